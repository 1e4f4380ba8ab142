//! Integration tests for the validate-engine client

use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use decision_pipeline::config::{EngineConfig, RequestConfig};
use decision_pipeline::engine::{EngineClient, ValidateEngine};
use decision_pipeline::error::EngineError;
use decision_pipeline::graph::{Graph, Node, NodeKind};

fn create_test_client(base_url: &str, api_key: Option<&str>) -> EngineClient {
    create_retrying_client(base_url, api_key, 0)
}

fn create_retrying_client(base_url: &str, api_key: Option<&str>, max_retries: u32) -> EngineClient {
    let config = EngineConfig {
        base_url: base_url.to_string(),
        api_key: api_key.map(str::to_string),
    };
    let request_config = RequestConfig {
        timeout_ms: 2000,
        max_retries,
        retry_delay_ms: 10,
    };
    EngineClient::new(&config, &request_config).expect("Failed to create client")
}

fn sample_graph() -> Graph {
    Graph::new().with_node(Node::new("g", NodeKind::Goal, "Revenue"))
}

#[tokio::test]
async fn test_accepting_verdict() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/validate"))
        .and(header("Authorization", "Bearer engine-key"))
        .and(body_partial_json(json!({"graph": {"nodes": [{"id": "g"}]}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server.uri(), Some("engine-key"));
    let outcome = client.validate(&sample_graph()).await.expect("validate");
    assert!(outcome.ok);
    assert!(outcome.violations.is_empty());
    assert!(outcome.normalized.is_none());
}

#[tokio::test]
async fn test_rejecting_verdict() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": false,
            "violations": [
                {"code": "GOAL_UNREACHABLE", "message": "no path to goal", "target_ids": ["g"]}
            ],
            "normalized": {"nodes": [], "edges": []}
        })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server.uri(), None);
    let outcome = client.validate(&sample_graph()).await.expect("validate");
    assert!(!outcome.ok);
    assert_eq!(outcome.violations[0].code, "GOAL_UNREACHABLE");
    assert_eq!(outcome.violations[0].target_ids, vec!["g".to_string()]);
}

#[tokio::test]
async fn test_server_error_is_api_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/validate"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server.uri(), None);
    let err = client.validate(&sample_graph()).await.unwrap_err();
    assert!(matches!(err, EngineError::Api { status: 503, .. }));
}

#[tokio::test]
async fn test_malformed_verdict() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"verdict": "fine"})))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server.uri(), None);
    let err = client.validate(&sample_graph()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidResponse { .. }));
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/validate"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&mock_server)
        .await;

    let client = create_retrying_client(&mock_server.uri(), None, 2);
    let outcome = client.validate(&sample_graph()).await.expect("validate after retry");
    assert!(outcome.ok);
}

#[tokio::test]
async fn test_bad_request_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/validate"))
        .respond_with(ResponseTemplate::new(400).set_body_string("graph too large"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_retrying_client(&mock_server.uri(), None, 3);
    let err = client.validate(&sample_graph()).await.unwrap_err();
    assert!(matches!(err, EngineError::Api { status: 400, .. }));
}
