use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{ValidateEngine, ValidationOutcome};
use crate::config::{EngineConfig, RequestConfig};
use crate::error::{EngineError, EngineResult};
use crate::graph::Graph;
use crate::retry::with_backoff;

/// HTTP client for the validate engine
#[derive(Clone)]
pub struct EngineClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    request_config: RequestConfig,
}

impl EngineClient {
    /// Create a new engine client
    pub fn new(config: &EngineConfig, request_config: &RequestConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(EngineError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_config: request_config.clone(),
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One POST to the validate endpoint.
    async fn post_validate(&self, url: &str, body: &Value) -> EngineResult<ValidationOutcome> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout {
                    timeout_ms: self.request_config.timeout_ms,
                }
            } else {
                EngineError::Http(e)
            }
        })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::InvalidResponse {
                message: format!("Failed to parse validation response: {}", e),
            })
    }
}

#[async_trait]
impl ValidateEngine for EngineClient {
    async fn validate(&self, graph: &Graph) -> EngineResult<ValidationOutcome> {
        let url = format!("{}/v1/validate", self.base_url);
        let body = json!({ "graph": graph.to_value() });
        let start = Instant::now();

        debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "Calling validate engine"
        );

        let outcome = with_backoff(&self.request_config, "validate", || {
            self.post_validate(&url, &body)
        })
        .await
        .map_err(|exhausted| exhausted.error)?;

        info!(
            ok = outcome.ok,
            violations = outcome.violations.len(),
            latency_ms = start.elapsed().as_millis(),
            "Validate engine call completed"
        );

        Ok(outcome)
    }
}
