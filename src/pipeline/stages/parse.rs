//! Stage 1: turn draft output or a caller-supplied graph into a [`Graph`].

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::corrections::CorrectionKind;
use crate::error::{ParseError, PipelineError, PipelineResult};
use crate::graph::{Graph, NodeKind, BELIEF_ALIAS, DEFAULT_GRAPH_VERSION};
use crate::llm::{extract_json_from_completion, LlmAdapter};
use crate::pipeline::{until_cancelled, PipelineContext, PipelineRequest, Stage};

/// Fetch the raw graph JSON: the caller's graph when given, otherwise a
/// fresh draft from the adapter. String payloads are unwrapped from any
/// markdown fence and parsed.
pub async fn load(
    request: &PipelineRequest,
    llm: &dyn LlmAdapter,
    cancel: &CancellationToken,
) -> PipelineResult<Value> {
    let raw = match &request.graph {
        Some(graph) => graph.clone(),
        None => {
            debug!(seed = ?request.seed, "Drafting graph from brief");
            until_cancelled(cancel, Stage::Parse, llm.draft_graph(&request.brief, request.seed))
                .await?
                .map_err(PipelineError::Draft)?
        }
    };

    match raw {
        Value::String(completion) => {
            let json = extract_json_from_completion(&completion).map_err(|message| {
                warn!(error = %message, "Draft output holds no JSON");
                ParseError::InvalidJson { message }
            })?;
            serde_json::from_str(json).map_err(|e| {
                warn!(error = %e, excerpt = %excerpt(json), "Draft output is not valid JSON");
                PipelineError::from(ParseError::InvalidJson {
                    message: e.to_string(),
                })
            })
        }
        other => Ok(other),
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(100).collect()
}

/// Parse `raw` into the context's graph, assign missing edge ids and record
/// the authored goals.
pub fn run(ctx: &mut PipelineContext, raw: Value) -> PipelineResult<()> {
    let aliased = count_aliased_beliefs(&raw);
    let mut graph = Graph::from_value(raw)?;

    if graph.version.is_none() {
        graph.version = Some(DEFAULT_GRAPH_VERSION.to_string());
    }

    assign_edge_ids(ctx, &mut graph);

    ctx.authored_goal_ids = graph
        .nodes_of_kind(NodeKind::Goal)
        .map(|n| n.id.clone())
        .collect();
    ctx.graph = graph;
    ctx.capture_snapshot(Stage::Parse);

    info!(
        request_id = %ctx.request_id,
        nodes = ctx.graph.nodes.len(),
        edges = ctx.graph.edges.len(),
        goals = ctx.authored_goal_ids.len(),
        aliased_beliefs = aliased,
        "Graph parsed"
    );
    Ok(())
}

/// Edges that carry their belief only under the alias.
fn count_aliased_beliefs(raw: &Value) -> usize {
    raw.get("edges")
        .and_then(Value::as_array)
        .map(|edges| {
            edges
                .iter()
                .filter(|e| e.get(BELIEF_ALIAS).is_some() && e.get("belief_exists").is_none())
                .count()
        })
        .unwrap_or(0)
}

/// Give every id-less edge `<from>::<to>`, suffixed `#n` on collision.
fn assign_edge_ids(ctx: &mut PipelineContext, graph: &mut Graph) {
    for index in 0..graph.edges.len() {
        if !graph.edges[index].id.is_empty() {
            continue;
        }
        let edge = &graph.edges[index];
        let id = graph.unique_edge_id(&edge.from, &edge.to);
        let description = format!("Edge {} -> {} had no id", edge.from, edge.to);
        graph.edges[index].id = id.clone();
        ctx.corrections
            .record(Stage::Parse, CorrectionKind::EdgeIdAssigned, [id], description);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::MockLlmAdapter;
    use serde_json::json;

    #[tokio::test]
    async fn test_load_prefers_caller_graph() {
        let llm = MockLlmAdapter::new();
        let request = PipelineRequest::new("b").with_graph(json!({"nodes": [], "edges": []}));
        let raw = load(&request, &llm, &CancellationToken::new()).await.unwrap();
        assert_eq!(raw, json!({"nodes": [], "edges": []}));
    }

    #[tokio::test]
    async fn test_load_unwraps_fenced_draft() {
        let mut llm = MockLlmAdapter::new();
        llm.expect_draft_graph()
            .withf(|brief, seed| brief.to_string() == "hire?" && *seed == Some(3))
            .returning(|_, _| Ok(json!("```json\n{\"nodes\": [], \"edges\": []}\n```")));
        let request = PipelineRequest::new("hire?").with_seed(3);
        let raw = load(&request, &llm, &CancellationToken::new()).await.unwrap();
        assert_eq!(raw["nodes"], json!([]));
    }

    #[tokio::test]
    async fn test_load_rejects_non_json_draft() {
        let mut llm = MockLlmAdapter::new();
        llm.expect_draft_graph()
            .returning(|_, _| Ok(json!("I could not build a graph")));
        let err = load(&PipelineRequest::new("b"), &llm, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
    }

    #[tokio::test]
    async fn test_load_maps_adapter_failure() {
        let mut llm = MockLlmAdapter::new();
        llm.expect_draft_graph()
            .returning(|_, _| Err(LlmError::Timeout { timeout_ms: 10 }));
        let err = load(&PipelineRequest::new("b"), &llm, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LLM_UNAVAILABLE");
    }

    #[test]
    fn test_run_assigns_edge_ids() {
        let mut ctx = PipelineContext::new("b", None, false);
        let raw = json!({
            "nodes": [
                {"id": "a", "kind": "factor"},
                {"id": "b", "kind": "goal"}
            ],
            "edges": [
                {"from": "a", "to": "b"},
                {"id": "a::b", "from": "a", "to": "b"},
                {"from": "a", "to": "b", "exists_probability": 0.4}
            ]
        });
        run(&mut ctx, raw).unwrap();

        let ids: Vec<&str> = ctx.graph.edges.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a::b#2", "a::b", "a::b#3"]);
        assert_eq!(ctx.graph.edges[2].belief_exists, Some(0.4));
        assert_eq!(
            ctx.corrections.of_kind(CorrectionKind::EdgeIdAssigned).count(),
            2
        );
        assert_eq!(ctx.graph.version.as_deref(), Some("1"));
        assert_eq!(ctx.authored_goal_ids, vec!["b".to_string()]);
        assert!(ctx.stage_snapshots.contains_key("stage_1_parse"));
    }

    #[test]
    fn test_run_rejects_malformed_graph() {
        let mut ctx = PipelineContext::new("b", None, false);
        let err = run(&mut ctx, json!({"nodes": [{"id": "x"}], "edges": []})).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(ctx.graph.nodes.is_empty());
    }
}
