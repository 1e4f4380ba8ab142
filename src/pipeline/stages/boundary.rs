//! Stage 7: external validation and the success envelope.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::ValidateEngine;
use crate::error::{PipelineError, PipelineResult};
use crate::graph::{Graph, NodeKind};
use crate::pipeline::{until_cancelled, PipelineContext, Stage};

/// Whether the graph can go straight to analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStatus {
    Ready,
    NeedsUserMapping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadyOption {
    pub id: String,
    pub label: String,
    pub interventions: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserQuestion {
    pub option_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factor_id: Option<String>,
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReady {
    pub status: ReadinessStatus,
    pub goal_node_id: Option<String>,
    pub goal_threshold: Option<f64>,
    pub options: Vec<ReadyOption>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub user_questions: Vec<UserQuestion>,
}

impl AnalysisReady {
    pub fn from_graph(graph: &Graph) -> Self {
        let goal = graph.goal();
        let mut options = Vec::new();
        let mut questions = Vec::new();

        for option in graph.nodes_of_kind(NodeKind::Option) {
            let interventions = option.interventions();
            let factor_edges: Vec<&str> = graph
                .outgoing(&option.id)
                .filter(|e| graph.kind_of(&e.to) == Some(NodeKind::Factor))
                .map(|e| e.to.as_str())
                .collect();

            if factor_edges.is_empty() {
                questions.push(UserQuestion {
                    option_id: option.id.clone(),
                    factor_id: None,
                    question: format!(
                        "Which factors does choosing \"{}\" change?",
                        option.display_name()
                    ),
                });
            }
            for factor in factor_edges {
                if !interventions.contains_key(factor) {
                    let factor_name = graph.node(factor).map_or(factor, |n| n.display_name());
                    questions.push(UserQuestion {
                        option_id: option.id.clone(),
                        factor_id: Some(factor.to_string()),
                        question: format!(
                            "What value does \"{}\" set for \"{}\"?",
                            option.display_name(),
                            factor_name
                        ),
                    });
                }
            }

            options.push(ReadyOption {
                id: option.id.clone(),
                label: option.display_name().to_string(),
                interventions,
            });
        }

        Self {
            status: if questions.is_empty() {
                ReadinessStatus::Ready
            } else {
                ReadinessStatus::NeedsUserMapping
            },
            goal_node_id: goal.map(|g| g.id.clone()),
            goal_threshold: goal.and_then(|g| g.goal_data()).and_then(|d| d.goal_threshold),
            options,
            user_questions: questions,
        }
    }
}

/// Validate the final graph and build the response body. A rejection
/// leaves the graph as it is.
pub async fn run(
    ctx: &mut PipelineContext,
    engine: &dyn ValidateEngine,
    cancel: &CancellationToken,
) -> PipelineResult<Value> {
    let outcome = until_cancelled(cancel, Stage::Boundary, engine.validate(&ctx.graph))
        .await?
        .map_err(PipelineError::EngineUnavailable)?;

    if !outcome.ok {
        warn!(
            request_id = %ctx.request_id,
            violations = outcome.violations.len(),
            "Boundary validation rejected the graph"
        );
        return Err(PipelineError::ValidationFailed {
            violations: outcome.violations,
        });
    }

    let ready = AnalysisReady::from_graph(&ctx.graph);
    info!(
        request_id = %ctx.request_id,
        status = ?ready.status,
        options = ready.options.len(),
        questions = ready.user_questions.len(),
        "Graph accepted"
    );

    let mut body = json!({
        "request_id": ctx.request_id,
        "graph": ctx.graph.to_value(),
        "analysis_ready": ready,
        "normalise_summary": ctx.normalise_summary,
        "corrections": ctx.corrections.entries(),
        "enrichment": {
            "goal_conflicts": ctx.goal_conflicts,
            "domain_completeness": ctx.domain_completeness,
        },
        "unresolved_violations": ctx.unresolved_violations,
    });
    if let Some(sweep) = &ctx.threshold_sweep {
        body["threshold_sweep"] = json!(sweep);
    }
    Ok(body)
}
