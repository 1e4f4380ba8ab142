//! Stage 4: fix what the detectors and the validate engine report.
//!
//! Deterministic fixes run first. Whatever they cannot settle goes to a
//! bounded number of LLM repair calls whose proposals are merged without
//! touching the nodes and edges the graph already has.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::corrections::CorrectionKind;
use crate::engine::{ValidateEngine, Violation};
use crate::error::{ParseError, PipelineResult};
use crate::graph::{Edge, FactorCategory, Graph, Node, NodeKind};
use crate::llm::{extract_json_from_completion, LlmAdapter};
use crate::pipeline::detectors::{self, non_canonical_reason, options_of};
use crate::pipeline::stages::normalise::{
    STRUCTURAL_BELIEF, STRUCTURAL_STRENGTH_MEAN, STRUCTURAL_STRENGTH_STD,
};
use crate::pipeline::{until_cancelled, PipelineContext, Stage};

/// Label given to an added baseline option.
pub const BASELINE_LABEL: &str = "Status quo";

pub async fn run(
    ctx: &mut PipelineContext,
    llm: &dyn LlmAdapter,
    engine: &dyn ValidateEngine,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> PipelineResult<()> {
    let mut violations = std::mem::take(&mut ctx.pending_violations);
    let mut engine_violations = if config.repair_consult_engine {
        consult_engine(ctx, engine, cancel).await?
    } else {
        Vec::new()
    };
    violations.extend(engine_violations.iter().cloned());

    apply_deterministic(ctx, &violations);
    let mut open = open_violations(&ctx.graph, &engine_violations);

    let mut attempts = 0;
    while !open.is_empty() && attempts < config.llm_repair_max_attempts {
        attempts += 1;
        debug!(
            request_id = %ctx.request_id,
            attempt = attempts,
            open = open.len(),
            "Requesting LLM repair"
        );

        let proposal = match until_cancelled(cancel, Stage::Repair, llm.repair_graph(&ctx.graph, &open)).await? {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!(request_id = %ctx.request_id, error = %e, "LLM repair unavailable, keeping deterministic fixes");
                break;
            }
        };
        match proposal_graph(proposal) {
            Ok(proposed) if !proposed.nodes.is_empty() => merge_proposal(ctx, proposed),
            Ok(_) => {
                warn!(request_id = %ctx.request_id, "LLM repair proposed an empty graph, ignored");
                continue;
            }
            Err(e) => {
                warn!(request_id = %ctx.request_id, error = %e, "LLM repair proposal unreadable, ignored");
                continue;
            }
        }

        if config.repair_consult_engine {
            engine_violations = consult_engine(ctx, engine, cancel).await?;
        }
        let mut current = detectors::detect(&ctx.graph);
        current.extend(engine_violations.iter().cloned());
        apply_deterministic(ctx, &current);
        open = open_violations(&ctx.graph, &engine_violations);
    }

    info!(
        request_id = %ctx.request_id,
        corrections = ctx.corrections.for_stage(Stage::Repair).count(),
        llm_attempts = attempts,
        unresolved = open.len(),
        "Graph repaired"
    );
    ctx.unresolved_violations = open;
    ctx.capture_snapshot(Stage::Repair);
    Ok(())
}

/// Ask the engine for violations. Transport failure is not fatal here.
async fn consult_engine(
    ctx: &PipelineContext,
    engine: &dyn ValidateEngine,
    cancel: &CancellationToken,
) -> PipelineResult<Vec<Violation>> {
    match until_cancelled(cancel, Stage::Repair, engine.validate(&ctx.graph)).await? {
        Ok(outcome) => Ok(outcome.violations),
        Err(e) => {
            warn!(request_id = %ctx.request_id, error = %e, "Validate engine unavailable during repair");
            Ok(Vec::new())
        }
    }
}

/// Local detector output plus engine violations no local fix covers,
/// without repeats.
fn open_violations(graph: &Graph, engine_violations: &[Violation]) -> Vec<Violation> {
    let mut open = detectors::detect(graph);
    for v in engine_violations {
        if !detectors::is_deterministic(&v.code) && !open.contains(v) {
            open.push(v.clone());
        }
    }
    open
}

/// Run the deterministic fixers for the codes present in `violations`.
/// Orphaned controllable factors are always re-checked since removing an
/// edge can create one.
fn apply_deterministic(ctx: &mut PipelineContext, violations: &[Violation]) {
    let codes: HashSet<&str> = violations.iter().map(|v| v.code.as_str()).collect();
    remove_invalid_edges(ctx, &codes);
    if codes.contains(detectors::MISSING_BASELINE_OPTION) {
        add_baseline_options(ctx);
    }
    reclassify_orphans(ctx);
}

fn remove_invalid_edges(ctx: &mut PipelineContext, codes: &HashSet<&str>) {
    let graph = &ctx.graph;
    let mut seen = HashSet::new();
    let mut removals: Vec<(usize, CorrectionKind, String)> = Vec::new();

    for (index, edge) in graph.edges.iter().enumerate() {
        let kinds = (graph.kind_of(&edge.from), graph.kind_of(&edge.to));
        let verdict = match kinds {
            (Some(_), Some(_)) if edge.from == edge.to => codes
                .contains(detectors::SELF_LOOP)
                .then(|| (CorrectionKind::SelfLoopRemoved, format!("Edge {} looped on {}", edge.id, edge.from))),
            (Some(from), Some(to)) => {
                if seen.contains(&(edge.from.as_str(), edge.to.as_str())) {
                    codes.contains(detectors::DUPLICATE_EDGE).then(|| {
                        (
                            CorrectionKind::DuplicateEdgeRemoved,
                            format!("Edge {} repeated {} -> {}", edge.id, edge.from, edge.to),
                        )
                    })
                } else {
                    non_canonical_reason(from, to)
                        .filter(|_| codes.contains(detectors::NON_CANONICAL_EDGE))
                        .map(|reason| {
                            (
                                CorrectionKind::NonCanonicalEdgeRemoved,
                                format!("Edge {} removed: {}", edge.id, reason),
                            )
                        })
                }
            }
            _ => codes.contains(detectors::DANGLING_EDGE).then(|| {
                (
                    CorrectionKind::DanglingEdgeRemoved,
                    format!("Edge {} pointed at a missing node", edge.id),
                )
            }),
        };

        match verdict {
            Some((kind, description)) => removals.push((index, kind, description)),
            None => {
                seen.insert((edge.from.as_str(), edge.to.as_str()));
            }
        }
    }

    if removals.is_empty() {
        return;
    }
    let doomed: HashSet<usize> = removals.iter().map(|(i, _, _)| *i).collect();
    let removed_ids: Vec<String> = removals
        .iter()
        .map(|(i, _, _)| ctx.graph.edges[*i].id.clone())
        .collect();

    let mut index = 0;
    ctx.graph.edges.retain(|_| {
        let keep = !doomed.contains(&index);
        index += 1;
        keep
    });

    for ((_, kind, description), id) in removals.into_iter().zip(removed_ids) {
        ctx.corrections.record(Stage::Repair, kind, [id], description);
    }
}

/// Give every decision without a baseline a status-quo option that holds
/// its siblings' factors at their current values.
fn add_baseline_options(ctx: &mut PipelineContext) {
    let decisions: Vec<String> = ctx
        .graph
        .nodes_of_kind(NodeKind::Decision)
        .filter(|d| {
            let options = options_of(&ctx.graph, &d.id);
            !options.is_empty() && !options.iter().any(|o| detectors::is_baseline_option(o))
        })
        .map(|d| d.id.clone())
        .collect();

    for decision in decisions {
        let graph = &ctx.graph;
        let mut levers: Vec<String> = Vec::new();
        for option in options_of(graph, &decision) {
            for edge in graph.outgoing(&option.id) {
                if graph.kind_of(&edge.to) == Some(NodeKind::Factor) && !levers.contains(&edge.to) {
                    levers.push(edge.to.clone());
                }
            }
        }
        let interventions: BTreeMap<String, f64> = levers
            .iter()
            .filter_map(|f| {
                let data = graph.node(f)?.factor_data()?;
                Some((f.clone(), data.baseline.or(data.value)?))
            })
            .collect();

        let option_id = graph.unique_node_id(&format!("{}_status_quo", decision));
        let option = Node::new(option_id.clone(), NodeKind::Option, BASELINE_LABEL)
            .with_data(json!({ "is_baseline": true, "interventions": interventions }));
        ctx.graph.nodes.push(option);

        let branch_id = ctx.graph.unique_edge_id(&decision, &option_id);
        ctx.graph.edges.push(Edge::new(branch_id, decision.clone(), option_id.clone()));
        for factor in &levers {
            let mut edge = Edge::new(ctx.graph.unique_edge_id(&option_id, factor), option_id.clone(), factor.clone())
                .with_strength(STRUCTURAL_STRENGTH_MEAN)
                .with_belief(STRUCTURAL_BELIEF);
            edge.strength_std = Some(STRUCTURAL_STRENGTH_STD);
            ctx.graph.edges.push(edge);
        }

        ctx.corrections.record(
            Stage::Repair,
            CorrectionKind::BaselineOptionAdded,
            [option_id, decision.clone()],
            format!(
                "Decision {} had no baseline; added a status-quo option over {} factor(s)",
                decision,
                levers.len()
            ),
        );
    }
}

fn reclassify_orphans(ctx: &mut PipelineContext) {
    let orphans: Vec<String> = ctx
        .graph
        .nodes_of_kind(NodeKind::Factor)
        .filter(|f| {
            f.category() == Some(FactorCategory::Controllable)
                && !ctx.graph.has_option_parent(&f.id)
        })
        .map(|f| f.id.clone())
        .collect();

    for id in orphans {
        if let Some(node) = ctx.graph.node_mut(&id) {
            node.set_category(FactorCategory::External);
        }
        ctx.corrections.record(
            Stage::Repair,
            CorrectionKind::FactorReclassified,
            [id],
            "No option sets this factor after repair; reclassified controllable -> external",
        );
    }
}

/// Read an LLM proposal, unwrapping fenced completions.
fn proposal_graph(proposal: Value) -> Result<Graph, ParseError> {
    let value = match proposal {
        Value::String(completion) => {
            let json = extract_json_from_completion(&completion)
                .map_err(|message| ParseError::InvalidJson { message })?;
            serde_json::from_str(json).map_err(|e| ParseError::InvalidJson {
                message: e.to_string(),
            })?
        }
        // Some pipes wrap the graph: {"graph": {...}}
        Value::Object(mut map) if map.contains_key("graph") && !map.contains_key("nodes") => {
            map.remove("graph").unwrap_or(Value::Object(Map::new()))
        }
        other => other,
    };
    Graph::from_value(value)
}

/// Merge a proposal: existing nodes stay verbatim, new nodes are added, and
/// the proposal's edge set replaces the current one with existing edges
/// (matched by id, else by endpoints) keeping their own fields.
fn merge_proposal(ctx: &mut PipelineContext, proposal: Graph) {
    let mut added_nodes = Vec::new();
    for node in proposal.nodes {
        if ctx.graph.node(&node.id).is_none() {
            added_nodes.push(node.id.clone());
            ctx.graph.nodes.push(node);
        }
    }

    let mut previous: Vec<Option<Edge>> = std::mem::take(&mut ctx.graph.edges)
        .into_iter()
        .map(Some)
        .collect();
    let mut added_edges = Vec::new();

    for mut proposed in proposal.edges {
        let by_id = (!proposed.id.is_empty())
            .then(|| {
                previous
                    .iter()
                    .position(|e| e.as_ref().is_some_and(|e| e.id == proposed.id))
            })
            .flatten();
        let matched = by_id.or_else(|| {
            previous.iter().position(|e| {
                e.as_ref()
                    .is_some_and(|e| e.from == proposed.from && e.to == proposed.to)
            })
        });

        if let Some(existing) = matched.and_then(|i| previous[i].take()) {
            ctx.graph.edges.push(existing);
            continue;
        }
        if proposed.id.is_empty() || ctx.graph.contains_edge(&proposed.id) || previous.iter().flatten().any(|e| e.id == proposed.id) {
            proposed.id = ctx.graph.unique_edge_id(&proposed.from, &proposed.to);
        }
        added_edges.push(proposed.id.clone());
        ctx.graph.edges.push(proposed);
    }

    let removed_edges: Vec<String> = previous.into_iter().flatten().map(|e| e.id).collect();

    let description = format!(
        "LLM repair added {} node(s) and {} edge(s), removed {} edge(s)",
        added_nodes.len(),
        added_edges.len(),
        removed_edges.len()
    );
    let targets: Vec<String> = added_nodes
        .into_iter()
        .chain(added_edges)
        .chain(removed_edges)
        .collect();
    ctx.corrections
        .record(Stage::Repair, CorrectionKind::LlmRepairApplied, targets, description);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockValidateEngine, ValidationOutcome};
    use crate::error::{EngineError, LlmError};
    use crate::llm::MockLlmAdapter;
    use serde_json::json;

    fn canonical() -> Graph {
        Graph::from_value(json!({
            "nodes": [
                {"id": "g", "kind": "goal", "label": "Profit"},
                {"id": "d", "kind": "decision", "label": "Price?"},
                {"id": "o1", "kind": "option", "label": "Raise", "data": {"interventions": {"f": 12.0}}},
                {"id": "o0", "kind": "option", "label": "Status quo", "data": {"interventions": {"f": 10.0}}},
                {"id": "f", "kind": "factor", "label": "Price", "category": "controllable", "data": {"value": 10}},
                {"id": "m", "kind": "factor", "label": "Demand", "category": "external"}
            ],
            "edges": [
                {"id": "e1", "from": "d", "to": "o1"},
                {"id": "e2", "from": "d", "to": "o0"},
                {"id": "e3", "from": "o1", "to": "f"},
                {"id": "e4", "from": "o0", "to": "f"},
                {"id": "e5", "from": "f", "to": "g", "strength_mean": 0.6, "x_note": "keep"},
                {"id": "e6", "from": "m", "to": "g", "strength_mean": 0.3}
            ]
        }))
        .unwrap()
    }

    fn ctx_for(graph: Graph) -> PipelineContext {
        let mut ctx = PipelineContext::new("brief", None, false);
        ctx.pending_violations = detectors::detect(&graph);
        ctx.graph = graph;
        ctx
    }

    async fn repair(ctx: &mut PipelineContext, llm: MockLlmAdapter, config: &PipelineConfig) {
        let engine = MockValidateEngine::new();
        run(ctx, &llm, &engine, config, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_canonical_graph_needs_no_repair() {
        let mut ctx = ctx_for(canonical());
        let before = ctx.graph.clone();
        repair(&mut ctx, MockLlmAdapter::new(), &PipelineConfig::default()).await;
        assert_eq!(ctx.graph, before);
        assert!(ctx.corrections.is_empty());
        assert!(ctx.unresolved_violations.is_empty());
        assert!(ctx.stage_snapshots.contains_key("stage_4_repair"));
    }

    #[tokio::test]
    async fn test_structural_edges_removed() {
        let graph = canonical()
            .with_edge(Edge::new("dangling", "f", "ghost"))
            .with_edge(Edge::new("loop", "m", "m"))
            .with_edge(Edge::new("dup", "f", "g"))
            .with_edge(Edge::new("bad", "d", "g"));
        let mut ctx = ctx_for(graph);
        repair(&mut ctx, MockLlmAdapter::new(), &PipelineConfig::default()).await;

        let ids: Vec<&str> = ctx.graph.edges.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3", "e4", "e5", "e6"]);
        assert_eq!(ctx.graph.edges[4].extra["x_note"], "keep");
        let kinds: Vec<CorrectionKind> = ctx.corrections.entries().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CorrectionKind::DanglingEdgeRemoved,
                CorrectionKind::SelfLoopRemoved,
                CorrectionKind::DuplicateEdgeRemoved,
                CorrectionKind::NonCanonicalEdgeRemoved
            ]
        );
    }

    #[tokio::test]
    async fn test_baseline_option_added() {
        let mut graph = canonical();
        graph.nodes.retain(|n| n.id != "o0");
        graph.edges.retain(|e| e.id != "e2" && e.id != "e4");
        let mut ctx = ctx_for(graph);
        repair(&mut ctx, MockLlmAdapter::new(), &PipelineConfig::default()).await;

        let baseline = ctx.graph.node("d_status_quo").expect("baseline option");
        assert!(detectors::is_baseline_option(baseline));
        assert_eq!(baseline.interventions().get("f"), Some(&10.0));
        assert!(ctx.graph.edges.iter().any(|e| e.from == "d" && e.to == "d_status_quo"));
        assert!(ctx.graph.edges.iter().any(|e| e.from == "d_status_quo" && e.to == "f"));
        assert!(ctx.unresolved_violations.is_empty());
    }

    #[tokio::test]
    async fn test_removed_edge_orphans_are_reclassified() {
        // d -> k is non-canonical; dropping it leaves nothing setting k.
        let graph = canonical()
            .with_node(Node::factor("k", "Ad spend", FactorCategory::Controllable))
            .with_edge(Edge::new("bad", "d", "k"));
        let mut ctx = ctx_for(graph);
        repair(&mut ctx, MockLlmAdapter::new(), &PipelineConfig::default()).await;

        assert_eq!(ctx.graph.node("k").unwrap().category(), Some(FactorCategory::External));
        assert!(ctx
            .corrections
            .targets(Stage::Repair, CorrectionKind::FactorReclassified)
            .contains("k"));
    }

    #[tokio::test]
    async fn test_llm_repair_merges_conservatively() {
        let mut graph = canonical();
        graph.node_mut("m").unwrap().set_category(FactorCategory::Observable);
        let mut ctx = ctx_for(graph);

        let mut llm = MockLlmAdapter::new();
        llm.expect_repair_graph()
            .times(1)
            .withf(|_, violations| violations.iter().any(|v| v.code == detectors::NO_EXTERNAL_FACTORS))
            .returning(|_, _| {
                Ok(json!({
                    "nodes": [
                        {"id": "f", "kind": "factor", "label": "RENAMED", "category": "controllable"},
                        {"id": "ext", "kind": "factor", "label": "Competitor pricing", "category": "external"}
                    ],
                    "edges": [
                        {"from": "d", "to": "o1"}, {"id": "e2", "from": "d", "to": "o0"},
                        {"id": "e3", "from": "o1", "to": "f"}, {"id": "e4", "from": "o0", "to": "f"},
                        {"id": "e5", "from": "f", "to": "g", "strength_mean": 9.0},
                        {"from": "ext", "to": "g", "strength_mean": -0.4}
                    ]
                }))
            });
        repair(&mut ctx, llm, &PipelineConfig::default()).await;

        assert_eq!(ctx.graph.node("f").unwrap().label.as_deref(), Some("Price"));
        assert!(ctx.graph.node("ext").is_some());
        assert!(ctx.graph.node("m").is_some());
        let e5 = ctx.graph.edges.iter().find(|e| e.id == "e5").unwrap();
        assert_eq!(e5.strength_mean, Some(0.6));
        assert!(ctx.graph.edges.iter().any(|e| e.id == "e1"));
        assert!(ctx.graph.edges.iter().any(|e| e.id == "ext::g"));
        assert!(!ctx.graph.edges.iter().any(|e| e.id == "e6"));
        assert!(ctx.unresolved_violations.is_empty());
        assert_eq!(ctx.corrections.of_kind(CorrectionKind::LlmRepairApplied).count(), 1);
    }

    #[tokio::test]
    async fn test_llm_failure_is_not_fatal() {
        let mut graph = canonical();
        graph.node_mut("m").unwrap().set_category(FactorCategory::Observable);
        let mut ctx = ctx_for(graph);
        let before = ctx.graph.clone();

        let mut llm = MockLlmAdapter::new();
        llm.expect_repair_graph()
            .times(1)
            .returning(|_, _| Err(LlmError::Timeout { timeout_ms: 5 }));
        let config = PipelineConfig {
            llm_repair_max_attempts: 3,
            ..Default::default()
        };
        repair(&mut ctx, llm, &config).await;

        assert_eq!(ctx.graph, before);
        assert_eq!(ctx.unresolved_violations.len(), 1);
        assert_eq!(ctx.unresolved_violations[0].code, detectors::NO_EXTERNAL_FACTORS);
    }

    #[tokio::test]
    async fn test_zero_attempts_skips_llm() {
        let mut graph = canonical();
        graph.node_mut("m").unwrap().set_category(FactorCategory::Observable);
        let mut ctx = ctx_for(graph);
        let config = PipelineConfig {
            llm_repair_max_attempts: 0,
            ..Default::default()
        };
        repair(&mut ctx, MockLlmAdapter::new(), &config).await;
        assert_eq!(ctx.unresolved_violations.len(), 1);
    }

    #[tokio::test]
    async fn test_engine_consulted_when_enabled() {
        let mut ctx = ctx_for(canonical());
        let mut engine = MockValidateEngine::new();
        engine.expect_validate().times(1).returning(|_| {
            Ok(ValidationOutcome::rejected(vec![Violation::new(
                "GOAL_UNREACHABLE",
                "engine rule",
            )]))
        });
        let config = PipelineConfig {
            repair_consult_engine: true,
            llm_repair_max_attempts: 0,
            ..Default::default()
        };
        run(&mut ctx, &MockLlmAdapter::new(), &engine, &config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ctx.unresolved_violations[0].code, "GOAL_UNREACHABLE");
    }

    #[tokio::test]
    async fn test_engine_failure_during_repair_is_ignored() {
        let mut ctx = ctx_for(canonical());
        let mut engine = MockValidateEngine::new();
        engine
            .expect_validate()
            .returning(|_| Err(EngineError::Timeout { timeout_ms: 1 }));
        let config = PipelineConfig {
            repair_consult_engine: true,
            ..Default::default()
        };
        let result = run(&mut ctx, &MockLlmAdapter::new(), &engine, &config, &CancellationToken::new()).await;
        assert!(result.is_ok());
        assert!(ctx.unresolved_violations.is_empty());
    }

    #[test]
    fn test_proposal_unwraps_graph_key_and_fences() {
        let wrapped = json!({"graph": {"nodes": [{"id": "a", "kind": "goal"}], "edges": []}});
        assert_eq!(proposal_graph(wrapped).unwrap().nodes.len(), 1);
        let fenced = json!("```json\n{\"nodes\": [], \"edges\": []}\n```");
        assert!(proposal_graph(fenced).unwrap().nodes.is_empty());
        assert!(proposal_graph(json!("no graph here")).is_err());
    }
}
