//! Stage 2: deterministic structural reconciliation.
//!
//! Normalise rewrites kinds, categories and edge parameters but never adds
//! or removes a node or an edge. Anything it cannot settle on its own is
//! left to Repair as a pending violation.

use serde::Serialize;
use tracing::{debug, info};

use crate::corrections::CorrectionKind;
use crate::graph::{Edge, EdgeClass, FactorCategory, Graph, NodeKind};
use crate::pipeline::{detectors, PipelineContext, Stage};

/// Default existence belief for a causal edge into an outcome.
pub const OUTCOME_BELIEF_EXISTS: f64 = 0.75;
/// Default strength spread for a causal edge into an outcome.
pub const OUTCOME_STRENGTH_STD: f64 = 0.2;
/// Default strength for a causal edge into an outcome.
pub const OUTCOME_STRENGTH_MEAN: f64 = 0.5;

/// Strength parameters every option→factor edge ends up with.
pub const STRUCTURAL_STRENGTH_MEAN: f64 = 1.0;
pub const STRUCTURAL_STRENGTH_STD: f64 = 0.01;
pub const STRUCTURAL_BELIEF: f64 = 1.0;

const PERCENT_UNITS: [&str; 3] = ["%", "percent", "pct"];

/// What Normalise did, for the response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormaliseSummary {
    pub single_goal_applied: bool,
    pub outcome_beliefs_filled: usize,
    pub decision_branches_normalized: usize,
    pub factors_reclassified: usize,
    pub edges_reversed: usize,
}

pub fn run(ctx: &mut PipelineContext) {
    let mut summary = NormaliseSummary {
        edges_reversed: reverse_structural_edges(ctx),
        single_goal_applied: collapse_goals(ctx),
        ..Default::default()
    };
    normalise_goal_threshold(ctx);
    infer_categories(ctx);
    summary.factors_reclassified = reclassify_orphans(ctx);
    summary.outcome_beliefs_filled = fill_outcome_beliefs(ctx);
    summary.decision_branches_normalized = normalise_decision_branches(ctx);

    ctx.pending_violations = detectors::detect(&ctx.graph);

    info!(
        request_id = %ctx.request_id,
        edges_reversed = summary.edges_reversed,
        single_goal_applied = summary.single_goal_applied,
        factors_reclassified = summary.factors_reclassified,
        outcome_beliefs_filled = summary.outcome_beliefs_filled,
        decision_branches_normalized = summary.decision_branches_normalized,
        pending_violations = ctx.pending_violations.len(),
        "Graph normalised"
    );
    ctx.normalise_summary = summary;
}

/// Flip `option→decision` and `factor→option` edges.
fn reverse_structural_edges(ctx: &mut PipelineContext) -> usize {
    let graph = &mut ctx.graph;
    let reversed: Vec<usize> = graph
        .edges
        .iter()
        .enumerate()
        .filter(|(_, e)| {
            matches!(
                (graph.kind_of(&e.from), graph.kind_of(&e.to)),
                (Some(NodeKind::Option), Some(NodeKind::Decision))
                    | (Some(NodeKind::Factor), Some(NodeKind::Option))
            )
        })
        .map(|(i, _)| i)
        .collect();

    for &index in &reversed {
        let edge = &mut graph.edges[index];
        edge.reverse();
        ctx.corrections.record(
            Stage::Normalise,
            CorrectionKind::EdgeReversed,
            [edge.id.clone()],
            format!("Edge now runs {} -> {}", edge.from, edge.to),
        );
    }
    reversed.len()
}

/// Keep one goal: a goal carrying threshold data beats one without, then
/// the most incoming causal edges wins, then document order. Others become
/// outcomes with their data intact.
fn collapse_goals(ctx: &mut PipelineContext) -> bool {
    let graph = &ctx.graph;
    let goals: Vec<(String, (bool, usize))> = graph
        .nodes_of_kind(NodeKind::Goal)
        .map(|g| {
            let thresholded = g.goal_data().map_or(false, |d| {
                d.goal_threshold.is_some() || d.goal_threshold_raw.is_some()
            });
            (g.id.clone(), (thresholded, causal_in_degree(graph, &g.id)))
        })
        .collect();
    if goals.len() <= 1 {
        return false;
    }

    let mut primary = &goals[0];
    for candidate in &goals[1..] {
        if candidate.1 > primary.1 {
            primary = candidate;
        }
    }
    let (primary, (thresholded, _)) = primary.clone();

    let demoted: Vec<String> = goals
        .into_iter()
        .map(|(id, _)| id)
        .filter(|id| *id != primary)
        .collect();
    for id in &demoted {
        if let Some(node) = ctx.graph.node_mut(id) {
            node.demote_goal_to_outcome();
        }
    }

    ctx.corrections.record(
        Stage::Normalise,
        CorrectionKind::SingleGoalApplied,
        demoted.iter().cloned(),
        format!(
            "Kept goal {}{}; {} other goal(s) demoted to outcome",
            primary,
            if thresholded { " (carries the goal threshold)" } else { "" },
            demoted.len()
        ),
    );
    true
}

fn causal_in_degree(graph: &Graph, id: &str) -> usize {
    graph
        .incoming(id)
        .filter(|e| graph.edge_class(e) == EdgeClass::Causal)
        .count()
}

/// Derive `goal_threshold` from `goal_threshold_raw` when it is missing.
fn normalise_goal_threshold(ctx: &mut PipelineContext) {
    let Some(goal) = ctx.graph.nodes.iter_mut().find(|n| n.kind() == NodeKind::Goal) else {
        return;
    };
    let goal_id = goal.id.clone();
    let Some(data) = goal.goal_data_mut() else {
        return;
    };
    if data.goal_threshold.is_some() {
        return;
    }
    let Some(raw) = data.goal_threshold_raw else {
        return;
    };

    let is_percent = data
        .goal_threshold_unit
        .as_deref()
        .map(|u| PERCENT_UNITS.contains(&u.trim().to_lowercase().as_str()))
        .unwrap_or(false);
    let mut threshold = if is_percent { raw / 100.0 } else { raw };
    if let Some(cap) = data.goal_threshold_cap {
        threshold = threshold.min(cap);
    }
    data.goal_threshold = Some(threshold);

    ctx.corrections.record(
        Stage::Normalise,
        CorrectionKind::GoalThresholdNormalized,
        [goal_id],
        format!("goal_threshold {} derived from raw value {}", threshold, raw),
    );
}

/// Factors set by an option but lacking a category are controllable.
fn infer_categories(ctx: &mut PipelineContext) {
    let inferred: Vec<String> = ctx
        .graph
        .nodes_of_kind(NodeKind::Factor)
        .filter(|f| f.category().is_none() && ctx.graph.has_option_parent(&f.id))
        .map(|f| f.id.clone())
        .collect();

    for id in inferred {
        if let Some(node) = ctx.graph.node_mut(&id) {
            node.set_category(FactorCategory::Controllable);
        }
        ctx.corrections.record(
            Stage::Normalise,
            CorrectionKind::CategoryInferred,
            [id],
            "Factor is set by an option; category inferred as controllable",
        );
    }
}

/// A controllable factor no option sets becomes external and loses the
/// fields that only make sense when controllable.
fn reclassify_orphans(ctx: &mut PipelineContext) -> usize {
    let orphans: Vec<String> = ctx
        .graph
        .nodes_of_kind(NodeKind::Factor)
        .filter(|f| {
            f.category() == Some(FactorCategory::Controllable)
                && !ctx.graph.has_option_parent(&f.id)
        })
        .map(|f| f.id.clone())
        .collect();

    for id in &orphans {
        let mut dropped = Vec::new();
        if let Some(node) = ctx.graph.node_mut(id) {
            node.set_category(FactorCategory::External);
            if let Some(data) = node.factor_data_mut() {
                dropped = data.drop_controllable_fields();
            }
        }
        debug!(factor_id = %id, dropped = ?dropped, "Orphan factor reclassified");
        ctx.corrections.record(
            Stage::Normalise,
            CorrectionKind::FactorReclassified,
            [id.clone()],
            if dropped.is_empty() {
                "No option sets this factor; reclassified controllable -> external".to_string()
            } else {
                format!(
                    "No option sets this factor; reclassified controllable -> external, dropped {}",
                    dropped.join(", ")
                )
            },
        );
    }
    orphans.len()
}

/// Fill missing belief and strength on causal edges into outcomes. A filled
/// mean takes its sign from `effect_direction`.
fn fill_outcome_beliefs(ctx: &mut PipelineContext) -> usize {
    let targets: Vec<usize> = ctx
        .graph
        .edges
        .iter()
        .enumerate()
        .filter(|(_, e)| {
            ctx.graph.kind_of(&e.to) == Some(NodeKind::Outcome)
                && ctx.graph.edge_class(e) == EdgeClass::Causal
                && (e.belief_exists.is_none() || e.strength_std.is_none() || e.strength_mean.is_none())
        })
        .map(|(i, _)| i)
        .collect();
    if targets.is_empty() {
        return 0;
    }

    let mut ids = Vec::with_capacity(targets.len());
    for index in &targets {
        let edge = &mut ctx.graph.edges[*index];
        edge.belief_exists.get_or_insert(OUTCOME_BELIEF_EXISTS);
        edge.strength_std.get_or_insert(OUTCOME_STRENGTH_STD);
        let sign = edge.effect_direction.map_or(1.0, |d| d.sign());
        edge.strength_mean.get_or_insert(sign * OUTCOME_STRENGTH_MEAN);
        ids.push(edge.id.clone());
    }
    ctx.corrections.record(
        Stage::Normalise,
        CorrectionKind::OutcomeBeliefFilled,
        ids,
        "Calibrated defaults filled on causal edges into outcomes",
    );
    targets.len()
}

/// Rescale each decision's branch beliefs to sum to one and give its
/// options' factor edges canonical structural strength.
fn normalise_decision_branches(ctx: &mut PipelineContext) -> usize {
    let decisions: Vec<String> = ctx
        .graph
        .nodes_of_kind(NodeKind::Decision)
        .map(|d| d.id.clone())
        .collect();

    let mut changed_decisions = 0;
    for decision in decisions {
        let graph = &ctx.graph;
        let branches: Vec<usize> = edge_indices(graph, |e| {
            e.from == decision && graph.kind_of(&e.to) == Some(NodeKind::Option)
        });
        if branches.is_empty() {
            continue;
        }
        let options: Vec<String> = branches
            .iter()
            .map(|&i| graph.edges[i].to.clone())
            .collect();
        let levers: Vec<usize> = edge_indices(graph, |e| {
            options.contains(&e.from) && graph.kind_of(&e.to) == Some(NodeKind::Factor)
        });

        let beliefs: Vec<f64> = branches
            .iter()
            .map(|&i| graph.edges[i].belief_exists.unwrap_or(1.0).max(0.0))
            .collect();
        let total: f64 = beliefs.iter().sum();
        let scaled: Vec<f64> = if total > 0.0 {
            beliefs.iter().map(|b| b / total).collect()
        } else {
            vec![1.0 / branches.len() as f64; branches.len()]
        };

        let mut changed = false;
        for (&index, &belief) in branches.iter().zip(&scaled) {
            let edge = &mut ctx.graph.edges[index];
            if edge.belief_exists.map_or(true, |b| (b - belief).abs() > 1e-9) {
                edge.belief_exists = Some(belief);
                changed = true;
            }
        }
        for &index in &levers {
            let edge = &mut ctx.graph.edges[index];
            if edge.strength_mean != Some(STRUCTURAL_STRENGTH_MEAN)
                || edge.strength_std != Some(STRUCTURAL_STRENGTH_STD)
                || edge.belief_exists != Some(STRUCTURAL_BELIEF)
            {
                edge.strength_mean = Some(STRUCTURAL_STRENGTH_MEAN);
                edge.strength_std = Some(STRUCTURAL_STRENGTH_STD);
                edge.belief_exists = Some(STRUCTURAL_BELIEF);
                changed = true;
            }
        }

        if changed {
            changed_decisions += 1;
            ctx.corrections.record(
                Stage::Normalise,
                CorrectionKind::DecisionBranchNormalized,
                [decision.clone()],
                format!(
                    "{} branch belief(s) rescaled to sum to 1, {} option edge(s) set to structural strength",
                    branches.len(),
                    levers.len()
                ),
            );
        }
    }
    changed_decisions
}

fn edge_indices(graph: &Graph, pred: impl Fn(&Edge) -> bool) -> Vec<usize> {
    graph
        .edges
        .iter()
        .enumerate()
        .filter(|(_, e)| pred(e))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EffectDirection, Node};
    use crate::pipeline::detectors::NO_EXTERNAL_FACTORS;
    use serde_json::json;

    fn ctx_with(graph: Graph) -> PipelineContext {
        let mut ctx = PipelineContext::new("brief", None, false);
        ctx.graph = graph;
        ctx
    }

    #[test]
    fn test_reverses_backwards_structural_edges() {
        let graph = Graph::new()
            .with_node(Node::new("d", NodeKind::Decision, "D"))
            .with_node(Node::new("o", NodeKind::Option, "O"))
            .with_node(Node::factor("f", "F", FactorCategory::Controllable))
            .with_edge(Edge::new("e1", "o", "d"))
            .with_edge(Edge::new("e2", "f", "o"));
        let mut ctx = ctx_with(graph);
        run(&mut ctx);

        assert_eq!(ctx.normalise_summary.edges_reversed, 2);
        assert_eq!((ctx.graph.edges[0].from.as_str(), ctx.graph.edges[0].to.as_str()), ("d", "o"));
        assert_eq!((ctx.graph.edges[1].from.as_str(), ctx.graph.edges[1].to.as_str()), ("o", "f"));
        // f has an option parent after the flip, so it is not orphaned.
        assert_eq!(ctx.graph.node("f").unwrap().category(), Some(FactorCategory::Controllable));
    }

    #[test]
    fn test_single_goal_keeps_most_connected() {
        let graph = Graph::new()
            .with_node(Node::new("g1", NodeKind::Goal, "Revenue").with_data(json!({"note": "keep"})))
            .with_node(Node::new("g2", NodeKind::Goal, "Retention"))
            .with_node(Node::factor("a", "A", FactorCategory::External))
            .with_node(Node::factor("b", "B", FactorCategory::External))
            .with_edge(Edge::new("e1", "a", "g1"))
            .with_edge(Edge::new("e2", "a", "g2"))
            .with_edge(Edge::new("e3", "b", "g2"));
        let mut ctx = ctx_with(graph);
        let node_count = ctx.graph.nodes.len();
        run(&mut ctx);

        assert!(ctx.normalise_summary.single_goal_applied);
        assert_eq!(ctx.graph.count_kind(NodeKind::Goal), 1);
        assert_eq!(ctx.graph.goal().unwrap().id, "g2");
        assert_eq!(ctx.graph.kind_of("g1"), Some(NodeKind::Outcome));
        assert_eq!(ctx.graph.node("g1").unwrap().data_field("note"), Some(json!("keep")));
        assert_eq!(ctx.graph.nodes.len(), node_count);
        let targets = ctx.corrections.targets(Stage::Normalise, CorrectionKind::SingleGoalApplied);
        assert!(targets.contains("g1"));
    }

    #[test]
    fn test_single_goal_prefers_thresholded_goal() {
        let graph = Graph::new()
            .with_node(Node::new("g1", NodeKind::Goal, "Margin").with_data(json!({"goal_threshold": 0.3})))
            .with_node(Node::new("g2", NodeKind::Goal, "Volume"))
            .with_node(Node::factor("a", "A", FactorCategory::External))
            .with_node(Node::factor("b", "B", FactorCategory::External))
            .with_edge(Edge::new("e1", "a", "g1"))
            .with_edge(Edge::new("e2", "a", "g2"))
            .with_edge(Edge::new("e3", "b", "g2"));
        let mut ctx = ctx_with(graph);
        run(&mut ctx);

        let goal = ctx.graph.goal().unwrap();
        assert_eq!(goal.id, "g1");
        assert_eq!(goal.goal_data().unwrap().goal_threshold, Some(0.3));
        assert_eq!(ctx.graph.kind_of("g2"), Some(NodeKind::Outcome));
        let correction = ctx.corrections.of_kind(CorrectionKind::SingleGoalApplied).next().unwrap();
        assert!(correction.description.contains("goal threshold"));
    }

    #[test]
    fn test_raw_threshold_counts_when_choosing_goal() {
        let graph = Graph::new()
            .with_node(Node::new("g1", NodeKind::Goal, "Volume"))
            .with_node(Node::new("g2", NodeKind::Goal, "Margin").with_data(json!({
                "goal_threshold_raw": 20,
                "goal_threshold_unit": "%"
            })))
            .with_node(Node::factor("a", "A", FactorCategory::External))
            .with_edge(Edge::new("e1", "a", "g1"));
        let mut ctx = ctx_with(graph);
        run(&mut ctx);

        let goal = ctx.graph.goal().unwrap();
        assert_eq!(goal.id, "g2");
        assert_eq!(goal.goal_data().unwrap().goal_threshold, Some(0.2));
    }

    #[test]
    fn test_goal_threshold_from_percent() {
        let graph = Graph::new().with_node(Node::new("g", NodeKind::Goal, "Margin").with_data(json!({
            "goal_threshold_raw": 35,
            "goal_threshold_unit": "%",
            "goal_threshold_cap": 0.3
        })));
        let mut ctx = ctx_with(graph);
        run(&mut ctx);
        let data = ctx.graph.goal().unwrap().goal_data().unwrap();
        assert_eq!(data.goal_threshold, Some(0.3));
        assert_eq!(data.goal_threshold_raw, Some(35.0));
    }

    #[test]
    fn test_goal_threshold_left_alone_when_set() {
        let graph = Graph::new().with_node(Node::new("g", NodeKind::Goal, "Margin").with_data(json!({
            "goal_threshold": 0.1,
            "goal_threshold_raw": 35,
            "goal_threshold_unit": "%"
        })));
        let mut ctx = ctx_with(graph);
        run(&mut ctx);
        assert_eq!(ctx.graph.goal().unwrap().goal_data().unwrap().goal_threshold, Some(0.1));
        assert_eq!(ctx.corrections.of_kind(CorrectionKind::GoalThresholdNormalized).count(), 0);
    }

    #[test]
    fn test_orphan_reclassification_drops_only_sanctioned_fields() {
        let orphan = Node::factor("f", "Ad spend", FactorCategory::Controllable)
            .with_extra("x_layout", json!({"x": 1}))
            .with_data(json!({
                "value": 5,
                "factor_type": "cost",
                "uncertainty_drivers": ["vendor"],
                "custom": true
            }));
        let mut ctx = ctx_with(Graph::new().with_node(orphan));
        run(&mut ctx);

        let node = ctx.graph.node("f").unwrap();
        assert_eq!(node.category(), Some(FactorCategory::External));
        assert_eq!(node.extra["x_layout"], json!({"x": 1}));
        let data = node.to_value()["data"].clone();
        assert_eq!(data, json!({"value": 5.0, "custom": true}));
        assert_eq!(ctx.normalise_summary.factors_reclassified, 1);
        assert!(ctx
            .corrections
            .targets(Stage::Normalise, CorrectionKind::FactorReclassified)
            .contains("f"));
    }

    #[test]
    fn test_category_inferred_from_option_parent() {
        let graph = Graph::new()
            .with_node(Node::new("o", NodeKind::Option, "O"))
            .with_node(Node::new("f", NodeKind::Factor, "F"))
            .with_edge(Edge::new("e", "o", "f"));
        let mut ctx = ctx_with(graph);
        run(&mut ctx);
        assert_eq!(ctx.graph.node("f").unwrap().category(), Some(FactorCategory::Controllable));
        assert_eq!(ctx.normalise_summary.factors_reclassified, 0);
    }

    #[test]
    fn test_outcome_beliefs_filled() {
        let graph = Graph::new()
            .with_node(Node::factor("f", "F", FactorCategory::External))
            .with_node(Node::new("out", NodeKind::Outcome, "Churn"))
            .with_edge(Edge::new("e1", "f", "out").with_strength(-0.4))
            .with_edge(Edge::new("e2", "f", "out").with_belief(0.9).with_strength(0.1));
        let mut ctx = ctx_with(graph);
        run(&mut ctx);

        let e1 = &ctx.graph.edges[0];
        assert_eq!(e1.strength_mean, Some(-0.4));
        assert_eq!(e1.belief_exists, Some(OUTCOME_BELIEF_EXISTS));
        assert_eq!(e1.strength_std, Some(OUTCOME_STRENGTH_STD));
        assert_eq!(ctx.graph.edges[1].belief_exists, Some(0.9));
        assert_eq!(ctx.normalise_summary.outcome_beliefs_filled, 2);
    }

    #[test]
    fn test_filled_strength_follows_effect_direction() {
        let negative = Edge {
            effect_direction: Some(EffectDirection::Negative),
            ..Edge::new("e1", "f", "out")
        };
        let positive = Edge {
            effect_direction: Some(EffectDirection::Positive),
            ..Edge::new("e2", "f", "out")
        };
        let graph = Graph::new()
            .with_node(Node::factor("f", "F", FactorCategory::External))
            .with_node(Node::new("out", NodeKind::Outcome, "Churn"))
            .with_edge(negative)
            .with_edge(positive)
            .with_edge(Edge::new("e3", "f", "out"));
        let mut ctx = ctx_with(graph);
        run(&mut ctx);

        assert_eq!(ctx.graph.edges[0].strength_mean, Some(-OUTCOME_STRENGTH_MEAN));
        assert_eq!(ctx.graph.edges[0].signed_weight(), -OUTCOME_STRENGTH_MEAN);
        assert_eq!(ctx.graph.edges[1].strength_mean, Some(OUTCOME_STRENGTH_MEAN));
        assert_eq!(ctx.graph.edges[2].strength_mean, Some(OUTCOME_STRENGTH_MEAN));
    }

    #[test]
    fn test_decision_branches_normalised() {
        let graph = Graph::new()
            .with_node(Node::new("d", NodeKind::Decision, "D"))
            .with_node(Node::new("o1", NodeKind::Option, "A"))
            .with_node(Node::new("o2", NodeKind::Option, "B"))
            .with_node(Node::factor("f", "F", FactorCategory::Controllable))
            .with_edge(Edge::new("e1", "d", "o1").with_belief(0.6))
            .with_edge(Edge::new("e2", "d", "o2").with_belief(0.6))
            .with_edge(Edge::new("e3", "o1", "f").with_strength(0.3));
        let mut ctx = ctx_with(graph);
        run(&mut ctx);

        assert_eq!(ctx.graph.edges[0].belief_exists, Some(0.5));
        assert_eq!(ctx.graph.edges[1].belief_exists, Some(0.5));
        assert_eq!(ctx.graph.edges[2].strength_mean, Some(1.0));
        assert_eq!(ctx.graph.edges[2].strength_std, Some(0.01));
        assert_eq!(ctx.normalise_summary.decision_branches_normalized, 1);

        // Second pass is a no-op.
        run(&mut ctx);
        assert_eq!(ctx.normalise_summary.decision_branches_normalized, 0);
    }

    #[test]
    fn test_counts_unchanged_and_detectors_stored() {
        let graph = Graph::new()
            .with_node(Node::new("g", NodeKind::Goal, "G"))
            .with_node(Node::new("o", NodeKind::Option, "O"))
            .with_node(Node::factor("f", "F", FactorCategory::Controllable))
            .with_edge(Edge::new("e1", "o", "f"))
            .with_edge(Edge::new("e2", "f", "g"))
            .with_edge(Edge::new("e3", "f", "ghost"));
        let mut ctx = ctx_with(graph);
        run(&mut ctx);

        assert_eq!(ctx.graph.nodes.len(), 3);
        assert_eq!(ctx.graph.edges.len(), 3);
        let codes: Vec<&str> = ctx.pending_violations.iter().map(|v| v.code.as_str()).collect();
        assert!(codes.contains(&detectors::DANGLING_EDGE));
        assert!(codes.contains(&NO_EXTERNAL_FACTORS));
    }
}
