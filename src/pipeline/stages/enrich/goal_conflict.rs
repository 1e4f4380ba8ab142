//! Pairwise goal-conflict analysis over signed causal paths.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::graph::{EdgeClass, Graph};

/// Longest causal path followed, in edges.
pub const MAX_PATH_DEPTH: usize = 8;

/// Contributions smaller than this count as zero.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Independent,
    Aligned,
    Conflicting,
}

/// How to present trade-offs when goals conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictGuidance {
    /// Show the trade-off frontier between the goals.
    Pareto,
    /// Ask the user to rank the goals.
    Prioritization,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalRelationship {
    pub goal_a: String,
    pub goal_b: String,
    pub relationship: RelationshipKind,
    pub shared_nodes: Vec<String>,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalConflictAnalysis {
    pub goal_ids: Vec<String>,
    pub relationships: Vec<GoalRelationship>,
    pub has_conflicts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<ConflictGuidance>,
}

/// Analyse every pair of `goal_ids` that still exist in `graph`.
pub fn analyze(graph: &Graph, goal_ids: &[String]) -> GoalConflictAnalysis {
    let goals: Vec<String> = goal_ids
        .iter()
        .filter(|id| graph.node(id).is_some())
        .cloned()
        .collect();
    let goal_set: HashSet<&str> = goals.iter().map(String::as_str).collect();

    let contributions: Vec<HashMap<String, f64>> = goals
        .iter()
        .map(|g| contributions_to(graph, g, &goal_set))
        .collect();

    let mut relationships = Vec::new();
    for i in 0..goals.len() {
        for j in (i + 1)..goals.len() {
            relationships.push(relate(
                graph,
                (&goals[i], &contributions[i]),
                (&goals[j], &contributions[j]),
            ));
        }
    }

    let conflicts = relationships
        .iter()
        .filter(|r| r.relationship == RelationshipKind::Conflicting)
        .count();
    let guidance = match conflicts {
        0 => None,
        n if goals.len() >= 3 && n >= 2 => Some(ConflictGuidance::Prioritization),
        _ => Some(ConflictGuidance::Pareto),
    };

    GoalConflictAnalysis {
        goal_ids: goals,
        relationships,
        has_conflicts: conflicts > 0,
        guidance,
    }
}

/// Net signed contribution of every node to `goal`: the sum over causal
/// simple paths of the product of edge weights. Other goals are sinks.
fn contributions_to(graph: &Graph, goal: &str, goals: &HashSet<&str>) -> HashMap<String, f64> {
    let mut totals = HashMap::new();
    let mut on_path = HashSet::from([goal.to_string()]);
    walk_back(graph, goal, 1.0, 0, goals, &mut on_path, &mut totals);
    totals
}

fn walk_back(
    graph: &Graph,
    node: &str,
    product: f64,
    depth: usize,
    goals: &HashSet<&str>,
    on_path: &mut HashSet<String>,
    totals: &mut HashMap<String, f64>,
) {
    if depth >= MAX_PATH_DEPTH {
        return;
    }
    for edge in graph.incoming(node) {
        if graph.edge_class(edge) != EdgeClass::Causal {
            continue;
        }
        let source = edge.from.as_str();
        if goals.contains(source) || on_path.contains(source) {
            continue;
        }
        let weight = product * edge.signed_weight();
        *totals.entry(source.to_string()).or_insert(0.0) += weight;

        on_path.insert(source.to_string());
        walk_back(graph, source, weight, depth + 1, goals, on_path, totals);
        on_path.remove(source);
    }
}

fn relate(
    graph: &Graph,
    (goal_a, into_a): (&String, &HashMap<String, f64>),
    (goal_b, into_b): (&String, &HashMap<String, f64>),
) -> GoalRelationship {
    // Document order keeps the output stable.
    let shared: Vec<(&str, f64, f64)> = graph
        .nodes
        .iter()
        .filter_map(|n| {
            let a = *into_a.get(&n.id)?;
            let b = *into_b.get(&n.id)?;
            (a.abs() > EPSILON && b.abs() > EPSILON).then_some((n.id.as_str(), a, b))
        })
        .collect();

    let opposed: Vec<&str> = shared
        .iter()
        .filter(|(_, a, b)| a.signum() != b.signum())
        .map(|(id, _, _)| *id)
        .collect();

    let (relationship, explanation) = if shared.is_empty() {
        (
            RelationshipKind::Independent,
            format!("No factor influences both {} and {}", goal_a, goal_b),
        )
    } else if !opposed.is_empty() {
        (
            RelationshipKind::Conflicting,
            format!(
                "{} push {} and {} in opposite directions",
                opposed.join(", "),
                goal_a,
                goal_b
            ),
        )
    } else {
        (
            RelationshipKind::Aligned,
            format!(
                "{} shared driver(s) move {} and {} the same way",
                shared.len(),
                goal_a,
                goal_b
            ),
        )
    };

    GoalRelationship {
        goal_a: goal_a.clone(),
        goal_b: goal_b.clone(),
        relationship,
        shared_nodes: shared.iter().map(|(id, _, _)| id.to_string()).collect(),
        explanation,
    }
}
