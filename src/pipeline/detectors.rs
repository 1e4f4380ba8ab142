//! Structural detectors shared by Normalise and Repair.

use std::collections::HashSet;

use crate::engine::Violation;
use crate::graph::{FactorCategory, Graph, Node, NodeKind};

pub const DANGLING_EDGE: &str = "DANGLING_EDGE";
pub const SELF_LOOP: &str = "SELF_LOOP";
pub const DUPLICATE_EDGE: &str = "DUPLICATE_EDGE";
pub const NON_CANONICAL_EDGE: &str = "NON_CANONICAL_EDGE";
pub const MISSING_BASELINE_OPTION: &str = "MISSING_BASELINE_OPTION";
pub const ORPHAN_CONTROLLABLE_FACTOR: &str = "ORPHAN_CONTROLLABLE_FACTOR";
pub const NO_EXTERNAL_FACTORS: &str = "NO_EXTERNAL_FACTORS";

/// Codes Repair knows how to fix without the LLM.
pub const DETERMINISTIC_CODES: [&str; 6] = [
    DANGLING_EDGE,
    SELF_LOOP,
    DUPLICATE_EDGE,
    NON_CANONICAL_EDGE,
    MISSING_BASELINE_OPTION,
    ORPHAN_CONTROLLABLE_FACTOR,
];

const BASELINE_KEYWORDS: [&str; 4] = ["status quo", "baseline", "do nothing", "no change"];

/// Whether an option represents keeping things as they are.
pub fn is_baseline_option(node: &Node) -> bool {
    if node.data_field("is_baseline").and_then(|v| v.as_bool()) == Some(true) {
        return true;
    }
    let label = node.display_name().to_lowercase();
    BASELINE_KEYWORDS.iter().any(|k| label.contains(k))
}

/// Why an edge breaks the decision→option→factor shape, if it does.
pub fn non_canonical_reason(from: NodeKind, to: NodeKind) -> Option<&'static str> {
    match (from, to) {
        (NodeKind::Decision, NodeKind::Option) | (NodeKind::Option, NodeKind::Factor) => None,
        (NodeKind::Decision, _) => Some("a decision may only point at options"),
        (_, NodeKind::Option) => Some("only a decision may point at an option"),
        (NodeKind::Option, _) => Some("an option may only point at factors"),
        _ => None,
    }
}

/// Options hanging off a decision via decision→option edges, in edge order.
pub fn options_of<'a>(graph: &'a Graph, decision_id: &'a str) -> Vec<&'a Node> {
    let mut seen = HashSet::new();
    graph
        .outgoing(decision_id)
        .filter_map(|e| graph.node(&e.to))
        .filter(|n| n.kind() == NodeKind::Option && seen.insert(n.id.clone()))
        .collect()
}

/// Run every structural detector. Order of the result follows the order of
/// checks below, then document order.
pub fn detect(graph: &Graph) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut seen_pairs = HashSet::new();

    for edge in &graph.edges {
        let (from, to) = (graph.kind_of(&edge.from), graph.kind_of(&edge.to));
        let (Some(from), Some(to)) = (from, to) else {
            violations.push(
                Violation::new(
                    DANGLING_EDGE,
                    format!("Edge {} refers to a node that does not exist", edge.id),
                )
                .with_targets([edge.id.clone()]),
            );
            continue;
        };

        if edge.from == edge.to {
            violations.push(
                Violation::new(SELF_LOOP, format!("Edge {} loops on {}", edge.id, edge.from))
                    .with_targets([edge.id.clone()]),
            );
            continue;
        }

        if !seen_pairs.insert((edge.from.as_str(), edge.to.as_str())) {
            violations.push(
                Violation::new(
                    DUPLICATE_EDGE,
                    format!("Edge {} repeats {} -> {}", edge.id, edge.from, edge.to),
                )
                .with_targets([edge.id.clone()]),
            );
            continue;
        }

        if let Some(reason) = non_canonical_reason(from, to) {
            violations.push(
                Violation::new(
                    NON_CANONICAL_EDGE,
                    format!("Edge {} ({} -> {}): {}", edge.id, from, to, reason),
                )
                .with_targets([edge.id.clone()]),
            );
        }
    }

    for decision in graph.nodes_of_kind(NodeKind::Decision) {
        let options = options_of(graph, &decision.id);
        if !options.is_empty() && !options.iter().any(|o| is_baseline_option(o)) {
            violations.push(
                Violation::new(
                    MISSING_BASELINE_OPTION,
                    format!("Decision {} has no status-quo option", decision.id),
                )
                .with_targets([decision.id.clone()]),
            );
        }
    }

    for factor in graph.nodes_of_kind(NodeKind::Factor) {
        if factor.category() == Some(FactorCategory::Controllable)
            && !graph.has_option_parent(&factor.id)
        {
            violations.push(
                Violation::new(
                    ORPHAN_CONTROLLABLE_FACTOR,
                    format!("Controllable factor {} is not set by any option", factor.id),
                )
                .with_targets([factor.id.clone()]),
            );
        }
    }

    let categories: Vec<Option<FactorCategory>> = graph
        .nodes_of_kind(NodeKind::Factor)
        .map(Node::category)
        .collect();
    if graph.goal().is_some()
        && categories.contains(&Some(FactorCategory::Controllable))
        && !categories.contains(&Some(FactorCategory::External))
    {
        violations.push(Violation::new(
            NO_EXTERNAL_FACTORS,
            "The model has no external factors; every driver is under the decision maker's control",
        ));
    }

    violations
}

/// True when Repair can fix `code` on its own.
pub fn is_deterministic(code: &str) -> bool {
    DETERMINISTIC_CODES.contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;
    use serde_json::json;

    fn codes(violations: &[Violation]) -> Vec<&str> {
        violations.iter().map(|v| v.code.as_str()).collect()
    }

    fn base() -> Graph {
        Graph::new()
            .with_node(Node::new("g", NodeKind::Goal, "Profit"))
            .with_node(Node::new("d", NodeKind::Decision, "Price?"))
            .with_node(Node::new("o1", NodeKind::Option, "Raise price"))
            .with_node(Node::new("o0", NodeKind::Option, "Status quo"))
            .with_node(Node::factor("f", "Price", FactorCategory::Controllable))
            .with_node(Node::factor("m", "Market demand", FactorCategory::External))
            .with_edge(Edge::new("e1", "d", "o1"))
            .with_edge(Edge::new("e2", "d", "o0"))
            .with_edge(Edge::new("e3", "o1", "f"))
            .with_edge(Edge::new("e4", "f", "g"))
            .with_edge(Edge::new("e5", "m", "g"))
    }

    #[test]
    fn test_canonical_graph_is_clean() {
        assert!(detect(&base()).is_empty());
    }

    #[test]
    fn test_edge_detectors() {
        let graph = base()
            .with_edge(Edge::new("dangling", "f", "ghost"))
            .with_edge(Edge::new("loop", "f", "f"))
            .with_edge(Edge::new("dup", "f", "g"))
            .with_edge(Edge::new("bad", "d", "f"));
        assert_eq!(
            codes(&detect(&graph)),
            vec![DANGLING_EDGE, SELF_LOOP, DUPLICATE_EDGE, NON_CANONICAL_EDGE]
        );
    }

    #[test]
    fn test_non_canonical_reasons() {
        assert!(non_canonical_reason(NodeKind::Decision, NodeKind::Option).is_none());
        assert!(non_canonical_reason(NodeKind::Factor, NodeKind::Goal).is_none());
        assert!(non_canonical_reason(NodeKind::Decision, NodeKind::Goal).is_some());
        assert!(non_canonical_reason(NodeKind::Factor, NodeKind::Option).is_some());
        assert!(non_canonical_reason(NodeKind::Option, NodeKind::Outcome).is_some());
    }

    #[test]
    fn test_missing_baseline() {
        let mut graph = base();
        graph.edges.retain(|e| e.id != "e2");
        let violations = detect(&graph);
        assert_eq!(codes(&violations), vec![MISSING_BASELINE_OPTION]);
        assert_eq!(violations[0].target_ids, vec!["d".to_string()]);
    }

    #[test]
    fn test_baseline_by_flag() {
        let node = Node::new("o", NodeKind::Option, "Keep going").with_data(json!({"is_baseline": true}));
        assert!(is_baseline_option(&node));
        assert!(!is_baseline_option(&Node::new("o", NodeKind::Option, "Expand")));
    }

    #[test]
    fn test_orphan_and_no_external() {
        let mut graph = base();
        graph.edges.retain(|e| e.id != "e3");
        graph.node_mut("m").unwrap().set_category(FactorCategory::Observable);
        assert_eq!(
            codes(&detect(&graph)),
            vec![ORPHAN_CONTROLLABLE_FACTOR, NO_EXTERNAL_FACTORS]
        );
    }

    #[test]
    fn test_deterministic_codes() {
        assert!(is_deterministic(SELF_LOOP));
        assert!(!is_deterministic(NO_EXTERNAL_FACTORS));
        assert!(!is_deterministic("ENGINE_ONLY_RULE"));
    }
}
