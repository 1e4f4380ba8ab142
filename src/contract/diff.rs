//! Before/after diffing of graph snapshots against a [`StageContract`].

use serde_json::{Map, Value};
use std::collections::HashSet;

use super::{DropPrecondition, Scope, StageContract};
use crate::corrections::{CorrectionCollector, CorrectionKind};

/// One breach of a stage contract.
#[derive(Debug, Clone, PartialEq)]
pub enum ContractViolation {
    FieldDropped {
        scope: Scope,
        entity_id: Option<String>,
        field: String,
    },
    FieldModified {
        scope: Scope,
        entity_id: Option<String>,
        field: String,
    },
    NodeRemoved {
        id: String,
    },
    EdgeRemoved {
        id: String,
    },
}

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let at = |id: &Option<String>| id.as_deref().map(|i| format!(" of '{}'", i)).unwrap_or_default();
        match self {
            ContractViolation::FieldDropped {
                scope,
                entity_id,
                field,
            } => write!(f, "{} field '{}'{} was dropped", scope, field, at(entity_id)),
            ContractViolation::FieldModified {
                scope,
                entity_id,
                field,
            } => write!(f, "{} field '{}'{} was modified", scope, field, at(entity_id)),
            ContractViolation::NodeRemoved { id } => write!(f, "node '{}' was removed", id),
            ContractViolation::EdgeRemoved { id } => write!(f, "edge '{}' was removed", id),
        }
    }
}

/// Compare two graph snapshots (JSON form) against `contract`.
///
/// Nodes are matched by id. Edges are matched by id, or by position when
/// the earlier snapshot had no id. Additions are never violations.
pub fn verify(
    contract: &StageContract,
    before: &Value,
    after: &Value,
    corrections: &CorrectionCollector,
) -> Vec<ContractViolation> {
    let mut checker = Checker {
        contract,
        reclassified: corrections.targets(contract.stage, CorrectionKind::FactorReclassified),
        violations: Vec::new(),
    };

    let empty = Map::new();
    let before_graph = before.as_object().unwrap_or(&empty);
    let after_graph = after.as_object().unwrap_or(&empty);

    checker.compare_object(Scope::Graph, None, before_graph, after_graph, &["nodes", "edges"]);
    checker.compare_nodes(array(before_graph, "nodes"), array(after_graph, "nodes"));
    checker.compare_edges(array(before_graph, "edges"), array(after_graph, "edges"));

    checker.violations
}

struct Checker<'a> {
    contract: &'a StageContract,
    reclassified: HashSet<String>,
    violations: Vec<ContractViolation>,
}

impl Checker<'_> {
    fn compare_nodes(&mut self, before: &[Value], after: &[Value]) {
        for node in before {
            let Some(before_node) = node.as_object() else { continue };
            let Some(id) = before_node.get("id").and_then(Value::as_str) else { continue };
            let after_node = after
                .iter()
                .filter_map(Value::as_object)
                .find(|n| n.get("id").and_then(Value::as_str) == Some(id));

            let Some(after_node) = after_node else {
                if !self.contract.allowed_removals.nodes {
                    self.violations.push(ContractViolation::NodeRemoved { id: id.to_string() });
                }
                continue;
            };

            let entity = Some(id.to_string());
            self.compare_object(Scope::Node, entity.clone(), before_node, after_node, &["id", "data"]);

            match (before_node.get("data"), after_node.get("data")) {
                (Some(Value::Object(b)), Some(Value::Object(a))) => {
                    self.compare_object(Scope::NodeData, entity, b, a, &[]);
                }
                (Some(Value::Object(b)), _) => {
                    self.compare_object(Scope::NodeData, entity, b, &Map::new(), &[]);
                }
                (Some(b), a) => {
                    if a.map_or(true, |a| !json_equiv(b, a)) {
                        self.check_changed_field(Scope::Node, &entity, "data", b, a, before_node, after_node);
                    }
                }
                (None, _) => {}
            }
        }
    }

    fn compare_edges(&mut self, before: &[Value], after: &[Value]) {
        for (index, edge) in before.iter().enumerate() {
            let Some(before_edge) = edge.as_object() else { continue };
            let id = before_edge
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty());

            let after_edge = match id {
                Some(id) => after
                    .iter()
                    .filter_map(Value::as_object)
                    .find(|e| e.get("id").and_then(Value::as_str) == Some(id)),
                None => after.get(index).and_then(Value::as_object),
            };
            let label = id
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{}", index));

            match after_edge {
                Some(after_edge) => {
                    self.compare_object(Scope::Edge, Some(label), before_edge, after_edge, &["id"]);
                }
                None if !self.contract.allowed_removals.edges => {
                    self.violations.push(ContractViolation::EdgeRemoved { id: label });
                }
                None => {}
            }
        }
    }

    fn compare_object(
        &mut self,
        scope: Scope,
        entity: Option<String>,
        before: &Map<String, Value>,
        after: &Map<String, Value>,
        skip: &[&str],
    ) {
        for (field, before_value) in before {
            if skip.contains(&field.as_str()) {
                continue;
            }
            let after_value = after.get(field);
            if after_value.map_or(false, |a| json_equiv(before_value, a)) {
                continue;
            }
            self.check_changed_field(scope, &entity, field, before_value, after_value, before, after);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_changed_field(
        &mut self,
        scope: Scope,
        entity: &Option<String>,
        field: &str,
        before_value: &Value,
        after_value: Option<&Value>,
        _before: &Map<String, Value>,
        after: &Map<String, Value>,
    ) {
        match after_value {
            None => {
                if !self.drop_allowed(scope, entity, field, before_value, after) {
                    self.violations.push(ContractViolation::FieldDropped {
                        scope,
                        entity_id: entity.clone(),
                        field: field.to_string(),
                    });
                }
            }
            Some(_) if self.contract.allowed_modifications.allows(scope, field) => {}
            Some(Value::Object(after_inner)) if before_value.is_object() => {
                // Nested objects: report the innermost field that changed.
                let mut nested = Vec::new();
                if let Some(before_inner) = before_value.as_object() {
                    collect_nested(field, before_inner, after_inner, &mut nested);
                }
                for (path, dropped) in nested {
                    self.violations.push(if dropped {
                        ContractViolation::FieldDropped {
                            scope,
                            entity_id: entity.clone(),
                            field: path,
                        }
                    } else {
                        ContractViolation::FieldModified {
                            scope,
                            entity_id: entity.clone(),
                            field: path,
                        }
                    });
                }
            }
            Some(_) => self.violations.push(ContractViolation::FieldModified {
                scope,
                entity_id: entity.clone(),
                field: field.to_string(),
            }),
        }
    }

    fn drop_allowed(
        &self,
        scope: Scope,
        entity: &Option<String>,
        field: &str,
        before_value: &Value,
        after: &Map<String, Value>,
    ) -> bool {
        let Some(rule) = self.contract.drop_rule(scope, field) else {
            return false;
        };
        match rule.precondition {
            DropPrecondition::Reclassified => entity
                .as_ref()
                .map_or(false, |id| self.reclassified.contains(id)),
            DropPrecondition::RenamedTo(target) => after
                .get(target)
                .map_or(false, |v| json_equiv(before_value, v)),
        }
    }
}

/// Walk two objects and collect `(path, dropped)` for every leaf that
/// disappeared or changed.
fn collect_nested(
    prefix: &str,
    before: &Map<String, Value>,
    after: &Map<String, Value>,
    out: &mut Vec<(String, bool)>,
) {
    for (key, b) in before {
        let path = format!("{}.{}", prefix, key);
        match after.get(key) {
            None => out.push((path, true)),
            Some(a) if json_equiv(b, a) => {}
            Some(Value::Object(a_inner)) if b.is_object() => {
                if let Some(b_inner) = b.as_object() {
                    collect_nested(&path, b_inner, a_inner, out);
                }
            }
            Some(_) => out.push((path, false)),
        }
    }
}

fn array<'a>(map: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    map.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// JSON equality where numbers compare by value (`10` equals `10.0`).
pub fn json_equiv(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_equiv(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map_or(false, |w| json_equiv(v, w)))
        }
        _ => a == b,
    }
}
