//! Node representation in the decision graph.
//!
//! A node is a closed union over [`NodeKind`]. Every payload keeps the fields
//! it does not model in an opaque `extra` map, and a known field whose value
//! does not fit its typed shape is kept there as well rather than rejected.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{put_typed, take_typed};
use crate::error::ParseError;

/// Kind of a decision-graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Goal,
    Decision,
    Option,
    Factor,
    Outcome,
    Risk,
    Constraint,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Goal => "goal",
            NodeKind::Decision => "decision",
            NodeKind::Option => "option",
            NodeKind::Factor => "factor",
            NodeKind::Outcome => "outcome",
            NodeKind::Risk => "risk",
            NodeKind::Constraint => "constraint",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "goal" => Ok(NodeKind::Goal),
            "decision" => Ok(NodeKind::Decision),
            "option" => Ok(NodeKind::Option),
            "factor" => Ok(NodeKind::Factor),
            "outcome" => Ok(NodeKind::Outcome),
            "risk" => Ok(NodeKind::Risk),
            "constraint" => Ok(NodeKind::Constraint),
            _ => Err(format!("Unknown node kind: {}", s)),
        }
    }
}

/// Category of a factor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorCategory {
    /// Set directly by choosing an option.
    Controllable,
    /// Outside the decision maker's influence.
    External,
    /// Measurable but not set by any option.
    Observable,
}

impl FactorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactorCategory::Controllable => "controllable",
            FactorCategory::External => "external",
            FactorCategory::Observable => "observable",
        }
    }
}

impl std::fmt::Display for FactorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Goal payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoalData {
    pub goal_threshold: Option<f64>,
    pub goal_threshold_raw: Option<f64>,
    pub goal_threshold_unit: Option<String>,
    pub goal_threshold_cap: Option<f64>,
    pub extra: Map<String, Value>,
}

impl GoalData {
    fn from_map(mut map: Map<String, Value>) -> Self {
        Self {
            goal_threshold: take_typed(&mut map, "goal_threshold"),
            goal_threshold_raw: take_typed(&mut map, "goal_threshold_raw"),
            goal_threshold_unit: take_typed(&mut map, "goal_threshold_unit"),
            goal_threshold_cap: take_typed(&mut map, "goal_threshold_cap"),
            extra: map,
        }
    }

    fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        put_typed(&mut map, "goal_threshold", &self.goal_threshold);
        put_typed(&mut map, "goal_threshold_raw", &self.goal_threshold_raw);
        put_typed(&mut map, "goal_threshold_unit", &self.goal_threshold_unit);
        put_typed(&mut map, "goal_threshold_cap", &self.goal_threshold_cap);
        merge_extra(&mut map, &self.extra);
        map
    }
}

/// Option payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionData {
    /// Target value per factor id when this option is chosen.
    pub interventions: Option<BTreeMap<String, f64>>,
    pub extra: Map<String, Value>,
}

impl OptionData {
    fn from_map(mut map: Map<String, Value>) -> Self {
        Self {
            interventions: take_typed(&mut map, "interventions"),
            extra: map,
        }
    }

    fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        put_typed(&mut map, "interventions", &self.interventions);
        merge_extra(&mut map, &self.extra);
        map
    }
}

/// Factor payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactorData {
    pub value: Option<f64>,
    pub baseline: Option<f64>,
    pub unit: Option<String>,
    pub factor_type: Option<String>,
    pub uncertainty_drivers: Option<Vec<String>>,
    pub extra: Map<String, Value>,
}

/// Data fields that only make sense on a controllable factor.
pub const CONTROLLABLE_ONLY_FIELDS: [&str; 2] = ["factor_type", "uncertainty_drivers"];

impl FactorData {
    fn from_map(mut map: Map<String, Value>) -> Self {
        Self {
            value: take_typed(&mut map, "value"),
            baseline: take_typed(&mut map, "baseline"),
            unit: take_typed(&mut map, "unit"),
            factor_type: take_typed(&mut map, "factor_type"),
            uncertainty_drivers: take_typed(&mut map, "uncertainty_drivers"),
            extra: map,
        }
    }

    fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        put_typed(&mut map, "value", &self.value);
        put_typed(&mut map, "baseline", &self.baseline);
        put_typed(&mut map, "unit", &self.unit);
        put_typed(&mut map, "factor_type", &self.factor_type);
        put_typed(&mut map, "uncertainty_drivers", &self.uncertainty_drivers);
        merge_extra(&mut map, &self.extra);
        map
    }

    /// Remove the controllable-only fields, typed or opaque. Returns the
    /// names of the fields that were present.
    pub fn drop_controllable_fields(&mut self) -> Vec<&'static str> {
        let mut dropped = Vec::new();
        if self.factor_type.take().is_some() | self.extra.remove("factor_type").is_some() {
            dropped.push("factor_type");
        }
        if self.uncertainty_drivers.take().is_some()
            | self.extra.remove("uncertainty_drivers").is_some()
        {
            dropped.push("uncertainty_drivers");
        }
        dropped
    }
}

/// Kind-specific part of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeBody {
    Goal { data: Option<GoalData> },
    Decision { data: Option<Map<String, Value>> },
    Option { data: Option<OptionData> },
    Factor {
        category: Option<FactorCategory>,
        data: Option<FactorData>,
    },
    Outcome { data: Option<Map<String, Value>> },
    Risk { data: Option<Map<String, Value>> },
    Constraint { data: Option<Map<String, Value>> },
}

impl NodeBody {
    fn empty(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Goal => NodeBody::Goal { data: None },
            NodeKind::Decision => NodeBody::Decision { data: None },
            NodeKind::Option => NodeBody::Option { data: None },
            NodeKind::Factor => NodeBody::Factor {
                category: None,
                data: None,
            },
            NodeKind::Outcome => NodeBody::Outcome { data: None },
            NodeKind::Risk => NodeBody::Risk { data: None },
            NodeKind::Constraint => NodeBody::Constraint { data: None },
        }
    }

    fn from_parts(kind: NodeKind, data: Option<Map<String, Value>>, extra: &mut Map<String, Value>) -> Self {
        match kind {
            NodeKind::Goal => NodeBody::Goal {
                data: data.map(GoalData::from_map),
            },
            NodeKind::Decision => NodeBody::Decision { data },
            NodeKind::Option => NodeBody::Option {
                data: data.map(OptionData::from_map),
            },
            NodeKind::Factor => NodeBody::Factor {
                category: take_typed(extra, "category"),
                data: data.map(FactorData::from_map),
            },
            NodeKind::Outcome => NodeBody::Outcome { data },
            NodeKind::Risk => NodeBody::Risk { data },
            NodeKind::Constraint => NodeBody::Constraint { data },
        }
    }

    fn data_map(&self) -> Option<Map<String, Value>> {
        match self {
            NodeBody::Goal { data } => data.as_ref().map(GoalData::to_map),
            NodeBody::Option { data } => data.as_ref().map(OptionData::to_map),
            NodeBody::Factor { data, .. } => data.as_ref().map(FactorData::to_map),
            NodeBody::Decision { data }
            | NodeBody::Outcome { data }
            | NodeBody::Risk { data }
            | NodeBody::Constraint { data } => data.clone(),
        }
    }
}

/// A node in the decision graph
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub label: Option<String>,
    pub body: NodeBody,
    /// Top-level fields not modelled above.
    pub extra: Map<String, Value>,
}

impl Node {
    /// Create a node with an empty payload.
    pub fn new(id: impl Into<String>, kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: Some(label.into()),
            body: NodeBody::empty(kind),
            extra: Map::new(),
        }
    }

    /// Create a factor node with a category.
    pub fn factor(id: impl Into<String>, label: impl Into<String>, category: FactorCategory) -> Self {
        let mut node = Self::new(id, NodeKind::Factor, label);
        node.body = NodeBody::Factor {
            category: Some(category),
            data: None,
        };
        node
    }

    /// Add an opaque top-level field.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Replace the payload from a JSON object, typed per kind.
    pub fn with_data(mut self, data: Value) -> Self {
        let map = match data {
            Value::Object(map) => Some(map),
            _ => None,
        };
        let category = self.category();
        self.body = NodeBody::from_parts(self.kind(), map, &mut Map::new());
        if let Some(category) = category {
            self.set_category(category);
        }
        self
    }

    /// Parse a node from its JSON form.
    pub fn from_value(index: usize, value: Value) -> Result<Self, ParseError> {
        let mut map = match value {
            Value::Object(map) => map,
            _ => {
                return Err(ParseError::NotAnEntity {
                    entity: "node".to_string(),
                    index,
                })
            }
        };

        let id = match map.remove("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            _ => {
                return Err(ParseError::InvalidId {
                    entity: "node".to_string(),
                    index,
                    field: "id".to_string(),
                })
            }
        };

        let kind = match map.remove("kind") {
            Some(Value::String(kind)) => kind
                .parse::<NodeKind>()
                .map_err(|_| ParseError::UnknownKind {
                    id: id.clone(),
                    kind: kind.clone(),
                })?,
            Some(other) => {
                return Err(ParseError::UnknownKind {
                    id,
                    kind: other.to_string(),
                })
            }
            None => return Err(ParseError::MissingKind { id }),
        };

        let label = take_typed(&mut map, "label");
        let data = match map.get("data") {
            Some(Value::Object(_)) => match map.remove("data") {
                Some(Value::Object(data)) => Some(data),
                _ => None,
            },
            _ => None,
        };
        let body = NodeBody::from_parts(kind, data, &mut map);

        Ok(Self {
            id,
            label,
            body,
            extra: map,
        })
    }

    /// Serialize to JSON. Typed fields win over opaque ones of the same name.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert("kind".to_string(), Value::String(self.kind().as_str().to_string()));
        put_typed(&mut map, "label", &self.label);
        put_typed(&mut map, "category", &self.category());
        if let Some(data) = self.body.data_map() {
            map.insert("data".to_string(), Value::Object(data));
        }
        merge_extra(&mut map, &self.extra);
        Value::Object(map)
    }

    pub fn kind(&self) -> NodeKind {
        match self.body {
            NodeBody::Goal { .. } => NodeKind::Goal,
            NodeBody::Decision { .. } => NodeKind::Decision,
            NodeBody::Option { .. } => NodeKind::Option,
            NodeBody::Factor { .. } => NodeKind::Factor,
            NodeBody::Outcome { .. } => NodeKind::Outcome,
            NodeBody::Risk { .. } => NodeKind::Risk,
            NodeBody::Constraint { .. } => NodeKind::Constraint,
        }
    }

    /// Label for human-facing text, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    pub fn category(&self) -> Option<FactorCategory> {
        match &self.body {
            NodeBody::Factor { category, .. } => *category,
            _ => None,
        }
    }

    /// Set a factor's category. No-op on other kinds.
    pub fn set_category(&mut self, new_category: FactorCategory) {
        if let NodeBody::Factor { category, .. } = &mut self.body {
            *category = Some(new_category);
            self.extra.remove("category");
        }
    }

    pub fn goal_data(&self) -> Option<&GoalData> {
        match &self.body {
            NodeBody::Goal { data } => data.as_ref(),
            _ => None,
        }
    }

    pub fn goal_data_mut(&mut self) -> Option<&mut GoalData> {
        match &mut self.body {
            NodeBody::Goal { data } => data.as_mut(),
            _ => None,
        }
    }

    pub fn factor_data(&self) -> Option<&FactorData> {
        match &self.body {
            NodeBody::Factor { data, .. } => data.as_ref(),
            _ => None,
        }
    }

    pub fn factor_data_mut(&mut self) -> Option<&mut FactorData> {
        match &mut self.body {
            NodeBody::Factor { data, .. } => data.as_mut(),
            _ => None,
        }
    }

    pub fn option_data(&self) -> Option<&OptionData> {
        match &self.body {
            NodeBody::Option { data } => data.as_ref(),
            _ => None,
        }
    }

    /// Interventions of an option node; empty for other kinds.
    pub fn interventions(&self) -> BTreeMap<String, f64> {
        self.option_data()
            .and_then(|d| d.interventions.clone())
            .unwrap_or_default()
    }

    /// Read a payload field by name regardless of kind, typed or opaque.
    pub fn data_field(&self, key: &str) -> Option<Value> {
        self.body.data_map().and_then(|mut m| m.remove(key))
    }

    /// Turn a goal into an outcome, carrying its payload over unchanged.
    /// Returns false when the node is not a goal.
    pub fn demote_goal_to_outcome(&mut self) -> bool {
        match &self.body {
            NodeBody::Goal { data } => {
                let carried = data.as_ref().map(GoalData::to_map);
                self.body = NodeBody::Outcome { data: carried };
                true
            }
            _ => false,
        }
    }
}

fn merge_extra(map: &mut Map<String, Value>, extra: &Map<String, Value>) {
    for (key, value) in extra {
        if !map.contains_key(key) {
            map.insert(key.clone(), value.clone());
        }
    }
}
