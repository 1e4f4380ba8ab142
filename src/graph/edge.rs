//! Edge representation in the decision graph

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{put_typed, take_typed};
use crate::error::ParseError;

/// Declared direction of an edge's effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectDirection {
    Positive,
    Negative,
}

impl EffectDirection {
    /// +1.0 or -1.0
    pub fn sign(&self) -> f64 {
        match self {
            EffectDirection::Positive => 1.0,
            EffectDirection::Negative => -1.0,
        }
    }
}

/// Declared edge type. Absent means directed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Directed,
    Bidirected,
}

/// A directed (or bidirected) edge between two nodes
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub strength_mean: Option<f64>,
    pub strength_std: Option<f64>,
    pub belief_exists: Option<f64>,
    pub effect_direction: Option<EffectDirection>,
    /// Kept verbatim, including nested fields.
    pub provenance: Option<Value>,
    pub edge_type: Option<EdgeType>,
    pub extra: Map<String, Value>,
}

/// Input alias for `belief_exists`.
pub const BELIEF_ALIAS: &str = "exists_probability";

impl Edge {
    /// Create a bare edge.
    pub fn new(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            strength_mean: None,
            strength_std: None,
            belief_exists: None,
            effect_direction: None,
            provenance: None,
            edge_type: None,
            extra: Map::new(),
        }
    }

    /// Set the mean strength.
    pub fn with_strength(mut self, mean: f64) -> Self {
        self.strength_mean = Some(mean);
        self
    }

    /// Set the existence belief.
    pub fn with_belief(mut self, belief: f64) -> Self {
        self.belief_exists = Some(belief);
        self
    }

    /// Add an opaque field.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Parse an edge from its JSON form. A missing `id` is left empty for
    /// Parse to assign.
    pub fn from_value(index: usize, value: Value) -> Result<Self, ParseError> {
        let mut map = match value {
            Value::Object(map) => map,
            _ => {
                return Err(ParseError::NotAnEntity {
                    entity: "edge".to_string(),
                    index,
                })
            }
        };

        let id = match map.remove("id") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(id)) => id,
            Some(_) => {
                return Err(ParseError::InvalidId {
                    entity: "edge".to_string(),
                    index,
                    field: "id".to_string(),
                })
            }
        };

        let mut endpoint = |field: &str| match map.remove(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
            _ => Err(ParseError::InvalidId {
                entity: "edge".to_string(),
                index,
                field: field.to_string(),
            }),
        };
        let from = endpoint("from")?;
        let to = endpoint("to")?;

        let mut belief_exists = take_typed(&mut map, "belief_exists");
        if belief_exists.is_none() {
            belief_exists = take_typed(&mut map, BELIEF_ALIAS);
        }

        Ok(Self {
            id,
            from,
            to,
            strength_mean: take_typed(&mut map, "strength_mean"),
            strength_std: take_typed(&mut map, "strength_std"),
            belief_exists,
            effect_direction: take_typed(&mut map, "effect_direction"),
            provenance: map.remove("provenance"),
            edge_type: take_typed(&mut map, "edge_type"),
            extra: map,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert("from".to_string(), Value::String(self.from.clone()));
        map.insert("to".to_string(), Value::String(self.to.clone()));
        put_typed(&mut map, "strength_mean", &self.strength_mean);
        put_typed(&mut map, "strength_std", &self.strength_std);
        put_typed(&mut map, "belief_exists", &self.belief_exists);
        put_typed(&mut map, "effect_direction", &self.effect_direction);
        put_typed(&mut map, "provenance", &self.provenance);
        put_typed(&mut map, "edge_type", &self.edge_type);
        for (key, value) in &self.extra {
            if !map.contains_key(key) {
                map.insert(key.clone(), value.clone());
            }
        }
        Value::Object(map)
    }

    pub fn is_bidirected(&self) -> bool {
        self.edge_type == Some(EdgeType::Bidirected)
    }

    /// Signed weight used for path analysis: `strength_mean` when present and
    /// non-zero, otherwise the sign of `effect_direction`, otherwise +1.
    pub fn signed_weight(&self) -> f64 {
        match self.strength_mean {
            Some(mean) if mean != 0.0 => mean,
            _ => self
                .effect_direction
                .map(|d| d.sign())
                .unwrap_or(1.0),
        }
    }

    /// Swap endpoints in place.
    pub fn reverse(&mut self) {
        std::mem::swap(&mut self.from, &mut self.to);
    }
}
