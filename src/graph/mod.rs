//! Decision graph model.
//!
//! - [`Graph`]: nodes, edges, meta and any unknown top-level fields
//! - [`Node`]: closed union over [`NodeKind`] with per-kind payloads
//! - [`Edge`]: typed strengths plus opaque provenance and extras
//!
//! Edge classes are derived from endpoint kinds every time they are asked
//! for, so a reclassified node changes the class of its edges immediately.

mod edge;
mod node;

pub use edge::*;
pub use node::*;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::ParseError;

/// Graph format version assumed when the producer omits one.
pub const DEFAULT_GRAPH_VERSION: &str = "1";

/// Remove `key` from `map` and return it typed, leaving it in place when it
/// does not deserialize as `T`.
pub(crate) fn take_typed<T: DeserializeOwned>(map: &mut Map<String, Value>, key: &str) -> Option<T> {
    let parsed = serde_json::from_value::<T>(map.get(key)?.clone()).ok()?;
    map.remove(key);
    Some(parsed)
}

/// Insert `value` under `key` when it is `Some`.
pub(crate) fn put_typed<T: Serialize>(map: &mut Map<String, Value>, key: &str, value: &Option<T>) {
    if let Some(v) = value {
        if let Ok(json) = serde_json::to_value(v) {
            map.insert(key.to_string(), json);
        }
    }
}

/// Class of an edge, derived from its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeClass {
    /// `decision→option` or `option→factor`
    Structural,
    Causal,
    Bidirected,
    /// One or both endpoints missing.
    Dangling,
}

/// Classify by endpoint kinds alone.
pub fn classify(from: NodeKind, to: NodeKind, bidirected: bool) -> EdgeClass {
    match (from, to) {
        (NodeKind::Decision, NodeKind::Option) | (NodeKind::Option, NodeKind::Factor) => {
            EdgeClass::Structural
        }
        _ if bidirected => EdgeClass::Bidirected,
        _ => EdgeClass::Causal,
    }
}

/// A decision graph
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Graph {
    pub version: Option<String>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub meta: Option<Value>,
    /// Top-level fields not modelled above.
    pub extra: Map<String, Value>,
}

impl Graph {
    /// Create an empty graph at the default version.
    pub fn new() -> Self {
        Self {
            version: Some(DEFAULT_GRAPH_VERSION.to_string()),
            ..Default::default()
        }
    }

    /// Add a node (builder style).
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an edge (builder style).
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Parse a graph from JSON. Node ids must be unique; edge endpoints are
    /// not checked here.
    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        let mut map = match value {
            Value::Object(map) => map,
            other => {
                return Err(ParseError::NotAnObject {
                    found: json_type_name(&other).to_string(),
                })
            }
        };

        let raw_nodes = take_array(&mut map, "nodes")?;
        let raw_edges = take_array(&mut map, "edges")?;

        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(raw_nodes.len());
        for (index, raw) in raw_nodes.into_iter().enumerate() {
            let node = Node::from_value(index, raw)?;
            if !seen.insert(node.id.clone()) {
                return Err(ParseError::DuplicateNodeId { id: node.id });
            }
            nodes.push(node);
        }

        let edges = raw_edges
            .into_iter()
            .enumerate()
            .map(|(index, raw)| Edge::from_value(index, raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            version: take_typed(&mut map, "version"),
            nodes,
            edges,
            meta: map.remove("meta"),
            extra: map,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        put_typed(&mut map, "version", &self.version);
        map.insert(
            "nodes".to_string(),
            Value::Array(self.nodes.iter().map(Node::to_value).collect()),
        );
        map.insert(
            "edges".to_string(),
            Value::Array(self.edges.iter().map(Edge::to_value).collect()),
        );
        put_typed(&mut map, "meta", &self.meta);
        for (key, value) in &self.extra {
            if !map.contains_key(key) {
                map.insert(key.clone(), value.clone());
            }
        }
        Value::Object(map)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn kind_of(&self, id: &str) -> Option<NodeKind> {
        self.node(id).map(Node::kind)
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.kind() == kind)
    }

    pub fn count_kind(&self, kind: NodeKind) -> usize {
        self.nodes_of_kind(kind).count()
    }

    /// First goal node in document order.
    pub fn goal(&self) -> Option<&Node> {
        self.nodes_of_kind(NodeKind::Goal).next()
    }

    /// Classify an edge against the current node kinds.
    pub fn edge_class(&self, edge: &Edge) -> EdgeClass {
        match (self.kind_of(&edge.from), self.kind_of(&edge.to)) {
            (Some(from), Some(to)) => classify(from, to, edge.is_bidirected()),
            _ => EdgeClass::Dangling,
        }
    }

    pub fn is_structural(&self, edge: &Edge) -> bool {
        self.edge_class(edge) == EdgeClass::Structural
    }

    pub fn is_causal(&self, edge: &Edge) -> bool {
        self.edge_class(edge) == EdgeClass::Causal
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// True when any `option` node has an edge into `id`.
    pub fn has_option_parent(&self, id: &str) -> bool {
        self.incoming(id)
            .any(|e| self.kind_of(&e.from) == Some(NodeKind::Option))
    }

    pub fn contains_edge(&self, id: &str) -> bool {
        self.edges.iter().any(|e| e.id == id)
    }

    /// `<from>::<to>`, suffixed `#n` when that id is already taken.
    pub fn unique_edge_id(&self, from: &str, to: &str) -> String {
        let base = format!("{}::{}", from, to);
        let mut candidate = base.clone();
        let mut n = 2;
        while self.contains_edge(&candidate) {
            candidate = format!("{}#{}", base, n);
            n += 1;
        }
        candidate
    }

    /// `base`, suffixed `_n` when a node already uses it.
    pub fn unique_node_id(&self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 2;
        while self.node(&candidate).is_some() {
            candidate = format!("{}_{}", base, n);
            n += 1;
        }
        candidate
    }
}

impl Serialize for Graph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Graph {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Graph::from_value(value).map_err(serde::de::Error::custom)
    }
}

fn take_array(map: &mut Map<String, Value>, field: &str) -> Result<Vec<Value>, ParseError> {
    match map.remove(field) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(ParseError::MissingArray {
            field: field.to_string(),
        }),
    }
}

/// Get a human-readable type name for a JSON value.
pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
