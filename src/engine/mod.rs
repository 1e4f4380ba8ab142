//! Validate-engine seam.
//!
//! Canonical-correctness rules are owned outside the pipeline; this module
//! only defines the narrow interface to them and an HTTP client.

mod client;

pub use client::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::graph::Graph;

/// A rule violation reported by the engine or by a local detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Stable machine-readable code, e.g. `DANGLING_EDGE`.
    pub code: String,
    pub message: String,
    /// Node or edge ids the violation refers to.
    #[serde(default)]
    pub target_ids: Vec<String>,
}

impl Violation {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            target_ids: Vec::new(),
        }
    }

    pub fn with_targets<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_ids.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// Engine verdict for one graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub ok: bool,
    #[serde(default)]
    pub violations: Vec<Violation>,
    /// Engine's own normalised rendition, when it produces one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized: Option<serde_json::Value>,
}

impl ValidationOutcome {
    /// An accepting verdict with no violations.
    pub fn accepted() -> Self {
        Self {
            ok: true,
            violations: Vec::new(),
            normalized: None,
        }
    }

    /// A rejecting verdict.
    pub fn rejected(violations: Vec<Violation>) -> Self {
        Self {
            ok: false,
            violations,
            normalized: None,
        }
    }
}

/// Checks a graph against canonical rules.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ValidateEngine: Send + Sync {
    async fn validate(&self, graph: &Graph) -> EngineResult<ValidationOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_builder() {
        let v = Violation::new("SELF_LOOP", "edge loops").with_targets(["e1"]);
        assert_eq!(v.target_ids, vec!["e1".to_string()]);
    }

    #[test]
    fn test_outcome_deserialization_defaults() {
        let outcome: ValidationOutcome = serde_json::from_str(r#"{"ok": true}"#).unwrap();
        assert!(outcome.ok);
        assert!(outcome.violations.is_empty());
        assert!(outcome.normalized.is_none());

        let outcome: ValidationOutcome = serde_json::from_str(
            r#"{"ok": false, "violations": [{"code": "NO_GOAL", "message": "m"}]}"#,
        )
        .unwrap();
        assert_eq!(outcome.violations[0].code, "NO_GOAL");
        assert!(outcome.violations[0].target_ids.is_empty());
    }
}
