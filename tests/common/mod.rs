//! Hand-written adapter and engine stubs shared by the pipeline tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use decision_pipeline::engine::{ValidateEngine, ValidationOutcome, Violation};
use decision_pipeline::error::{EngineError, EngineResult, LlmError, LlmResult, SweepResult};
use decision_pipeline::graph::Graph;
use decision_pipeline::pipeline::stages::threshold_sweep::{ThresholdAnalyzer, ThresholdSweepResult};
use decision_pipeline::LlmAdapter;

/// Returns a fixed draft and, when set, a fixed repair proposal.
pub struct StubLlm {
    pub draft: Value,
    pub repair: Option<Value>,
    pub repair_calls: AtomicUsize,
}

impl StubLlm {
    pub fn drafting(draft: Value) -> Self {
        Self {
            draft,
            repair: None,
            repair_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_repair(mut self, repair: Value) -> Self {
        self.repair = Some(repair);
        self
    }

    pub fn repair_calls(&self) -> usize {
        self.repair_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmAdapter for StubLlm {
    async fn draft_graph(&self, _brief: &str, _seed: Option<u64>) -> LlmResult<Value> {
        Ok(self.draft.clone())
    }

    async fn repair_graph(&self, _graph: &Graph, _violations: &[Violation]) -> LlmResult<Value> {
        self.repair_calls.fetch_add(1, Ordering::SeqCst);
        self.repair.clone().ok_or_else(|| LlmError::InvalidResponse {
            message: "no repair configured".to_string(),
        })
    }
}

/// Drafting takes far longer than any test waits.
pub struct SlowLlm;

#[async_trait]
impl LlmAdapter for SlowLlm {
    async fn draft_graph(&self, _brief: &str, _seed: Option<u64>) -> LlmResult<Value> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!({"nodes": [], "edges": []}))
    }

    async fn repair_graph(&self, _graph: &Graph, _violations: &[Violation]) -> LlmResult<Value> {
        Err(LlmError::Timeout { timeout_ms: 0 })
    }
}

/// Engine with a fixed verdict.
pub enum StubEngine {
    Accepting,
    Rejecting(Vec<Violation>),
    Down,
}

#[async_trait]
impl ValidateEngine for StubEngine {
    async fn validate(&self, _graph: &Graph) -> EngineResult<ValidationOutcome> {
        match self {
            StubEngine::Accepting => Ok(ValidationOutcome::accepted()),
            StubEngine::Rejecting(violations) => Ok(ValidationOutcome::rejected(violations.clone())),
            StubEngine::Down => Err(EngineError::Api {
                status: 503,
                message: "unavailable".to_string(),
            }),
        }
    }
}

/// Analyzer that always panics.
pub struct PanickingSweep;

impl ThresholdAnalyzer for PanickingSweep {
    fn sweep(&self, _graph: &Graph, _offsets: &[f64]) -> SweepResult<Option<ThresholdSweepResult>> {
        panic!("sweep exploded");
    }
}

/// Decision with two wired options, a thresholded goal and one external factor.
pub fn canonical_graph() -> Value {
    json!({
        "version": "1",
        "nodes": [
            {"id": "g", "kind": "goal", "label": "Revenue", "data": {"goal_threshold": 0.5}},
            {"id": "d", "kind": "decision", "label": "Launch?"},
            {"id": "o1", "kind": "option", "label": "Launch", "data": {"interventions": {"f": 1.0}}},
            {"id": "o0", "kind": "option", "label": "Status quo", "data": {"interventions": {"f": 0.0}}},
            {"id": "f", "kind": "factor", "label": "Marketing spend", "category": "controllable", "data": {"value": 0.0}},
            {"id": "m", "kind": "factor", "label": "Market demand", "category": "external", "data": {"value": 0.2}}
        ],
        "edges": [
            {"id": "e1", "from": "d", "to": "o1"},
            {"id": "e2", "from": "d", "to": "o0"},
            {"id": "e3", "from": "o1", "to": "f"},
            {"id": "e4", "from": "o0", "to": "f"},
            {"id": "e5", "from": "f", "to": "g", "strength_mean": 0.8, "strength_std": 0.1},
            {"id": "e6", "from": "m", "to": "g", "strength_mean": 0.5}
        ]
    })
}

/// Two drafted goals pulled apart by one option.
pub fn conflicting_goals_graph() -> Value {
    json!({
        "nodes": [
            {"id": "g1", "kind": "goal", "label": "Revenue"},
            {"id": "g2", "kind": "goal", "label": "Churn"},
            {"id": "opt1", "kind": "option", "label": "Raise price"}
        ],
        "edges": [
            {"id": "e1", "from": "opt1", "to": "g1", "strength_mean": 1.5},
            {"id": "e2", "from": "opt1", "to": "g2", "strength_mean": -1.2}
        ]
    })
}
