//! Request-scoped pipeline state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::stages::enrich::{DomainCompleteness, GoalConflictAnalysis};
use super::stages::normalise::NormaliseSummary;
use super::stages::threshold_sweep::ThresholdSweepResult;
use super::Stage;
use crate::corrections::CorrectionCollector;
use crate::engine::Violation;
use crate::graph::{Graph, NodeKind};

/// Goal-threshold bookkeeping taken after selected stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub goal_node_id: Option<String>,
    pub goal_threshold: Option<f64>,
    pub goal_threshold_raw: Option<f64>,
    pub goal_threshold_unit: Option<String>,
    pub goal_threshold_cap: Option<f64>,
    pub goal_constraints_count: usize,
}

impl StageSnapshot {
    pub fn capture(graph: &Graph) -> Self {
        let goal = graph.goal();
        let data = goal.and_then(|g| g.goal_data());
        Self {
            goal_node_id: goal.map(|g| g.id.clone()),
            goal_threshold: data.and_then(|d| d.goal_threshold),
            goal_threshold_raw: data.and_then(|d| d.goal_threshold_raw),
            goal_threshold_unit: data.and_then(|d| d.goal_threshold_unit.clone()),
            goal_threshold_cap: data.and_then(|d| d.goal_threshold_cap),
            goal_constraints_count: graph.count_kind(NodeKind::Constraint),
        }
    }

    /// Goal-threshold fields as JSON, keyed by name. Absent fields are omitted.
    fn threshold_fields(&self) -> Vec<(&'static str, Value)> {
        let mut fields = Vec::new();
        if let Some(v) = self.goal_threshold {
            fields.push(("goal_threshold", Value::from(v)));
        }
        if let Some(v) = self.goal_threshold_raw {
            fields.push(("goal_threshold_raw", Value::from(v)));
        }
        if let Some(v) = &self.goal_threshold_unit {
            fields.push(("goal_threshold_unit", Value::from(v.clone())));
        }
        if let Some(v) = self.goal_threshold_cap {
            fields.push(("goal_threshold_cap", Value::from(v)));
        }
        fields
    }

    fn threshold_field(&self, name: &str) -> Option<Value> {
        self.threshold_fields()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }
}

/// A goal-threshold field that was present at an earlier snapshot and is
/// missing or different at a later one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdRegression {
    pub field: &'static str,
    pub from_snapshot: String,
    pub to_snapshot: String,
    pub before: Value,
    pub after: Option<Value>,
}

/// Named checkpoint positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointName {
    PostStabilisation,
    PreBoundary,
}

impl CheckpointName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointName::PostStabilisation => "post_stabilisation",
            CheckpointName::PreBoundary => "pre_boundary",
        }
    }
}

/// Deep copy of the graph at a named point.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineCheckpoint {
    pub name: CheckpointName,
    pub captured_at: DateTime<Utc>,
    pub graph: Graph,
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    /// Ran but had nothing to do.
    Skipped,
    /// Failed without ending the run.
    Isolated,
    Failed,
    Cancelled,
}

/// One executed stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub duration_ms: u64,
    pub outcome: StageOutcome,
}

/// Everything one run reads and writes. Owned by a single request.
#[derive(Debug)]
pub struct PipelineContext {
    pub request_id: String,
    pub brief: String,
    pub seed: Option<u64>,
    pub graph: Graph,
    pub corrections: CorrectionCollector,
    pub stage_snapshots: BTreeMap<String, StageSnapshot>,
    pub checkpoints: Vec<PipelineCheckpoint>,
    /// Read once from config when the run starts.
    pub checkpoints_enabled: bool,
    pub stage_trace: Vec<StageRecord>,
    /// Goal ids as drafted, before Normalise collapses them.
    pub authored_goal_ids: Vec<String>,
    pub normalise_summary: NormaliseSummary,
    /// Detector output handed from Normalise to Repair.
    pub pending_violations: Vec<Violation>,
    pub unresolved_violations: Vec<Violation>,
    pub goal_conflicts: Option<GoalConflictAnalysis>,
    pub domain_completeness: Option<DomainCompleteness>,
    pub threshold_sweep: Option<ThresholdSweepResult>,
}

impl PipelineContext {
    pub fn new(brief: impl Into<String>, seed: Option<u64>, checkpoints_enabled: bool) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            brief: brief.into(),
            seed,
            graph: Graph::default(),
            corrections: CorrectionCollector::new(),
            stage_snapshots: BTreeMap::new(),
            checkpoints: Vec::new(),
            checkpoints_enabled,
            stage_trace: Vec::new(),
            authored_goal_ids: Vec::new(),
            normalise_summary: NormaliseSummary::default(),
            pending_violations: Vec::new(),
            unresolved_violations: Vec::new(),
            goal_conflicts: None,
            domain_completeness: None,
            threshold_sweep: None,
        }
    }

    /// Record the snapshot for `stage`. No-op for stages without a key.
    pub fn capture_snapshot(&mut self, stage: Stage) {
        if let Some(key) = stage.snapshot_key() {
            self.stage_snapshots
                .insert(key.to_string(), StageSnapshot::capture(&self.graph));
        }
    }

    /// Deep-copy the graph when checkpoints are enabled.
    pub fn capture_checkpoint(&mut self, name: CheckpointName) {
        if !self.checkpoints_enabled {
            return;
        }
        self.checkpoints.push(PipelineCheckpoint {
            name,
            captured_at: Utc::now(),
            graph: self.graph.clone(),
        });
    }

    pub fn snapshot_keys(&self) -> Vec<&str> {
        self.stage_snapshots.keys().map(String::as_str).collect()
    }

    /// Compare consecutive snapshots in stage order and report
    /// goal-threshold fields that went missing or changed.
    pub fn threshold_regressions(&self) -> Vec<ThresholdRegression> {
        let ordered: Vec<(&'static str, &StageSnapshot)> = Stage::ALL
            .iter()
            .filter_map(|s| s.snapshot_key())
            .filter_map(|key| self.stage_snapshots.get(key).map(|snap| (key, snap)))
            .collect();

        let mut regressions = Vec::new();
        for pair in ordered.windows(2) {
            let (from_key, earlier) = pair[0];
            let (to_key, later) = pair[1];
            for (field, before) in earlier.threshold_fields() {
                let after = later.threshold_field(field);
                if after.as_ref() != Some(&before) {
                    regressions.push(ThresholdRegression {
                        field,
                        from_snapshot: from_key.to_string(),
                        to_snapshot: to_key.to_string(),
                        before,
                        after,
                    });
                }
            }
        }
        regressions
    }

    /// Stages that ran, in order.
    pub fn executed_stages(&self) -> Vec<Stage> {
        self.stage_trace.iter().map(|r| r.stage).collect()
    }
}
