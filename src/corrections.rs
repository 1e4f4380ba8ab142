//! Append-only log of stage-attributed corrections.
//!
//! One collector is built per run and threaded through every stage by
//! `&mut`. Entries are never edited or removed once recorded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::pipeline::Stage;

/// What a stage changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    EdgeIdAssigned,
    EdgeReversed,
    SingleGoalApplied,
    GoalThresholdNormalized,
    CategoryInferred,
    FactorReclassified,
    OutcomeBeliefFilled,
    DecisionBranchNormalized,
    DanglingEdgeRemoved,
    SelfLoopRemoved,
    DuplicateEdgeRemoved,
    NonCanonicalEdgeRemoved,
    BaselineOptionAdded,
    LlmRepairApplied,
}

impl CorrectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionKind::EdgeIdAssigned => "edge_id_assigned",
            CorrectionKind::EdgeReversed => "edge_reversed",
            CorrectionKind::SingleGoalApplied => "single_goal_applied",
            CorrectionKind::GoalThresholdNormalized => "goal_threshold_normalized",
            CorrectionKind::CategoryInferred => "category_inferred",
            CorrectionKind::FactorReclassified => "factor_reclassified",
            CorrectionKind::OutcomeBeliefFilled => "outcome_belief_filled",
            CorrectionKind::DecisionBranchNormalized => "decision_branch_normalized",
            CorrectionKind::DanglingEdgeRemoved => "dangling_edge_removed",
            CorrectionKind::SelfLoopRemoved => "self_loop_removed",
            CorrectionKind::DuplicateEdgeRemoved => "duplicate_edge_removed",
            CorrectionKind::NonCanonicalEdgeRemoved => "non_canonical_edge_removed",
            CorrectionKind::BaselineOptionAdded => "baseline_option_added",
            CorrectionKind::LlmRepairApplied => "llm_repair_applied",
        }
    }
}

impl std::fmt::Display for CorrectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A change a stage made to the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub stage: Stage,
    #[serde(rename = "type")]
    pub kind: CorrectionKind,
    pub target_ids: Vec<String>,
    pub description: String,
}

/// Per-run correction log.
#[derive(Debug, Clone, Default)]
pub struct CorrectionCollector {
    entries: Vec<Correction>,
}

impl CorrectionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a correction.
    pub fn record<I, S>(&mut self, stage: Stage, kind: CorrectionKind, target_ids: I, description: impl Into<String>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let correction = Correction {
            stage,
            kind,
            target_ids: target_ids.into_iter().map(Into::into).collect(),
            description: description.into(),
        };
        debug!(
            stage = %stage,
            kind = %kind,
            targets = ?correction.target_ids,
            "Correction recorded"
        );
        self.entries.push(correction);
    }

    pub fn entries(&self) -> &[Correction] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn for_stage(&self, stage: Stage) -> impl Iterator<Item = &Correction> {
        self.entries.iter().filter(move |c| c.stage == stage)
    }

    pub fn of_kind(&self, kind: CorrectionKind) -> impl Iterator<Item = &Correction> {
        self.entries.iter().filter(move |c| c.kind == kind)
    }

    /// Ids targeted by corrections of `kind` recorded by `stage`.
    pub fn targets(&self, stage: Stage, kind: CorrectionKind) -> HashSet<String> {
        self.for_stage(stage)
            .filter(|c| c.kind == kind)
            .flat_map(|c| c.target_ids.iter().cloned())
            .collect()
    }

    /// Number of corrections per type.
    pub fn counts_by_kind(&self) -> BTreeMap<CorrectionKind, usize> {
        let mut counts = BTreeMap::new();
        for c in &self.entries {
            *counts.entry(c.kind).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_filter() {
        let mut collector = CorrectionCollector::new();
        assert!(collector.is_empty());

        collector.record(
            Stage::Normalise,
            CorrectionKind::FactorReclassified,
            ["f1"],
            "no option sets it",
        );
        collector.record(
            Stage::Repair,
            CorrectionKind::SelfLoopRemoved,
            vec!["e9".to_string()],
            "loop",
        );

        assert_eq!(collector.len(), 2);
        assert_eq!(collector.for_stage(Stage::Normalise).count(), 1);
        assert_eq!(collector.of_kind(CorrectionKind::SelfLoopRemoved).count(), 1);
        let targets = collector.targets(Stage::Normalise, CorrectionKind::FactorReclassified);
        assert!(targets.contains("f1"));
        assert!(collector
            .targets(Stage::Repair, CorrectionKind::FactorReclassified)
            .is_empty());
    }

    #[test]
    fn test_serializes_type_field() {
        let mut collector = CorrectionCollector::new();
        collector.record(Stage::Normalise, CorrectionKind::SingleGoalApplied, ["g2"], "merged");
        let json = serde_json::to_value(&collector.entries()[0]).unwrap();
        assert_eq!(json["type"], "single_goal_applied");
        assert_eq!(json["stage"], "normalise");
        assert_eq!(json["target_ids"][0], "g2");
    }

    #[test]
    fn test_counts_by_kind() {
        let mut collector = CorrectionCollector::new();
        for id in ["a", "b"] {
            collector.record(Stage::Parse, CorrectionKind::EdgeIdAssigned, [id], "assigned");
        }
        let counts = collector.counts_by_kind();
        assert_eq!(counts.get(&CorrectionKind::EdgeIdAssigned), Some(&2));
    }
}
