//! Stage 6: final bookkeeping before the boundary call.

use tracing::{error, warn};

use crate::pipeline::{CheckpointName, PipelineContext, Stage};

/// Snapshot keys every run must hold when Package starts.
pub const EXPECTED_SNAPSHOTS: [&str; 3] = ["stage_1_parse", "stage_3_enrich", "stage_4_repair"];

pub fn run(ctx: &mut PipelineContext) {
    let keys = ctx.snapshot_keys();
    if keys != EXPECTED_SNAPSHOTS {
        error!(
            request_id = %ctx.request_id,
            expected = ?EXPECTED_SNAPSHOTS,
            found = ?keys,
            "Stage snapshots out of step"
        );
    }

    ctx.capture_snapshot(Stage::Package);

    for regression in ctx.threshold_regressions() {
        warn!(
            request_id = %ctx.request_id,
            field = regression.field,
            from = %regression.from_snapshot,
            to = %regression.to_snapshot,
            before = %regression.before,
            after = ?regression.after,
            "Goal threshold regressed between stages"
        );
    }

    ctx.capture_checkpoint(CheckpointName::PreBoundary);
}
