//! Stage 3: read-only analyses attached to the context.
//!
//! The two analyses share no data and never touch the graph.

pub mod domain_completeness;
pub mod goal_conflict;

pub use domain_completeness::{Domain, DomainCompleteness, Importance, MissingFactor};
pub use goal_conflict::{
    ConflictGuidance, GoalConflictAnalysis, GoalRelationship, RelationshipKind,
};

use tracing::info;

use crate::pipeline::{PipelineContext, Stage};

pub fn run(ctx: &mut PipelineContext) {
    let conflicts = goal_conflict::analyze(&ctx.graph, &ctx.authored_goal_ids);
    let completeness = domain_completeness::analyze(&ctx.brief, &ctx.graph);

    info!(
        request_id = %ctx.request_id,
        goals = conflicts.goal_ids.len(),
        has_conflicts = conflicts.has_conflicts,
        domain = completeness.domain.as_str(),
        completeness_score = completeness.completeness_score,
        "Graph enriched"
    );

    ctx.goal_conflicts = Some(conflicts);
    ctx.domain_completeness = Some(completeness);
    ctx.capture_snapshot(Stage::Enrich);
}
