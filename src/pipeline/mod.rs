//! The unified pipeline.
//!
//! A run threads one [`PipelineContext`] through seven stages in a fixed
//! order:
//!
//! 1. Parse: draft or accept the graph and turn it into a typed [`Graph`]
//! 2. Normalise: deterministic structural reconciliation
//! 3. Enrich: read-only goal-conflict and domain-completeness analyses
//! 4. Repair: deterministic fixes, then bounded LLM repair
//! 5. Threshold-Sweep: advisory robustness check, isolated from the run
//! 6. Package: snapshots and checkpoints
//! 7. Boundary: external validation and the response envelope
//!
//! Cancellation is checked before every stage and raced against every
//! adapter and engine call.

mod context;
mod detectors;
pub mod stages;

pub use context::*;
pub use detectors::*;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ContractMode, PipelineConfig};
use crate::contract::{self, contract_for};
use crate::engine::ValidateEngine;
use crate::error::{AppError, AppResult, PipelineError, PipelineResult};
use crate::llm::LlmAdapter;
use stages::threshold_sweep::{NormalApproxSweep, ThresholdAnalyzer};

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    Normalise,
    Enrich,
    Repair,
    ThresholdSweep,
    Package,
    Boundary,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Parse,
        Stage::Normalise,
        Stage::Enrich,
        Stage::Repair,
        Stage::ThresholdSweep,
        Stage::Package,
        Stage::Boundary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Normalise => "normalise",
            Stage::Enrich => "enrich",
            Stage::Repair => "repair",
            Stage::ThresholdSweep => "threshold_sweep",
            Stage::Package => "package",
            Stage::Boundary => "boundary",
        }
    }

    /// Key of the snapshot taken when this stage completes.
    pub fn snapshot_key(&self) -> Option<&'static str> {
        match self {
            Stage::Parse => Some("stage_1_parse"),
            Stage::Enrich => Some("stage_3_enrich"),
            Stage::Repair => Some("stage_4_repair"),
            Stage::Package => Some("stage_5_package"),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inbound request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineRequest {
    /// Free-text description of the decision.
    #[serde(default)]
    pub brief: String,
    /// Caller-supplied graph; skips drafting when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl PipelineRequest {
    pub fn new(brief: impl Into<String>) -> Self {
        Self {
            brief: brief.into(),
            ..Default::default()
        }
    }

    pub fn with_graph(mut self, graph: Value) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Load a request from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| AppError::Config {
            message: format!("Cannot read request file {}: {}", path.display(), e),
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> AppResult<Self> {
        serde_json::from_str(raw).map_err(|e| AppError::Config {
            message: format!("Invalid request JSON: {}", e),
        })
    }
}

/// Outcome of one run, success or failure.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResponse {
    pub status_code: u16,
    pub body: Value,
    pub stage_snapshots: BTreeMap<String, StageSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_checkpoints: Option<Vec<PipelineCheckpoint>>,
    pub stage_trace: Vec<StageRecord>,
}

impl PipelineResponse {
    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }

    /// Stages that ran, in order.
    pub fn executed_stages(&self) -> Vec<Stage> {
        self.stage_trace.iter().map(|r| r.stage).collect()
    }

    /// Error code of a failed run.
    pub fn error_code(&self) -> Option<&str> {
        self.body.get("error")?.get("code")?.as_str()
    }
}

/// Open stage: start time and the graph as it was before the stage ran.
struct StageGuard {
    stage: Stage,
    started: Instant,
    before: Option<Value>,
}

/// Race a future against cancellation.
pub(crate) async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    stage: Stage,
    fut: F,
) -> PipelineResult<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled { stage }),
        out = fut => Ok(out),
    }
}

/// Stage driver.
pub struct Pipeline {
    llm: Arc<dyn LlmAdapter>,
    engine: Arc<dyn ValidateEngine>,
    analyzer: Arc<dyn ThresholdAnalyzer>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a pipeline with the default threshold analyzer.
    pub fn new(
        llm: Arc<dyn LlmAdapter>,
        engine: Arc<dyn ValidateEngine>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            llm,
            engine,
            analyzer: Arc::new(NormalApproxSweep),
            config,
        }
    }

    /// Replace the threshold analyzer.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn ThresholdAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage for one request.
    pub async fn run(
        &self,
        request: PipelineRequest,
        cancel: &CancellationToken,
    ) -> PipelineResponse {
        let mut ctx = PipelineContext::new(
            request.brief.clone(),
            request.seed,
            self.config.checkpoints_enabled,
        );
        let start = Instant::now();

        info!(
            request_id = %ctx.request_id,
            has_graph = request.graph.is_some(),
            "Pipeline run started"
        );

        let result = self.execute(&mut ctx, request, cancel).await;

        let (status_code, body) = match result {
            Ok(body) => {
                info!(
                    request_id = %ctx.request_id,
                    corrections = ctx.corrections.len(),
                    latency_ms = start.elapsed().as_millis(),
                    "Pipeline run completed"
                );
                (200, body)
            }
            Err(e) => {
                match &e {
                    PipelineError::ContractViolation { .. } => {
                        error!(request_id = %ctx.request_id, error = %e, "Pipeline run aborted")
                    }
                    _ => warn!(
                        request_id = %ctx.request_id,
                        code = e.code(),
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        "Pipeline run failed"
                    ),
                }
                (e.status_code(), e.to_body())
            }
        };

        PipelineResponse {
            status_code,
            body,
            stage_snapshots: ctx.stage_snapshots,
            pipeline_checkpoints: ctx.checkpoints_enabled.then_some(ctx.checkpoints),
            stage_trace: ctx.stage_trace,
        }
    }

    async fn execute(
        &self,
        ctx: &mut PipelineContext,
        request: PipelineRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<Value> {
        // 1. Parse
        let mut guard = self.begin(ctx, Stage::Parse, cancel)?;
        let raw = match stages::parse::load(&request, self.llm.as_ref(), cancel).await {
            Ok(raw) => raw,
            Err(e) => return Err(self.abort(ctx, guard, e)),
        };
        if guard.before.is_some() {
            guard.before = Some(raw.clone());
        }
        if let Err(e) = stages::parse::run(ctx, raw) {
            return Err(self.abort(ctx, guard, e));
        }
        self.finish(ctx, guard, StageOutcome::Completed)?;

        // 2. Normalise
        let guard = self.begin(ctx, Stage::Normalise, cancel)?;
        stages::normalise::run(ctx);
        self.finish(ctx, guard, StageOutcome::Completed)?;

        // 3. Enrich
        let guard = self.begin(ctx, Stage::Enrich, cancel)?;
        stages::enrich::run(ctx);
        self.finish(ctx, guard, StageOutcome::Completed)?;

        // 4. Repair
        let guard = self.begin(ctx, Stage::Repair, cancel)?;
        let repaired = stages::repair::run(
            ctx,
            self.llm.as_ref(),
            self.engine.as_ref(),
            &self.config,
            cancel,
        )
        .await;
        if let Err(e) = repaired {
            return Err(self.abort(ctx, guard, e));
        }
        self.finish(ctx, guard, StageOutcome::Completed)?;
        ctx.capture_checkpoint(CheckpointName::PostStabilisation);

        // 5. Threshold-Sweep
        let guard = self.begin(ctx, Stage::ThresholdSweep, cancel)?;
        let outcome = self.sweep_isolated(ctx);
        self.finish(ctx, guard, outcome)?;

        // 6. Package
        let guard = self.begin(ctx, Stage::Package, cancel)?;
        stages::package::run(ctx);
        self.finish(ctx, guard, StageOutcome::Completed)?;

        // 7. Boundary
        let guard = self.begin(ctx, Stage::Boundary, cancel)?;
        match stages::boundary::run(ctx, self.engine.as_ref(), cancel).await {
            Ok(body) => {
                self.finish(ctx, guard, StageOutcome::Completed)?;
                Ok(body)
            }
            Err(e) => Err(self.abort(ctx, guard, e)),
        }
    }

    /// Run the sweep so that neither an error nor a panic escapes.
    fn sweep_isolated(&self, ctx: &mut PipelineContext) -> StageOutcome {
        let analyzer = Arc::clone(&self.analyzer);
        let offsets = self.config.sweep_offsets.clone();
        let graph = &ctx.graph;
        let caught = std::panic::catch_unwind(AssertUnwindSafe(|| {
            stages::threshold_sweep::run(analyzer.as_ref(), graph, &offsets)
        }));

        match caught {
            Ok(Ok(Some(result))) => {
                ctx.threshold_sweep = Some(result);
                StageOutcome::Completed
            }
            Ok(Ok(None)) => {
                debug!(request_id = %ctx.request_id, "No goal threshold, sweep skipped");
                StageOutcome::Skipped
            }
            Ok(Err(e)) => {
                warn!(request_id = %ctx.request_id, error = %e, "Threshold sweep failed, continuing");
                StageOutcome::Isolated
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(request_id = %ctx.request_id, panic = %message, "Threshold sweep panicked, continuing");
                StageOutcome::Isolated
            }
        }
    }

    fn begin(
        &self,
        ctx: &PipelineContext,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> PipelineResult<StageGuard> {
        if cancel.is_cancelled() {
            info!(request_id = %ctx.request_id, stage = %stage, "Cancelled before stage");
            return Err(PipelineError::Cancelled { stage });
        }
        debug!(request_id = %ctx.request_id, stage = %stage, "Stage started");
        let before = (self.config.contract_mode != ContractMode::Off).then(|| ctx.graph.to_value());
        Ok(StageGuard {
            stage,
            started: Instant::now(),
            before,
        })
    }

    /// Close a stage: record it, then check its contract.
    fn finish(
        &self,
        ctx: &mut PipelineContext,
        guard: StageGuard,
        outcome: StageOutcome,
    ) -> PipelineResult<()> {
        let duration_ms = guard.started.elapsed().as_millis() as u64;
        ctx.stage_trace.push(StageRecord {
            stage: guard.stage,
            duration_ms,
            outcome,
        });
        info!(
            request_id = %ctx.request_id,
            stage = %guard.stage,
            duration_ms,
            outcome = ?outcome,
            "Stage finished"
        );

        let Some(before) = guard.before else {
            return Ok(());
        };
        let violations = contract::verify(
            contract_for(guard.stage),
            &before,
            &ctx.graph.to_value(),
            &ctx.corrections,
        );
        if violations.is_empty() {
            return Ok(());
        }

        let details: Vec<String> = violations.iter().map(ToString::to_string).collect();
        for detail in &details {
            warn!(request_id = %ctx.request_id, stage = %guard.stage, violation = %detail, "Stage contract violated");
        }
        match self.config.contract_mode {
            ContractMode::Strict => Err(PipelineError::ContractViolation {
                stage: guard.stage,
                details,
            }),
            _ => Ok(()),
        }
    }

    /// Record a fatal stage failure and hand the error back.
    fn abort(&self, ctx: &mut PipelineContext, guard: StageGuard, err: PipelineError) -> PipelineError {
        let outcome = match err {
            PipelineError::Cancelled { .. } => StageOutcome::Cancelled,
            _ => StageOutcome::Failed,
        };
        ctx.stage_trace.push(StageRecord {
            stage: guard.stage,
            duration_ms: guard.started.elapsed().as_millis() as u64,
            outcome,
        });
        err
    }
}
