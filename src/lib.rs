//! # Decision Pipeline
//!
//! Turns an LLM-drafted decision graph into a canonical, analysis-ready
//! graph by running it through seven stages in a fixed order.
//!
//! ## Stages
//!
//! - **Parse**: draft the graph (or accept the caller's) and type it
//! - **Normalise**: deterministic reconciliation with per-change corrections
//! - **Enrich**: goal-conflict and domain-completeness analyses
//! - **Repair**: deterministic fixes, then bounded LLM repair
//! - **Threshold-Sweep**: advisory goal-threshold robustness check
//! - **Package**: stage snapshots and checkpoints
//! - **Boundary**: external validation and the response envelope
//!
//! ## Architecture
//!
//! ```text
//! Request → Pipeline (Rust) → LLM pipes (HTTP)
//!                 ↓
//!          Validate engine (HTTP)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use decision_pipeline::{Config, EngineClient, LlmClient, Pipeline, PipelineRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let llm = LlmClient::new(&config.llm, config.request.clone())?;
//!     let engine = EngineClient::new(&config.engine, &config.request)?;
//!     let pipeline = Pipeline::new(Arc::new(llm), Arc::new(engine), config.pipeline.clone());
//!     let response = pipeline
//!         .run(PipelineRequest::new("Should we raise prices?"), &CancellationToken::new())
//!         .await;
//!     println!("{}", response.body);
//!     Ok(())
//! }
//! ```

/// Configuration loaded from the environment.
pub mod config;
/// Per-stage field contracts and the before/after diff.
pub mod contract;
/// Stage-attributed correction log.
pub mod corrections;
/// Validate-engine seam and HTTP client.
pub mod engine;
/// Error types and result aliases.
pub mod error;
/// Typed decision graph with opaque field preservation.
pub mod graph;
/// LLM adapter seam and HTTP pipe client.
pub mod llm;
/// Stage driver, context and stages.
pub mod pipeline;
/// System prompts for the LLM pipes.
pub mod prompts;
/// Exponential backoff for the HTTP clients.
pub mod retry;

pub use config::Config;
pub use engine::{EngineClient, ValidateEngine};
pub use error::{AppError, AppResult, PipelineError};
pub use graph::Graph;
pub use llm::{LlmAdapter, LlmClient};
pub use pipeline::{Pipeline, PipelineRequest, PipelineResponse, Stage};
