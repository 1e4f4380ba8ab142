use serde_json::json;
use thiserror::Error;

use crate::engine::Violation;
use crate::pipeline::Stage;
use crate::retry::{is_retryable_status, Retryable};

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Validate engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// LLM adapter errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Validate-engine client errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::Api { status, .. } => is_retryable_status(*status),
            LlmError::Unavailable { .. } => false,
            LlmError::InvalidResponse { .. } | LlmError::Timeout { .. } | LlmError::Http(_) => true,
        }
    }
}

impl Retryable for EngineError {
    fn is_retryable(&self) -> bool {
        match self {
            EngineError::Api { status, .. } => is_retryable_status(*status),
            EngineError::InvalidResponse { .. } => false,
            EngineError::Timeout { .. } | EngineError::Http(_) => true,
        }
    }
}

/// Malformed graph input. Always fatal to the request.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("graph must be a JSON object, got {found}")]
    NotAnObject { found: String },

    #[error("graph is missing the '{field}' array")]
    MissingArray { field: String },

    #[error("{entity} at index {index} must be a JSON object")]
    NotAnEntity { entity: String, index: usize },

    #[error("{entity} at index {index} has a missing or non-string '{field}'")]
    InvalidId {
        entity: String,
        index: usize,
        field: String,
    },

    #[error("node '{id}' has no kind")]
    MissingKind { id: String },

    #[error("node '{id}' has unsupported kind '{kind}'")]
    UnknownKind { id: String, kind: String },

    #[error("node id '{id}' appears more than once")]
    DuplicateNodeId { id: String },

    #[error("draft output is not valid JSON: {message}")]
    InvalidJson { message: String },
}

/// Threshold-sweep failures. Advisory only; never end a run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SweepError {
    #[error("causal graph contains a cycle through '{node}'")]
    Cycle { node: String },

    #[error("graph has no option nodes to compare")]
    NoOptions,

    #[error("goal '{goal}' is not reachable from any option")]
    Unreachable { goal: String },
}

/// Errors that end a pipeline run.
///
/// Each variant maps to a stable machine-readable code and an HTTP-style
/// status. Client messages never carry transport or internal detail.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("Graph draft failed: {0}")]
    Draft(LlmError),

    #[error("Boundary validation rejected the graph ({} violations)", violations.len())]
    ValidationFailed { violations: Vec<Violation> },

    #[error("Validate engine unavailable: {0}")]
    EngineUnavailable(EngineError),

    #[error("Request cancelled before stage {stage}")]
    Cancelled { stage: Stage },

    #[error("Stage {stage} broke its contract: {}", details.join("; "))]
    ContractViolation { stage: Stage, details: Vec<String> },
}

impl PipelineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Parse(_) => "PARSE_ERROR",
            PipelineError::Draft(_) => "LLM_UNAVAILABLE",
            PipelineError::ValidationFailed { .. } => "GRAPH_VALIDATION_FAILED",
            PipelineError::EngineUnavailable(_) => "VALIDATION_ENGINE_UNAVAILABLE",
            PipelineError::Cancelled { .. } => "REQUEST_CANCELLED",
            PipelineError::ContractViolation { .. } => "CONTRACT_VIOLATION",
        }
    }

    /// HTTP-style status code for the response envelope.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::Parse(_) => 400,
            PipelineError::Draft(_) => 502,
            PipelineError::ValidationFailed { .. } => 422,
            PipelineError::EngineUnavailable(_) => 502,
            PipelineError::Cancelled { .. } => 499,
            PipelineError::ContractViolation { .. } => 500,
        }
    }

    /// Human-readable message safe to show the caller.
    pub fn client_message(&self) -> String {
        match self {
            PipelineError::Parse(ParseError::InvalidJson { .. }) => {
                "The decision graph could not be read as JSON.".to_string()
            }
            PipelineError::Parse(e) => format!("The decision graph is malformed: {}", e),
            PipelineError::Draft(_) => {
                "The graph drafting service is unavailable. Please try again.".to_string()
            }
            PipelineError::ValidationFailed { violations } => format!(
                "The decision graph failed validation with {} issue(s).",
                violations.len()
            ),
            PipelineError::EngineUnavailable(_) => {
                "The graph validation service is unavailable. Please try again.".to_string()
            }
            PipelineError::Cancelled { .. } => "The request was cancelled.".to_string(),
            PipelineError::ContractViolation { .. } => {
                "An internal error occurred while processing the graph.".to_string()
            }
        }
    }

    /// Structured error body for the response envelope.
    pub fn to_body(&self) -> serde_json::Value {
        let mut error = json!({
            "code": self.code(),
            "message": self.client_message(),
        });
        match self {
            PipelineError::ValidationFailed { violations } => {
                let codes: Vec<&str> = violations.iter().map(|v| v.code.as_str()).collect();
                error["violations"] = json!(codes);
            }
            PipelineError::Cancelled { stage } => {
                error["stage"] = json!(stage.as_str());
            }
            _ => {}
        }
        json!({ "error": error })
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for LLM adapter operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Result type alias for validate-engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type alias for threshold sweeps
pub type SweepResult<T> = Result<T, SweepError>;

/// Result type alias for pipeline runs
pub type PipelineResult<T> = Result<T, PipelineError>;
