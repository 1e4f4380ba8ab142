use std::env;

use crate::error::AppError;
use crate::retry::MAX_RETRIES_CAP;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipeline: PipelineConfig,
}

/// LLM pipe API configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub draft_pipe: String,
    pub repair_pipe: String,
}

/// Validate-engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// How stage contracts are enforced at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractMode {
    /// No before/after diffing.
    Off,
    /// Diff every stage and log violations.
    Warn,
    /// Diff every stage and abort the run on the first violation.
    Strict,
}

impl std::str::FromStr for ContractMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(ContractMode::Off),
            "warn" => Ok(ContractMode::Warn),
            "strict" => Ok(ContractMode::Strict),
            _ => Err(format!("Unknown contract mode: {}", s)),
        }
    }
}

/// Pipeline behaviour switches
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capture deep copies of the graph at named points.
    pub checkpoints_enabled: bool,
    pub contract_mode: ContractMode,
    /// Upper bound on LLM-assisted repair calls per run.
    pub llm_repair_max_attempts: u32,
    /// Ask the validate engine for violations during Repair.
    pub repair_consult_engine: bool,
    /// Relative threshold perturbations explored by the sweep.
    pub sweep_offsets: Vec<f64>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let llm = LlmConfig {
            api_key: env::var("LLM_API_KEY").map_err(|_| AppError::Config {
                message: "LLM_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
            draft_pipe: env::var("LLM_DRAFT_PIPE").unwrap_or_else(|_| "draft-graph-v1".to_string()),
            repair_pipe: env::var("LLM_REPAIR_PIPE")
                .unwrap_or_else(|_| "repair-graph-v1".to_string()),
        };

        let engine = EngineConfig {
            base_url: env::var("ENGINE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            api_key: env::var("ENGINE_API_KEY").ok().filter(|k| !k.is_empty()),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30000),
            max_retries: env::var("MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .map(|n| n.min(MAX_RETRIES_CAP))
                .unwrap_or(3),
            retry_delay_ms: env::var("RETRY_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
        };

        let contract_mode = match env::var("PIPELINE_CONTRACT_MODE") {
            Ok(raw) => raw
                .parse()
                .map_err(|message: String| AppError::Config { message })?,
            Err(_) => ContractMode::Warn,
        };

        let pipeline = PipelineConfig {
            checkpoints_enabled: env::var("PIPELINE_CHECKPOINTS_ENABLED")
                .map(|s| parse_flag(&s))
                .unwrap_or(false),
            contract_mode,
            llm_repair_max_attempts: env::var("PIPELINE_LLM_REPAIR_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            repair_consult_engine: env::var("PIPELINE_REPAIR_CONSULT_ENGINE")
                .map(|s| parse_flag(&s))
                .unwrap_or(false),
            sweep_offsets: match env::var("PIPELINE_SWEEP_OFFSETS") {
                Ok(raw) => parse_offsets(&raw).ok_or_else(|| AppError::Config {
                    message: format!("PIPELINE_SWEEP_OFFSETS is not a list of numbers: {}", raw),
                })?,
                Err(_) => default_sweep_offsets(),
            },
        };

        Ok(Config {
            llm,
            engine,
            logging,
            request,
            pipeline,
        })
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_offsets(raw: &str) -> Option<Vec<f64>> {
    let offsets: Option<Vec<f64>> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect();
    offsets.filter(|o| !o.is_empty())
}

fn default_sweep_offsets() -> Vec<f64> {
    vec![-0.2, -0.1, -0.05, 0.05, 0.1, 0.2]
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            checkpoints_enabled: false,
            contract_mode: ContractMode::Warn,
            llm_repair_max_attempts: 1,
            repair_consult_engine: false,
            sweep_offsets: default_sweep_offsets(),
        }
    }
}
