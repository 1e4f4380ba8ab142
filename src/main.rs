use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use decision_pipeline::{
    config::{Config, LogFormat},
    EngineClient, LlmClient, Pipeline, PipelineRequest,
};

/// Run one decision-graph request through the pipeline.
#[derive(Debug, Parser)]
#[command(name = "decision-pipeline", version, about)]
struct Cli {
    /// Request JSON file (`{"brief": ..., "graph"?: ..., "seed"?: ...}`); stdin when omitted
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Pretty-print the response
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        contract_mode = ?config.pipeline.contract_mode,
        "Decision pipeline starting..."
    );

    let request = match &cli.request {
        Some(path) => PipelineRequest::from_path(path)?,
        None => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw)?;
            PipelineRequest::from_json(&raw)?
        }
    };

    let llm = match LlmClient::new(&config.llm, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.llm.base_url, "LLM client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize LLM client");
            return Err(e.into());
        }
    };

    let engine = match EngineClient::new(&config.engine, &config.request) {
        Ok(c) => {
            info!(base_url = %config.engine.base_url, "Validate engine client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize validate engine client");
            return Err(e.into());
        }
    };

    let pipeline = Pipeline::new(Arc::new(llm), Arc::new(engine), config.pipeline.clone());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let response = pipeline.run(request, &cancel).await;
    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    println!("{}", rendered);

    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
