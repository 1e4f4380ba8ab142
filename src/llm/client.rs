use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use super::types::{Message, PipeRequest, PipeResponse};
use super::{extract_json_from_completion, LlmAdapter};
use crate::config::{LlmConfig, RequestConfig};
use crate::engine::Violation;
use crate::error::{LlmError, LlmResult};
use crate::graph::Graph;
use crate::prompts::{DRAFT_GRAPH_PROMPT, REPAIR_GRAPH_PROMPT};
use crate::retry::{with_backoff, Exhausted};

/// Client for the LLM pipes API. Owns retry and backoff for every call.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    draft_pipe: String,
    repair_pipe: String,
    request_config: RequestConfig,
}

impl LlmClient {
    /// Create a new LLM client
    pub fn new(config: &LlmConfig, request_config: RequestConfig) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LlmError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            draft_pipe: config.draft_pipe.clone(),
            repair_pipe: config.repair_pipe.clone(),
            request_config,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a pipe, retrying transient failures with backoff. Exhaustion is
    /// reported as [`LlmError::Unavailable`].
    pub async fn call_pipe(&self, request: PipeRequest) -> LlmResult<PipeResponse> {
        let url = format!("{}/v1/pipes/run", self.base_url);
        let call = format!("pipe:{}", request.name);

        match with_backoff(&self.request_config, &call, || self.execute_request(&url, &request)).await {
            Ok(response) => {
                info!(pipe = %request.name, "LLM pipe call succeeded");
                Ok(response)
            }
            Err(Exhausted { error, retries }) => {
                error!(pipe = %request.name, error = %error, retries, "LLM pipe call gave up");
                Err(LlmError::Unavailable {
                    message: error.to_string(),
                    retries,
                })
            }
        }
    }

    /// Execute a single request (internal)
    async fn execute_request(&self, url: &str, request: &PipeRequest) -> LlmResult<PipeResponse> {
        debug!(
            pipe = %request.name,
            messages = request.messages.len(),
            "Calling LLM pipe"
        );

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    LlmError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let pipe_response: PipeResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    message: format!("Failed to parse pipe response: {}", e),
                })?;

        if !pipe_response.success {
            return Err(LlmError::InvalidResponse {
                message: "Pipe reported success=false".to_string(),
            });
        }

        Ok(pipe_response)
    }

    /// Run a pipe and decode its completion as a JSON graph.
    async fn run_graph_pipe(&self, request: PipeRequest) -> LlmResult<Value> {
        let response = self.call_pipe(request).await?;
        let json_text = extract_json_from_completion(&response.completion)
            .map_err(|message| LlmError::InvalidResponse { message })?;
        serde_json::from_str(json_text).map_err(|e| LlmError::InvalidResponse {
            message: format!("Completion is not valid JSON: {}", e),
        })
    }
}

#[async_trait]
impl LlmAdapter for LlmClient {
    async fn draft_graph(&self, brief: &str, seed: Option<u64>) -> LlmResult<Value> {
        let mut request = PipeRequest::new(
            &self.draft_pipe,
            vec![Message::system(DRAFT_GRAPH_PROMPT), Message::user(brief)],
        );
        if let Some(seed) = seed {
            request = request.with_variable("seed", seed.to_string());
        }
        self.run_graph_pipe(request).await
    }

    async fn repair_graph(&self, graph: &Graph, violations: &[Violation]) -> LlmResult<Value> {
        let payload = json!({
            "graph": graph.to_value(),
            "violations": violations,
        });
        let request = PipeRequest::new(
            &self.repair_pipe,
            vec![
                Message::system(REPAIR_GRAPH_PROMPT),
                Message::user(payload.to_string()),
            ],
        );
        self.run_graph_pipe(request).await
    }
}
