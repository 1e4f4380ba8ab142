//! LLM adapter seam and its HTTP pipe implementation.
//!
//! The pipeline only sees [`LlmAdapter`]. Retry, failover and timeouts are
//! the adapter's business; an error returned from it is final.

mod client;
mod types;

pub use client::*;
pub use types::*;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::Violation;
use crate::error::LlmResult;
use crate::graph::Graph;

/// Drafts and repairs decision graphs.
///
/// Both calls return the model's raw JSON; turning it into a [`Graph`] is
/// the Parse stage's job (or Repair's merge step).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Draft a graph from a free-text brief.
    async fn draft_graph(&self, brief: &str, seed: Option<u64>) -> LlmResult<Value>;

    /// Propose a corrected graph for the given violations.
    async fn repair_graph(&self, graph: &Graph, violations: &[Violation]) -> LlmResult<Value>;
}

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Attempts extraction in this order:
/// 1. Raw JSON (fast path)
/// 2. ```json ... ``` code blocks
/// 3. ``` ... ``` code blocks
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}
