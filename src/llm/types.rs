use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message in a pipe conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// Message role
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Request to run a pipe
#[derive(Debug, Clone, Serialize)]
pub struct PipeRequest {
    /// Pipe name (required by the pipe API)
    pub name: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, String>>,
}

/// Response from a pipe
#[derive(Debug, Clone, Deserialize)]
pub struct PipeResponse {
    pub success: bool,
    pub completion: String,
    pub raw: Option<RawResponse>,
}

/// Raw model response details
#[derive(Debug, Clone, Deserialize)]
pub struct RawResponse {
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

/// Token usage information
#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

impl PipeRequest {
    /// Create a new pipe request with name and messages
    pub fn new(name: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            name: name.into(),
            messages,
            stream: false,
            variables: None,
        }
    }

    /// Add a single variable
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = Message::system("You draft graphs");
        assert!(matches!(msg.role, MessageRole::System));
        let msg = Message::user("Brief");
        assert!(matches!(msg.role, MessageRole::User));
        assert_eq!(msg.content, "Brief");
    }

    #[test]
    fn test_pipe_request_serialization_skips_empty_variables() {
        let req = PipeRequest::new("draft-graph-v1", vec![Message::user("x")]);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["name"], "draft-graph-v1");
        assert_eq!(json["stream"], false);
        assert!(json.get("variables").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn test_pipe_request_with_variable() {
        let req = PipeRequest::new("p", vec![]).with_variable("seed", "42");
        assert_eq!(req.variables.unwrap().get("seed"), Some(&"42".to_string()));
    }

    #[test]
    fn test_pipe_response_deserialization() {
        let resp: PipeResponse = serde_json::from_str(
            r#"{"success": true, "completion": "{}", "raw": {"model": "m", "usage": {"total_tokens": 9}}}"#,
        )
        .unwrap();
        assert!(resp.success);
        assert_eq!(resp.raw.unwrap().usage.unwrap().total_tokens, Some(9));
    }
}
