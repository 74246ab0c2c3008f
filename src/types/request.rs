//! Uniform provider request/response contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::message::Message;
use crate::error::{FieldError, LacquerError};

/// A tool the model may call during generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool's input.
    #[serde(default = "default_schema")]
    pub input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

/// Token counters reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Accumulate another usage report into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// The uniform request every provider adapter accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Caller-side deadline; adapters must observe it at every suspension
    /// point and kill subprocesses when it fires.
    #[serde(skip, default)]
    pub cancel: CancellationToken,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: Vec::new(),
            tools: Vec::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Structural checks every adapter performs before dispatch.
    pub fn validate(&self) -> Result<(), LacquerError> {
        let mut errors = Vec::new();
        if self.model.trim().is_empty() {
            errors.push(FieldError::new("model", "model must not be empty"));
        }
        if self.messages.is_empty() {
            errors.push(FieldError::new("messages", "messages must not be empty"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LacquerError::Validation(errors))
        }
    }
}

/// What a provider returns from a successful generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOutput {
    /// One or more assistant messages produced for the request.
    pub messages: Vec<Message>,
    pub usage: TokenUsage,
}
