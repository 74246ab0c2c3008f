//! Anthropic Messages API adapter.
//!
//! Maps the uniform request contract onto the vendor schema and back. 4xx
//! responses are passed through unchanged; 429 and 5xx responses are retried
//! a few times inside the adapter before surfacing.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::Provider;
use crate::error::LacquerError;
use crate::events::EventSink;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::types::message::{ContentBlock, ImageSource, Message, Role};
use crate::types::model::ModelInfo;
use crate::types::request::{GenerateOutput, GenerateRequest, TokenUsage};

pub const PROVIDER_NAME: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Environment variables consulted for the API key, in order.
const API_KEY_ENV_VARS: [&str; 2] = ["ANTHROPIC_API_KEY", "CLAUDE_API_KEY"];

/// Adapter configuration, usually taken from the `[providers.anthropic]`
/// config table.
#[derive(Debug, Clone, Default)]
pub struct AnthropicConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
}

pub struct AnthropicProvider {
    api_key: SecretString,
    base_url: String,
    http_client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self, LacquerError> {
        let api_key = resolve_api_key(config.api_key.as_deref(), |name| {
            std::env::var(name).ok()
        })?;
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()?;
        Ok(Self {
            api_key,
            base_url: config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            http_client,
        })
    }

    async fn post_messages(&self, body: &Value) -> Result<Value, LacquerError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let payload: Value = response.json().await.map_err(|err| {
            LacquerError::Parse(format!("reading anthropic response: {err}"))
        })?;

        if (200..300).contains(&status) {
            Ok(payload)
        } else {
            Err(map_api_error(status, &payload))
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, LacquerError> {
        let response = self
            .http_client
            .get(url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .send()
            .await?;

        let status = response.status().as_u16();
        let payload: Value = response.json().await.map_err(|err| {
            LacquerError::Parse(format!("reading anthropic response: {err}"))
        })?;

        if (200..300).contains(&status) {
            Ok(payload)
        } else {
            Err(map_api_error(status, &payload))
        }
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    async fn generate(
        &self,
        request: GenerateRequest,
        _events: &dyn EventSink,
    ) -> Result<GenerateOutput, LacquerError> {
        request.validate()?;
        let cancel = request.cancel.clone();
        let body = build_request_body(&request);
        debug!(model = %request.model, request_id = %request.request_id, "anthropic request");

        let executor = RetryExecutor::new(
            RetryPolicy::new()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_millis(500)),
        );

        let payload = tokio::select! {
            _ = cancel.cancelled() => return Err(LacquerError::Cancelled),
            result = executor.execute(|| self.post_messages(&body)) => result?,
        };

        parse_response(&payload)
    }

    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LacquerError> {
        let mut models = Vec::new();
        let mut after_id: Option<String> = None;

        loop {
            let mut url = format!("{}/v1/models?limit=100", self.base_url);
            if let Some(after) = &after_id {
                url.push_str(&format!("&after_id={after}"));
            }
            let page: ModelsPage = serde_json::from_value(self.get_json(&url).await?)
                .map_err(|err| LacquerError::Parse(format!("anthropic models list: {err}")))?;

            for model in page.data {
                models.push(
                    ModelInfo::new(model.id, model.display_name)
                        .with_features(&["chat", "tools", "vision"]),
                );
            }
            if !page.has_more {
                break;
            }
            after_id = page.last_id;
            if after_id.is_none() {
                break;
            }
        }

        Ok(models)
    }
}

#[derive(Debug, Deserialize)]
struct ModelsPage {
    data: Vec<ModelEntry>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    display_name: String,
}

/// Explicit config wins, then known environment variables in order.
fn resolve_api_key(
    explicit: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<SecretString, LacquerError> {
    if let Some(key) = explicit {
        if !key.trim().is_empty() {
            return Ok(SecretString::from(key.to_string()));
        }
    }
    for name in API_KEY_ENV_VARS {
        if let Some(key) = env(name) {
            if !key.trim().is_empty() {
                return Ok(SecretString::from(key));
            }
        }
    }
    Err(LacquerError::MissingApiKey {
        provider: PROVIDER_NAME.to_string(),
        tried: API_KEY_ENV_VARS.iter().map(|v| (*v).to_string()).collect(),
    })
}

/// Max-tokens fallback per model family, used when the request leaves it out.
fn default_max_tokens(model: &str) -> u32 {
    if model.contains("claude-opus-4") || model.contains("claude-sonnet-4") {
        32_000
    } else if model.contains("claude-3-7-sonnet") {
        64_000
    } else if model.contains("claude-3-5") {
        8_192
    } else {
        4_096
    }
}

fn build_request_body(request: &GenerateRequest) -> Value {
    let mut system_parts: Vec<String> = Vec::new();
    if let Some(system) = &request.system_prompt {
        system_parts.push(system.clone());
    }

    let mut messages = Vec::new();
    for message in &request.messages {
        match message.role {
            // The vendor API takes the system prompt out of band.
            Role::System => system_parts.push(message.text()),
            Role::User | Role::Tool => {
                messages.push(json!({
                    "role": "user",
                    "content": message.content.iter().map(block_to_vendor).collect::<Vec<_>>(),
                }));
            }
            Role::Assistant => {
                messages.push(json!({
                    "role": "assistant",
                    "content": message.content.iter().map(block_to_vendor).collect::<Vec<_>>(),
                }));
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens.unwrap_or_else(|| default_max_tokens(&request.model)),
        "messages": messages,
    });

    if !system_parts.is_empty() {
        body["system"] = Value::String(system_parts.join("\n\n"));
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.stop.is_empty() {
        body["stop_sequences"] = json!(request.stop);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.input_schema,
                    })
                })
                .collect(),
        );
    }
    if !request.metadata.is_empty() {
        if let Some(user_id) = request.metadata.get("user_id") {
            body["metadata"] = json!({ "user_id": user_id });
        }
    }

    body
}

fn block_to_vendor(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Image { source, media_type } => match source {
            ImageSource::Base64 { data } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            }),
            ImageSource::Url { url } => json!({
                "type": "image",
                "source": {"type": "url", "url": url},
            }),
        },
        ContentBlock::ToolUse { id, name, input } => {
            json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
        ContentBlock::Thinking { signature, text } => json!({
            "type": "thinking",
            "thinking": text,
            "signature": signature,
        }),
    }
}

fn block_from_vendor(value: &Value) -> Result<ContentBlock, LacquerError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| LacquerError::Parse("content block without type".to_string()))?;

    let block = match kind {
        "text" => ContentBlock::Text {
            text: value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "tool_use" => ContentBlock::ToolUse {
            id: value
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: value
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input: value.get("input").cloned().unwrap_or(Value::Null),
        },
        "tool_result" => ContentBlock::ToolResult {
            tool_use_id: value
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content: value
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "thinking" => ContentBlock::Thinking {
            signature: value
                .get("signature")
                .and_then(Value::as_str)
                .map(String::from),
            text: value
                .get("thinking")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        other => {
            return Err(LacquerError::Parse(format!(
                "unknown content block type '{other}'"
            )));
        }
    };
    Ok(block)
}

fn parse_response(payload: &Value) -> Result<GenerateOutput, LacquerError> {
    let content = payload
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| LacquerError::Parse("anthropic response without content".to_string()))?;

    let blocks = content
        .iter()
        .map(block_from_vendor)
        .collect::<Result<Vec<_>, _>>()?;

    let usage = payload.get("usage").map_or_else(TokenUsage::default, |u| {
        TokenUsage::new(
            u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        )
    });

    Ok(GenerateOutput {
        messages: vec![Message::new(Role::Assistant, blocks)],
        usage,
    })
}

fn map_api_error(status: u16, payload: &Value) -> LacquerError {
    let message = payload
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    LacquerError::Api {
        status,
        message,
        details: Some(payload.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::request::ToolSpec;

    #[test]
    fn test_api_key_resolution_order() {
        let env = |name: &str| match name {
            "ANTHROPIC_API_KEY" => Some("from-env".to_string()),
            _ => None,
        };

        let explicit = resolve_api_key(Some("from-config"), env).unwrap();
        assert_eq!(explicit.expose_secret(), "from-config");

        let fallback = resolve_api_key(None, env).unwrap();
        assert_eq!(fallback.expose_secret(), "from-env");

        let err = resolve_api_key(None, |_| None).unwrap_err();
        assert!(matches!(err, LacquerError::MissingApiKey { .. }));
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_default_max_tokens_per_family() {
        assert_eq!(default_max_tokens("claude-sonnet-4-20250514"), 32_000);
        assert_eq!(default_max_tokens("claude-3-7-sonnet-latest"), 64_000);
        assert_eq!(default_max_tokens("claude-3-5-haiku-20241022"), 8_192);
        assert_eq!(default_max_tokens("claude-3-opus-20240229"), 4_096);
    }

    #[test]
    fn test_request_body_mapping() {
        let mut request = GenerateRequest::new(
            "claude-3-5-haiku-latest",
            vec![
                Message::system("be terse"),
                Message::user("hello"),
            ],
        );
        request.system_prompt = Some("you are a poet".to_string());
        request.temperature = Some(0.3);
        request.tools = vec![ToolSpec {
            name: "search".to_string(),
            description: "web search".to_string(),
            input_schema: json!({"type": "object"}),
        }];

        let body = build_request_body(&request);
        assert_eq!(body["model"], "claude-3-5-haiku-latest");
        assert_eq!(body["max_tokens"], 8_192);
        assert_eq!(body["system"], "you are a poet\n\nbe terse");
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["tools"][0]["name"], "search");
    }

    #[test]
    fn test_response_parsing() {
        let payload = json!({
            "content": [
                {"type": "text", "text": "hi there"},
                {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "x"}},
            ],
            "usage": {"input_tokens": 12, "output_tokens": 34},
        });
        let output = parse_response(&payload).unwrap();
        assert_eq!(output.messages.len(), 1);
        assert_eq!(output.messages[0].text(), "hi there");
        assert_eq!(output.usage.prompt_tokens, 12);
        assert_eq!(output.usage.total_tokens, 46);
        assert!(matches!(
            output.messages[0].content[1],
            ContentBlock::ToolUse { .. }
        ));
    }

    #[test]
    fn test_api_error_passthrough() {
        let payload = json!({"error": {"type": "invalid_request_error", "message": "bad model"}});
        let err = map_api_error(404, &payload);
        match err {
            LacquerError::Api { status, message, .. } => {
                assert_eq!(status, 404);
                assert_eq!(message, "bad model");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!map_api_error(404, &payload).is_retryable());
        assert!(map_api_error(500, &payload).is_retryable());
    }

    #[test]
    fn test_content_block_vendor_round_trip() {
        let blocks = vec![
            ContentBlock::text("hello"),
            ContentBlock::ToolUse {
                id: "t1".to_string(),
                name: "calc".to_string(),
                input: json!({"a": 1}),
            },
            ContentBlock::Thinking {
                signature: Some("sig".to_string()),
                text: "hmm".to_string(),
            },
        ];
        for block in blocks {
            let vendor = block_to_vendor(&block);
            let back = block_from_vendor(&vendor).unwrap();
            assert_eq!(back, block);
        }
    }
}
