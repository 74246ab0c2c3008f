//! Message and content block types.
//!
//! Messages are the uniform currency between the runner and provider
//! adapters. Content is a discriminated union over block kinds so adapters
//! can map blocks to vendor schemas without structural sniffing.

use serde::{Deserialize, Serialize};

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// Where image bytes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// Inline base64-encoded data.
    Base64 { data: String },
    /// Remote URL.
    Url { url: String },
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text { text: String },

    /// An image, inline or by reference.
    Image {
        source: ImageSource,
        media_type: String,
    },

    /// A tool invocation requested by the model.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// The result of a tool invocation, matched by id.
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },

    /// Model reasoning surfaced by providers that expose it.
    Thinking {
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        text: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::text(text)])
    }

    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// Concatenated assistant text across a slice of messages.
pub fn assistant_text(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        if message.role == Role::Assistant {
            let text = message.text();
            if !text.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&text);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_block_tagged_serialization() {
        let block = ContentBlock::ToolUse {
            id: "toolu_1".to_string(),
            name: "search".to_string(),
            input: serde_json::json!({"query": "rust"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["name"], "search");

        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_message_text_extraction() {
        let message = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("hello "),
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "noop".to_string(),
                    input: serde_json::Value::Null,
                },
                ContentBlock::text("world"),
            ],
        );
        assert_eq!(message.text(), "hello world");
    }

    #[test]
    fn test_assistant_text_skips_other_roles() {
        let messages = vec![
            Message::user("question"),
            Message::assistant("first"),
            Message::assistant("second"),
        ];
        assert_eq!(assistant_text(&messages), "first\nsecond");
    }
}
