//! Render-ready assistant messages rebuilt from the structured output stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Input of a tool invocation as it streams in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum ToolInput {
    /// Partial JSON text received so far
    Accumulating(String),
    /// Final structured input
    Parsed(Value),
    /// Final text that did not parse as JSON
    Raw(String),
}

impl Default for ToolInput {
    fn default() -> Self {
        ToolInput::Accumulating(String::new())
    }
}

impl ToolInput {
    pub fn is_final(&self) -> bool {
        !matches!(self, ToolInput::Accumulating(_))
    }
}

/// One unit of assistant output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: ToolInput,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Text carried by text and thinking blocks.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Thinking { thinking } => Some(thinking),
            ContentBlock::ToolUse { .. } => None,
        }
    }
}

/// A message being assembled from stream events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    pub is_streaming: bool,
}

impl StreamingMessage {
    pub fn new(id: impl Into<String>, role: MessageRole) -> Self {
        Self {
            id: id.into(),
            role,
            content: Vec::new(),
            is_streaming: true,
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}
