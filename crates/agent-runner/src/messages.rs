//! Messages streamed by the coding agent (one JSON object per line).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Markers the agent emits when a conversation no longer fits its context.
const TOKEN_LIMIT_MARKERS: &[&str] = &[
    "Prompt is too long",
    "context_length_exceeded",
    "maximum context length",
];

const TOKEN_LIMIT_SUBTYPES: &[&str] = &["error_max_tokens", "error_token_limit"];

/// One streamed message, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentMessage {
    System(SystemMessage),
    User(ConversationMessage),
    Assistant(ConversationMessage),
    Result(ResultMessage),
}

impl AgentMessage {
    /// Conversation id carried by the message, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System(m) => m.session_id.as_deref(),
            Self::User(m) | Self::Assistant(m) => m.session_id.as_deref(),
            Self::Result(m) => m.session_id.as_deref(),
        }
    }

    /// `system`, `user`, `assistant` or `result`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::System(_) => "system",
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::Result(_) => "result",
        }
    }

    /// Whether this message signals that the context window is exhausted.
    #[must_use]
    pub fn is_token_limit(&self) -> bool {
        match self {
            Self::Result(m) => {
                TOKEN_LIMIT_SUBTYPES.contains(&m.subtype.as_str())
                    || m.result.as_deref().is_some_and(contains_token_limit_marker)
            }
            Self::Assistant(m) => contains_token_limit_marker(&m.message.text()),
            Self::System(_) | Self::User(_) => false,
        }
    }
}

fn contains_token_limit_marker(text: &str) -> bool {
    TOKEN_LIMIT_MARKERS.iter().any(|m| text.contains(m))
}

/// `system` message; `init` carries the conversation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default, rename = "permissionMode")]
    pub permission_mode: Option<String>,
    #[serde(default, rename = "apiKeySource")]
    pub api_key_source: Option<String>,
}

impl SystemMessage {
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.subtype == "init"
    }
}

/// `user` or `assistant` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: MessageBody,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

/// Inner API message of a `user` / `assistant` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub content: MessageContent,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Value>,
}

/// Message content is either a bare string or a list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

/// Borrowed view of a `tool_use` block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolUse<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub input: &'a Value,
}

impl MessageBody {
    fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    /// Text blocks joined by newlines.
    #[must_use]
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Text and tool inputs in block order, joined by newlines.
    #[must_use]
    pub fn content_text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    ContentBlock::ToolUse { input, .. } => Some(input.to_string()),
                    ContentBlock::ToolResult { content, .. } => Some(match content {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    }),
                    ContentBlock::Thinking { .. } | ContentBlock::Other => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// All `tool_use` blocks in order.
    #[must_use]
    pub fn tool_uses(&self) -> Vec<ToolUse<'_>> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolUse { id, name, input }),
                _ => None,
            })
            .collect()
    }
}

/// Terminal `result` message of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// `success`, `error_max_turns`, `error_during_execution`, ...
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub duration_api_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<Value>,
}

impl ResultMessage {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.subtype == "success" && !self.is_error
    }
}
