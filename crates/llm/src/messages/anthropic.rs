//! Wire types for the Anthropic Messages dialect.
//!
//! The format differs from OpenAI's in several ways that drive the
//! translator: content is an array of typed blocks, the system prompt is a
//! top-level field, and tool interactions use tool_use/tool_result blocks
//! instead of function calls.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;

/// Request body for the Messages API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesRequest {
    pub model: String,

    /// Messages alternating between user and assistant roles.
    pub messages: Vec<InputMessage>,

    /// Required by the real Anthropic API; optional here so that requests
    /// translated from dialects without the field can omit it and let the
    /// upstream default decide.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// System prompt, as a plain string or text blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    // Vendor-specific fields with no OpenAI equivalent. Decoded so that the
    // translator can strip them explicitly; passthrough forwards them as-is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_caching: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_search: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub computer_use: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Value>,
}

/// System prompt: plain string or an array of text blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Flatten to plain text with blank-line separators.
    pub fn joined_text(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => {
                let texts: Vec<&str> = blocks.iter().map(|block| block.text.as_str()).collect();
                texts.join("\n\n")
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

/// An input message with role and content.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputMessage {
    pub role: Role,
    pub content: MessageContent,
}

/// Message content: a bare string or an array of typed blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Role of a message sender. Anthropic has no system or tool roles; system
/// prompts are a top-level field and tool results travel in user messages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A typed content block.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: Value,
    },
    ToolUse {
        id: String,
        name: String,
        /// Arguments as a parsed JSON object.
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: ToolResultContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Tool result content: a bare string, or text blocks, or arbitrary JSON.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
    Other(Value),
}

impl ToolResultContent {
    /// Stringify for dialects that accept only text. Structured content is
    /// JSON-encoded rather than dropped.
    pub fn to_text(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Blocks(blocks) => {
                let texts: Vec<String> = blocks
                    .iter()
                    .map(|block| match block {
                        ContentBlock::Text { text } => text.clone(),
                        other => serde_json::to_string(other).unwrap_or_default(),
                    })
                    .collect();

                texts.join("\n\n")
            }
            ToolResultContent::Other(value) => serde_json::to_string(value).unwrap_or_default(),
        }
    }
}

/// Request metadata.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Tool definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's input.
    pub input_schema: Value,
}

/// Tool choice configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    None,
    Tool { name: String },
}

/// Response body from the Messages API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub r#type: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    /// Forward compatibility with reasons we do not know yet.
    #[serde(untagged)]
    Other(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndTurn => write!(f, "end_turn"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::StopSequence => write!(f, "stop_sequence"),
            StopReason::ToolUse => write!(f, "tool_use"),
            StopReason::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// May be omitted in streaming message_delta events.
    #[serde(default)]
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub error: ErrorDetails,
}

/// Error details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl From<LlmError> for ErrorResponse {
    fn from(error: LlmError) -> Self {
        let error_type = match &error {
            LlmError::InvalidRequest(_)
            | LlmError::UnknownModel(_)
            | LlmError::WorkModeRejection(_)
            | LlmError::UnsupportedContent(_)
            | LlmError::Cancelled => "invalid_request_error",
            LlmError::Unauthenticated(_) => "authentication_error",
            LlmError::NotFound(_) => "not_found_error",
            LlmError::Conflict(_) => "invalid_request_error",
            LlmError::UpstreamError { .. } | LlmError::UpstreamUnavailable(_) => "api_error",
            LlmError::Internal(_) => "api_error",
        };

        Self {
            error_type: "error".to_string(),
            error: ErrorDetails {
                error_type: error_type.to_string(),
                message: error.client_message(),
            },
        }
    }
}

/// Streaming event types for Anthropic SSE responses.
///
/// Event flow for a typical streaming response:
/// 1. `message_start` with the message envelope
/// 2. `content_block_start` per content block (text or tool_use)
/// 3. `content_block_delta` with incremental updates
/// 4. `content_block_stop` per block
/// 5. `message_delta` with stop reason and usage
/// 6. `message_stop`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaData,
        usage: Usage,
    },
    MessageStop,
    Ping,
    Error {
        error: ErrorDetails,
    },
}

impl StreamEvent {
    /// The SSE `event:` name for this event.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Message envelope carried by `message_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessageStart {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub usage: Usage,
}

/// Delta payload of `content_block_delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

/// Delta payload of `message_delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeltaData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}
