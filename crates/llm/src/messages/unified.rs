//! Dialect-neutral canonical request, response and stream event types.
//!
//! Every endpoint decodes its wire dialect into these types, and every
//! upstream call encodes them back out into the target dialect:
//!
//! ```text
//! Dialect request → ChatRequest → Upstream → ChatResponse / StreamEvent → Dialect reply
//! ```
//!
//! Tool-call arguments stay raw JSON strings on this boundary; they are
//! parsed into objects only where a target dialect requires one.

use std::fmt;

use crate::error::LlmError;

pub(crate) mod from_anthropic;
pub(crate) mod from_openai;
pub(crate) mod from_responses;
pub(crate) mod to_anthropic;
pub(crate) mod to_openai;
pub(crate) mod to_responses;

/// Canonical, dialect-neutral chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier, possibly rewritten by the alias resolver.
    pub model: String,
    /// System instruction, kept out of the message list. Multiple source
    /// system messages are concatenated with blank-line separators.
    pub system: Option<String>,
    /// Conversation messages in order.
    pub messages: Vec<Message>,
    /// Tool declarations, unique by name.
    pub tools: Vec<ToolDefinition>,
    /// How the model is allowed to use tools.
    pub tool_choice: Option<ToolChoice>,
    /// Requested completion token cap, before clamping.
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Sequences that stop generation.
    pub stop_sequences: Vec<String>,
    /// Whether the client asked for a streamed reply.
    pub stream: bool,
}

impl ChatRequest {
    /// Validate cross-message invariants that serde cannot express.
    ///
    /// Every `tool_result` must reference a `tool_use` id from an earlier
    /// assistant message, and tool names must be unique.
    pub fn validate(&self) -> Result<(), LlmError> {
        if self.model.is_empty() {
            return Err(LlmError::InvalidRequest("missing model".to_string()));
        }

        if self.messages.is_empty() {
            return Err(LlmError::InvalidRequest("messages must not be empty".to_string()));
        }

        let mut seen_names = std::collections::HashSet::new();

        for tool in &self.tools {
            if !seen_names.insert(tool.name.as_str()) {
                return Err(LlmError::InvalidRequest(format!(
                    "duplicate tool name '{}'",
                    tool.name
                )));
            }
        }

        let mut known_tool_use_ids = std::collections::HashSet::new();

        for message in &self.messages {
            for part in &message.parts {
                match part {
                    Part::ToolUse { id, .. } if message.role == Role::Assistant => {
                        known_tool_use_ids.insert(id.as_str());
                    }
                    Part::ToolResult { tool_use_id, .. } => {
                        if !known_tool_use_ids.contains(tool_use_id.as_str()) {
                            return Err(LlmError::InvalidRequest(format!(
                                "tool_result references unknown tool_use id '{tool_use_id}'"
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// The text of the last user message, if any. Used by the loopback model.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages.iter().rev().find_map(|message| {
            if message.role != Role::User {
                return None;
            }

            let text = message.joined_text();
            if text.is_empty() { None } else { Some(text) }
        })
    }
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Who sent the message.
    pub role: Role,
    /// Ordered content parts. Order is preserved across translation.
    pub parts: Vec<Part>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    /// All text parts joined with blank-line separators.
    pub fn joined_text(&self) -> String {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();

        texts.join("\n\n")
    }
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// System instructions. Normalized into [`ChatRequest::system`] by the
    /// codecs; never present in `messages` after decoding.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool execution results.
    Tool,
}

/// One content part of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    /// Plain text.
    Text {
        text: String,
    },
    /// A tool invocation requested by the assistant. Arguments are kept as
    /// the raw JSON string from the wire.
    ToolUse {
        id: String,
        name: String,
        arguments: String,
    },
    /// The result of executing a tool, referencing the originating call.
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    /// An image block, carried opaquely. Only passthrough-capable; dialects
    /// without an image form reject it as unsupported content.
    Image {
        source: serde_json::Value,
    },
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments, carried verbatim between dialects.
    pub parameters: serde_json::Value,
}

/// How the model is allowed to use tools.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// The model must call at least one tool.
    Required,
    /// Tool usage is disabled.
    None,
    /// The model must call the named tool.
    Tool(String),
}

/// Canonical, dialect-neutral chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    /// Ordered content parts, symmetric to request message parts.
    pub parts: Vec<Part>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl ChatResponse {
    /// All text parts concatenated, without separators.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The tool-use parts of the response, in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &str)> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolUse { id, name, arguments } => Some((id.as_str(), name.as_str(), arguments.as_str())),
                _ => None,
            })
            .collect()
    }
}

/// Why generation stopped, in the neutral vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndTurn => write!(f, "end_turn"),
            StopReason::ToolUse => write!(f, "tool_use"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::StopSequence => write!(f, "stop_sequence"),
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Conservative token estimate for synthesized usage, when the upstream did
/// not report any. Never a billing source of truth.
pub(crate) fn estimate_tokens(text: &str) -> u32 {
    ((text.len() / 4) as u32).max(1)
}

/// Parse raw tool-call arguments into the object form some dialects require.
/// Invalid JSON is wrapped rather than dropped, so the model's output stays
/// inspectable downstream.
pub(crate) fn parse_tool_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }

    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "_": raw }))
}

/// Neutral streaming event. Upstream SSE streams are parsed into this form
/// and re-serialized into the target dialect's concrete event names.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Start of the message; carries the envelope identity.
    MessageStart { id: String, model: String },
    /// Incremental text.
    TextDelta { text: String },
    /// A tool call opened at the given block index.
    ToolCallStart { index: usize, id: String, name: String },
    /// An argument fragment for the tool call at the given index.
    ToolCallArgsDelta { index: usize, arguments: String },
    /// The tool call at the given index is complete.
    ToolCallStop { index: usize },
    /// The stream must suspend for client tool output. Synthesized by the
    /// Responses re-framer; upstream parsers never emit it.
    RequiredAction { calls: Vec<PendingToolCall> },
    /// Terminal metadata: aggregate stop reason and usage when known.
    MessageDelta { stop_reason: StopReason, usage: Option<Usage> },
    /// End of stream.
    MessageStop,
}

/// A tool call awaiting client output.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    /// Output item id (`fc_…`).
    pub id: String,
    /// Call correlation id (`call_…`), the id tool outputs are submitted
    /// against.
    pub call_id: String,
    pub name: String,
    /// Raw JSON argument string as accumulated from the stream.
    pub arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".to_string(),
            system: None,
            messages,
            tools: Vec::new(),
            tool_choice: None,
            max_output_tokens: None,
            temperature: None,
            stop_sequences: Vec::new(),
            stream: false,
        }
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let request = request_with(Vec::new());
        assert!(request.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_model() {
        let mut request = request_with(vec![Message::text(Role::User, "hi")]);
        request.model = String::new();
        assert!(request.validate().is_err());
    }

    #[test]
    fn validate_rejects_orphan_tool_result() {
        let request = request_with(vec![
            Message::text(Role::User, "hi"),
            Message {
                role: Role::Tool,
                parts: vec![Part::ToolResult {
                    tool_use_id: "call_missing".to_string(),
                    content: "{}".to_string(),
                }],
            },
        ]);

        let error = request.validate().unwrap_err().to_string();
        assert!(error.contains("call_missing"), "{error}");
    }

    #[test]
    fn validate_accepts_linked_tool_result() {
        let request = request_with(vec![
            Message::text(Role::User, "ls please"),
            Message {
                role: Role::Assistant,
                parts: vec![Part::ToolUse {
                    id: "call_1".to_string(),
                    name: "shell".to_string(),
                    arguments: r#"{"command":"ls"}"#.to_string(),
                }],
            },
            Message {
                role: Role::Tool,
                parts: vec![Part::ToolResult {
                    tool_use_id: "call_1".to_string(),
                    content: "src".to_string(),
                }],
            },
        ]);

        assert!(request.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_tool_names() {
        let mut request = request_with(vec![Message::text(Role::User, "hi")]);
        let tool = ToolDefinition {
            name: "shell".to_string(),
            description: "run a command".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        };
        request.tools = vec![tool.clone(), tool];

        assert!(request.validate().is_err());
    }

    #[test]
    fn last_user_text_skips_tool_results() {
        let request = request_with(vec![
            Message::text(Role::User, "Hello"),
            Message {
                role: Role::Assistant,
                parts: vec![Part::ToolUse {
                    id: "call_1".to_string(),
                    name: "shell".to_string(),
                    arguments: "{}".to_string(),
                }],
            },
            Message {
                role: Role::Tool,
                parts: vec![Part::ToolResult {
                    tool_use_id: "call_1".to_string(),
                    content: "ok".to_string(),
                }],
            },
        ]);

        assert_eq!(request.last_user_text().as_deref(), Some("Hello"));
    }

    #[test]
    fn token_estimate_is_conservative() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(40)), 10);
    }

    #[test]
    fn tool_arguments_fall_back_to_wrapped_raw() {
        assert_eq!(
            parse_tool_arguments(r#"{"command":"ls"}"#),
            serde_json::json!({"command": "ls"})
        );
        assert_eq!(parse_tool_arguments(""), serde_json::json!({}));
        assert_eq!(
            parse_tool_arguments("not json"),
            serde_json::json!({"_": "not json"})
        );
    }
}
