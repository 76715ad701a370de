//! Conversions from the Anthropic messages dialect into the canonical form.
//!
//! Vendor-specific beta fields (`prompt_caching`, `web_search`,
//! `computer_use`, `mcp`, `response_format`, `reasoning`, `thinking`) are
//! dropped here: the canonical form has no place for them, so a request
//! translated onward to OpenAI never carries them.

use crate::{
    error::LlmError,
    messages::{anthropic, unified},
};

impl TryFrom<anthropic::MessagesRequest> for unified::ChatRequest {
    type Error = LlmError;

    fn try_from(request: anthropic::MessagesRequest) -> Result<Self, Self::Error> {
        let mut messages = Vec::with_capacity(request.messages.len());

        for message in request.messages {
            match message.role {
                anthropic::Role::User => convert_user_message(message.content, &mut messages),
                anthropic::Role::Assistant => {
                    let parts = match message.content {
                        anthropic::MessageContent::Text(text) => vec![unified::Part::Text { text }],
                        anthropic::MessageContent::Blocks(blocks) => {
                            let mut parts = Vec::with_capacity(blocks.len());

                            for block in blocks {
                                match block {
                                    anthropic::ContentBlock::Text { text } => {
                                        parts.push(unified::Part::Text { text });
                                    }
                                    anthropic::ContentBlock::ToolUse { id, name, input } => {
                                        parts.push(unified::Part::ToolUse {
                                            id,
                                            name,
                                            arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                                        });
                                    }
                                    anthropic::ContentBlock::Image { source } => {
                                        parts.push(unified::Part::Image { source });
                                    }
                                    anthropic::ContentBlock::ToolResult { .. } => {
                                        return Err(LlmError::InvalidRequest(
                                            "tool_result blocks are not valid in assistant messages".to_string(),
                                        ));
                                    }
                                }
                            }

                            parts
                        }
                    };

                    messages.push(unified::Message {
                        role: unified::Role::Assistant,
                        parts,
                    });
                }
            }
        }

        Ok(Self {
            model: request.model,
            system: request.system.map(|system| system.joined_text()),
            messages,
            tools: request
                .tools
                .unwrap_or_default()
                .into_iter()
                .map(|tool| unified::ToolDefinition {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                })
                .collect(),
            tool_choice: request.tool_choice.map(unified::ToolChoice::from),
            max_output_tokens: request.max_tokens.filter(|v| *v > 0),
            temperature: request.temperature,
            stop_sequences: request.stop_sequences.unwrap_or_default(),
            stream: request.stream.unwrap_or(false),
        })
    }
}

/// Anthropic carries tool results inside user messages. The canonical form
/// gives them their own `tool` role messages, preserving block order by
/// splitting the user message around each result.
fn convert_user_message(content: anthropic::MessageContent, messages: &mut Vec<unified::Message>) {
    let blocks = match content {
        anthropic::MessageContent::Text(text) => {
            messages.push(unified::Message::text(unified::Role::User, text));
            return;
        }
        anthropic::MessageContent::Blocks(blocks) => blocks,
    };

    let mut user_parts: Vec<unified::Part> = Vec::new();

    for block in blocks {
        match block {
            anthropic::ContentBlock::Text { text } => {
                user_parts.push(unified::Part::Text { text });
            }
            anthropic::ContentBlock::Image { source } => {
                user_parts.push(unified::Part::Image { source });
            }
            anthropic::ContentBlock::ToolResult {
                tool_use_id, content, ..
            } => {
                if !user_parts.is_empty() {
                    messages.push(unified::Message {
                        role: unified::Role::User,
                        parts: std::mem::take(&mut user_parts),
                    });
                }

                messages.push(unified::Message {
                    role: unified::Role::Tool,
                    parts: vec![unified::Part::ToolResult {
                        tool_use_id,
                        content: content.to_text(),
                    }],
                });
            }
            anthropic::ContentBlock::ToolUse { id, name, input } => {
                // Tolerated in user context by the upstream API; keep it.
                user_parts.push(unified::Part::ToolUse {
                    id,
                    name,
                    arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                });
            }
        }
    }

    if !user_parts.is_empty() {
        messages.push(unified::Message {
            role: unified::Role::User,
            parts: user_parts,
        });
    }
}

impl From<anthropic::ToolChoice> for unified::ToolChoice {
    fn from(choice: anthropic::ToolChoice) -> Self {
        match choice {
            anthropic::ToolChoice::Auto => unified::ToolChoice::Auto,
            anthropic::ToolChoice::Any => unified::ToolChoice::Required,
            anthropic::ToolChoice::None => unified::ToolChoice::None,
            anthropic::ToolChoice::Tool { name } => unified::ToolChoice::Tool(name),
        }
    }
}

impl From<anthropic::StopReason> for unified::StopReason {
    fn from(reason: anthropic::StopReason) -> Self {
        match reason {
            anthropic::StopReason::EndTurn => unified::StopReason::EndTurn,
            anthropic::StopReason::MaxTokens => unified::StopReason::MaxTokens,
            anthropic::StopReason::StopSequence => unified::StopReason::StopSequence,
            anthropic::StopReason::ToolUse => unified::StopReason::ToolUse,
            anthropic::StopReason::Other(reason) => {
                log::warn!("unknown upstream stop_reason '{reason}', mapped to end_turn");
                unified::StopReason::EndTurn
            }
        }
    }
}

impl From<anthropic::MessagesResponse> for unified::ChatResponse {
    fn from(response: anthropic::MessagesResponse) -> Self {
        let parts = response
            .content
            .into_iter()
            .filter_map(|block| match block {
                anthropic::ContentBlock::Text { text } => Some(unified::Part::Text { text }),
                anthropic::ContentBlock::ToolUse { id, name, input } => Some(unified::Part::ToolUse {
                    id,
                    name,
                    arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                }),
                anthropic::ContentBlock::Image { source } => Some(unified::Part::Image { source }),
                // Tool results do not appear in responses.
                anthropic::ContentBlock::ToolResult { .. } => None,
            })
            .collect();

        Self {
            id: response.id,
            model: response.model,
            parts,
            stop_reason: response
                .stop_reason
                .map(unified::StopReason::from)
                .unwrap_or(unified::StopReason::EndTurn),
            usage: unified::Usage {
                prompt_tokens: response.usage.input_tokens,
                completion_tokens: response.usage.output_tokens,
            },
        }
    }
}
