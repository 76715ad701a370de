//! Conversions from the canonical form into the Anthropic messages dialect.

use crate::messages::{
    anthropic,
    unified::{self, parse_tool_arguments},
};

impl From<unified::ChatRequest> for anthropic::MessagesRequest {
    fn from(request: unified::ChatRequest) -> Self {
        let mut messages: Vec<anthropic::InputMessage> = Vec::with_capacity(request.messages.len());
        let mut extra_system = Vec::new();

        for message in request.messages {
            let (role, blocks) = match message.role {
                unified::Role::System => {
                    extra_system.push(message.joined_text());
                    continue;
                }
                unified::Role::User => (anthropic::Role::User, blocks_from_parts(message.parts)),
                unified::Role::Assistant => (anthropic::Role::Assistant, blocks_from_parts(message.parts)),
                unified::Role::Tool => {
                    // Tool results travel as tool_result blocks in user messages.
                    let blocks = message
                        .parts
                        .into_iter()
                        .filter_map(|part| match part {
                            unified::Part::ToolResult { tool_use_id, content } => {
                                Some(anthropic::ContentBlock::ToolResult {
                                    tool_use_id,
                                    content: anthropic::ToolResultContent::Text(content),
                                    is_error: None,
                                })
                            }
                            _ => None,
                        })
                        .collect();

                    (anthropic::Role::User, blocks)
                }
            };

            // Anthropic expects alternating roles; adjacent same-role
            // messages (a tool result followed by user text, say) merge into
            // one message with ordered blocks.
            match messages.last_mut() {
                Some(last) if last.role == role => match &mut last.content {
                    anthropic::MessageContent::Blocks(existing) => existing.extend(blocks),
                    anthropic::MessageContent::Text(text) => {
                        let mut merged = vec![anthropic::ContentBlock::Text {
                            text: std::mem::take(text),
                        }];
                        merged.extend(blocks);
                        last.content = anthropic::MessageContent::Blocks(merged);
                    }
                },
                _ => messages.push(anthropic::InputMessage {
                    role,
                    content: anthropic::MessageContent::Blocks(blocks),
                }),
            }
        }

        let system = {
            let mut parts: Vec<String> = request.system.into_iter().collect();
            parts.extend(extra_system);

            if parts.is_empty() {
                None
            } else {
                Some(anthropic::SystemPrompt::Text(parts.join("\n\n")))
            }
        };

        Self {
            model: request.model,
            messages,
            max_tokens: request.max_output_tokens,
            system,
            temperature: request.temperature,
            top_p: None,
            top_k: None,
            stop_sequences: if request.stop_sequences.is_empty() {
                None
            } else {
                Some(request.stop_sequences)
            },
            stream: if request.stream { Some(true) } else { None },
            metadata: None,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(
                    request
                        .tools
                        .into_iter()
                        .map(|tool| anthropic::Tool {
                            name: tool.name,
                            description: tool.description,
                            input_schema: tool.parameters,
                        })
                        .collect(),
                )
            },
            tool_choice: request.tool_choice.map(anthropic::ToolChoice::from),
            prompt_caching: None,
            web_search: None,
            computer_use: None,
            mcp: None,
            response_format: None,
            reasoning: None,
            thinking: None,
        }
    }
}

fn blocks_from_parts(parts: Vec<unified::Part>) -> Vec<anthropic::ContentBlock> {
    parts
        .into_iter()
        .map(|part| match part {
            unified::Part::Text { text } => anthropic::ContentBlock::Text { text },
            unified::Part::ToolUse { id, name, arguments } => anthropic::ContentBlock::ToolUse {
                id,
                name,
                input: parse_tool_arguments(&arguments),
            },
            unified::Part::ToolResult { tool_use_id, content } => anthropic::ContentBlock::ToolResult {
                tool_use_id,
                content: anthropic::ToolResultContent::Text(content),
                is_error: None,
            },
            unified::Part::Image { source } => anthropic::ContentBlock::Image { source },
        })
        .collect()
}

impl From<unified::ToolChoice> for anthropic::ToolChoice {
    fn from(choice: unified::ToolChoice) -> Self {
        match choice {
            unified::ToolChoice::Auto => anthropic::ToolChoice::Auto,
            unified::ToolChoice::Required => anthropic::ToolChoice::Any,
            unified::ToolChoice::None => anthropic::ToolChoice::None,
            unified::ToolChoice::Tool(name) => anthropic::ToolChoice::Tool { name },
        }
    }
}

impl From<unified::StopReason> for anthropic::StopReason {
    fn from(reason: unified::StopReason) -> Self {
        match reason {
            unified::StopReason::EndTurn => anthropic::StopReason::EndTurn,
            unified::StopReason::MaxTokens => anthropic::StopReason::MaxTokens,
            unified::StopReason::StopSequence => anthropic::StopReason::StopSequence,
            unified::StopReason::ToolUse => anthropic::StopReason::ToolUse,
        }
    }
}

impl From<unified::ChatResponse> for anthropic::MessagesResponse {
    fn from(response: unified::ChatResponse) -> Self {
        let content = response
            .parts
            .iter()
            .filter_map(|part| match part {
                unified::Part::Text { text } => Some(anthropic::ContentBlock::Text { text: text.clone() }),
                unified::Part::ToolUse { id, name, arguments } => Some(anthropic::ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: parse_tool_arguments(arguments),
                }),
                unified::Part::Image { source } => Some(anthropic::ContentBlock::Image {
                    source: source.clone(),
                }),
                unified::Part::ToolResult { .. } => None,
            })
            .collect();

        Self {
            id: response.id,
            r#type: "message".to_string(),
            role: anthropic::Role::Assistant,
            content,
            model: response.model,
            stop_reason: Some(anthropic::StopReason::from(response.stop_reason)),
            stop_sequence: None,
            usage: anthropic::Usage {
                input_tokens: response.usage.prompt_tokens,
                output_tokens: response.usage.completion_tokens,
            },
        }
    }
}
