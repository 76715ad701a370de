//! Conversions from the OpenAI chat dialect into the canonical form.

use crate::{
    error::LlmError,
    messages::{openai, unified},
};

impl TryFrom<openai::ChatCompletionRequest> for unified::ChatRequest {
    type Error = LlmError;

    fn try_from(request: openai::ChatCompletionRequest) -> Result<Self, Self::Error> {
        let mut system_parts = Vec::new();
        let mut messages = Vec::with_capacity(request.messages.len());

        for message in request.messages {
            match message.role {
                openai::ChatRole::System => {
                    if let Some(content) = message.content {
                        system_parts.push(content.joined_text());
                    }
                }
                openai::ChatRole::User => {
                    let text = message.content.map(|c| c.joined_text()).unwrap_or_default();

                    messages.push(unified::Message::text(unified::Role::User, text));
                }
                openai::ChatRole::Assistant => {
                    let mut parts = Vec::new();

                    if let Some(content) = message.content {
                        let text = content.joined_text();
                        if !text.is_empty() {
                            parts.push(unified::Part::Text { text });
                        }
                    }

                    for call in message.tool_calls.unwrap_or_default() {
                        parts.push(unified::Part::ToolUse {
                            id: call.id,
                            name: call.function.name,
                            arguments: call.function.arguments,
                        });
                    }

                    messages.push(unified::Message {
                        role: unified::Role::Assistant,
                        parts,
                    });
                }
                openai::ChatRole::Tool => {
                    let tool_use_id = message.tool_call_id.ok_or_else(|| {
                        LlmError::InvalidRequest("tool message is missing tool_call_id".to_string())
                    })?;

                    messages.push(unified::Message {
                        role: unified::Role::Tool,
                        parts: vec![unified::Part::ToolResult {
                            tool_use_id,
                            content: message.content.map(|c| c.joined_text()).unwrap_or_default(),
                        }],
                    });
                }
                openai::ChatRole::Other(role) => {
                    return Err(LlmError::InvalidRequest(format!("unknown message role '{role}'")));
                }
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        Ok(Self {
            model: request.model,
            system,
            messages,
            tools: request
                .tools
                .unwrap_or_default()
                .into_iter()
                .map(|tool| unified::ToolDefinition {
                    name: tool.function.name,
                    description: tool.function.description,
                    parameters: tool.function.parameters,
                })
                .collect(),
            tool_choice: request.tool_choice.map(unified::ToolChoice::from),
            max_output_tokens: request.max_tokens.filter(|v| *v > 0),
            temperature: request.temperature,
            stop_sequences: request.stop.map(openai::StopSequences::into_vec).unwrap_or_default(),
            stream: request.stream.unwrap_or(false),
        })
    }
}

impl From<openai::ToolChoice> for unified::ToolChoice {
    fn from(choice: openai::ToolChoice) -> Self {
        match choice {
            openai::ToolChoice::Mode(mode) => match mode {
                openai::ToolChoiceMode::None => unified::ToolChoice::None,
                openai::ToolChoiceMode::Auto | openai::ToolChoiceMode::Other(_) => unified::ToolChoice::Auto,
                openai::ToolChoiceMode::Required => unified::ToolChoice::Required,
            },
            openai::ToolChoice::Specific { function, .. } => unified::ToolChoice::Tool(function.name),
        }
    }
}

impl From<openai::FinishReason> for unified::StopReason {
    fn from(reason: openai::FinishReason) -> Self {
        match reason {
            openai::FinishReason::Stop => unified::StopReason::EndTurn,
            openai::FinishReason::Length => unified::StopReason::MaxTokens,
            openai::FinishReason::ToolCalls => unified::StopReason::ToolUse,
            openai::FinishReason::ContentFilter => {
                log::warn!("upstream finish_reason=content_filter mapped to end_turn");
                unified::StopReason::EndTurn
            }
            openai::FinishReason::Other(reason) => {
                log::warn!("unknown upstream finish_reason '{reason}', mapped to end_turn");
                unified::StopReason::EndTurn
            }
        }
    }
}

impl From<openai::ChatCompletionResponse> for unified::ChatResponse {
    fn from(response: openai::ChatCompletionResponse) -> Self {
        let mut parts = Vec::new();
        let mut stop_reason = unified::StopReason::EndTurn;

        if let Some(choice) = response.choices.into_iter().next() {
            if let Some(content) = choice.message.content {
                let text = content.joined_text();
                if !text.is_empty() {
                    parts.push(unified::Part::Text { text });
                }
            }

            for call in choice.message.tool_calls.unwrap_or_default() {
                parts.push(unified::Part::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                });
            }

            stop_reason = unified::StopReason::from(choice.finish_reason);
        }

        Self {
            id: response.id,
            model: response.model,
            parts,
            stop_reason,
            usage: unified::Usage {
                prompt_tokens: response.usage.prompt_tokens,
                completion_tokens: response.usage.completion_tokens,
            },
        }
    }
}
