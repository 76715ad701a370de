//! Conversions from the canonical form into the OpenAI chat dialect.

use crate::{
    error::LlmError,
    messages::{openai, unified},
};

impl TryFrom<unified::ChatRequest> for openai::ChatCompletionRequest {
    type Error = LlmError;

    fn try_from(request: unified::ChatRequest) -> Result<Self, Self::Error> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if let Some(system) = request.system {
            messages.push(openai::ChatMessage {
                role: openai::ChatRole::System,
                content: Some(openai::MessageContent::Text(system)),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for message in request.messages {
            match message.role {
                unified::Role::System => {
                    // Normalized away by the codecs; tolerate stray ones.
                    messages.push(openai::ChatMessage {
                        role: openai::ChatRole::System,
                        content: Some(openai::MessageContent::Text(message.joined_text())),
                        tool_calls: None,
                        tool_call_id: None,
                    });
                }
                unified::Role::User => {
                    reject_untranslatable(&message.parts)?;

                    messages.push(openai::ChatMessage {
                        role: openai::ChatRole::User,
                        content: Some(openai::MessageContent::Text(message.joined_text())),
                        tool_calls: None,
                        tool_call_id: None,
                    });
                }
                unified::Role::Assistant => {
                    reject_untranslatable(&message.parts)?;

                    let text = message.joined_text();
                    let tool_calls: Vec<openai::ToolCall> = message
                        .parts
                        .into_iter()
                        .filter_map(|part| match part {
                            unified::Part::ToolUse { id, name, arguments } => Some(openai::ToolCall {
                                id,
                                tool_type: openai::ToolCallType::Function,
                                function: openai::FunctionCall { name, arguments },
                            }),
                            _ => None,
                        })
                        .collect();

                    messages.push(openai::ChatMessage {
                        role: openai::ChatRole::Assistant,
                        content: if text.is_empty() {
                            None
                        } else {
                            Some(openai::MessageContent::Text(text))
                        },
                        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                        tool_call_id: None,
                    });
                }
                unified::Role::Tool => {
                    // One wire message per tool result, keyed by the call id.
                    for part in message.parts {
                        if let unified::Part::ToolResult { tool_use_id, content } = part {
                            messages.push(openai::ChatMessage {
                                role: openai::ChatRole::Tool,
                                content: Some(openai::MessageContent::Text(content)),
                                tool_calls: None,
                                tool_call_id: Some(tool_use_id),
                            });
                        }
                    }
                }
            }
        }

        Ok(Self {
            model: request.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
            stop: if request.stop_sequences.is_empty() {
                None
            } else {
                Some(openai::StopSequences::Many(request.stop_sequences))
            },
            stream: if request.stream { Some(true) } else { None },
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(
                    request
                        .tools
                        .into_iter()
                        .map(|tool| openai::Tool {
                            tool_type: openai::ToolCallType::Function,
                            function: openai::FunctionDefinition {
                                name: tool.name,
                                description: tool.description,
                                parameters: tool.parameters,
                            },
                        })
                        .collect(),
                )
            },
            tool_choice: request.tool_choice.map(openai::ToolChoice::from),
            user: None,
        })
    }
}

fn reject_untranslatable(parts: &[unified::Part]) -> Result<(), LlmError> {
    for part in parts {
        if matches!(part, unified::Part::Image { .. }) {
            return Err(LlmError::UnsupportedContent(
                "image content cannot be translated to the OpenAI chat dialect".to_string(),
            ));
        }
    }

    Ok(())
}

impl From<unified::ToolChoice> for openai::ToolChoice {
    fn from(choice: unified::ToolChoice) -> Self {
        match choice {
            unified::ToolChoice::Auto => openai::ToolChoice::Mode(openai::ToolChoiceMode::Auto),
            unified::ToolChoice::Required => openai::ToolChoice::Mode(openai::ToolChoiceMode::Required),
            unified::ToolChoice::None => openai::ToolChoice::Mode(openai::ToolChoiceMode::None),
            unified::ToolChoice::Tool(name) => openai::ToolChoice::Specific {
                tool_type: openai::ToolCallType::Function,
                function: openai::ToolChoiceFunction { name },
            },
        }
    }
}

impl From<unified::StopReason> for openai::FinishReason {
    fn from(reason: unified::StopReason) -> Self {
        match reason {
            unified::StopReason::EndTurn => openai::FinishReason::Stop,
            unified::StopReason::MaxTokens => openai::FinishReason::Length,
            unified::StopReason::ToolUse => openai::FinishReason::ToolCalls,
            unified::StopReason::StopSequence => openai::FinishReason::Stop,
        }
    }
}

impl From<unified::ChatResponse> for openai::ChatCompletionResponse {
    fn from(response: unified::ChatResponse) -> Self {
        let text = response.joined_text();

        let tool_calls: Vec<openai::ToolCall> = response
            .parts
            .iter()
            .filter_map(|part| match part {
                unified::Part::ToolUse { id, name, arguments } => Some(openai::ToolCall {
                    id: id.clone(),
                    tool_type: openai::ToolCallType::Function,
                    function: openai::FunctionCall {
                        name: name.clone(),
                        arguments: arguments.clone(),
                    },
                }),
                _ => None,
            })
            .collect();

        Self {
            id: response.id,
            object: openai::ObjectType::ChatCompletion,
            created: unix_timestamp(),
            model: response.model,
            choices: vec![openai::ChatChoice {
                index: 0,
                message: openai::ChatMessage {
                    role: openai::ChatRole::Assistant,
                    content: if text.is_empty() {
                        None
                    } else {
                        Some(openai::MessageContent::Text(text))
                    },
                    tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                    tool_call_id: None,
                },
                finish_reason: openai::FinishReason::from(response.stop_reason),
            }],
            usage: openai::Usage {
                prompt_tokens: response.usage.prompt_tokens,
                completion_tokens: response.usage.completion_tokens,
                total_tokens: response.usage.total(),
            },
        }
    }
}

pub(crate) fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> unified::ChatRequest {
        unified::ChatRequest {
            model: "gpt-4o-mini".to_string(),
            system: Some("Be terse.".to_string()),
            messages: vec![unified::Message::text(unified::Role::User, "hello")],
            tools: Vec::new(),
            tool_choice: None,
            max_output_tokens: Some(128),
            temperature: Some(0.2),
            stop_sequences: Vec::new(),
            stream: false,
        }
    }

    #[test]
    fn system_becomes_leading_message() {
        let request = openai::ChatCompletionRequest::try_from(base_request()).unwrap();

        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, openai::ChatRole::System);
        assert_eq!(
            request.messages[0].content.as_ref().unwrap().joined_text(),
            "Be terse."
        );
    }

    #[test]
    fn tool_results_expand_to_tool_messages() {
        let mut unified_request = base_request();
        unified_request.messages = vec![
            unified::Message::text(unified::Role::User, "run ls"),
            unified::Message {
                role: unified::Role::Assistant,
                parts: vec![unified::Part::ToolUse {
                    id: "call_1".to_string(),
                    name: "shell".to_string(),
                    arguments: r#"{"command":"ls"}"#.to_string(),
                }],
            },
            unified::Message {
                role: unified::Role::Tool,
                parts: vec![
                    unified::Part::ToolResult {
                        tool_use_id: "call_1".to_string(),
                        content: "src".to_string(),
                    },
                    unified::Part::ToolResult {
                        tool_use_id: "call_1".to_string(),
                        content: "tests".to_string(),
                    },
                ],
            },
        ];

        let request = openai::ChatCompletionRequest::try_from(unified_request).unwrap();

        // system + user + assistant + two tool messages
        assert_eq!(request.messages.len(), 5);
        assert_eq!(request.messages[3].role, openai::ChatRole::Tool);
        assert_eq!(request.messages[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(request.messages[4].role, openai::ChatRole::Tool);
    }

    #[test]
    fn image_parts_are_unsupported() {
        let mut unified_request = base_request();
        unified_request.messages = vec![unified::Message {
            role: unified::Role::User,
            parts: vec![unified::Part::Image {
                source: serde_json::json!({"type": "base64", "data": "...."}),
            }],
        }];

        let error = openai::ChatCompletionRequest::try_from(unified_request).unwrap_err();
        assert!(matches!(error, LlmError::UnsupportedContent(_)));
    }

    #[test]
    fn multi_part_text_joins_with_blank_lines() {
        let mut unified_request = base_request();
        unified_request.messages = vec![unified::Message {
            role: unified::Role::User,
            parts: vec![
                unified::Part::Text { text: "first".to_string() },
                unified::Part::Text { text: "second".to_string() },
            ],
        }];

        let request = openai::ChatCompletionRequest::try_from(unified_request).unwrap();
        assert_eq!(
            request.messages[1].content.as_ref().unwrap().joined_text(),
            "first\n\nsecond"
        );
    }

    #[test]
    fn response_round_trip_preserves_tool_calls() {
        let unified_response = unified::ChatResponse {
            id: "msg_1".to_string(),
            model: "claude-3-5-haiku-latest".to_string(),
            parts: vec![
                unified::Part::Text { text: "Checking.".to_string() },
                unified::Part::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "get_weather".to_string(),
                    arguments: r#"{"location":"Paris"}"#.to_string(),
                },
            ],
            stop_reason: unified::StopReason::ToolUse,
            usage: unified::Usage {
                prompt_tokens: 20,
                completion_tokens: 10,
            },
        };

        let response = openai::ChatCompletionResponse::from(unified_response);
        assert_eq!(response.choices[0].finish_reason, openai::FinishReason::ToolCalls);

        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(response.usage.total_tokens, 30);
    }
}
