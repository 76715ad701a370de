//! Conversions from the OpenAI Responses dialect into the canonical form.

use crate::{
    error::LlmError,
    messages::{responses, unified},
};

impl TryFrom<responses::ResponsesRequest> for unified::ChatRequest {
    type Error = LlmError;

    fn try_from(request: responses::ResponsesRequest) -> Result<Self, Self::Error> {
        let mut system_parts: Vec<String> = request.instructions.into_iter().collect();
        let mut messages = Vec::new();

        match request.input {
            responses::ResponsesInput::Text(text) => {
                messages.push(unified::Message::text(unified::Role::User, text));
            }
            responses::ResponsesInput::Items(items) => {
                for item in items {
                    convert_item(item, &mut system_parts, &mut messages)?;
                }
            }
        }

        let mut tools = Vec::new();

        for tool in request.tools.unwrap_or_default() {
            if tool.tool_type != "function" {
                return Err(LlmError::UnsupportedContent(format!(
                    "tool type '{}' cannot be translated",
                    tool.tool_type
                )));
            }

            tools.push(unified::ToolDefinition {
                name: tool.name,
                description: tool.description,
                parameters: tool.parameters,
            });
        }

        let tool_choice = match request.tool_choice {
            None => None,
            Some(responses::ResponsesToolChoice::Mode(mode)) => Some(match mode.as_str() {
                "auto" => unified::ToolChoice::Auto,
                "required" => unified::ToolChoice::Required,
                "none" => unified::ToolChoice::None,
                other => {
                    return Err(LlmError::InvalidRequest(format!("invalid tool_choice '{other}'")));
                }
            }),
            Some(responses::ResponsesToolChoice::Function { name, .. }) => Some(unified::ToolChoice::Tool(name)),
        };

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        Ok(Self {
            model: request.model,
            system,
            messages,
            tools,
            tool_choice,
            max_output_tokens: request.max_output_tokens.filter(|v| *v > 0),
            temperature: request.temperature,
            stop_sequences: Vec::new(),
            stream: request.stream.unwrap_or(false),
        })
    }
}

fn convert_item(
    item: responses::InputItem,
    system_parts: &mut Vec<String>,
    messages: &mut Vec<unified::Message>,
) -> Result<(), LlmError> {
    match item {
        responses::InputItem::Message { role, content } => {
            let text = content.joined_text();

            match role.as_str() {
                "system" | "developer" => system_parts.push(text),
                "user" => messages.push(unified::Message::text(unified::Role::User, text)),
                "assistant" => messages.push(unified::Message::text(unified::Role::Assistant, text)),
                other => {
                    return Err(LlmError::InvalidRequest(format!("unknown input role '{other}'")));
                }
            }
        }
        responses::InputItem::FunctionCall {
            call_id, name, arguments, ..
        } => {
            let part = unified::Part::ToolUse {
                id: call_id,
                name,
                arguments,
            };

            // Consecutive replayed calls collapse into one assistant turn.
            match messages.last_mut() {
                Some(message) if message.role == unified::Role::Assistant => message.parts.push(part),
                _ => messages.push(unified::Message {
                    role: unified::Role::Assistant,
                    parts: vec![part],
                }),
            }
        }
        responses::InputItem::FunctionCallOutput { call_id, output } => {
            messages.push(unified::Message {
                role: unified::Role::Tool,
                parts: vec![unified::Part::ToolResult {
                    tool_use_id: call_id,
                    content: output,
                }],
            });
        }
    }

    Ok(())
}
