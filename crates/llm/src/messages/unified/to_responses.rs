//! Shaping canonical responses into the OpenAI Responses dialect.
//!
//! Unlike the other directions these are free functions: the response object
//! carries gateway-generated identity (the `resp_…` id that keys tool-call
//! continuations), which a plain `From` impl has no access to.

use crate::messages::{responses, unified};

/// Build a `response` object from a canonical response.
///
/// When the response stopped on tool calls, the output lists each call in
/// the flat `function_call` shape, a `required_action` enumerates them and
/// the status is `incomplete`.
pub(crate) fn response_object(
    response: &unified::ChatResponse,
    response_id: &str,
    created_at: u64,
) -> responses::Response {
    let pending = pending_tool_calls(response);
    let mut output = Vec::new();

    let text = response.joined_text();

    if !text.is_empty() {
        output.push(responses::OutputItem::Message {
            id: format!("msg_{response_id}"),
            role: "assistant".to_string(),
            status: "completed".to_string(),
            content: vec![responses::OutputContent::OutputText { text }],
        });
    }

    for call in &pending {
        output.push(responses::OutputItem::FunctionCall {
            id: call.id.clone(),
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: "completed".to_string(),
        });
    }

    let suspended = !pending.is_empty();

    responses::Response {
        id: response_id.to_string(),
        object: "response".to_string(),
        created_at,
        model: response.model.clone(),
        status: if suspended {
            responses::ResponseStatus::Incomplete
        } else {
            responses::ResponseStatus::Completed
        },
        output,
        required_action: if suspended {
            Some(required_action(&pending))
        } else {
            None
        },
        usage: Some(responses::ResponsesUsage {
            input_tokens: response.usage.prompt_tokens,
            output_tokens: response.usage.completion_tokens,
            total_tokens: response.usage.total(),
        }),
    }
}

/// The tool calls of a canonical response in continuation form. The wire
/// `tool_use` id doubles as the submission `call_id`; the item id gets the
/// `fc_` prefix the Responses dialect uses for output items.
pub(crate) fn pending_tool_calls(response: &unified::ChatResponse) -> Vec<unified::PendingToolCall> {
    response
        .tool_uses()
        .into_iter()
        .map(|(id, name, arguments)| unified::PendingToolCall {
            id: format!("fc_{id}"),
            call_id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        })
        .collect()
}

/// Build the `required_action` object enumerating pending tool calls.
pub(crate) fn required_action(pending: &[unified::PendingToolCall]) -> responses::RequiredAction {
    responses::RequiredAction {
        action_type: "submit_tool_outputs".to_string(),
        submit_tool_outputs: responses::SubmitToolOutputsAction {
            tool_calls: pending
                .iter()
                .map(|call| responses::RequiredToolCall {
                    id: call.id.clone(),
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                })
                .collect(),
        },
    }
}
