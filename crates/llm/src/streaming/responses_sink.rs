//! Neutral events to Responses-dialect SSE, including the suspension
//! sequence for tool calls.
//!
//! A stream that finishes on tool calls does not complete: it registers a
//! continuation and terminates with `response.output_item.done` per call,
//! `response.required_action`, a `response.completed` carrying
//! `status=incomplete`, and the `[DONE]` sentinel. The client resumes by
//! submitting tool outputs against the advertised response id.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use crate::{
    continuation::ContinuationStore,
    messages::{
        responses,
        unified::{ChatRequest, PendingToolCall, StopReason, StreamEvent, Usage},
    },
    model::Family,
    streaming::{EventSink, Frame},
};

/// Everything the sink needs to register a continuation at suspension time.
pub(crate) struct ContinuationHandle {
    pub store: Arc<ContinuationStore>,
    pub request: ChatRequest,
    pub family: Family,
}

struct ToolCallItem {
    output_index: usize,
    call: PendingToolCall,
    args_done_sent: bool,
}

pub(crate) struct ResponsesSink {
    queue: VecDeque<Frame>,
    response_id: String,
    created_at: u64,
    model: String,
    started: bool,
    text: String,
    message_item_index: Option<usize>,
    next_output_index: usize,
    tool_calls: BTreeMap<usize, ToolCallItem>,
    usage: Option<Usage>,
    handle: Option<ContinuationHandle>,
    ended: bool,
}

impl ResponsesSink {
    pub fn new(response_id: String, model: String, handle: Option<ContinuationHandle>) -> Self {
        Self {
            queue: VecDeque::new(),
            response_id,
            created_at: crate::messages::unified::to_openai::unix_timestamp(),
            model,
            started: false,
            text: String::new(),
            message_item_index: None,
            next_output_index: 0,
            tool_calls: BTreeMap::new(),
            usage: None,
            handle,
            ended: false,
        }
    }

    fn push(&mut self, event: responses::ResponsesStreamEvent) {
        let frame = Frame::named(event.event_name(), &event);
        self.queue.push_back(frame);
    }

    fn ensure_started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let response = self.skeleton(responses::ResponseStatus::InProgress, Vec::new(), None);
        self.push(responses::ResponsesStreamEvent::Created { response });
    }

    fn skeleton(
        &self,
        status: responses::ResponseStatus,
        output: Vec<responses::OutputItem>,
        required_action: Option<responses::RequiredAction>,
    ) -> responses::Response {
        responses::Response {
            id: self.response_id.clone(),
            object: "response".to_string(),
            created_at: self.created_at,
            model: self.model.clone(),
            status,
            output,
            required_action,
            usage: self.usage.map(|usage| responses::ResponsesUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total(),
            }),
        }
    }

    fn message_item(&self) -> Option<responses::OutputItem> {
        if self.text.is_empty() {
            return None;
        }

        Some(responses::OutputItem::Message {
            id: format!("msg_{}", self.response_id),
            role: "assistant".to_string(),
            status: "completed".to_string(),
            content: vec![responses::OutputContent::OutputText {
                text: self.text.clone(),
            }],
        })
    }

    fn function_call_item(call: &PendingToolCall, status: &str) -> responses::OutputItem {
        responses::OutputItem::FunctionCall {
            id: call.id.clone(),
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: status.to_string(),
        }
    }

    fn finalize(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        self.ensure_started();

        let tool_calls = std::mem::take(&mut self.tool_calls);
        let mut items: Vec<(usize, ToolCallItem)> = tool_calls.into_iter().collect();
        items.sort_by_key(|(_, item)| item.output_index);

        // Close out argument streams that never saw an explicit stop.
        for (_, item) in items.iter_mut() {
            if !item.args_done_sent {
                item.args_done_sent = true;
                self.push(responses::ResponsesStreamEvent::FunctionCallArgumentsDone {
                    output_index: item.output_index,
                    arguments: item.call.arguments.clone(),
                });
            }
        }

        let pending: Vec<PendingToolCall> = items.iter().map(|(_, item)| item.call.clone()).collect();

        let mut output = Vec::new();
        if let Some(message) = self.message_item() {
            output.push(message);
        }

        if pending.is_empty() {
            let response = self.skeleton(responses::ResponseStatus::Completed, output, None);
            self.push(responses::ResponsesStreamEvent::Completed { response });
            self.queue.push_back(Frame::done());
            return;
        }

        for (_, item) in &items {
            self.push(responses::ResponsesStreamEvent::OutputItemDone {
                output_index: item.output_index,
                item: Self::function_call_item(&item.call, "completed"),
            });
        }

        for call in &pending {
            output.push(Self::function_call_item(call, "completed"));
        }

        let required_action = crate::messages::unified::to_responses::required_action(&pending);

        // Suspension is a neutral event in its own right; route it through
        // the same path an upstream-surfaced one would take.
        self.process(StreamEvent::RequiredAction { calls: pending });

        let response = self.skeleton(responses::ResponseStatus::Incomplete, output, Some(required_action));
        self.push(responses::ResponsesStreamEvent::Completed { response });
        self.queue.push_back(Frame::done());
    }
}

impl EventSink for ResponsesSink {
    fn process(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::MessageStart { model, .. } => {
                if !model.is_empty() {
                    self.model = model;
                }
                self.ensure_started();
            }

            StreamEvent::TextDelta { text } => {
                if text.is_empty() {
                    return;
                }

                self.ensure_started();

                if self.message_item_index.is_none() {
                    self.message_item_index = Some(self.next_output_index);
                    self.next_output_index += 1;
                }

                self.text.push_str(&text);
                self.push(responses::ResponsesStreamEvent::OutputTextDelta { delta: text });
            }

            StreamEvent::ToolCallStart { index, id, name } => {
                self.ensure_started();

                let output_index = self.next_output_index;
                self.next_output_index += 1;

                let call = PendingToolCall {
                    id: format!("fc_{id}"),
                    call_id: id,
                    name,
                    arguments: String::new(),
                };

                self.push(responses::ResponsesStreamEvent::OutputItemAdded {
                    output_index,
                    item: Self::function_call_item(&call, "in_progress"),
                });

                self.tool_calls.insert(
                    index,
                    ToolCallItem {
                        output_index,
                        call,
                        args_done_sent: false,
                    },
                );
            }

            StreamEvent::ToolCallArgsDelta { index, arguments } => {
                let Some(item) = self.tool_calls.get_mut(&index) else {
                    log::warn!("dropping arguments for unknown tool call index {index}");
                    return;
                };

                item.call.arguments.push_str(&arguments);
                let output_index = item.output_index;

                self.push(responses::ResponsesStreamEvent::FunctionCallArgumentsDelta {
                    output_index,
                    delta: arguments,
                });
            }

            StreamEvent::ToolCallStop { index } => {
                let Some(item) = self.tool_calls.get_mut(&index) else {
                    return;
                };

                if !item.args_done_sent {
                    item.args_done_sent = true;
                    let output_index = item.output_index;
                    let arguments = item.call.arguments.clone();

                    self.push(responses::ResponsesStreamEvent::FunctionCallArgumentsDone {
                        output_index,
                        arguments,
                    });
                }
            }

            StreamEvent::RequiredAction { calls } => {
                if let Some(handle) = self.handle.take() {
                    handle
                        .store
                        .register(self.response_id.clone(), handle.request, handle.family, calls.clone());
                }

                self.push(responses::ResponsesStreamEvent::RequiredAction {
                    required_action: crate::messages::unified::to_responses::required_action(&calls),
                });
            }

            StreamEvent::MessageDelta { usage, .. } => {
                if usage.is_some() {
                    self.usage = usage;
                }
            }

            StreamEvent::MessageStop => self.finalize(),
        }
    }

    fn finish(&mut self) {
        self.finalize();
    }

    fn pop(&mut self) -> Option<Frame> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::test_support::{json, run_sink};

    fn scripted_tool_stream() -> Vec<StreamEvent> {
        vec![
            StreamEvent::MessageStart {
                id: "chatcmpl-1".to_string(),
                model: "gpt-4o-mini".to_string(),
            },
            StreamEvent::TextDelta { text: "ok".to_string() },
            StreamEvent::ToolCallStart {
                index: 0,
                id: "call_1".to_string(),
                name: "shell".to_string(),
            },
            StreamEvent::ToolCallArgsDelta {
                index: 0,
                arguments: "{\"command\":".to_string(),
            },
            StreamEvent::ToolCallArgsDelta {
                index: 0,
                arguments: "\"ls\"}".to_string(),
            },
            StreamEvent::ToolCallStop { index: 0 },
            StreamEvent::MessageDelta {
                stop_reason: StopReason::ToolUse,
                usage: Some(Usage {
                    prompt_tokens: 15,
                    completion_tokens: 8,
                }),
            },
            StreamEvent::MessageStop,
        ]
    }

    #[test]
    fn tool_call_stream_suspends_with_required_action() {
        let frames = run_sink(
            scripted_tool_stream(),
            ResponsesSink::new("resp_test".to_string(), "gpt-4o-mini".to_string(), None),
        );

        let names: Vec<_> = frames.iter().filter_map(Frame::name).collect();
        assert_eq!(
            names,
            vec![
                "response.created",
                "response.output_text.delta",
                "response.output_item.added",
                "response.function_call_arguments.delta",
                "response.function_call_arguments.delta",
                "response.function_call_arguments.done",
                "response.output_item.done",
                "response.required_action",
                "response.completed",
            ]
        );

        // One bare data frame: the sentinel.
        assert_eq!(frames.last().unwrap().payload(), "[DONE]");

        let done = json(&frames[5]);
        assert_eq!(done["arguments"], r#"{"command":"ls"}"#);

        let required = json(&frames[7]);
        assert_eq!(
            required["required_action"]["submit_tool_outputs"]["tool_calls"][0]["name"],
            "shell"
        );

        let completed = json(&frames[8]);
        assert_eq!(completed["response"]["status"], "incomplete");
        assert_eq!(completed["response"]["id"], "resp_test");

        // The function_call output item is flat.
        let item = completed["response"]["output"]
            .as_array()
            .unwrap()
            .iter()
            .find(|item| item["type"] == "function_call")
            .unwrap();
        assert_eq!(item["call_id"], "call_1");
        assert_eq!(item["name"], "shell");
        assert_eq!(item["arguments"], r#"{"command":"ls"}"#);
        assert_eq!(item["status"], "completed");
    }

    #[test]
    fn tool_call_stream_registers_continuation() {
        let store = Arc::new(ContinuationStore::new(std::time::Duration::from_secs(600)));

        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            system: None,
            messages: vec![crate::messages::unified::Message::text(
                crate::messages::unified::Role::User,
                "run ls",
            )],
            tools: Vec::new(),
            tool_choice: None,
            max_output_tokens: None,
            temperature: None,
            stop_sequences: Vec::new(),
            stream: true,
        };

        let handle = ContinuationHandle {
            store: store.clone(),
            request,
            family: Family::Openai,
        };

        run_sink(
            scripted_tool_stream(),
            ResponsesSink::new("resp_reg".to_string(), "gpt-4o-mini".to_string(), Some(handle)),
        );

        let (follow_up, family) = store
            .begin_resume(
                "resp_reg",
                &[responses::ToolOutput {
                    tool_call_id: "call_1".to_string(),
                    output: "src".to_string(),
                }],
            )
            .unwrap();

        assert_eq!(family, Family::Openai);
        assert_eq!(follow_up.messages.len(), 3);
    }

    #[test]
    fn text_only_stream_completes() {
        let frames = run_sink(
            vec![
                StreamEvent::MessageStart {
                    id: "chatcmpl-1".to_string(),
                    model: "gpt-4o-mini".to_string(),
                },
                StreamEvent::TextDelta { text: "Hello".to_string() },
                StreamEvent::MessageDelta {
                    stop_reason: StopReason::EndTurn,
                    usage: Some(Usage {
                        prompt_tokens: 3,
                        completion_tokens: 1,
                    }),
                },
                StreamEvent::MessageStop,
            ],
            ResponsesSink::new("resp_text".to_string(), "gpt-4o-mini".to_string(), None),
        );

        let names: Vec<_> = frames.iter().filter_map(Frame::name).collect();
        assert_eq!(names, vec!["response.created", "response.output_text.delta", "response.completed"]);

        let completed = json(&frames[2]);
        assert_eq!(completed["response"]["status"], "completed");
        assert_eq!(completed["response"]["output"][0]["type"], "message");
        assert_eq!(
            completed["response"]["output"][0]["content"][0]["text"],
            "Hello"
        );
        assert_eq!(completed["response"]["usage"]["total_tokens"], 4);
        assert!(completed["response"].get("required_action").is_none());

        assert_eq!(frames.last().unwrap().payload(), "[DONE]");
    }

    #[test]
    fn truncated_stream_still_terminates_cleanly() {
        let frames = run_sink(
            vec![StreamEvent::TextDelta {
                text: "par".to_string(),
            }],
            ResponsesSink::new("resp_trunc".to_string(), "gpt-4o-mini".to_string(), None),
        );

        let names: Vec<_> = frames.iter().filter_map(Frame::name).collect();
        assert_eq!(names, vec!["response.created", "response.output_text.delta", "response.completed"]);
        assert_eq!(frames.last().unwrap().payload(), "[DONE]");
    }
}
