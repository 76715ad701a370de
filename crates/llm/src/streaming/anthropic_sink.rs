//! Neutral events to Anthropic named SSE events.
//!
//! This is the OpenAI-to-Anthropic direction of the re-framer. Text streams
//! through content block 0 as it arrives; tool calls are accumulated per
//! source index and emitted as complete `tool_use` blocks at stream end,
//! after which `message_delta` carries the aggregate stop reason and (when
//! the upstream never reported usage) a conservative token estimate.

use std::collections::{BTreeMap, VecDeque};

use crate::{
    messages::{
        anthropic,
        unified::{self, StopReason, StreamEvent, parse_tool_arguments},
    },
    streaming::{EventSink, Frame},
};

struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

pub(crate) struct AnthropicSink {
    queue: VecDeque<Frame>,
    started: bool,
    model: String,
    text_block_open: bool,
    text_block_closed: bool,
    total_text_len: usize,
    tool_calls: BTreeMap<usize, ToolCallAccumulator>,
    stop_reason: Option<StopReason>,
    usage: Option<unified::Usage>,
    ended: bool,
}

impl Default for AnthropicSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicSink {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            started: false,
            model: String::new(),
            text_block_open: false,
            text_block_closed: false,
            total_text_len: 0,
            tool_calls: BTreeMap::new(),
            stop_reason: None,
            usage: None,
            ended: false,
        }
    }

    fn push(&mut self, event: anthropic::StreamEvent) {
        let frame = Frame::named(event.event_name(), &event);
        self.queue.push_back(frame);
    }

    fn ensure_started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let envelope = anthropic::StreamMessageStart {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            message_type: "message".to_string(),
            role: anthropic::Role::Assistant,
            content: Vec::new(),
            model: self.model.clone(),
            usage: anthropic::Usage {
                input_tokens: 0,
                output_tokens: 0,
            },
        };

        self.push(anthropic::StreamEvent::MessageStart { message: envelope });
    }

    fn close_text_block(&mut self) {
        // Only close what was opened.
        if self.text_block_open && !self.text_block_closed {
            self.text_block_closed = true;
            self.push(anthropic::StreamEvent::ContentBlockStop { index: 0 });
        }
    }

    fn finalize(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        self.ensure_started();
        self.close_text_block();

        // Tool blocks follow the text block, in source index order. The
        // accumulated argument fragments are parsed here; unparseable
        // arguments are wrapped, not dropped.
        let mut next_index = if self.text_block_open { 1 } else { 0 };
        let tool_calls = std::mem::take(&mut self.tool_calls);
        let has_tool_calls = !tool_calls.is_empty();

        for (_, call) in tool_calls {
            let index = next_index;
            next_index += 1;

            self.push(anthropic::StreamEvent::ContentBlockStart {
                index,
                content_block: anthropic::ContentBlock::ToolUse {
                    id: call.id,
                    name: call.name,
                    input: parse_tool_arguments(&call.arguments),
                },
            });
            self.push(anthropic::StreamEvent::ContentBlockStop { index });
        }

        let stop_reason = match self.stop_reason {
            Some(reason) => reason,
            None if has_tool_calls => StopReason::ToolUse,
            None => StopReason::EndTurn,
        };

        let usage = match self.usage {
            Some(usage) => anthropic::Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
            // Upstream never reported usage: estimate output from the text
            // volume so billing-adjacent consumers see a nonzero signal.
            None => anthropic::Usage {
                input_tokens: 0,
                output_tokens: ((self.total_text_len / 4) as u32).max(1),
            },
        };

        self.push(anthropic::StreamEvent::MessageDelta {
            delta: anthropic::MessageDeltaData {
                stop_reason: Some(anthropic::StopReason::from(stop_reason)),
                stop_sequence: None,
            },
            usage,
        });
        self.push(anthropic::StreamEvent::MessageStop);
    }
}

impl EventSink for AnthropicSink {
    fn process(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::MessageStart { id, model } => {
                self.model = model;
                self.started = true;

                let envelope = anthropic::StreamMessageStart {
                    id: if id.is_empty() {
                        format!("msg_{}", uuid::Uuid::new_v4())
                    } else {
                        id
                    },
                    message_type: "message".to_string(),
                    role: anthropic::Role::Assistant,
                    content: Vec::new(),
                    model: self.model.clone(),
                    usage: anthropic::Usage {
                        input_tokens: 0,
                        output_tokens: 0,
                    },
                };

                self.push(anthropic::StreamEvent::MessageStart { message: envelope });
            }

            StreamEvent::TextDelta { text } => {
                if text.is_empty() {
                    return;
                }

                self.ensure_started();

                if !self.text_block_open {
                    self.text_block_open = true;
                    self.push(anthropic::StreamEvent::ContentBlockStart {
                        index: 0,
                        content_block: anthropic::ContentBlock::Text { text: String::new() },
                    });
                }

                self.total_text_len += text.len();
                self.push(anthropic::StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: anthropic::ContentDelta::TextDelta { text },
                });
            }

            StreamEvent::ToolCallStart { index, id, name } => {
                self.tool_calls.insert(
                    index,
                    ToolCallAccumulator {
                        id,
                        name,
                        arguments: String::new(),
                    },
                );
            }

            StreamEvent::ToolCallArgsDelta { index, arguments } => {
                self.tool_calls
                    .entry(index)
                    .or_insert_with(|| ToolCallAccumulator {
                        id: format!("toolu_{}", uuid::Uuid::new_v4()),
                        name: String::new(),
                        arguments: String::new(),
                    })
                    .arguments
                    .push_str(&arguments);
            }

            StreamEvent::ToolCallStop { .. } => {}
            StreamEvent::RequiredAction { .. } => {}

            StreamEvent::MessageDelta { stop_reason, usage } => {
                self.stop_reason = Some(stop_reason);
                if usage.is_some() {
                    self.usage = usage;
                }
            }

            StreamEvent::MessageStop => {
                self.finalize();
            }
        }
    }

    fn finish(&mut self) {
        self.finalize();
    }

    fn pop(&mut self) -> Option<Frame> {
        self.queue.pop_front()
    }
}
