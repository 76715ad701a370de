//! Neutral events to OpenAI chat completion chunks.

use std::collections::VecDeque;

use crate::{
    messages::{openai, unified::StreamEvent},
    streaming::{EventSink, Frame},
};

/// Serializes neutral events as `data:`-framed chat completion chunks,
/// terminated by `data: [DONE]`.
pub(crate) struct OpenAiSink {
    queue: VecDeque<Frame>,
    id: String,
    model: String,
    created: u64,
    ended: bool,
}

impl Default for OpenAiSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiSink {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            id: String::new(),
            model: String::new(),
            created: crate::messages::unified::to_openai::unix_timestamp(),
            ended: false,
        }
    }

    fn chunk(&self, delta: openai::ChatMessageDelta, finish_reason: Option<openai::FinishReason>) -> Frame {
        self.chunk_with_usage(delta, finish_reason, None)
    }

    fn chunk_with_usage(
        &self,
        delta: openai::ChatMessageDelta,
        finish_reason: Option<openai::FinishReason>,
        usage: Option<openai::Usage>,
    ) -> Frame {
        Frame::data(&openai::ChatCompletionChunk {
            id: self.id.clone(),
            object: openai::ObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![openai::ChatChoiceDelta {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        })
    }
}

impl EventSink for OpenAiSink {
    fn process(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::MessageStart { id, model } => {
                self.id = id;
                self.model = model;

                let frame = self.chunk(
                    openai::ChatMessageDelta {
                        role: Some(openai::ChatRole::Assistant),
                        ..Default::default()
                    },
                    None,
                );
                self.queue.push_back(frame);
            }

            StreamEvent::TextDelta { text } => {
                let frame = self.chunk(
                    openai::ChatMessageDelta {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                );
                self.queue.push_back(frame);
            }

            StreamEvent::ToolCallStart { index, id, name } => {
                let frame = self.chunk(
                    openai::ChatMessageDelta {
                        tool_calls: Some(vec![openai::StreamingToolCall::Start {
                            index,
                            id,
                            r#type: openai::ToolCallType::Function,
                            function: openai::FunctionStart {
                                name,
                                arguments: String::new(),
                            },
                        }]),
                        ..Default::default()
                    },
                    None,
                );
                self.queue.push_back(frame);
            }

            StreamEvent::ToolCallArgsDelta { index, arguments } => {
                let frame = self.chunk(
                    openai::ChatMessageDelta {
                        tool_calls: Some(vec![openai::StreamingToolCall::Delta {
                            index,
                            function: openai::FunctionDelta { arguments },
                        }]),
                        ..Default::default()
                    },
                    None,
                );
                self.queue.push_back(frame);
            }

            // OpenAI has no per-call stop frame; the finish_reason carries it.
            StreamEvent::ToolCallStop { .. } => {}
            StreamEvent::RequiredAction { .. } => {}

            StreamEvent::MessageDelta { stop_reason, usage } => {
                let frame = self.chunk_with_usage(
                    openai::ChatMessageDelta::default(),
                    Some(openai::FinishReason::from(stop_reason)),
                    usage.map(|usage| openai::Usage {
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                        total_tokens: usage.total(),
                    }),
                );
                self.queue.push_back(frame);
            }

            StreamEvent::MessageStop => {
                self.ended = true;
                self.queue.push_back(Frame::done());
            }
        }
    }

    fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        // Truncated upstream: close out with a stop chunk and the sentinel.
        let frame = self.chunk(openai::ChatMessageDelta::default(), Some(openai::FinishReason::Stop));
        self.queue.push_back(frame);
        self.queue.push_back(Frame::done());
    }

    fn pop(&mut self) -> Option<Frame> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::unified::{StopReason, Usage},
        streaming::test_support::{json, run_sink},
    };

    #[test]
    fn text_stream_renders_chunks_and_done() {
        let frames = run_sink(
            vec![
                StreamEvent::MessageStart {
                    id: "msg_1".to_string(),
                    model: "claude-3-5-haiku-latest".to_string(),
                },
                StreamEvent::TextDelta { text: "Hel".to_string() },
                StreamEvent::TextDelta { text: "lo".to_string() },
                StreamEvent::MessageDelta {
                    stop_reason: StopReason::EndTurn,
                    usage: Some(Usage {
                        prompt_tokens: 5,
                        completion_tokens: 2,
                    }),
                },
                StreamEvent::MessageStop,
            ],
            OpenAiSink::new(),
        );

        assert_eq!(frames.len(), 5);
        assert_eq!(json(&frames[0])["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(json(&frames[1])["choices"][0]["delta"]["content"], "Hel");
        assert_eq!(json(&frames[3])["choices"][0]["finish_reason"], "stop");
        assert_eq!(json(&frames[3])["usage"]["total_tokens"], 7);
        assert_eq!(frames[4].payload(), "[DONE]");
    }

    #[test]
    fn tool_call_events_render_id_and_name_once() {
        let frames = run_sink(
            vec![
                StreamEvent::MessageStart {
                    id: "msg_1".to_string(),
                    model: "claude-3-5-haiku-latest".to_string(),
                },
                StreamEvent::ToolCallStart {
                    index: 0,
                    id: "toolu_1".to_string(),
                    name: "shell".to_string(),
                },
                StreamEvent::ToolCallArgsDelta {
                    index: 0,
                    arguments: r#"{"command":"ls"}"#.to_string(),
                },
                StreamEvent::ToolCallStop { index: 0 },
                StreamEvent::MessageDelta {
                    stop_reason: StopReason::ToolUse,
                    usage: None,
                },
                StreamEvent::MessageStop,
            ],
            OpenAiSink::new(),
        );

        let start = json(&frames[1]);
        assert_eq!(start["choices"][0]["delta"]["tool_calls"][0]["id"], "toolu_1");
        assert_eq!(
            start["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
            "shell"
        );

        let delta = json(&frames[2]);
        assert!(delta["choices"][0]["delta"]["tool_calls"][0].get("id").is_none());
        assert_eq!(
            delta["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            r#"{"command":"ls"}"#
        );

        let finish = json(&frames[3]);
        assert_eq!(finish["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(frames.last().unwrap().payload(), "[DONE]");
    }

    #[test]
    fn truncated_neutral_stream_still_terminates() {
        let frames = run_sink(
            vec![
                StreamEvent::MessageStart {
                    id: "msg_1".to_string(),
                    model: "m".to_string(),
                },
                StreamEvent::TextDelta { text: "par".to_string() },
            ],
            OpenAiSink::new(),
        );

        let finish = json(&frames[frames.len() - 2]);
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(frames.last().unwrap().payload(), "[DONE]");
    }
}
