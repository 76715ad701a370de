//! Anthropic-family upstream caller and stream processor.

use std::collections::{BTreeSet, VecDeque};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, header::CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::LlmError,
    http_client::default_http_client_builder,
    messages::{
        anthropic,
        unified::{ChatRequest, ChatResponse, StopReason, StreamEvent, Usage},
    },
    provider::{EventStream, Provider, transport_error, upstream_error},
};

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

pub(crate) struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl AnthropicProvider {
    pub fn new(config: &config::UpstreamConfig) -> crate::Result<Self> {
        let mut headers = http::HeaderMap::new();

        let version = config
            .anthropic_version
            .as_deref()
            .unwrap_or(DEFAULT_ANTHROPIC_VERSION);

        headers.insert(
            "anthropic-version",
            version.parse().map_err(|_| {
                LlmError::Internal(Some(format!("invalid anthropic_version '{version}'")))
            })?,
        );

        for (name, value) in &config.extra_headers {
            let name: http::HeaderName = name.parse().map_err(|_| {
                LlmError::Internal(Some(format!("invalid upstream header name '{name}'")))
            })?;
            let value: http::HeaderValue = value.parse().map_err(|_| {
                LlmError::Internal(Some(format!("invalid upstream header value for '{name}'")))
            })?;

            headers.insert(name, value);
        }

        let client = default_http_client_builder().default_headers(headers).build().map_err(|e| {
            log::error!("failed to build Anthropic upstream client: {e}");
            LlmError::Internal(None)
        })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn send(&self, body: Vec<u8>) -> crate::Result<reqwest::Response> {
        let mut builder = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header(CONTENT_TYPE, "application/json");

        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key.expose_secret());
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("anthropic", e))?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        Ok(response)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn complete(&self, mut request: ChatRequest) -> crate::Result<ChatResponse> {
        request.stream = false;

        let wire = anthropic::MessagesRequest::from(request);
        let body = sonic_rs::to_vec(&wire).map_err(|e| {
            log::error!("failed to serialize Anthropic request: {e}");
            LlmError::Internal(None)
        })?;

        let response = self.send(body).await?;

        let text = response.text().await.map_err(|e| transport_error("anthropic", e))?;

        let wire: anthropic::MessagesResponse = sonic_rs::from_str(&text).map_err(|e| {
            log::error!("failed to parse Anthropic response: {e}");
            LlmError::Internal(None)
        })?;

        Ok(ChatResponse::from(wire))
    }

    async fn stream(&self, mut request: ChatRequest) -> crate::Result<EventStream> {
        request.stream = true;

        let wire = anthropic::MessagesRequest::from(request);
        let body = sonic_rs::to_vec(&wire).map_err(|e| {
            log::error!("failed to serialize Anthropic streaming request: {e}");
            LlmError::Internal(None)
        })?;

        let response = self.send(body).await?;

        let events = response.bytes_stream().eventsource();

        let stream = futures::stream::unfold(
            (Box::pin(events), AnthropicStreamProcessor::new(), false),
            |(mut events, mut processor, mut upstream_done)| async move {
                loop {
                    if let Some(event) = processor.pop() {
                        return Some((Ok(event), (events, processor, upstream_done)));
                    }

                    if upstream_done {
                        return None;
                    }

                    match events.next().await {
                        Some(Ok(event)) => match sonic_rs::from_str::<anthropic::StreamEvent>(&event.data) {
                            Ok(parsed) => {
                                if processor.process(parsed) {
                                    upstream_done = true;
                                }
                            }
                            Err(e) => log::warn!("skipping unparseable Anthropic stream event: {e}"),
                        },
                        Some(Err(e)) => {
                            log::warn!("SSE parse error in Anthropic stream: {e}");
                        }
                        // Truncated upstream: synthesize a clean terminal.
                        None => {
                            processor.finish();
                            upstream_done = true;
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Incremental state for re-framing an Anthropic event stream into neutral
/// events. Block indexes are preserved so downstream sinks keep the
/// all-of-block-N-before-block-M ordering.
pub(crate) struct AnthropicStreamProcessor {
    pending: VecDeque<StreamEvent>,
    started: bool,
    open_tool_calls: BTreeSet<usize>,
    prompt_tokens: u32,
    delta_emitted: bool,
    finished: bool,
}

impl Default for AnthropicStreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicStreamProcessor {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            started: false,
            open_tool_calls: BTreeSet::new(),
            prompt_tokens: 0,
            delta_emitted: false,
            finished: false,
        }
    }

    pub fn pop(&mut self) -> Option<StreamEvent> {
        self.pending.pop_front()
    }

    /// Feed one upstream event. Returns true when the stream is complete.
    pub fn process(&mut self, event: anthropic::StreamEvent) -> bool {
        match event {
            anthropic::StreamEvent::MessageStart { message } => {
                self.started = true;
                self.prompt_tokens = message.usage.input_tokens;
                self.pending.push_back(StreamEvent::MessageStart {
                    id: message.id,
                    model: message.model,
                });
            }

            anthropic::StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                anthropic::ContentBlock::ToolUse { id, name, .. } => {
                    self.open_tool_calls.insert(index);
                    self.pending.push_back(StreamEvent::ToolCallStart { index, id, name });
                }
                anthropic::ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        self.pending.push_back(StreamEvent::TextDelta { text });
                    }
                }
                _ => {}
            },

            anthropic::StreamEvent::ContentBlockDelta { index, delta } => match delta {
                anthropic::ContentDelta::TextDelta { text } => {
                    self.pending.push_back(StreamEvent::TextDelta { text });
                }
                anthropic::ContentDelta::InputJsonDelta { partial_json } => {
                    self.pending.push_back(StreamEvent::ToolCallArgsDelta {
                        index,
                        arguments: partial_json,
                    });
                }
            },

            anthropic::StreamEvent::ContentBlockStop { index } => {
                if self.open_tool_calls.remove(&index) {
                    self.pending.push_back(StreamEvent::ToolCallStop { index });
                }
            }

            anthropic::StreamEvent::MessageDelta { delta, usage } => {
                self.delta_emitted = true;
                self.pending.push_back(StreamEvent::MessageDelta {
                    stop_reason: delta
                        .stop_reason
                        .map(StopReason::from)
                        .unwrap_or(StopReason::EndTurn),
                    usage: Some(Usage {
                        prompt_tokens: if usage.input_tokens > 0 {
                            usage.input_tokens
                        } else {
                            self.prompt_tokens
                        },
                        completion_tokens: usage.output_tokens,
                    }),
                });
            }

            anthropic::StreamEvent::MessageStop => {
                self.finish();
                return true;
            }

            anthropic::StreamEvent::Ping => {}

            anthropic::StreamEvent::Error { error } => {
                log::error!("Anthropic stream error event: {} - {}", error.error_type, error.message);
                self.finish();
                return true;
            }
        }

        false
    }

    /// Close the stream, synthesizing whatever terminal events are missing.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if !self.started {
            self.pending.push_back(StreamEvent::MessageStart {
                id: format!("msg_{}", uuid::Uuid::new_v4()),
                model: String::new(),
            });
        }

        let open = std::mem::take(&mut self.open_tool_calls);
        for index in open {
            self.pending.push_back(StreamEvent::ToolCallStop { index });
        }

        if !self.delta_emitted {
            self.delta_emitted = true;
            self.pending.push_back(StreamEvent::MessageDelta {
                stop_reason: StopReason::EndTurn,
                usage: None,
            });
        }

        self.pending.push_back(StreamEvent::MessageStop);
    }
}
