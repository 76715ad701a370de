//! OpenAI-family upstream caller and stream processor.

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
        openai,
        unified::{ChatRequest, ChatResponse, StopReason, StreamEvent, Usage},
    },
    provider::{EventStream, Provider, transport_error, upstream_error},
};

pub(crate) struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl OpenAiProvider {
    pub fn new(config: &config::UpstreamConfig) -> crate::Result<Self> {
        let mut headers = http::HeaderMap::new();

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
            log::error!("failed to build OpenAI upstream client: {e}");
            LlmError::Internal(None)
        })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn request_builder(&self, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).header(CONTENT_TYPE, "application/json");

        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        builder
    }

    async fn send(&self, path: &str, body: Vec<u8>) -> crate::Result<reqwest::Response> {
        let response = self
            .request_builder(format!("{}{path}", self.base_url))
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("openai", e))?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        Ok(response)
    }

    /// Forward an embeddings request. The body is already in wire form; only
    /// the model rewrite done by the caller distinguishes it from the
    /// client's original.
    pub async fn embeddings(&self, request: openai::EmbeddingsRequest) -> crate::Result<openai::EmbeddingsResponse> {
        let body = sonic_rs::to_vec(&request).map_err(|e| {
            log::error!("failed to serialize embeddings request: {e}");
            LlmError::Internal(None)
        })?;

        let response = self.send("/embeddings", body).await?;

        let text = response.text().await.map_err(|e| transport_error("openai", e))?;

        sonic_rs::from_str(&text).map_err(|e| {
            log::error!("failed to parse embeddings response: {e}");
            LlmError::Internal(None)
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(&self, mut request: ChatRequest) -> crate::Result<ChatResponse> {
        request.stream = false;

        let wire = openai::ChatCompletionRequest::try_from(request)?;
        let body = sonic_rs::to_vec(&wire).map_err(|e| {
            log::error!("failed to serialize chat completion request: {e}");
            LlmError::Internal(None)
        })?;

        let response = self.send("/chat/completions", body).await?;

        let text = response.text().await.map_err(|e| transport_error("openai", e))?;

        let wire: openai::ChatCompletionResponse = sonic_rs::from_str(&text).map_err(|e| {
            log::error!("failed to parse chat completion response: {e}");
            LlmError::Internal(None)
        })?;

        Ok(ChatResponse::from(wire))
    }

    async fn stream(&self, mut request: ChatRequest) -> crate::Result<EventStream> {
        request.stream = true;

        let wire = openai::ChatCompletionRequest::try_from(request)?;
        let body = sonic_rs::to_vec(&wire).map_err(|e| {
            log::error!("failed to serialize streaming chat request: {e}");
            LlmError::Internal(None)
        })?;

        let response = self.send("/chat/completions", body).await?;

        let events = response.bytes_stream().eventsource();

        let stream = futures::stream::unfold(
            (Box::pin(events), OpenAiStreamProcessor::new(), false),
            |(mut events, mut processor, mut upstream_done)| async move {
                loop {
                    if let Some(event) = processor.pop() {
                        return Some((Ok(event), (events, processor, upstream_done)));
                    }

                    if upstream_done {
                        return None;
                    }

                    match events.next().await {
                        Some(Ok(event)) => {
                            if event.data.trim() == "[DONE]" {
                                processor.finish();
                                upstream_done = true;
                                continue;
                            }

                            match sonic_rs::from_str::<openai::ChatCompletionChunk>(&event.data) {
                                Ok(chunk) => processor.process(chunk),
                                Err(e) => log::warn!("skipping unparseable OpenAI stream chunk: {e}"),
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("SSE parse error in OpenAI stream: {e}");
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
        "openai"
    }
}

/// Incremental state for re-framing an OpenAI chunk stream into neutral
/// events. Terminal events are synthesized at stream end, so truncated
/// upstream streams still leave the client well-formed.
pub(crate) struct OpenAiStreamProcessor {
    pending: VecDeque<StreamEvent>,
    started: bool,
    open_tool_calls: BTreeSet<usize>,
    finish_reason: Option<StopReason>,
    usage: Option<Usage>,
    finished: bool,
}

impl Default for OpenAiStreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiStreamProcessor {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            started: false,
            open_tool_calls: BTreeSet::new(),
            finish_reason: None,
            usage: None,
            finished: false,
        }
    }

    pub fn pop(&mut self) -> Option<StreamEvent> {
        self.pending.pop_front()
    }

    pub fn process(&mut self, chunk: openai::ChatCompletionChunk) {
        if !self.started {
            self.started = true;
            self.pending.push_back(StreamEvent::MessageStart {
                id: chunk.id.clone(),
                model: chunk.model.clone(),
            });
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            });
        }

        for choice in chunk.choices {
            if choice.index != 0 {
                continue;
            }

            if let Some(content) = choice.delta.content
                && !content.is_empty()
            {
                self.pending.push_back(StreamEvent::TextDelta { text: content });
            }

            for tool_call in choice.delta.tool_calls.unwrap_or_default() {
                match tool_call {
                    openai::StreamingToolCall::Start { index, id, function, .. } => {
                        self.open_tool_calls.insert(index);
                        self.pending.push_back(StreamEvent::ToolCallStart {
                            index,
                            id,
                            name: function.name,
                        });

                        if !function.arguments.is_empty() {
                            self.pending.push_back(StreamEvent::ToolCallArgsDelta {
                                index,
                                arguments: function.arguments,
                            });
                        }
                    }
                    openai::StreamingToolCall::Delta { index, function } => {
                        if !self.open_tool_calls.contains(&index) {
                            // Defragmented upstreams sometimes skip the
                            // start frame; open the call with what we have.
                            self.open_tool_calls.insert(index);
                            self.pending.push_back(StreamEvent::ToolCallStart {
                                index,
                                id: format!("call_{}", uuid::Uuid::new_v4()),
                                name: String::new(),
                            });
                        }

                        self.pending.push_back(StreamEvent::ToolCallArgsDelta {
                            index,
                            arguments: function.arguments,
                        });
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(StopReason::from(reason));
            }
        }
    }

    /// Close the stream: stop open tool calls, then the terminal pair.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if !self.started {
            self.started = true;
            self.pending.push_back(StreamEvent::MessageStart {
                id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
                model: String::new(),
            });
        }

        let open = std::mem::take(&mut self.open_tool_calls);
        for index in open {
            self.pending.push_back(StreamEvent::ToolCallStop { index });
        }

        self.pending.push_back(StreamEvent::MessageDelta {
            stop_reason: self.finish_reason.unwrap_or(StopReason::EndTurn),
            usage: self.usage,
        });
        self.pending.push_back(StreamEvent::MessageStop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(value: serde_json::Value) -> openai::ChatCompletionChunk {
        serde_json::from_value(value).unwrap()
    }

    fn drain(processor: &mut OpenAiStreamProcessor) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = processor.pop() {
            events.push(event);
        }
        events
    }

    #[test]
    fn text_stream_produces_ordered_events() {
        let mut processor = OpenAiStreamProcessor::new();

        processor.process(chunk(json!({
            "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hel"}}]
        })));
        processor.process(chunk(json!({
            "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]
        })));
        processor.finish();

        let events = drain(&mut processor);

        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(&events[1], StreamEvent::TextDelta { text } if text == "Hel"));
        assert!(matches!(&events[2], StreamEvent::TextDelta { text } if text == "lo"));
        assert!(
            matches!(events[3], StreamEvent::MessageDelta { stop_reason, .. } if stop_reason == StopReason::EndTurn)
        );
        assert!(matches!(events[4], StreamEvent::MessageStop));
    }

    #[test]
    fn tool_call_fragments_accumulate_per_index() {
        let mut processor = OpenAiStreamProcessor::new();

        processor.process(chunk(json!({
            "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "id": "call_1", "type": "function",
                "function": {"name": "shell", "arguments": ""}
            }]}}]
        })));
        processor.process(chunk(json!({
            "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "function": {"arguments": "{\"command\":"}
            }]}}]
        })));
        processor.process(chunk(json!({
            "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "function": {"arguments": "\"ls\"}"}
            }]}, "finish_reason": "tool_calls"}]
        })));
        processor.finish();

        let events = drain(&mut processor);

        assert!(matches!(&events[1], StreamEvent::ToolCallStart { index: 0, id, name }
            if id == "call_1" && name == "shell"));
        assert!(matches!(&events[2], StreamEvent::ToolCallArgsDelta { arguments, .. }
            if arguments == "{\"command\":"));
        assert!(matches!(&events[3], StreamEvent::ToolCallArgsDelta { arguments, .. }
            if arguments == "\"ls\"}"));
        assert!(matches!(events[4], StreamEvent::ToolCallStop { index: 0 }));
        assert!(
            matches!(events[5], StreamEvent::MessageDelta { stop_reason, .. } if stop_reason == StopReason::ToolUse)
        );
        assert!(matches!(events[6], StreamEvent::MessageStop));
    }

    #[test]
    fn truncated_stream_synthesizes_clean_terminal() {
        let mut processor = OpenAiStreamProcessor::new();

        processor.process(chunk(json!({
            "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "delta": {"content": "partial"}}]
        })));
        // No finish_reason, no [DONE]: the connection dropped.
        processor.finish();

        let events = drain(&mut processor);
        let last_two = &events[events.len() - 2..];

        assert!(
            matches!(last_two[0], StreamEvent::MessageDelta { stop_reason, .. } if stop_reason == StopReason::EndTurn)
        );
        assert!(matches!(last_two[1], StreamEvent::MessageStop));
    }

    #[test]
    fn usage_from_final_chunk_is_carried() {
        let mut processor = OpenAiStreamProcessor::new();

        processor.process(chunk(json!({
            "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1,
            "model": "gpt-4o-mini",
            "choices": [],
            "usage": {"prompt_tokens": 9, "completion_tokens": 4, "total_tokens": 13}
        })));
        processor.finish();

        let events = drain(&mut processor);
        let delta = events
            .iter()
            .find_map(|event| match event {
                StreamEvent::MessageDelta { usage, .. } => *usage,
                _ => None,
            })
            .unwrap();

        assert_eq!(delta.prompt_tokens, 9);
        assert_eq!(delta.completion_tokens, 4);
    }
}
