//! Upstream providers: the callers that forward canonical requests to the
//! configured vendor endpoints and normalize their replies.

pub(crate) mod anthropic;
pub(crate) mod loopback;
pub(crate) mod openai;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{
    error::{LlmError, preview_body},
    messages::unified::{ChatRequest, ChatResponse, StreamEvent},
};

/// A stream of neutral events, one per upstream SSE frame (or synthesized at
/// stream end to keep the client well-formed).
pub(crate) type EventStream = Pin<Box<dyn Stream<Item = crate::Result<StreamEvent>> + Send>>;

/// A provider forwards canonical requests to one upstream family.
#[async_trait]
pub(crate) trait Provider: Send + Sync {
    /// Issue a unary completion call.
    async fn complete(&self, request: ChatRequest) -> crate::Result<ChatResponse>;

    /// Issue a streaming completion call.
    async fn stream(&self, request: ChatRequest) -> crate::Result<EventStream>;

    fn name(&self) -> &str;
}

/// Map an upstream non-success reply into the stable error kind, previewing
/// at most 8 KiB of the body.
pub(crate) async fn upstream_error(response: reqwest::Response) -> LlmError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();

    LlmError::UpstreamError {
        status,
        preview: preview_body(&body),
    }
}

/// Map a transport-level send failure.
pub(crate) fn transport_error(provider: &str, error: reqwest::Error) -> LlmError {
    log::warn!("upstream {provider} unreachable: {error}");
    LlmError::UpstreamUnavailable(format!("failed to reach {provider} upstream"))
}
