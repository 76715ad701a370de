//! The reserved `loopback` model: echoes the last user message without
//! calling any upstream. Useful for smoke tests and wiring checks.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::{
    messages::{
        openai,
        unified::{ChatRequest, ChatResponse, Part, StopReason, StreamEvent, Usage, estimate_tokens},
    },
    provider::{EventStream, Provider},
};

const LOOPBACK_PREFIX: &str = "[loopback] ";

/// Default embedding width when the client does not request one.
const DEFAULT_EMBEDDING_DIMENSIONS: usize = 256;

pub(crate) struct LoopbackProvider;

impl LoopbackProvider {
    fn respond(request: &ChatRequest) -> ChatResponse {
        let echoed = request.last_user_text().unwrap_or_default();
        let text = format!("{LOOPBACK_PREFIX}{echoed}");

        let prompt_text: String = request
            .messages
            .iter()
            .map(|message| message.joined_text())
            .collect::<Vec<_>>()
            .join("\n");

        let usage = Usage {
            prompt_tokens: estimate_tokens(&prompt_text),
            completion_tokens: estimate_tokens(&text),
        };

        ChatResponse {
            id: format!("loopback-{}", uuid::Uuid::new_v4()),
            model: request.model.clone(),
            parts: vec![Part::Text { text }],
            stop_reason: StopReason::EndTurn,
            usage,
        }
    }

    /// Deterministic pseudo-embeddings: the same input always produces the
    /// same vector, with the declared dimension respected.
    pub fn embeddings(request: &openai::EmbeddingsRequest, dimensions: usize) -> openai::EmbeddingsResponse {
        let texts = request.input.texts();
        let mut prompt_tokens = 0;

        let data = texts
            .iter()
            .enumerate()
            .map(|(index, text)| {
                prompt_tokens += estimate_tokens(text);

                openai::Embedding {
                    object: openai::ObjectType::Embedding,
                    index,
                    embedding: pseudo_vector(text, dimensions),
                }
            })
            .collect();

        openai::EmbeddingsResponse {
            object: openai::ObjectType::List,
            data,
            model: request.model.clone(),
            usage: openai::EmbeddingsUsage {
                prompt_tokens,
                total_tokens: prompt_tokens,
            },
        }
    }
}

/// Derive a unit-range vector from the input hash. A small xorshift over the
/// digest gives stable values without pulling in an RNG.
fn pseudo_vector(text: &str, dimensions: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut state = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));

    (0..dimensions)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;

            ((state % 2000) as f32 / 1000.0) - 1.0
        })
        .collect()
}

pub(crate) fn default_dimensions() -> usize {
    DEFAULT_EMBEDDING_DIMENSIONS
}

#[async_trait]
impl Provider for LoopbackProvider {
    async fn complete(&self, request: ChatRequest) -> crate::Result<ChatResponse> {
        Ok(Self::respond(&request))
    }

    async fn stream(&self, request: ChatRequest) -> crate::Result<EventStream> {
        let response = Self::respond(&request);

        let events = vec![
            StreamEvent::MessageStart {
                id: response.id.clone(),
                model: response.model.clone(),
            },
            StreamEvent::TextDelta {
                text: response.joined_text(),
            },
            StreamEvent::MessageDelta {
                stop_reason: StopReason::EndTurn,
                usage: Some(response.usage),
            },
            StreamEvent::MessageStop,
        ];

        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{Message, Role};

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            model: "loopback".to_string(),
            system: None,
            messages: vec![Message::text(Role::User, text)],
            tools: Vec::new(),
            tool_choice: None,
            max_output_tokens: None,
            temperature: None,
            stop_sequences: Vec::new(),
            stream: false,
        }
    }

    #[tokio::test]
    async fn echoes_last_user_message() {
        let response = LoopbackProvider.complete(request("Hello")).await.unwrap();

        assert_eq!(response.joined_text(), "[loopback] Hello");
        assert!(response.usage.total() > 0);
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn stream_is_well_formed() {
        use futures::StreamExt;

        let mut stream = LoopbackProvider.stream(request("Hi")).await.unwrap();
        let mut events = Vec::new();

        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }

        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(&events[1], StreamEvent::TextDelta { text } if text == "[loopback] Hi"));
        assert!(matches!(events[events.len() - 1], StreamEvent::MessageStop));
    }

    #[test]
    fn embeddings_are_deterministic_with_declared_dimension() {
        let request = openai::EmbeddingsRequest {
            model: "loopback".to_string(),
            input: openai::EmbeddingsInput::Batch(vec!["a".to_string(), "b".to_string()]),
            dimensions: Some(16),
            encoding_format: None,
            user: None,
        };

        let first = LoopbackProvider::embeddings(&request, 16);
        let second = LoopbackProvider::embeddings(&request, 16);

        assert_eq!(first.data.len(), 2);
        assert_eq!(first.data[0].embedding.len(), 16);
        assert_eq!(first.data[0].embedding, second.data[0].embedding);
        assert_ne!(first.data[0].embedding, first.data[1].embedding);
    }
}
