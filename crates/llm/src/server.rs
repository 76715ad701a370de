//! Gateway server: routing, work-mode gating, clamping, dispatch and usage
//! recording, shared by every endpoint handler.

use std::sync::{Arc, Mutex};

use config::{Config, WorkMode};
use futures::StreamExt;
use ledger::{Direction, Ledger, SqliteStore, UsageEntry};
use tokio_util::sync::CancellationToken;

use crate::{
    continuation::{ContinuationStatus, ContinuationStore},
    error::LlmError,
    gate::{self, Dialect},
    messages::{
        openai, responses,
        unified::{ChatRequest, ChatResponse, StreamEvent},
    },
    metadata::ModelCatalog,
    model::{AliasResolver, Family, classify},
    provider::{
        EventStream, Provider, anthropic::AnthropicProvider, loopback::LoopbackProvider, openai::OpenAiProvider,
    },
    request::RequestContext,
};

/// Service identifier stamped on ledger entries.
const SERVICE_ID: &str = "prism-gateway";

/// Cap on embedding input batch size.
const MAX_EMBEDDING_INPUTS: usize = 2048;

/// The shared gateway state behind every endpoint.
#[derive(Clone)]
pub struct GatewayServer {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    work_mode: WorkMode,
    global_cap: Option<u32>,
    aliases: AliasResolver,
    catalog: Arc<ModelCatalog>,
    openai: Option<OpenAiProvider>,
    anthropic: Option<AnthropicProvider>,
    loopback: LoopbackProvider,
    continuations: Arc<ContinuationStore>,
    ledger: Mutex<Option<Ledger>>,
}

impl GatewayServer {
    /// Build the gateway from configuration and start its background tasks
    /// (metadata refresh, continuation reaper, ledger workers). The tasks
    /// stop when the cancellation token fires; call [`Self::shutdown`] after
    /// serving stops to drain the ledger.
    pub async fn build(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let catalog = Arc::new(ModelCatalog::new(config.metadata.clone()));
        tokio::spawn(catalog.clone().refresh_loop(shutdown.clone()));

        let continuations = Arc::new(ContinuationStore::new(config.llm.continuation_ttl));
        tokio::spawn(continuations.clone().reaper_loop(shutdown.clone()));

        let openai = config
            .llm
            .upstreams
            .openai
            .as_ref()
            .map(OpenAiProvider::new)
            .transpose()?;

        let anthropic = config
            .llm
            .upstreams
            .anthropic
            .as_ref()
            .map(AnthropicProvider::new)
            .transpose()?;

        let ledger = if config.ledger.enabled {
            let store = Arc::new(SqliteStore::open(&config.ledger.path)?);
            Some(Ledger::spawn(store, &config.ledger))
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(GatewayInner {
                work_mode: config.llm.work_mode,
                global_cap: config.llm.max_output_tokens,
                aliases: AliasResolver::new(&config.llm.aliases),
                catalog,
                openai,
                anthropic,
                loopback: LoopbackProvider,
                continuations,
                ledger: Mutex::new(ledger),
            }),
        })
    }

    /// Drain and close the usage ledger. Idempotent.
    pub async fn shutdown(&self) {
        let ledger = self
            .inner
            .ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(ledger) = ledger {
            ledger.close().await;
        }
    }

    /// The configured work mode, for the health endpoint.
    pub fn work_mode(&self) -> WorkMode {
        self.inner.work_mode
    }

    pub(crate) fn continuations(&self) -> Arc<ContinuationStore> {
        self.inner.continuations.clone()
    }

    /// Resolve aliases, classify, gate and clamp. On success the request's
    /// model is rewritten to its resolved form and the vendor family is
    /// returned for dispatch.
    pub(crate) fn prepare(&self, dialect: Dialect, request: &mut ChatRequest) -> crate::Result<Family> {
        request.model = self.inner.aliases.resolve(&request.model);

        let snapshot = self.inner.catalog.snapshot();
        let family = classify(&request.model, &snapshot);

        gate::check(self.inner.work_mode, dialect, family, &request.model)?;

        // Clamp to the smaller of model cap, global cap and the client's
        // request. Absent values are upstream's choice and never raised.
        if let Some(requested) = request.max_output_tokens {
            let mut value = requested;

            if let Some(cap) = snapshot.completion_cap(&request.model) {
                value = value.min(cap);
            }

            if let Some(cap) = self.inner.global_cap {
                value = value.min(cap);
            }

            if value != requested {
                log::debug!("clamped max_output_tokens from {requested} to {value} for {}", request.model);
            }

            request.max_output_tokens = Some(value);
        }

        Ok(family)
    }

    fn provider(&self, family: Family) -> crate::Result<&dyn Provider> {
        match family {
            Family::Openai => self
                .inner
                .openai
                .as_ref()
                .map(|provider| provider as &dyn Provider)
                .ok_or_else(|| LlmError::UpstreamUnavailable("no openai upstream configured".to_string())),
            Family::Anthropic => self
                .inner
                .anthropic
                .as_ref()
                .map(|provider| provider as &dyn Provider)
                .ok_or_else(|| LlmError::UpstreamUnavailable("no anthropic upstream configured".to_string())),
            Family::Loopback => Ok(&self.inner.loopback),
            Family::Unknown => Err(LlmError::UnknownModel("unclassified model".to_string())),
        }
    }

    /// Unary completion: prepare, dispatch, record usage.
    pub(crate) async fn complete(
        &self,
        dialect: Dialect,
        mut request: ChatRequest,
        context: &RequestContext,
    ) -> crate::Result<ChatResponse> {
        request.validate()?;
        let family = self.prepare(dialect, &mut request)?;

        self.complete_prepared(family, request, context).await
    }

    /// Unary completion for an already-prepared request.
    pub(crate) async fn complete_prepared(
        &self,
        family: Family,
        request: ChatRequest,
        context: &RequestContext,
    ) -> crate::Result<ChatResponse> {
        let response = self.provider(family)?.complete(request).await?;

        self.record_usage(context, &response.model, response.usage.prompt_tokens, response.usage.completion_tokens);

        Ok(response)
    }

    /// Streaming completion for an already-prepared request. Usage is
    /// recorded when the upstream reports it in the terminal delta.
    pub(crate) async fn stream_prepared(
        &self,
        family: Family,
        request: ChatRequest,
        context: &RequestContext,
    ) -> crate::Result<EventStream> {
        let model = request.model.clone();
        let stream = self.provider(family)?.stream(request).await?;

        let server = self.clone();
        let context = context.clone();

        let observed = stream.map(move |event| {
            if let Ok(StreamEvent::MessageDelta {
                usage: Some(usage), ..
            }) = &event
            {
                server.record_usage(&context, &model, usage.prompt_tokens, usage.completion_tokens);
            }

            event
        });

        Ok(Box::pin(observed))
    }

    /// Streaming completion: validate, prepare, dispatch.
    pub(crate) async fn stream(
        &self,
        dialect: Dialect,
        mut request: ChatRequest,
        context: &RequestContext,
    ) -> crate::Result<EventStream> {
        request.validate()?;
        let family = self.prepare(dialect, &mut request)?;

        self.stream_prepared(family, request, context).await
    }

    /// Forward or serve an embeddings request.
    pub(crate) async fn embeddings(
        &self,
        mut request: openai::EmbeddingsRequest,
        context: &RequestContext,
    ) -> crate::Result<openai::EmbeddingsResponse> {
        if request.input.is_empty() {
            return Err(LlmError::InvalidRequest("input must not be empty".to_string()));
        }

        if request.input.len() > MAX_EMBEDDING_INPUTS {
            return Err(LlmError::InvalidRequest(format!(
                "embedding inputs are capped at {MAX_EMBEDDING_INPUTS} entries"
            )));
        }

        if let Some(dimensions) = request.dimensions {
            request.dimensions = Some(dimensions.clamp(1, 4096));
        }

        request.model = self.inner.aliases.resolve(&request.model);

        let snapshot = self.inner.catalog.snapshot();
        let family = classify(&request.model, &snapshot);

        gate::check(self.inner.work_mode, Dialect::OpenaiEmbeddings, family, &request.model)?;

        let response = match family {
            Family::Openai => {
                let Some(provider) = self.inner.openai.as_ref() else {
                    return Err(LlmError::UpstreamUnavailable("no openai upstream configured".to_string()));
                };

                provider.embeddings(request).await?
            }
            Family::Loopback => {
                let dimensions = request
                    .dimensions
                    .map(|d| d as usize)
                    .unwrap_or_else(crate::provider::loopback::default_dimensions);

                LoopbackProvider::embeddings(&request, dimensions)
            }
            Family::Anthropic => {
                return Err(LlmError::InvalidRequest(
                    "embeddings are not supported for anthropic-family models".to_string(),
                ));
            }
            Family::Unknown => unreachable!("the gate rejects unknown families"),
        };

        self.record_usage(context, &response.model, response.usage.prompt_tokens, 0);

        Ok(response)
    }

    /// Accept tool outputs for a suspended response: resume the
    /// continuation, issue the follow-up upstream call and store the result
    /// for retrieval.
    pub(crate) async fn resume_continuation(
        &self,
        response_id: &str,
        outputs: &[responses::ToolOutput],
        context: &RequestContext,
    ) -> crate::Result<()> {
        let (request, family) = self.inner.continuations.begin_resume(response_id, outputs)?;

        let follow_up = request.clone();

        let response = match self.complete_prepared(family, request, context).await {
            Ok(response) => response,
            Err(error) => {
                // Leave the entry resumable so the client may retry.
                self.inner.continuations.abort_resume(response_id);
                return Err(error);
            }
        };

        self.inner.continuations.complete(response_id, follow_up, response);

        Ok(())
    }

    pub(crate) fn continuation_status(&self, response_id: &str) -> crate::Result<ContinuationStatus> {
        self.inner.continuations.status(response_id)
    }

    /// The model listing: metadata catalog entries plus the reserved
    /// loopback model.
    pub(crate) fn models(&self) -> openai::ModelsResponse {
        let snapshot = self.inner.catalog.snapshot();

        let mut data: Vec<openai::Model> = snapshot
            .entries()
            .map(|entry| openai::Model {
                id: entry.model.clone(),
                object: openai::ObjectType::Model,
                created: entry.updated_at,
                owned_by: entry.provider.clone(),
            })
            .collect();

        data.push(openai::Model {
            id: crate::model::LOOPBACK_MODEL.to_string(),
            object: openai::ObjectType::Model,
            created: 0,
            owned_by: "prism".to_string(),
        });

        data.sort_by(|a, b| a.id.cmp(&b.id));

        openai::ModelsResponse {
            object: openai::ObjectType::List,
            data,
        }
    }

    /// Enqueue a usage entry. Never blocks, never fails the request.
    fn record_usage(&self, context: &RequestContext, model: &str, prompt_tokens: u32, completion_tokens: u32) {
        let guard = self
            .inner
            .ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(ledger) = guard.as_ref() {
            let mut entry = UsageEntry::now(
                context.user_id.clone(),
                SERVICE_ID,
                prompt_tokens,
                completion_tokens,
                Direction::Consume,
            );
            entry.api_key_id = Some(context.api_key_id.clone());
            entry.memo = model.to_string();

            ledger.record(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{Message, Role};

    fn test_config(toml: &str) -> Config {
        toml::from_str(toml).expect("valid test config")
    }

    async fn test_server(toml: &str) -> GatewayServer {
        GatewayServer::build(&test_config(toml), CancellationToken::new())
            .await
            .expect("server builds")
    }

    fn context() -> RequestContext {
        RequestContext {
            user_id: "testuser00000".to_string(),
            api_key_id: "testuser00000".to_string(),
        }
    }

    fn chat_request(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            system: None,
            messages: vec![Message::text(Role::User, "Hello")],
            tools: Vec::new(),
            tool_choice: None,
            max_output_tokens: None,
            temperature: None,
            stop_sequences: Vec::new(),
            stream: false,
        }
    }

    #[tokio::test]
    async fn prepare_applies_aliases_and_classifies() {
        let server = test_server(
            r#"
            [ledger]
            enabled = false

            [[llm.aliases]]
            pattern = "claude-3-5-sonnet*"
            target = "claude-3-5-haiku-latest"
            "#,
        )
        .await;

        let mut request = chat_request("claude-3-5-sonnet-20241022");
        let family = server.prepare(Dialect::AnthropicMessages, &mut request).unwrap();

        assert_eq!(request.model, "claude-3-5-haiku-latest");
        assert_eq!(family, Family::Anthropic);
    }

    #[tokio::test]
    async fn prepare_clamps_to_smallest_cap() {
        let server = test_server(
            r#"
            [ledger]
            enabled = false

            [llm]
            max_output_tokens = 8000

            [[metadata.models]]
            model = "gpt-4o-mini"
            provider = "openai"
            max_completion_cap = 4096
            "#,
        )
        .await;

        // Client asks above both caps: model cap wins.
        let mut request = chat_request("gpt-4o-mini");
        request.max_output_tokens = Some(100_000);
        server.prepare(Dialect::OpenaiChat, &mut request).unwrap();
        assert_eq!(request.max_output_tokens, Some(4096));

        // Client asks below every cap: untouched.
        let mut request = chat_request("gpt-4o-mini");
        request.max_output_tokens = Some(100);
        server.prepare(Dialect::OpenaiChat, &mut request).unwrap();
        assert_eq!(request.max_output_tokens, Some(100));

        // Absent means upstream default; caps never raise it.
        let mut request = chat_request("gpt-4o-mini");
        server.prepare(Dialect::OpenaiChat, &mut request).unwrap();
        assert_eq!(request.max_output_tokens, None);
    }

    #[tokio::test]
    async fn work_mode_rejections_surface_from_prepare() {
        let server = test_server(
            r#"
            [ledger]
            enabled = false

            [llm]
            work_mode = "passthrough"
            "#,
        )
        .await;

        let mut request = chat_request("claude-3-5-haiku-20241022");
        let error = server.prepare(Dialect::OpenaiResponses, &mut request).unwrap_err();

        assert!(error.to_string().contains("work_mode=passthrough does not support translation"));
    }

    #[tokio::test]
    async fn unknown_model_is_rejected() {
        let server = test_server("[ledger]\nenabled = false").await;

        let mut request = chat_request("mystery-9000");
        let error = server.prepare(Dialect::OpenaiChat, &mut request).unwrap_err();

        assert!(matches!(error, LlmError::UnknownModel(_)));
    }

    #[tokio::test]
    async fn loopback_completion_echoes() {
        let server = test_server("[ledger]\nenabled = false").await;

        let response = server
            .complete(Dialect::OpenaiChat, chat_request("loopback"), &context())
            .await
            .unwrap();

        assert_eq!(response.joined_text(), "[loopback] Hello");
        assert!(response.usage.total() > 0);
    }

    #[tokio::test]
    async fn missing_upstream_is_unavailable() {
        let server = test_server("[ledger]\nenabled = false").await;

        let error = server
            .complete(Dialect::OpenaiChat, chat_request("gpt-4o-mini"), &context())
            .await
            .unwrap_err();

        assert!(matches!(error, LlmError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn loopback_embeddings_match_cardinality() {
        let server = test_server("[ledger]\nenabled = false").await;

        let request = openai::EmbeddingsRequest {
            model: "loopback".to_string(),
            input: openai::EmbeddingsInput::Batch(vec!["a".into(), "b".into(), "c".into()]),
            dimensions: Some(9999),
            encoding_format: None,
            user: None,
        };

        let response = server.embeddings(request, &context()).await.unwrap();

        assert_eq!(response.data.len(), 3);
        // Dimensions are clamped into [1, 4096].
        assert_eq!(response.data[0].embedding.len(), 4096);
    }

    #[tokio::test]
    async fn oversized_embedding_batch_is_rejected() {
        let server = test_server("[ledger]\nenabled = false").await;

        let request = openai::EmbeddingsRequest {
            model: "loopback".to_string(),
            input: openai::EmbeddingsInput::Batch(vec![String::from("x"); 2049]),
            dimensions: None,
            encoding_format: None,
            user: None,
        };

        let error = server.embeddings(request, &context()).await.unwrap_err();
        assert!(matches!(error, LlmError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn models_include_catalog_and_loopback() {
        let server = test_server(
            r#"
            [ledger]
            enabled = false

            [[metadata.models]]
            model = "gpt-4o-mini"
            provider = "openai"
            "#,
        )
        .await;

        let models = server.models();
        let ids: Vec<&str> = models.data.iter().map(|m| m.id.as_str()).collect();

        assert!(ids.contains(&"gpt-4o-mini"));
        assert!(ids.contains(&"loopback"));
    }
}
