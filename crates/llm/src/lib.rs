//! Model-agnostic LLM gateway core: dialect endpoints, routing and
//! translation, streaming re-framers, tool-call continuations and usage
//! accounting.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
};
use axum_serde::Sonic;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

mod continuation;
mod error;
mod gate;
mod http_client;
mod messages;
mod metadata;
mod model;
mod provider;
mod request;
mod server;
mod streaming;

pub use error::{AnthropicResult, LlmError, LlmResult as Result};
pub use server::GatewayServer;

use continuation::ContinuationStatus;
use error::AnthropicErrorResponse;
use gate::Dialect;
use messages::{
    anthropic, openai, responses,
    unified::{self, ChatRequest, ChatResponse, StreamEvent},
};
use request::extract_context;
use streaming::{
    anthropic_sink::AnthropicSink,
    frame_stream,
    openai_sink::OpenAiSink,
    responses_sink::{ContinuationHandle, ResponsesSink},
};

/// Build the gateway state from configuration. Background tasks are tied to
/// the cancellation token; call [`GatewayServer::shutdown`] after serving
/// stops.
pub async fn build_server(config: &config::Config, shutdown: CancellationToken) -> anyhow::Result<GatewayServer> {
    GatewayServer::build(config, shutdown).await
}

/// The gateway's HTTP surface.
pub fn router(server: GatewayServer, health: &config::HealthConfig) -> Router {
    let mut router = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/responses", post(create_response))
        .route("/v1/responses/{id}", get(get_response))
        .route("/v1/responses/{id}/submit_tool_outputs", post(submit_tool_outputs))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models));

    if health.enabled {
        router = router.route(&health.path, get(health_handler));
    }

    router.with_state(server)
}

/// Handle OpenAI chat completion requests, unary or streamed.
async fn chat_completions(
    State(server): State<GatewayServer>,
    headers: HeaderMap,
    Sonic(request): Sonic<openai::ChatCompletionRequest>,
) -> Result<Response> {
    let context = extract_context(&headers)?;

    log::debug!(
        "chat completions: model={}, messages={}, stream={}",
        request.model,
        request.messages.len(),
        request.stream.unwrap_or(false)
    );

    let unified_request = ChatRequest::try_from(request)?;
    unified_request.validate()?;

    if unified_request.stream {
        let events = server.stream(Dialect::OpenaiChat, unified_request, &context).await?;

        return Ok(Sse::new(frame_stream(events, OpenAiSink::new())).into_response());
    }

    let response = server.complete(Dialect::OpenaiChat, unified_request, &context).await?;

    Ok(Json(openai::ChatCompletionResponse::from(response)).into_response())
}

/// Handle Anthropic messages requests, unary or streamed. Errors are shaped
/// in the Anthropic error envelope.
async fn anthropic_messages(
    State(server): State<GatewayServer>,
    headers: HeaderMap,
    Sonic(request): Sonic<anthropic::MessagesRequest>,
) -> AnthropicResult<Response> {
    let context = extract_context(&headers).map_err(AnthropicErrorResponse::from)?;

    log::debug!(
        "messages: model={}, messages={}, stream={}",
        request.model,
        request.messages.len(),
        request.stream.unwrap_or(false)
    );

    let unified_request = ChatRequest::try_from(request).map_err(AnthropicErrorResponse::from)?;
    unified_request.validate().map_err(AnthropicErrorResponse::from)?;

    if unified_request.stream {
        let events = server
            .stream(Dialect::AnthropicMessages, unified_request, &context)
            .await
            .map_err(AnthropicErrorResponse::from)?;

        return Ok(Sse::new(frame_stream(events, AnthropicSink::new())).into_response());
    }

    let response = server
        .complete(Dialect::AnthropicMessages, unified_request, &context)
        .await
        .map_err(AnthropicErrorResponse::from)?;

    Ok(Json(anthropic::MessagesResponse::from(response)).into_response())
}

/// Handle Responses-dialect requests. Streams that stop on tool calls
/// suspend into a continuation instead of completing.
async fn create_response(
    State(server): State<GatewayServer>,
    headers: HeaderMap,
    Sonic(request): Sonic<responses::ResponsesRequest>,
) -> Result<Response> {
    let context = extract_context(&headers)?;

    log::debug!(
        "responses: model={}, stream={}",
        request.model,
        request.stream.unwrap_or(false)
    );

    let mut unified_request = ChatRequest::try_from(request)?;
    unified_request.validate()?;

    let family = server.prepare(Dialect::OpenaiResponses, &mut unified_request)?;
    let response_id = continuation::ContinuationStore::generate_id();

    if unified_request.stream {
        let snapshot = unified_request.clone();
        let model = unified_request.model.clone();

        let events = server.stream_prepared(family, unified_request, &context).await?;

        let sink = ResponsesSink::new(
            response_id,
            model,
            Some(ContinuationHandle {
                store: server.continuations(),
                request: snapshot,
                family,
            }),
        );

        return Ok(Sse::new(frame_stream(events, sink)).into_response());
    }

    let snapshot = unified_request.clone();
    let response = server.complete_prepared(family, unified_request, &context).await?;

    let pending = unified::to_responses::pending_tool_calls(&response);

    if !pending.is_empty() {
        server
            .continuations()
            .register(response_id.clone(), snapshot, family, pending);
    }

    let object = unified::to_responses::response_object(&response, &response_id, unified::to_openai::unix_timestamp());

    Ok(Json(object).into_response())
}

/// Accept tool outputs for a suspended response. The follow-up upstream
/// call happens here; its result is retrievable via `GET /v1/responses/{id}`.
async fn submit_tool_outputs(
    State(server): State<GatewayServer>,
    headers: HeaderMap,
    Path(response_id): Path<String>,
    Sonic(submission): Sonic<responses::SubmitToolOutputsRequest>,
) -> Result<Response> {
    let context = extract_context(&headers)?;

    log::debug!(
        "tool output submission for {response_id}: {} output(s)",
        submission.tool_outputs.len()
    );

    server
        .resume_continuation(&response_id, &submission.tool_outputs, &context)
        .await?;

    Ok(Json(serde_json::json!({"status": "accepted"})).into_response())
}

#[derive(Debug, Deserialize)]
struct GetResponseQuery {
    #[serde(default)]
    stream: Option<bool>,
}

/// Retrieve a response by id: the continuation result once tool outputs
/// were submitted, or the pending required action before that. With
/// `?stream=true` a completed result is replayed as Responses SSE.
async fn get_response(
    State(server): State<GatewayServer>,
    headers: HeaderMap,
    Path(response_id): Path<String>,
    Query(query): Query<GetResponseQuery>,
) -> Result<Response> {
    extract_context(&headers)?;

    match server.continuation_status(&response_id)? {
        ContinuationStatus::Completed(result) => {
            if query.stream.unwrap_or(false) {
                let events = replay_events(&result);
                let sink = ResponsesSink::new(response_id, result.model.clone(), None);
                let stream: provider::EventStream = Box::pin(futures::stream::iter(events.into_iter().map(Ok)));

                return Ok(Sse::new(frame_stream(stream, sink)).into_response());
            }

            let object = unified::to_responses::response_object(
                &result,
                &response_id,
                unified::to_openai::unix_timestamp(),
            );

            Ok(Json(object).into_response())
        }
        ContinuationStatus::Awaiting { model, pending } => {
            let object = responses::Response {
                id: response_id,
                object: "response".to_string(),
                created_at: unified::to_openai::unix_timestamp(),
                model,
                status: responses::ResponseStatus::Incomplete,
                output: Vec::new(),
                required_action: Some(unified::to_responses::required_action(&pending)),
                usage: None,
            };

            Ok(Json(object).into_response())
        }
        ContinuationStatus::InFlight => {
            let object = responses::Response {
                id: response_id,
                object: "response".to_string(),
                created_at: unified::to_openai::unix_timestamp(),
                model: String::new(),
                status: responses::ResponseStatus::InProgress,
                output: Vec::new(),
                required_action: None,
                usage: None,
            };

            Ok(Json(object).into_response())
        }
    }
}

/// Turn a stored response back into the neutral event sequence, so a
/// completed continuation can be replayed over SSE.
fn replay_events(response: &ChatResponse) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::MessageStart {
        id: response.id.clone(),
        model: response.model.clone(),
    }];

    let mut tool_index = 0;

    for part in &response.parts {
        match part {
            unified::Part::Text { text } => events.push(StreamEvent::TextDelta { text: text.clone() }),
            unified::Part::ToolUse { id, name, arguments } => {
                events.push(StreamEvent::ToolCallStart {
                    index: tool_index,
                    id: id.clone(),
                    name: name.clone(),
                });
                events.push(StreamEvent::ToolCallArgsDelta {
                    index: tool_index,
                    arguments: arguments.clone(),
                });
                events.push(StreamEvent::ToolCallStop { index: tool_index });
                tool_index += 1;
            }
            _ => {}
        }
    }

    events.push(StreamEvent::MessageDelta {
        stop_reason: response.stop_reason,
        usage: Some(response.usage),
    });
    events.push(StreamEvent::MessageStop);

    events
}

/// Handle OpenAI embeddings requests.
async fn embeddings(
    State(server): State<GatewayServer>,
    headers: HeaderMap,
    Sonic(request): Sonic<openai::EmbeddingsRequest>,
) -> Result<Json<openai::EmbeddingsResponse>> {
    let context = extract_context(&headers)?;

    log::debug!("embeddings: model={}, inputs={}", request.model, request.input.len());

    let response = server.embeddings(request, &context).await?;

    Ok(Json(response))
}

/// Handle list models requests.
async fn list_models(State(server): State<GatewayServer>) -> Json<openai::ModelsResponse> {
    Json(server.models())
}

/// Health endpoint: liveness plus the active work mode.
async fn health_handler(State(server): State<GatewayServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "work_mode": server.work_mode().to_string(),
    }))
}
