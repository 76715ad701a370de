//! Tool-call continuation store backing the Responses dialect.
//!
//! When a Responses stream suspends on tool calls, the gateway registers a
//! continuation keyed by the generated response id: a snapshot of the
//! prepared request, the pending calls, and the routing family. Submission
//! of tool outputs advances the state machine
//! `awaiting_output → resumed → completed`; a periodic reaper expires
//! abandoned entries.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::{
    error::LlmError,
    messages::{
        responses,
        unified::{ChatRequest, ChatResponse, Message, Part, PendingToolCall, Role},
    },
    model::Family,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContinuationState {
    AwaitingOutput,
    Resumed,
    Completed,
    Expired,
}

pub(crate) struct Continuation {
    request: ChatRequest,
    family: Family,
    pending: Vec<PendingToolCall>,
    state: ContinuationState,
    result: Option<ChatResponse>,
    created_at: Instant,
}

/// What a probe of a continuation sees.
pub(crate) enum ContinuationStatus {
    /// Still waiting on tool outputs.
    Awaiting {
        model: String,
        pending: Vec<PendingToolCall>,
    },
    /// Outputs submitted, the follow-up upstream call is in flight.
    InFlight,
    /// The follow-up finished; the result is available.
    Completed(Box<ChatResponse>),
}

pub(crate) struct ContinuationStore {
    entries: DashMap<String, Continuation>,
    ttl: Duration,
}

impl ContinuationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn generate_id() -> String {
        format!("resp_{}", uuid::Uuid::new_v4().simple())
    }

    /// Register a suspended response awaiting tool output.
    pub fn register(&self, response_id: String, request: ChatRequest, family: Family, pending: Vec<PendingToolCall>) {
        log::debug!(
            "registering continuation {response_id} with {} pending tool call(s)",
            pending.len()
        );

        self.entries.insert(
            response_id,
            Continuation {
                request,
                family,
                pending,
                state: ContinuationState::AwaitingOutput,
                result: None,
                created_at: Instant::now(),
            },
        );
    }

    /// Accept a tool-output submission: validate, mark resumed, and build
    /// the follow-up request (original messages, a synthesized assistant
    /// message with the recorded tool calls, and the submitted results).
    pub fn begin_resume(
        &self,
        response_id: &str,
        outputs: &[responses::ToolOutput],
    ) -> Result<(ChatRequest, Family), LlmError> {
        let mut entry = self
            .entries
            .get_mut(response_id)
            .ok_or_else(|| LlmError::NotFound(format!("response '{response_id}' not found or expired")))?;

        if entry.state == ContinuationState::Expired || entry.created_at.elapsed() > self.ttl {
            entry.state = ContinuationState::Expired;
            return Err(LlmError::NotFound(format!("response '{response_id}' not found or expired")));
        }

        if entry.state != ContinuationState::AwaitingOutput {
            return Err(LlmError::Conflict(format!(
                "tool outputs were already submitted for response '{response_id}'"
            )));
        }

        if outputs.is_empty() {
            return Err(LlmError::InvalidRequest("tool_outputs must not be empty".to_string()));
        }

        for output in outputs {
            let known = entry
                .pending
                .iter()
                .any(|call| call.call_id == output.tool_call_id || call.id == output.tool_call_id);

            if !known {
                return Err(LlmError::InvalidRequest(format!(
                    "unknown tool_call_id '{}'",
                    output.tool_call_id
                )));
            }
        }

        let mut request = entry.request.clone();

        request.messages.push(Message {
            role: Role::Assistant,
            parts: entry
                .pending
                .iter()
                .map(|call| Part::ToolUse {
                    id: call.call_id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                })
                .collect(),
        });

        request.messages.push(Message {
            role: Role::Tool,
            parts: outputs
                .iter()
                .map(|output| {
                    let call_id = entry
                        .pending
                        .iter()
                        .find(|call| call.id == output.tool_call_id)
                        .map(|call| call.call_id.clone())
                        .unwrap_or_else(|| output.tool_call_id.clone());

                    Part::ToolResult {
                        tool_use_id: call_id,
                        content: output.output.clone(),
                    }
                })
                .collect(),
        });

        // The follow-up is a fresh unary exchange.
        request.stream = false;

        entry.state = ContinuationState::Resumed;

        Ok((request, entry.family))
    }

    /// Store the outcome of the follow-up call. A follow-up that itself
    /// stopped on tool calls re-arms the continuation: the snapshot grows by
    /// the new assistant turn and the entry goes back to awaiting output, so
    /// chained tool calls keep resuming against the same response id.
    pub fn complete(&self, response_id: &str, follow_up: ChatRequest, response: ChatResponse) {
        let Some(mut entry) = self.entries.get_mut(response_id) else {
            return;
        };

        let new_pending = crate::messages::unified::to_responses::pending_tool_calls(&response);

        if new_pending.is_empty() {
            entry.state = ContinuationState::Completed;
            entry.result = Some(response);
            return;
        }

        // The snapshot stays one assistant turn behind: resume synthesizes
        // that turn from the pending calls, exactly as it did the first time.
        entry.request = follow_up;
        entry.pending = new_pending;
        entry.state = ContinuationState::AwaitingOutput;
        entry.result = Some(response);
        entry.created_at = Instant::now();
    }

    /// Roll a failed resume back so the client may retry the submission.
    pub fn abort_resume(&self, response_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(response_id)
            && entry.state == ContinuationState::Resumed
        {
            entry.state = ContinuationState::AwaitingOutput;
        }
    }

    /// Probe a continuation. Expired entries answer like missing ones.
    pub fn status(&self, response_id: &str) -> Result<ContinuationStatus, LlmError> {
        let entry = self
            .entries
            .get(response_id)
            .ok_or_else(|| LlmError::NotFound(format!("response '{response_id}' not found or expired")))?;

        if entry.state == ContinuationState::Expired || entry.created_at.elapsed() > self.ttl {
            return Err(LlmError::NotFound(format!("response '{response_id}' not found or expired")));
        }

        Ok(match entry.state {
            ContinuationState::AwaitingOutput => ContinuationStatus::Awaiting {
                model: entry.request.model.clone(),
                pending: entry.pending.clone(),
            },
            ContinuationState::Resumed => ContinuationStatus::InFlight,
            ContinuationState::Completed => ContinuationStatus::Completed(Box::new(
                entry.result.clone().unwrap_or_else(|| ChatResponse {
                    id: response_id.to_string(),
                    model: entry.request.model.clone(),
                    parts: Vec::new(),
                    stop_reason: crate::messages::unified::StopReason::EndTurn,
                    usage: Default::default(),
                }),
            )),
            ContinuationState::Expired => unreachable!("handled above"),
        })
    }

    /// Mark overdue entries expired and drop the ones past the grace
    /// window. Expired entries may still be probed until dropped, but never
    /// resumed.
    pub fn reap(&self) {
        let ttl = self.ttl;
        let mut expired = 0;

        for mut entry in self.entries.iter_mut() {
            if entry.state == ContinuationState::AwaitingOutput && entry.created_at.elapsed() > ttl {
                entry.state = ContinuationState::Expired;
                expired += 1;
            }
        }

        self.entries.retain(|_, entry| entry.created_at.elapsed() <= ttl * 2);

        if expired > 0 {
            log::debug!("expired {expired} tool-call continuation(s)");
        }
    }

    /// Run the periodic reaper until cancellation.
    pub async fn reaper_loop(self: Arc<Self>, token: CancellationToken) {
        let tick = self.ttl.min(Duration::from_secs(60)).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.reap(),
                _ = token.cancelled() => break,
            }
        }
    }

    #[cfg(test)]
    fn force_age(&self, response_id: &str, age: Duration) {
        if let Some(mut entry) = self.entries.get_mut(response_id) {
            entry.created_at = Instant::now() - age;
        }
    }
}
