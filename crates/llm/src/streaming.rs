//! Outbound stream re-framers: neutral events to target-dialect SSE frames.
//!
//! Each sink is a small state machine fed one neutral event at a time,
//! queueing zero or more wire frames per input. The driver below pulls the
//! upstream, feeds the sink and drains its queue; backpressure falls out of
//! the response writer suspending the whole pipeline. A sink never surfaces
//! a mid-stream error: failures synthesize terminal frames so the client
//! always observes a well-formed stream.

pub(crate) mod anthropic_sink;
pub(crate) mod openai_sink;
pub(crate) mod responses_sink;

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::{Stream, StreamExt};

use crate::{messages::unified::StreamEvent, provider::EventStream};

/// One SSE frame: a bare `data:` line, or an `event:`/`data:` pair.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Data { data: String },
    Named { name: &'static str, data: String },
}

impl Frame {
    /// Serialize a payload into a bare data frame, degrading to an error
    /// placeholder rather than breaking the stream.
    pub fn data<T: serde::Serialize>(payload: &T) -> Self {
        Frame::Data {
            data: serialize(payload),
        }
    }

    /// Serialize a payload into a named event frame.
    pub fn named<T: serde::Serialize>(name: &'static str, payload: &T) -> Self {
        Frame::Named {
            name,
            data: serialize(payload),
        }
    }

    /// The OpenAI-style stream terminator.
    pub fn done() -> Self {
        Frame::Data {
            data: "[DONE]".to_string(),
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        match self {
            Frame::Data { .. } => None,
            Frame::Named { name, .. } => Some(name),
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            Frame::Data { data } | Frame::Named { data, .. } => data,
        }
    }

    fn into_event(self) -> Event {
        match self {
            Frame::Data { data } => Event::default().data(data),
            Frame::Named { name, data } => Event::default().event(name).data(data),
        }
    }
}

fn serialize<T: serde::Serialize>(payload: &T) -> String {
    sonic_rs::to_string(payload).unwrap_or_else(|e| {
        log::error!("failed to serialize stream frame: {e}");
        r#"{"error":"serialization failed"}"#.to_string()
    })
}

/// A target-dialect event serializer.
pub(crate) trait EventSink: Send + 'static {
    /// Feed one neutral event.
    fn process(&mut self, event: StreamEvent);

    /// The upstream ended (cleanly or not). Synthesize whatever terminal
    /// frames are still missing.
    fn finish(&mut self);

    /// Drain the next queued wire frame.
    fn pop(&mut self) -> Option<Frame>;
}

/// Drive a neutral event stream through a sink, yielding SSE frames.
pub(crate) fn frame_stream<S: EventSink>(
    events: EventStream,
    sink: S,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    futures::stream::unfold((events, sink, false), |(mut events, mut sink, mut done)| async move {
        loop {
            if let Some(frame) = sink.pop() {
                return Some((Ok(frame.into_event()), (events, sink, done)));
            }

            if done {
                return None;
            }

            match events.next().await {
                Some(Ok(event)) => sink.process(event),
                Some(Err(e)) => {
                    log::warn!("upstream stream failed mid-flight: {e}");
                    sink.finish();
                    done = true;
                }
                None => {
                    sink.finish();
                    done = true;
                }
            }
        }
    })
}
