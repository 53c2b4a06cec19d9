//! Reply stream sessions: SSE-shaped event flow with lifecycle and observer tee.
//!
//! One [`StreamSession`] covers one reply: `status:started`, any number of
//! deltas / tool events / attachments, the final message(s), then
//! `status:completed` (or `error`). Every push is mirrored to the
//! [`StreamObserver`] through a [`TeeStream`] — including pushes whose primary
//! delivery failed, so monitoring stays truthful when a platform rate-limits.
//! Close never notifies observers and runs on every path, error or not.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::adapter::Adapter;
use crate::error::ChannelError;
use crate::message::{Attachment, Message, OutboundMessage, ReplyRef, Target};
use crate::outbound;
use crate::store::ChannelConfig;

pub use stream_event::StatusState;

/// One event in a reply stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Status(StatusState),
    Delta { text: String, phase: Option<String> },
    ToolCallStart { name: String },
    ToolCallEnd { name: String },
    Attachment(Attachment),
    Final(Message),
    Error { message: String },
}

impl StreamEvent {
    /// Reasoning-phase marker on delta events.
    pub const PHASE_REASONING: &'static str = "reasoning";

    /// Bridges to the wire shape (`stream-event` crate).
    pub fn to_wire(&self) -> Result<stream_event::WireEvent, ChannelError> {
        let err = |e: serde_json::Error| ChannelError::Config(e.to_string());
        Ok(match self {
            StreamEvent::Status(state) => stream_event::WireEvent::Status { state: *state },
            StreamEvent::Delta { text, phase } => stream_event::WireEvent::Delta {
                text: text.clone(),
                phase: phase.clone(),
            },
            StreamEvent::ToolCallStart { name } => {
                stream_event::WireEvent::ToolCallStart { name: name.clone() }
            }
            StreamEvent::ToolCallEnd { name } => {
                stream_event::WireEvent::ToolCallEnd { name: name.clone() }
            }
            StreamEvent::Attachment(attachment) => stream_event::WireEvent::Attachment {
                attachment: serde_json::to_value(attachment).map_err(err)?,
            },
            StreamEvent::Final(message) => stream_event::WireEvent::Final {
                message: serde_json::to_value(message).map_err(err)?,
            },
            StreamEvent::Error { message } => stream_event::WireEvent::Error {
                message: message.clone(),
            },
        })
    }
}

/// Options for opening a stream against a target.
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    pub reply: Option<ReplyRef>,
    pub source_message_id: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Adapter-side stream: pushes events to the platform.
#[async_trait]
pub trait OutboundStream: Send {
    async fn push(&mut self, event: &StreamEvent) -> Result<(), ChannelError>;
    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Mirror for every emitted stream event (WebUI, cross-channel broadcast).
#[async_trait]
pub trait StreamObserver: Send + Sync {
    async fn observe(&self, session_id: &str, event: &StreamEvent);
}

/// Wraps an adapter stream and mirrors each push to the observer. The observer
/// is invoked even when the primary push errors; close does not notify it.
pub struct TeeStream {
    session_id: String,
    inner: Option<Box<dyn OutboundStream>>,
    observer: Option<Arc<dyn StreamObserver>>,
}

impl TeeStream {
    pub fn new(
        session_id: impl Into<String>,
        inner: Option<Box<dyn OutboundStream>>,
        observer: Option<Arc<dyn StreamObserver>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            inner,
            observer,
        }
    }

    pub fn has_adapter_stream(&self) -> bool {
        self.inner.is_some()
    }

    /// Pushes to the adapter stream (no-op when absent), then mirrors to the
    /// observer, then returns the primary result.
    pub async fn push(&mut self, event: &StreamEvent) -> Result<(), ChannelError> {
        let primary = match self.inner.as_mut() {
            Some(stream) => stream.push(event).await,
            None => Ok(()),
        };
        if let Some(observer) = &self.observer {
            observer.observe(&self.session_id, event).await;
        }
        primary
    }

    pub async fn close(&mut self) -> Result<(), ChannelError> {
        match self.inner.as_mut() {
            Some(stream) => stream.close().await,
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Finals,
    Closed,
}

/// One reply's event flow against a target.
///
/// Lifecycle: `start` → deltas / tool events / attachments → final message(s)
/// → `complete` (or `fail`). Order violations error with
/// [`ChannelError::OutOfOrder`]. Without an adapter stream, final messages go
/// out through the outbound pipeline and all other events reach the observer
/// only.
pub struct StreamSession {
    session_id: String,
    target: Target,
    reply: Option<ReplyRef>,
    adapter: Arc<dyn Adapter>,
    config: Arc<ChannelConfig>,
    tee: TeeStream,
    phase: Phase,
}

impl StreamSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Emits `status:started`.
    pub async fn start(&mut self) -> Result<(), ChannelError> {
        if self.phase != Phase::Created {
            return Err(ChannelError::OutOfOrder("start after start"));
        }
        self.phase = Phase::Started;
        self.tee.push(&StreamEvent::Status(StatusState::Started)).await
    }

    pub async fn push_delta(
        &mut self,
        text: impl Into<String>,
        phase: Option<String>,
    ) -> Result<(), ChannelError> {
        self.push_body(StreamEvent::Delta {
            text: text.into(),
            phase,
        })
        .await
    }

    pub async fn push_tool_call_start(&mut self, name: impl Into<String>) -> Result<(), ChannelError> {
        self.push_body(StreamEvent::ToolCallStart { name: name.into() }).await
    }

    pub async fn push_tool_call_end(&mut self, name: impl Into<String>) -> Result<(), ChannelError> {
        self.push_body(StreamEvent::ToolCallEnd { name: name.into() }).await
    }

    pub async fn push_attachment(&mut self, attachment: Attachment) -> Result<(), ChannelError> {
        self.push_body(StreamEvent::Attachment(attachment)).await
    }

    async fn push_body(&mut self, event: StreamEvent) -> Result<(), ChannelError> {
        match self.phase {
            Phase::Started => self.tee.push(&event).await,
            Phase::Created => Err(ChannelError::OutOfOrder("event before start")),
            Phase::Finals => Err(ChannelError::OutOfOrder("event after final")),
            Phase::Closed => Err(ChannelError::StreamClosed),
        }
    }

    /// Pushes one final message. With an adapter stream the message rides the
    /// stream; otherwise it is delivered through the outbound pipeline. The
    /// observer sees the event either way.
    pub async fn push_final(&mut self, mut message: Message) -> Result<(), ChannelError> {
        match self.phase {
            Phase::Started | Phase::Finals => {}
            Phase::Created => return Err(ChannelError::OutOfOrder("final before start")),
            Phase::Closed => return Err(ChannelError::StreamClosed),
        }
        self.phase = Phase::Finals;
        if message.reply.is_none() {
            message.reply = self.reply.clone();
        }
        if self.tee.has_adapter_stream() {
            self.tee.push(&StreamEvent::Final(message)).await
        } else {
            let delivery = outbound::deliver(
                self.adapter.as_ref(),
                &self.config,
                &OutboundMessage::new(self.target.clone(), message.clone()),
            )
            .await;
            // Mirror regardless of delivery outcome; the tee has no primary here.
            let _ = self.tee.push(&StreamEvent::Final(message)).await;
            delivery
        }
    }

    /// Emits `status:completed` and closes.
    pub async fn complete(&mut self) -> Result<(), ChannelError> {
        match self.phase {
            Phase::Started | Phase::Finals => {}
            Phase::Created => return Err(ChannelError::OutOfOrder("complete before start")),
            Phase::Closed => return Err(ChannelError::StreamClosed),
        }
        let pushed = self.tee.push(&StreamEvent::Status(StatusState::Completed)).await;
        self.phase = Phase::Closed;
        let closed = self.tee.close().await;
        pushed.and(closed)
    }

    /// Emits `error` and closes. Safe on any non-closed phase.
    pub async fn fail(&mut self, message: impl Into<String>) -> Result<(), ChannelError> {
        if self.phase == Phase::Closed {
            return Err(ChannelError::StreamClosed);
        }
        let pushed = self
            .tee
            .push(&StreamEvent::Error {
                message: message.into(),
            })
            .await;
        self.phase = Phase::Closed;
        let closed = self.tee.close().await;
        pushed.and(closed)
    }

    /// Closes without a terminal event; used on teardown paths where the
    /// terminal event was already pushed or cannot be.
    pub async fn close(&mut self) -> Result<(), ChannelError> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        self.phase = Phase::Closed;
        self.tee.close().await
    }
}

/// Per-message reply surface bound to an adapter's `Sender` and `StreamSender`
/// (when present). Handed to the inbound processor by the dispatcher.
#[derive(Clone)]
pub struct StreamReplySender {
    adapter: Arc<dyn Adapter>,
    config: Arc<ChannelConfig>,
    observer: Option<Arc<dyn StreamObserver>>,
}

impl StreamReplySender {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        config: Arc<ChannelConfig>,
        observer: Option<Arc<dyn StreamObserver>>,
    ) -> Self {
        Self {
            adapter,
            config,
            observer,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn config(&self) -> &Arc<ChannelConfig> {
        &self.config
    }

    /// Normalizes the target and delivers through the outbound pipeline
    /// (chunking, gating, retries).
    pub async fn send(&self, target: &Target, message: Message) -> Result<(), ChannelError> {
        let target = self.normalize(target);
        outbound::deliver(
            self.adapter.as_ref(),
            &self.config,
            &OutboundMessage::new(target, message),
        )
        .await
    }

    /// Opens a stream session for one reply. Falls back to pipeline delivery
    /// of final messages when the adapter has no `StreamSender`.
    pub async fn open_stream(
        &self,
        session_id: impl Into<String>,
        target: &Target,
        options: StreamOptions,
    ) -> Result<StreamSession, ChannelError> {
        let session_id = session_id.into();
        let target = self.normalize(target);
        let inner = match self.adapter.stream_sender() {
            Some(streamer) => Some(
                streamer
                    .open_stream(&self.config, &target, &options)
                    .await?,
            ),
            None => None,
        };
        Ok(StreamSession {
            session_id: session_id.clone(),
            target,
            reply: options.reply,
            adapter: self.adapter.clone(),
            config: self.config.clone(),
            tee: TeeStream::new(session_id, inner, self.observer.clone()),
            phase: Phase::Created,
        })
    }

    fn normalize(&self, target: &Target) -> Target {
        match self.adapter.target_resolver() {
            Some(resolver) => resolver.normalize_target(target),
            None => target.clone(),
        }
    }
}

/// Observer that records events per session; test and demo aid.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<(String, StreamEvent)>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, StreamEvent)> {
        self.events.lock().expect("observer poisoned").clone()
    }

    /// Event type tags in arrival order for one session.
    pub fn kinds(&self, session_id: &str) -> Vec<String> {
        self.events
            .lock()
            .expect("observer poisoned")
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, ev)| match ev {
                StreamEvent::Status(StatusState::Started) => "started".to_string(),
                StreamEvent::Status(StatusState::Completed) => "completed".to_string(),
                StreamEvent::Status(StatusState::Failed) => "failed".to_string(),
                StreamEvent::Delta { phase: Some(p), .. } => format!("delta:{p}"),
                StreamEvent::Delta { .. } => "delta".to_string(),
                StreamEvent::ToolCallStart { .. } => "tool_call_start".to_string(),
                StreamEvent::ToolCallEnd { .. } => "tool_call_end".to_string(),
                StreamEvent::Attachment(_) => "attachment".to_string(),
                StreamEvent::Final(_) => "final".to_string(),
                StreamEvent::Error { .. } => "error".to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl StreamObserver for RecordingObserver {
    async fn observe(&self, session_id: &str, event: &StreamEvent) {
        self.events
            .lock()
            .expect("observer poisoned")
            .push((session_id.to_string(), event.clone()));
    }
}

/// Observer that encodes each event as one SSE `data:` line and forwards it to
/// a channel; per-session envelope state keeps `event_id` monotonic.
pub struct SseLineObserver {
    sink: mpsc::Sender<String>,
    states: std::sync::Mutex<HashMap<String, stream_event::EnvelopeState>>,
}

impl SseLineObserver {
    pub fn new(sink: mpsc::Sender<String>) -> Self {
        Self {
            sink,
            states: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StreamObserver for SseLineObserver {
    async fn observe(&self, session_id: &str, event: &StreamEvent) {
        let Ok(wire) = event.to_wire() else {
            return;
        };
        let line = {
            let mut states = self.states.lock().expect("sse observer poisoned");
            let state = states
                .entry(session_id.to_string())
                .or_insert_with(|| stream_event::EnvelopeState::new(session_id.to_string()));
            let line = stream_event::to_sse_line(&wire, state);
            if wire.is_terminal() {
                states.remove(session_id);
            }
            line
        };
        match line {
            Ok(line) => {
                if self.sink.send(line).await.is_err() {
                    tracing::debug!(session_id, "sse sink closed, dropping line");
                }
            }
            Err(e) => tracing::warn!(session_id, error = %e, "sse encoding failed"),
        }
    }
}
