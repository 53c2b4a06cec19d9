//! Error types for the channel runtime.
//!
//! One central [`ChannelError`] covers the public surface; store-level errors
//! live next to their traits and convert into `ChannelError` at the boundary.
//! Local recovery happens only for transport failures (retried by the outbound
//! pipeline) and [`ChannelError::StopUnsupported`] (tolerated during
//! reconciliation); everything else propagates.

use thiserror::Error;

/// Errors surfaced by the channel runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// Channel type is not registered.
    #[error("unsupported channel type: {0}")]
    Unsupported(String),

    /// Invalid or missing channel configuration (credentials, normalization).
    #[error("channel config: {0}")]
    Config(String),

    /// Message uses a feature the channel does not support. Never retried.
    #[error("channel {channel} does not support {capability}")]
    Capability { channel: String, capability: String },

    /// Adapter send/connect failure. The outbound pipeline retries these.
    #[error("transport: {0}")]
    Transport(String),

    /// All send attempts failed; wraps the last cause.
    #[error("send failed after {attempts} attempts: {last}")]
    SendRetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ChannelError>,
    },

    /// The connection cannot be gracefully torn down. Reconcile keeps the
    /// existing session instead of restarting.
    #[error("stop not supported for this connection")]
    StopUnsupported,

    /// Inbound queue is full; backpressure to the adapter.
    #[error("inbound queue full")]
    QueueFull,

    /// Chat engine failure, also emitted as an `error` stream event.
    #[error("chat engine: {0}")]
    Engine(String),

    /// Processing-status callback failure. Logged, never shadows a chat error.
    #[error("processing status notifier: {0}")]
    Notifier(String),

    /// Config/identity store failure.
    #[error("store: {0}")]
    Store(String),

    /// Token minting failure.
    #[error("token minting: {0}")]
    Token(String),

    /// Route resolution failure.
    #[error("route resolution: {0}")]
    Route(String),

    /// Message persistence failure.
    #[error("persist: {0}")]
    Persist(String),

    /// Outbound planning produced nothing to send.
    #[error("empty outbound message")]
    EmptyMessage,

    /// Push or close on a stream that has already finished.
    #[error("stream closed")]
    StreamClosed,

    /// Stream event violates the session lifecycle (e.g. delta before start).
    #[error("stream event out of order: {0}")]
    OutOfOrder(&'static str),

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl ChannelError {
    /// True when reconcile should keep the old connection rather than restart.
    pub fn is_stop_unsupported(&self) -> bool {
        matches!(self, ChannelError::StopUnsupported)
    }
}
