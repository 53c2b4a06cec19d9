//! Stream event wire protocol: type + payload + envelope + SSE framing.
//!
//! This crate defines the wire shape of a single reply-stream event and the
//! envelope injected into each one. It does not depend on courier; courier
//! bridges its typed `StreamEvent` into [`WireEvent`] and calls [`to_sse_line`].

pub mod envelope;
pub mod event;
pub mod sse;

pub use envelope::{to_json, Envelope, EnvelopeState};
pub use event::{StatusState, WireEvent};
pub use sse::to_sse_line;
