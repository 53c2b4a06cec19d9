//! # Courier
//!
//! A pluggable channel runtime bridging external messaging platforms
//! (Telegram, Feishu, Discord, ...) and an internal conversational engine.
//! Adapters plug into a capability-probed registry; a reconciliation loop
//! keeps long-lived platform connections converged with stored configs; a
//! bounded worker pool runs inbound messages through identity resolution and
//! policy into the engine; replies stream back as SSE-shaped events with
//! chunking, capability gating, retries, and an observer tee.
//!
//! ## Design principles
//!
//! - **Polymorphism over capability sets**: adapters implement the base
//!   [`Adapter`] contract plus zero or more optional contracts ([`Sender`],
//!   [`StreamSender`], [`Receiver`], [`DirectoryAdapter`], ...). Callers probe;
//!   the registry never imposes a closed union.
//! - **Detached lifetimes at two seams**: inbound enqueue never extends the
//!   webhook's lifetime, and adapter connects are never tied to a caller —
//!   a completed request must not cancel engine work or a platform session.
//! - **Serialized refresh**: the reconciler holds one mutex for the full
//!   sweep; concurrent refreshes wait instead of skipping, so freshly
//!   persisted configs are never dropped under contention.
//! - **Truthful monitoring**: every stream push is mirrored to the
//!   [`StreamObserver`], even when the platform push fails.
//!
//! ## Main modules
//!
//! - [`registry`]: [`Registry`] — type-indexed adapter table with capability
//!   getters.
//! - [`adapter`]: [`Adapter`] and the optional contracts; [`Connection`];
//!   [`adapter::mock::MockAdapter`] for tests.
//! - [`manager`]: [`Manager`] — reconcile loop, connection table, lifecycle
//!   (`start`, `shutdown`, `stop`, `stop_by_bot`), [`Manager::send`].
//! - [`dispatch`]: bounded inbound queue, worker pool, [`InboundMiddleware`].
//! - [`identity`]: [`IdentityResolver`] — canonical identities, bind codes,
//!   preauth keys, personal-bot guard, membership policy.
//! - [`processor`]: [`Processor`] — one inbound message orchestrated from
//!   query to reply stream.
//! - [`outbound`]: planning (chunking, media ordering), capability gating,
//!   delivery with retries.
//! - [`stream`]: [`StreamSession`], [`TeeStream`], [`StreamReplySender`],
//!   observers; wire framing lives in the `stream-event` crate.
//! - [`message`]: the channel message model and inbound context.
//! - [`store`], [`route`], [`token`], [`writer`], [`runner`]: consumed
//!   contracts with in-memory (and SQLite, where it matters) bindings.
//!
//! Key types are re-exported at the crate root:
//! `use courier::{Manager, Registry, Message, InboundMessage};`

pub mod adapter;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod manager;
pub mod message;
pub mod outbound;
pub mod processor;
pub mod registry;
pub mod route;
pub mod runner;
pub mod store;
pub mod stream;
pub mod token;
pub mod writer;

pub use env_config::RuntimeSettings;

pub use adapter::{
    Adapter, BindingMatcher, ConfigNormalizer, Connection, DirectoryAdapter, DirectoryEntry,
    MessageEditor, ProcessingStatusHandle, ProcessingStatusInfo, ProcessingStatusNotifier, Reactor,
    Receiver, SelfDiscoverer, Sender, StreamSender, TargetResolver,
};
pub use descriptor::{
    Capabilities, ChannelType, ChunkerMode, ConfigSchema, Descriptor, FieldSpec, MediaOrder,
    OutboundPolicy, TargetSpec,
};
pub use dispatch::{Dispatcher, InboundHandler, InboundMiddleware, NextHandler};
pub use error::ChannelError;
pub use identity::{
    BindCode, BotKind, BotProfile, ChannelIdentity, Decision, IdentityMiddleware, IdentityResolver,
    IdentityStore, InMemoryIdentityStore, InboundIdentity, PreauthKey, Resolution,
    SqliteIdentityStore,
};
pub use manager::{Manager, SendRequest};
pub use message::inbound::{Conversation, Identity, InboundMessage};
pub use message::{
    Action, Attachment, AttachmentKind, Format, Message, OutboundMessage, Part, PartStyle,
    ReplyRef, Target, ThreadRef,
};
pub use processor::{InboundProcessor, Processor, ProcessorConfig};
pub use registry::Registry;
pub use route::{ResolveInput, RouteBinding, RouteResolver, StaticRouteResolver};
pub use runner::{ChatChunk, ChatRequest, MockRunner, Runner};
pub use store::{ChannelConfig, ConfigStore, InMemoryConfigStore, SqliteConfigStore, StoreError,
    UserBinding};
pub use stream::{
    OutboundStream, RecordingObserver, SseLineObserver, StatusState, StreamEvent, StreamObserver,
    StreamOptions, StreamReplySender, StreamSession, TeeStream,
};
pub use token::{ChatTokenClaims, StaticTokenMinter, TokenMinter};
pub use writer::{InMemoryMessageWriter, MessageWriter, PersistInput};
