//! Adapter contracts: the base trait plus optional capability contracts.
//!
//! An adapter bridges one platform. The base [`Adapter`] contract exposes the
//! type and descriptor; everything else — sending, receiving, streaming,
//! directory lookup, processing status — is an optional contract discovered by
//! capability probe (`adapter.sender()`, `adapter.receiver()`, ...). Callers
//! must tolerate absence; the registry never assumes a closed union.

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::descriptor::{ChannelType, Descriptor};
use crate::dispatch::InboundHandler;
use crate::error::ChannelError;
use crate::message::{Message, OutboundMessage, Target};
use crate::store::ChannelConfig;
use crate::stream::{OutboundStream, StreamOptions};

/// Base adapter contract. Capability probes default to `None`; adapters
/// override the ones they implement.
pub trait Adapter: Send + Sync {
    fn channel_type(&self) -> ChannelType;
    fn descriptor(&self) -> Descriptor;

    fn config_normalizer(&self) -> Option<&dyn ConfigNormalizer> {
        None
    }
    fn target_resolver(&self) -> Option<&dyn TargetResolver> {
        None
    }
    fn binding_matcher(&self) -> Option<&dyn BindingMatcher> {
        None
    }
    fn sender(&self) -> Option<&dyn Sender> {
        None
    }
    fn stream_sender(&self) -> Option<&dyn StreamSender> {
        None
    }
    fn receiver(&self) -> Option<&dyn Receiver> {
        None
    }
    fn message_editor(&self) -> Option<&dyn MessageEditor> {
        None
    }
    fn reactor(&self) -> Option<&dyn Reactor> {
        None
    }
    fn self_discoverer(&self) -> Option<&dyn SelfDiscoverer> {
        None
    }
    fn directory(&self) -> Option<&dyn DirectoryAdapter> {
        None
    }
    fn processing_status(&self) -> Option<&dyn ProcessingStatusNotifier> {
        None
    }
}

/// Validates and canonicalizes credential maps before they are persisted.
pub trait ConfigNormalizer: Send + Sync {
    fn normalize_config(&self, input: &Map<String, Value>) -> Result<Map<String, Value>, ChannelError>;
    fn normalize_user_config(
        &self,
        input: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ChannelError>;
}

/// Resolves and canonicalizes delivery targets.
pub trait TargetResolver: Send + Sync {
    /// Builds a target from a user binding config (e.g. an `open_id` entry).
    fn resolve_target(&self, user_config: &Map<String, Value>) -> Result<Target, ChannelError>;

    /// Pre-send canonicalization. Must be idempotent.
    fn normalize_target(&self, target: &Target) -> Target {
        target.clone()
    }
}

/// Matches a stored user binding config against lookup criteria.
pub trait BindingMatcher: Send + Sync {
    fn match_binding(&self, config: &Map<String, Value>, criteria: &Map<String, Value>) -> bool;
}

/// Sends one outbound message.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, config: &ChannelConfig, message: &OutboundMessage)
        -> Result<(), ChannelError>;
}

/// Opens a platform-native reply stream.
#[async_trait]
pub trait StreamSender: Send + Sync {
    async fn open_stream(
        &self,
        config: &ChannelConfig,
        target: &Target,
        options: &StreamOptions,
    ) -> Result<Box<dyn OutboundStream>, ChannelError>;
}

/// Maintains a long-lived inbound connection for one config.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Establishes the platform session and delivers inbound messages through
    /// `handler`. The session outlives the caller; it ends only via
    /// [`Connection::stop`] or process shutdown.
    async fn connect(
        &self,
        config: Arc<ChannelConfig>,
        handler: InboundHandler,
    ) -> Result<Box<dyn Connection>, ChannelError>;
}

/// Edits or removes already-sent messages.
#[async_trait]
pub trait MessageEditor: Send + Sync {
    async fn edit_message(
        &self,
        config: &ChannelConfig,
        target: &Target,
        message_id: &str,
        message: &Message,
    ) -> Result<(), ChannelError>;

    async fn unsend_message(
        &self,
        config: &ChannelConfig,
        target: &Target,
        message_id: &str,
    ) -> Result<(), ChannelError>;
}

/// Adds reactions to messages.
#[async_trait]
pub trait Reactor: Send + Sync {
    async fn react(
        &self,
        config: &ChannelConfig,
        target: &Target,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ChannelError>;
}

/// Discovers the bot's own platform identity (filled into the config's
/// self-identity map on connect).
#[async_trait]
pub trait SelfDiscoverer: Send + Sync {
    async fn discover_self(&self, config: &ChannelConfig) -> Result<Map<String, Value>, ChannelError>;
}

/// Result of a directory lookup for one platform subject.
#[derive(Clone, Debug, Default)]
pub struct DirectoryEntry {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Looks up platform subjects for higher-quality profile data.
#[async_trait]
pub trait DirectoryAdapter: Send + Sync {
    async fn lookup_subject(
        &self,
        config: &ChannelConfig,
        subject_id: &str,
    ) -> Result<DirectoryEntry, ChannelError>;
}

/// Channel-facing context for a processing-status notification.
#[derive(Clone, Debug)]
pub struct ProcessingStatusInfo {
    pub bot_id: String,
    pub chat_id: String,
    pub route_id: String,
    pub reply_target: Option<Target>,
    pub source_message_id: Option<String>,
}

/// Opaque adapter-chosen token carried from `processing_started` to the
/// matching completed/failed call. Serialized as JSON when an adapter
/// persists it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessingStatusHandle {
    pub token: String,
}

/// Surfaces "the bot is thinking" lifecycle to the platform (typing
/// indicators, placeholder cards). All calls are best-effort for the caller.
#[async_trait]
pub trait ProcessingStatusNotifier: Send + Sync {
    async fn processing_started(
        &self,
        config: &ChannelConfig,
        info: &ProcessingStatusInfo,
    ) -> Result<ProcessingStatusHandle, ChannelError>;

    async fn processing_completed(
        &self,
        config: &ChannelConfig,
        info: &ProcessingStatusInfo,
        handle: &ProcessingStatusHandle,
    ) -> Result<(), ChannelError>;

    async fn processing_failed(
        &self,
        config: &ChannelConfig,
        info: &ProcessingStatusInfo,
        handle: &ProcessingStatusHandle,
    ) -> Result<(), ChannelError>;
}

/// A live platform session owned by the connection manager, keyed by config id.
/// Lifetime ends at [`stop`](Connection::stop) (which flips `is_running` to
/// false) or manager shutdown. `stop` may fail with
/// [`ChannelError::StopUnsupported`] for long-lived adapters that cannot be
/// gracefully torn down.
#[async_trait]
pub trait Connection: Send + Sync {
    fn config_id(&self) -> &str;
    fn bot_id(&self) -> &str;
    fn channel_type(&self) -> ChannelType;
    fn is_running(&self) -> bool;
    async fn stop(&self) -> Result<(), ChannelError>;
}
