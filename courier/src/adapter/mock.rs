//! Scriptable in-memory adapter for tests and demos.
//!
//! Capabilities are opt-in via builder methods, so a test can model anything
//! from a send-only text channel to a full streaming platform with directory
//! lookup and processing-status support.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::adapter::{
    Adapter, Connection, DirectoryAdapter, DirectoryEntry, ProcessingStatusHandle,
    ProcessingStatusInfo, ProcessingStatusNotifier, Receiver, Sender, SelfDiscoverer, StreamSender,
    TargetResolver,
};
use crate::descriptor::{Capabilities, ChannelType, Descriptor, OutboundPolicy};
use crate::dispatch::InboundHandler;
use crate::error::ChannelError;
use crate::message::inbound::InboundMessage;
use crate::message::{Message, OutboundMessage, Target};
use crate::store::ChannelConfig;
use crate::stream::{OutboundStream, StreamEvent, StreamOptions};

/// Events recorded by one mock stream.
pub type RecordedEvents = Arc<Mutex<Vec<StreamEvent>>>;

struct MockStream {
    events: RecordedEvents,
    fail_pushes: bool,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl OutboundStream for MockStream {
    async fn push(&mut self, event: &StreamEvent) -> Result<(), ChannelError> {
        self.events
            .lock()
            .expect("mock stream poisoned")
            .push(event.clone());
        if self.fail_pushes {
            return Err(ChannelError::Transport("mock stream push failed".into()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One mock connection; stop flips `running` and bumps the adapter-wide
/// counter.
pub struct MockConnection {
    config_id: String,
    bot_id: String,
    channel_type: ChannelType,
    running: AtomicBool,
    stops: Arc<AtomicUsize>,
    stop_unsupported: bool,
}

#[async_trait]
impl Connection for MockConnection {
    fn config_id(&self) -> &str {
        &self.config_id
    }

    fn bot_id(&self) -> &str {
        &self.bot_id
    }

    fn channel_type(&self) -> ChannelType {
        self.channel_type.clone()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        if self.stop_unsupported {
            return Err(ChannelError::StopUnsupported);
        }
        self.running.store(false, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory adapter with scriptable capabilities and recorded side effects.
pub struct MockAdapter {
    channel_type: ChannelType,
    descriptor: Descriptor,
    has_sender: bool,
    has_receiver: bool,
    has_stream_sender: bool,
    has_directory: bool,
    has_status: bool,
    has_target_resolver: bool,
    has_self_discoverer: bool,
    self_identity: Map<String, Value>,
    sent: Mutex<Vec<OutboundMessage>>,
    fail_next_sends: AtomicU32,
    fail_stream_pushes: AtomicBool,
    fail_status_calls: AtomicBool,
    stop_unsupported: AtomicBool,
    stops: Arc<AtomicUsize>,
    connects: AtomicUsize,
    handlers: Mutex<Vec<InboundHandler>>,
    streams: Mutex<Vec<RecordedEvents>>,
    status_log: Mutex<Vec<String>>,
    directory_entries: Mutex<HashMap<String, DirectoryEntry>>,
    directory_error: AtomicBool,
}

impl MockAdapter {
    pub fn new(channel_type: impl AsRef<str>) -> Self {
        let channel_type = ChannelType::new(channel_type);
        let descriptor = Descriptor::new(channel_type.as_str().to_string())
            .with_capabilities(Capabilities::full());
        Self {
            channel_type,
            descriptor,
            has_sender: false,
            has_receiver: false,
            has_stream_sender: false,
            has_directory: false,
            has_status: false,
            has_target_resolver: false,
            has_self_discoverer: false,
            self_identity: Map::new(),
            sent: Mutex::new(Vec::new()),
            fail_next_sends: AtomicU32::new(0),
            fail_stream_pushes: AtomicBool::new(false),
            fail_status_calls: AtomicBool::new(false),
            stop_unsupported: AtomicBool::new(false),
            stops: Arc::new(AtomicUsize::new(0)),
            connects: AtomicUsize::new(0),
            handlers: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            status_log: Mutex::new(Vec::new()),
            directory_entries: Mutex::new(HashMap::new()),
            directory_error: AtomicBool::new(false),
        }
    }

    pub fn with_sender(mut self) -> Self {
        self.has_sender = true;
        self
    }

    pub fn with_receiver(mut self) -> Self {
        self.has_receiver = true;
        self
    }

    pub fn with_stream_sender(mut self) -> Self {
        self.has_stream_sender = true;
        self
    }

    pub fn with_directory(mut self) -> Self {
        self.has_directory = true;
        self
    }

    pub fn with_processing_status(mut self) -> Self {
        self.has_status = true;
        self
    }

    pub fn with_target_resolver(mut self) -> Self {
        self.has_target_resolver = true;
        self
    }

    pub fn with_self_identity(mut self, identity: Map<String, Value>) -> Self {
        self.has_self_discoverer = true;
        self.self_identity = identity;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.descriptor.capabilities = capabilities;
        self
    }

    pub fn with_outbound(mut self, outbound: OutboundPolicy) -> Self {
        self.descriptor.outbound = outbound;
        self
    }

    pub fn with_directory_entry(self, subject_id: &str, entry: DirectoryEntry) -> Self {
        self.directory_entries
            .lock()
            .expect("mock adapter poisoned")
            .insert(subject_id.to_string(), entry);
        self
    }

    /// Next `n` sends fail with a transport error.
    pub fn fail_sends(&self, n: u32) {
        self.fail_next_sends.store(n, Ordering::SeqCst);
    }

    pub fn fail_stream_pushes(&self) {
        self.fail_stream_pushes.store(true, Ordering::SeqCst);
    }

    pub fn fail_status_calls(&self) {
        self.fail_status_calls.store(true, Ordering::SeqCst);
    }

    pub fn fail_directory_lookups(&self) {
        self.directory_error.store(true, Ordering::SeqCst);
    }

    /// Connections report stop as unsupported.
    pub fn set_stop_unsupported(&self) {
        self.stop_unsupported.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().expect("mock adapter poisoned").clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> Vec<RecordedEvents> {
        self.streams.lock().expect("mock adapter poisoned").clone()
    }

    pub fn status_log(&self) -> Vec<String> {
        self.status_log.lock().expect("mock adapter poisoned").clone()
    }

    /// Feeds a message through the most recent connection's handler, as the
    /// platform would.
    pub async fn inject(
        &self,
        config: Arc<ChannelConfig>,
        message: InboundMessage,
    ) -> Result<(), ChannelError> {
        let handler = {
            let handlers = self.handlers.lock().expect("mock adapter poisoned");
            handlers.last().cloned()
        };
        match handler {
            Some(handler) => handler(config, message).await,
            None => Err(ChannelError::Transport("mock adapter not connected".into())),
        }
    }
}

impl Adapter for MockAdapter {
    fn channel_type(&self) -> ChannelType {
        self.channel_type.clone()
    }

    fn descriptor(&self) -> Descriptor {
        self.descriptor.clone()
    }

    fn sender(&self) -> Option<&dyn Sender> {
        self.has_sender.then_some(self as &dyn Sender)
    }

    fn stream_sender(&self) -> Option<&dyn StreamSender> {
        self.has_stream_sender.then_some(self as &dyn StreamSender)
    }

    fn receiver(&self) -> Option<&dyn Receiver> {
        self.has_receiver.then_some(self as &dyn Receiver)
    }

    fn directory(&self) -> Option<&dyn DirectoryAdapter> {
        self.has_directory.then_some(self as &dyn DirectoryAdapter)
    }

    fn processing_status(&self) -> Option<&dyn ProcessingStatusNotifier> {
        self.has_status.then_some(self as &dyn ProcessingStatusNotifier)
    }

    fn target_resolver(&self) -> Option<&dyn TargetResolver> {
        self.has_target_resolver.then_some(self as &dyn TargetResolver)
    }

    fn self_discoverer(&self) -> Option<&dyn SelfDiscoverer> {
        self.has_self_discoverer.then_some(self as &dyn SelfDiscoverer)
    }
}

#[async_trait]
impl Sender for MockAdapter {
    async fn send(
        &self,
        _config: &ChannelConfig,
        message: &OutboundMessage,
    ) -> Result<(), ChannelError> {
        let remaining = self.fail_next_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(ChannelError::Transport("mock send failed".into()));
        }
        self.sent
            .lock()
            .expect("mock adapter poisoned")
            .push(message.clone());
        Ok(())
    }
}

#[async_trait]
impl StreamSender for MockAdapter {
    async fn open_stream(
        &self,
        _config: &ChannelConfig,
        _target: &Target,
        _options: &StreamOptions,
    ) -> Result<Box<dyn OutboundStream>, ChannelError> {
        let events: RecordedEvents = Arc::new(Mutex::new(Vec::new()));
        self.streams
            .lock()
            .expect("mock adapter poisoned")
            .push(Arc::clone(&events));
        Ok(Box::new(MockStream {
            events,
            fail_pushes: self.fail_stream_pushes.load(Ordering::SeqCst),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

#[async_trait]
impl Receiver for MockAdapter {
    async fn connect(
        &self,
        config: Arc<ChannelConfig>,
        handler: InboundHandler,
    ) -> Result<Box<dyn Connection>, ChannelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .lock()
            .expect("mock adapter poisoned")
            .push(handler);
        Ok(Box::new(MockConnection {
            config_id: config.id.clone(),
            bot_id: config.bot_id.clone(),
            channel_type: self.channel_type.clone(),
            running: AtomicBool::new(true),
            stops: Arc::clone(&self.stops),
            stop_unsupported: self.stop_unsupported.load(Ordering::SeqCst),
        }))
    }
}

#[async_trait]
impl DirectoryAdapter for MockAdapter {
    async fn lookup_subject(
        &self,
        _config: &ChannelConfig,
        subject_id: &str,
    ) -> Result<DirectoryEntry, ChannelError> {
        if self.directory_error.load(Ordering::SeqCst) {
            return Err(ChannelError::Transport("mock directory down".into()));
        }
        self.directory_entries
            .lock()
            .expect("mock adapter poisoned")
            .get(subject_id)
            .cloned()
            .ok_or_else(|| ChannelError::NotFound(format!("subject {subject_id}")))
    }
}

#[async_trait]
impl ProcessingStatusNotifier for MockAdapter {
    async fn processing_started(
        &self,
        _config: &ChannelConfig,
        _info: &ProcessingStatusInfo,
    ) -> Result<ProcessingStatusHandle, ChannelError> {
        if self.fail_status_calls.load(Ordering::SeqCst) {
            return Err(ChannelError::Notifier("mock status down".into()));
        }
        let mut log = self.status_log.lock().expect("mock adapter poisoned");
        log.push("started".to_string());
        Ok(ProcessingStatusHandle {
            token: format!("tok-{}", log.len()),
        })
    }

    async fn processing_completed(
        &self,
        _config: &ChannelConfig,
        _info: &ProcessingStatusInfo,
        handle: &ProcessingStatusHandle,
    ) -> Result<(), ChannelError> {
        if self.fail_status_calls.load(Ordering::SeqCst) {
            return Err(ChannelError::Notifier("mock status down".into()));
        }
        self.status_log
            .lock()
            .expect("mock adapter poisoned")
            .push(format!("completed:{}", handle.token));
        Ok(())
    }

    async fn processing_failed(
        &self,
        _config: &ChannelConfig,
        _info: &ProcessingStatusInfo,
        handle: &ProcessingStatusHandle,
    ) -> Result<(), ChannelError> {
        if self.fail_status_calls.load(Ordering::SeqCst) {
            return Err(ChannelError::Notifier("mock status down".into()));
        }
        self.status_log
            .lock()
            .expect("mock adapter poisoned")
            .push(format!("failed:{}", handle.token));
        Ok(())
    }
}

impl TargetResolver for MockAdapter {
    fn resolve_target(&self, user_config: &Map<String, Value>) -> Result<Target, ChannelError> {
        user_config
            .get("target")
            .or_else(|| user_config.get("open_id"))
            .and_then(Value::as_str)
            .map(Target::new)
            .ok_or_else(|| ChannelError::Config("binding config has no target".into()))
    }

    fn normalize_target(&self, target: &Target) -> Target {
        let mut normalized = target.clone();
        normalized.id = normalized.id.trim().to_ascii_lowercase();
        normalized
    }
}

#[async_trait]
impl SelfDiscoverer for MockAdapter {
    async fn discover_self(
        &self,
        _config: &ChannelConfig,
    ) -> Result<Map<String, Value>, ChannelError> {
        Ok(self.self_identity.clone())
    }
}

/// Convenience for processor tests: text message on the mock channel.
pub fn inbound_text(
    channel: &str,
    bot_id: &str,
    conversation_kind: &str,
    subject_id: &str,
    text: &str,
) -> InboundMessage {
    use crate::message::inbound::{Conversation, Identity};
    let mut message = InboundMessage::new(
        ChannelType::new(channel),
        bot_id,
        Identity::new(subject_id, subject_id),
        Conversation::new("conv-1", conversation_kind),
        Message::text(text),
    );
    message.message.id = Some("m-1".to_string());
    message.reply_target = Some(Target::new("conv-1"));
    message
}
