//! Inbound processor: orchestrates one message from query extraction to the
//! reply stream.
//!
//! Pipeline: build query → resolve identity → resolve route → trigger test →
//! persist → mint tokens → processing-status started → stream the engine →
//! silent-reply detection → reply filtering → final events → completed.

pub mod reply;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::adapter::{Adapter, ProcessingStatusHandle, ProcessingStatusInfo};
use crate::descriptor::Capabilities;
use crate::error::ChannelError;
use crate::identity::{IdentityResolver, InboundIdentity, Resolution};
use crate::message::inbound::InboundMessage;
use crate::message::{Format, Message, ReplyRef, Target};
use crate::route::{ResolveInput, RouteBinding, RouteResolver};
use crate::runner::{chunk_kind, ChatRequest, Runner};
use crate::store::ChannelConfig;
use crate::stream::{StreamOptions, StreamReplySender};
use crate::token::{ChatTokenClaims, TokenMinter};
use crate::writer::{trigger_mode, MessageWriter, PersistInput};

/// Processor knobs; defaults match the runtime settings defaults.
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub command_prefix: String,
    pub status_notify_timeout: Duration,
    pub token_ttl: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            command_prefix: "/".to_string(),
            status_notify_timeout: Duration::from_secs(60),
            token_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&env_config::RuntimeSettings> for ProcessorConfig {
    fn from(settings: &env_config::RuntimeSettings) -> Self {
        Self {
            command_prefix: settings.command_prefix.clone(),
            status_notify_timeout: settings.status_notify_timeout,
            token_ttl: settings.token_ttl,
        }
    }
}

/// One inbound message in, zero or more outbound events out.
#[async_trait]
pub trait InboundProcessor: Send + Sync {
    async fn process(
        &self,
        config: Arc<ChannelConfig>,
        message: InboundMessage,
        sender: StreamReplySender,
    ) -> Result<(), ChannelError>;
}

/// Default processor wired against the consumed contracts.
pub struct Processor {
    resolver: Arc<IdentityResolver>,
    runner: Arc<dyn Runner>,
    routes: Arc<dyn RouteResolver>,
    writer: Arc<dyn MessageWriter>,
    tokens: Arc<dyn TokenMinter>,
    settings: ProcessorConfig,
}

impl Processor {
    pub fn new(
        resolver: Arc<IdentityResolver>,
        runner: Arc<dyn Runner>,
        routes: Arc<dyn RouteResolver>,
        writer: Arc<dyn MessageWriter>,
        tokens: Arc<dyn TokenMinter>,
        settings: ProcessorConfig,
    ) -> Self {
        Self {
            resolver,
            runner,
            routes,
            writer,
            tokens,
            settings,
        }
    }

    /// Reply is produced only for direct conversations, mentions, replies to
    /// the bot, command-prefixed text, or a force-reply identity.
    fn should_reply(&self, msg: &InboundMessage, identity: &InboundIdentity) -> bool {
        if msg.conversation.is_direct() || identity.force_reply {
            return true;
        }
        if msg.metadata_flag("is_mentioned") || msg.metadata_flag("is_reply_to_bot") {
            return true;
        }
        let text = msg.message.plain_text();
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        self.command_prefixes(msg)
            .iter()
            .any(|prefix| !prefix.is_empty() && text.starts_with(prefix.as_str()))
    }

    fn command_prefixes(&self, msg: &InboundMessage) -> Vec<String> {
        if let Some(list) = msg.metadata.get("command_prefixes").and_then(Value::as_array) {
            let prefixes: Vec<String> = list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if !prefixes.is_empty() {
                return prefixes;
            }
        }
        if let Some(prefix) = msg.metadata.get("command_prefix").and_then(Value::as_str) {
            if !prefix.is_empty() {
                return vec![prefix.to_string()];
            }
        }
        vec![self.settings.command_prefix.clone()]
    }

    async fn persist_user_message(
        &self,
        msg: &InboundMessage,
        route: &RouteBinding,
        query: &str,
        mode: &str,
    ) -> Result<(), ChannelError> {
        let mut metadata = Map::new();
        metadata.insert("route_id".to_string(), json!(route.route_id));
        metadata.insert("platform".to_string(), json!(msg.channel.as_str()));
        metadata.insert("trigger_mode".to_string(), json!(mode));
        self.writer
            .persist(PersistInput {
                role: "user".to_string(),
                content: json!({"role": "user", "content": query}),
                metadata,
            })
            .await
    }

    async fn notify_started(
        &self,
        adapter: &dyn Adapter,
        config: &ChannelConfig,
        info: &ProcessingStatusInfo,
    ) -> Option<ProcessingStatusHandle> {
        let notifier = adapter.processing_status()?;
        match tokio::time::timeout(
            self.settings.status_notify_timeout,
            notifier.processing_started(config, info),
        )
        .await
        {
            Ok(Ok(handle)) => Some(handle),
            Ok(Err(e)) => {
                tracing::warn!(
                    channel = %msg_channel(config),
                    config_id = %config.id,
                    bot_id = %info.bot_id,
                    error = %e,
                    "processing-started notification failed"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    channel = %msg_channel(config),
                    config_id = %config.id,
                    bot_id = %info.bot_id,
                    "processing-started notification timed out"
                );
                None
            }
        }
    }

    /// Best-effort completion/failure notification. Errors are logged and
    /// never shadow the chat outcome.
    async fn notify_outcome(
        &self,
        adapter: &dyn Adapter,
        config: &ChannelConfig,
        info: &ProcessingStatusInfo,
        handle: Option<ProcessingStatusHandle>,
        failed: bool,
    ) {
        let Some(notifier) = adapter.processing_status() else {
            return;
        };
        let handle = handle.unwrap_or_default();
        let call = async {
            if failed {
                notifier.processing_failed(config, info, &handle).await
            } else {
                notifier.processing_completed(config, info, &handle).await
            }
        };
        match tokio::time::timeout(self.settings.status_notify_timeout, call).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    channel = %msg_channel(config),
                    config_id = %config.id,
                    bot_id = %info.bot_id,
                    failed,
                    error = %e,
                    "processing-status notification failed"
                );
            }
            Err(_) => {
                tracing::warn!(
                    channel = %msg_channel(config),
                    config_id = %config.id,
                    bot_id = %info.bot_id,
                    failed,
                    "processing-status notification timed out"
                );
            }
        }
    }

    /// Builds one reply message, or `None` when the text is empty, declined
    /// via `NO_REPLY`, or duplicates a tool-sent text.
    fn build_reply(
        &self,
        text: &str,
        caps: &Capabilities,
        tool_texts: &[String],
        reply: &Option<ReplyRef>,
    ) -> Option<Message> {
        let trimmed = text.trim();
        if trimmed.is_empty() || reply::is_no_reply(trimmed) {
            return None;
        }
        if reply::duplicates_tool_text(trimmed, tool_texts) {
            return None;
        }
        let format = if (caps.markdown || caps.rich_text) && reply::looks_like_markdown(trimmed) {
            Format::Markdown
        } else {
            Format::Plain
        };
        let mut message = Message {
            format: Some(format),
            text: trimmed.to_string(),
            ..Message::default()
        };
        if message.reply.is_none() {
            message.reply = reply.clone();
        }
        Some(message)
    }

    /// True when a `send_message` call already answered on this platform and
    /// target; the engine has spoken, so channel replies are suppressed.
    fn tool_answered_here(
        &self,
        calls: &[reply::SendMessageCall],
        msg: &InboundMessage,
        sender: &StreamReplySender,
        reply_target: &Target,
    ) -> bool {
        let normalize = |target: &Target| match sender.adapter().target_resolver() {
            Some(r) => r.normalize_target(target),
            None => target.clone(),
        };
        let here = normalize(reply_target);
        calls.iter().any(|call| {
            let same_platform = call
                .platform
                .as_deref()
                .map(|p| crate::descriptor::ChannelType::new(p) == msg.channel)
                .unwrap_or(false);
            let same_target = call
                .target
                .as_deref()
                .map(|t| normalize(&Target::new(t)).id == here.id)
                .unwrap_or(false);
            same_platform && same_target
        })
    }
}

fn msg_channel(config: &ChannelConfig) -> &crate::descriptor::ChannelType {
    &config.channel_type
}

#[async_trait]
impl InboundProcessor for Processor {
    async fn process(
        &self,
        config: Arc<ChannelConfig>,
        msg: InboundMessage,
        sender: StreamReplySender,
    ) -> Result<(), ChannelError> {
        // 1. Query text; empty queries are dropped outright.
        let query = reply::build_query(&msg.message);
        if query.is_empty() {
            tracing::debug!(
                channel = %msg.channel,
                config_id = %config.id,
                "empty query, dropping inbound"
            );
            return Ok(());
        }

        // 2. Identity (pre-resolved by the middleware when present).
        let identity = match msg.identity.clone() {
            Some(identity) => identity,
            None => match self.resolver.resolve(&config, &msg).await? {
                Resolution::Pass(identity) => identity,
                Resolution::Stop(decision) => {
                    if let Some(reply_msg) = decision.reply {
                        let target = msg
                            .reply_target
                            .clone()
                            .unwrap_or_else(|| Target::new(&msg.conversation.id));
                        sender.send(&target, reply_msg).await?;
                    }
                    return Ok(());
                }
            },
        };

        // 3. Route; history container is bot-centric so cross-platform
        // history stays unified.
        let route = self
            .routes
            .resolve_conversation(&ResolveInput {
                bot_id: identity.bot_id.clone(),
                platform: msg.channel.clone(),
                conversation_id: msg.conversation.id.clone(),
                thread_id: msg.conversation.thread_id.clone(),
                conversation_kind: msg.conversation.kind.clone(),
                channel_identity_id: identity.channel_identity_id.clone(),
                channel_config_id: identity.channel_config_id.clone(),
                reply_target: msg.reply_target.clone(),
            })
            .await?;
        let active_chat_id = identity.bot_id.clone();

        // 4. Trigger test; untriggered messages are history-only.
        if !self.should_reply(&msg, &identity) {
            self.persist_user_message(&msg, &route, &query, trigger_mode::PASSIVE_SYNC)
                .await?;
            return Ok(());
        }

        // 5. Persist before the engine call so it does not double-store.
        self.persist_user_message(&msg, &route, &query, trigger_mode::ACTIVE_CHAT)
            .await?;

        // 6. Tokens.
        let reply_target = msg
            .reply_target
            .clone()
            .unwrap_or_else(|| Target::new(&msg.conversation.id));
        let chat_token = {
            let claims = ChatTokenClaims {
                bot_id: identity.bot_id.clone(),
                chat_id: active_chat_id.clone(),
                route_id: route.route_id.clone(),
                user_id: identity.user_id.clone(),
                channel_identity_id: identity.channel_identity_id.clone(),
            };
            match self
                .tokens
                .mint_chat_token(&claims, self.settings.token_ttl)
                .await
            {
                Ok(token) => Some(token),
                Err(e) => {
                    tracing::warn!(
                        channel = %msg.channel,
                        bot_id = %identity.bot_id,
                        user_id = %identity.user_id,
                        error = %e,
                        "chat token minting failed"
                    );
                    None
                }
            }
        };
        let bearer_token = match self.tokens.mint_user_token(&identity.user_id).await {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::debug!(
                    user_id = %identity.user_id,
                    error = %e,
                    "user token unavailable, falling back to chat token"
                );
                chat_token.clone()
            }
        };

        // 7. Processing-status started (best-effort, bounded).
        let status_info = ProcessingStatusInfo {
            bot_id: identity.bot_id.clone(),
            chat_id: active_chat_id.clone(),
            route_id: route.route_id.clone(),
            reply_target: Some(reply_target.clone()),
            source_message_id: msg.message.id.clone(),
        };
        let status_handle = self
            .notify_started(sender.adapter().as_ref(), &config, &status_info)
            .await;

        // 8. Stream session.
        let source_message_id = msg.message.id.clone();
        let reply_ref = ReplyRef {
            target: reply_target.clone(),
            message_id: source_message_id.clone().unwrap_or_default(),
        };
        let mut session = sender
            .open_stream(
                msg.session_id(),
                &reply_target,
                StreamOptions {
                    reply: Some(reply_ref.clone()),
                    source_message_id: source_message_id.clone(),
                    metadata: msg.metadata.clone(),
                },
            )
            .await?;
        session.start().await?;

        // 9. Engine stream.
        let mut request_metadata = Map::new();
        request_metadata.insert("platform".to_string(), json!(msg.channel.as_str()));
        request_metadata.insert(
            "conversation_kind".to_string(),
            json!(msg.conversation.kind),
        );
        let request = ChatRequest {
            bot_id: identity.bot_id.clone(),
            chat_id: active_chat_id.clone(),
            route_id: route.route_id.clone(),
            session_id: msg.session_id(),
            user_id: identity.user_id.clone(),
            channel_identity_id: identity.channel_identity_id.clone(),
            query,
            bearer_token,
            chat_token,
            user_message_persisted: true,
            metadata: request_metadata,
        };

        let chunks = match self.runner.stream_chat(request).await {
            Ok(chunks) => chunks,
            Err(e) => {
                let _ = session.fail(e.to_string()).await;
                self.notify_outcome(
                    sender.adapter().as_ref(),
                    &config,
                    &status_info,
                    status_handle,
                    true,
                )
                .await;
                return Err(e);
            }
        };

        let mut chunks = ReceiverStream::new(chunks);
        let mut transcript: Vec<Value> = Vec::new();
        let mut engine_error: Option<ChannelError> = None;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    if let Some(messages) = chunk.messages {
                        transcript = messages;
                    }
                    match chunk.kind.as_str() {
                        chunk_kind::TEXT_DELTA if !chunk.delta.is_empty() => {
                            if let Err(e) = session.push_delta(chunk.delta, None).await {
                                tracing::warn!(
                                    channel = %msg.channel,
                                    config_id = %config.id,
                                    error = %e,
                                    "delta push failed"
                                );
                            }
                        }
                        chunk_kind::REASONING_DELTA if !chunk.delta.is_empty() => {
                            let phase = Some(crate::stream::StreamEvent::PHASE_REASONING.to_string());
                            if let Err(e) = session.push_delta(chunk.delta, phase).await {
                                tracing::warn!(
                                    channel = %msg.channel,
                                    config_id = %config.id,
                                    error = %e,
                                    "reasoning delta push failed"
                                );
                            }
                        }
                        chunk_kind::ERROR => {
                            engine_error = Some(ChannelError::Engine(chunk.error));
                            break;
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    engine_error = Some(e);
                    break;
                }
            }
        }

        // 10. Engine failure: error event, failed notification, original error
        // returned — the notifier can never shadow it.
        if let Some(e) = engine_error {
            let _ = session.fail(e.to_string()).await;
            self.notify_outcome(
                sender.adapter().as_ref(),
                &config,
                &status_info,
                status_handle,
                true,
            )
            .await;
            return Err(e);
        }

        // 11. Silent-reply detection.
        let tool_calls = reply::send_message_calls(&transcript);
        let tool_texts: Vec<String> = tool_calls
            .iter()
            .map(|c| c.text.clone())
            .filter(|t| !t.trim().is_empty())
            .collect();
        if self.tool_answered_here(&tool_calls, &msg, &sender, &reply_target) {
            tracing::debug!(
                channel = %msg.channel,
                config_id = %config.id,
                "engine already replied via send_message, suppressing"
            );
            session.complete().await?;
            self.notify_outcome(
                sender.adapter().as_ref(),
                &config,
                &status_info,
                status_handle,
                false,
            )
            .await;
            return Ok(());
        }

        // 12–13. Reply filtering and final events.
        let caps = sender.adapter().descriptor().capabilities;
        let reply_ref = Some(reply_ref);
        for text in reply::extract_assistant_texts(&transcript) {
            if let Some(message) = self.build_reply(&text, &caps, &tool_texts, &reply_ref) {
                session.push_final(message).await?;
            }
        }
        session.complete().await?;
        self.notify_outcome(
            sender.adapter().as_ref(),
            &config,
            &status_info,
            status_handle,
            false,
        )
        .await;
        Ok(())
    }
}
