//! Standard inbound middleware: resolve the sender before processing.
//!
//! Stops policy-rejected messages at the chain (emitting the decision reply
//! when one exists) and attaches the resolved [`InboundIdentity`] for the
//! processor.

use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatch::{InboundMiddleware, NextHandler};
use crate::error::ChannelError;
use crate::identity::{IdentityResolver, Resolution};
use crate::message::inbound::InboundMessage;
use crate::registry::Registry;
use crate::store::ChannelConfig;
use crate::stream::StreamReplySender;

pub struct IdentityMiddleware {
    resolver: Arc<IdentityResolver>,
    registry: Arc<Registry>,
}

impl IdentityMiddleware {
    pub fn new(resolver: Arc<IdentityResolver>, registry: Arc<Registry>) -> Self {
        Self { resolver, registry }
    }
}

#[async_trait]
impl InboundMiddleware for IdentityMiddleware {
    async fn around_handle(
        &self,
        config: Arc<ChannelConfig>,
        mut message: InboundMessage,
        inner: NextHandler,
    ) -> Result<(), ChannelError> {
        match self.resolver.resolve(&config, &message).await? {
            Resolution::Pass(identity) => {
                message.identity = Some(identity);
                inner(config, message).await
            }
            Resolution::Stop(decision) => {
                if let Some(reply) = decision.reply {
                    let target = message
                        .reply_target
                        .clone()
                        .unwrap_or_else(|| crate::message::Target::new(&message.conversation.id));
                    if let Some(adapter) = self.registry.get(&message.channel) {
                        let sender = StreamReplySender::new(adapter, config.clone(), None);
                        if let Err(e) = sender.send(&target, reply).await {
                            tracing::warn!(
                                channel = %message.channel,
                                config_id = %config.id,
                                bot_id = %message.bot_id,
                                error = %e,
                                "failed to deliver policy reply"
                            );
                        }
                    }
                } else {
                    tracing::debug!(
                        channel = %message.channel,
                        config_id = %config.id,
                        bot_id = %message.bot_id,
                        "inbound dropped by identity policy"
                    );
                }
                Ok(())
            }
        }
    }
}
