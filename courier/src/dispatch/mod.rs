//! Inbound dispatch: bounded queue, worker pool, middleware chain.
//!
//! Adapters hand messages in via a non-blocking enqueue — the webhook (or
//! gateway) context never extends into processing, and a full queue surfaces
//! as [`ChannelError::QueueFull`] backpressure. N workers drain the queue and
//! run the handler chain; one failing message never blocks the next.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::ChannelError;
use crate::message::inbound::InboundMessage;
use crate::store::ChannelConfig;

/// Future returned by inbound handlers.
pub type InboundFuture = Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send>>;

/// Handler for one inbound message. Cloneable so every connection and worker
/// can hold the chain.
pub type InboundHandler = Arc<dyn Fn(Arc<ChannelConfig>, InboundMessage) -> InboundFuture + Send + Sync>;

/// The inner handler passed to middleware; call it to continue the chain.
pub type NextHandler = Box<dyn FnOnce(Arc<ChannelConfig>, InboundMessage) -> InboundFuture + Send>;

/// Async middleware wrapping inbound handling (around pattern): decide when to
/// call `inner`, mutate the message, swallow or map errors.
#[async_trait]
pub trait InboundMiddleware: Send + Sync {
    async fn around_handle(
        &self,
        config: Arc<ChannelConfig>,
        message: InboundMessage,
        inner: NextHandler,
    ) -> Result<(), ChannelError>;
}

/// Applies the middleware slice around `handler`, outermost first: the first
/// registered middleware sees the message first.
pub fn wrap_handler(
    handler: InboundHandler,
    middlewares: &[Arc<dyn InboundMiddleware>],
) -> InboundHandler {
    let mut wrapped = handler;
    for middleware in middlewares.iter().rev() {
        let middleware = Arc::clone(middleware);
        let inner = Arc::clone(&wrapped);
        wrapped = Arc::new(move |config, message| {
            let middleware = Arc::clone(&middleware);
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                let next: NextHandler = Box::new(move |c, m| inner(c, m));
                middleware.around_handle(config, message, next).await
            })
        });
    }
    wrapped
}

/// One queued inbound message.
pub struct Job {
    pub config: Arc<ChannelConfig>,
    pub message: InboundMessage,
}

/// Bounded inbound queue plus its worker pool.
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
    rx: std::sync::Mutex<Option<mpsc::Receiver<Job>>>,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    /// Non-blocking enqueue. A full queue returns
    /// [`ChannelError::QueueFull`] so the adapter can signal backpressure to
    /// the platform.
    pub fn enqueue(&self, config: Arc<ChannelConfig>, message: InboundMessage) -> Result<(), ChannelError> {
        self.tx
            .try_send(Job { config, message })
            .map_err(|_| ChannelError::QueueFull)
    }

    /// Spawns `workers` tasks draining the queue through `handler` until
    /// cancellation. May be called once; later calls are no-ops.
    pub fn start(
        &self,
        handler: InboundHandler,
        workers: usize,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) {
        let receiver = {
            let mut slot = self.rx.lock().expect("dispatcher poisoned");
            slot.take()
        };
        let Some(receiver) = receiver else {
            tracing::warn!("dispatcher already started");
            return;
        };
        let receiver = Arc::new(Mutex::new(receiver));
        for worker in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = cancel.cancelled() => break,
                        job = async { receiver.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else { break };
                    let channel = job.message.channel.clone();
                    let config_id = job.config.id.clone();
                    if let Err(e) = handler(job.config, job.message).await {
                        tracing::warn!(
                            worker,
                            channel = %channel,
                            config_id = %config_id,
                            error = %e,
                            "inbound handling failed"
                        );
                    }
                }
                tracing::debug!(worker, "inbound worker drained");
            });
        }
    }
}
