// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Internal Message Channels
//!
//! Channels connect endpoints inside an integration flow. Three kinds exist:
//! - queue channels: bounded, pollable; receivers pull with a timeout
//! - direct channels: point-to-point, one subscriber per message (round-robin),
//!   invoked in the sender's task
//! - publish-subscribe channels: every subscriber, invoked in the sender's task

pub mod registry;

pub use registry::ChannelRegistry;

use crate::{
    errors::IntegrationError,
    events::{EventStream, IntegrationEvent},
    message::Message,
};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Consumes messages delivered by a subscribable channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<(), IntegrationError>;
}

/// What a queue channel does when it is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FullPolicy {
    /// Wait for room, up to the channel's send timeout when one is set.
    #[default]
    Block,
    /// Fail the send with `ChannelFullError`.
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelKind {
    Queue {
        capacity: usize,
        when_full: FullPolicy,
        send_timeout_ms: Option<u64>,
    },
    #[default]
    Direct,
    PublishSubscribe,
}

impl ChannelKind {
    /// Blocking queue channel without a send timeout.
    pub fn queue(capacity: usize) -> ChannelKind {
        ChannelKind::Queue {
            capacity,
            when_full: FullPolicy::Block,
            send_timeout_ms: None,
        }
    }

    /// Queue channel rejecting sends once full.
    pub fn fail_fast_queue(capacity: usize) -> ChannelKind {
        ChannelKind::Queue {
            capacity,
            when_full: FullPolicy::Fail,
            send_timeout_ms: None,
        }
    }
}

pub type SubscriptionId = u64;

struct QueueChannel {
    when_full: FullPolicy,
    send_timeout: Option<Duration>,
    sender: mpsc::Sender<Message>,
    receiver: Mutex<mpsc::Receiver<Message>>,
}

#[derive(Default)]
struct Subscribers {
    handlers: RwLock<Vec<(SubscriptionId, Arc<dyn MessageHandler>)>>,
    next_id: AtomicU64,
    next_handler: AtomicUsize,
}

impl Subscribers {
    fn snapshot(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| h.clone())
            .collect()
    }
}

enum Flavor {
    Queue(QueueChannel),
    Direct(Subscribers),
    PublishSubscribe(Subscribers),
}

struct ChannelInner {
    name: String,
    kind: ChannelKind,
    events: EventStream,
    flavor: Flavor,
}

/// Handle to a named channel; clones share the same channel.
#[derive(Clone)]
pub struct MessageChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl MessageChannel {
    /// Queue kinds must have a non-zero capacity; [`ChannelRegistry::declare`]
    /// rejects the others before they get here.
    pub(crate) fn new(name: &str, kind: ChannelKind, events: EventStream) -> MessageChannel {
        let flavor = match &kind {
            ChannelKind::Queue {
                capacity,
                when_full,
                send_timeout_ms,
            } => {
                let (sender, receiver) = mpsc::channel(*capacity);
                Flavor::Queue(QueueChannel {
                    when_full: *when_full,
                    send_timeout: send_timeout_ms.map(Duration::from_millis),
                    sender,
                    receiver: Mutex::new(receiver),
                })
            }
            ChannelKind::Direct => Flavor::Direct(Subscribers::default()),
            ChannelKind::PublishSubscribe => Flavor::PublishSubscribe(Subscribers::default()),
        };

        MessageChannel {
            inner: Arc::new(ChannelInner {
                name: name.to_owned(),
                kind,
                events,
                flavor,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.inner.kind
    }

    pub fn is_pollable(&self) -> bool {
        matches!(self.inner.flavor, Flavor::Queue(_))
    }

    /// Whether both handles point to the same channel.
    pub fn same_as(&self, other: &MessageChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn full(&self) -> IntegrationError {
        warn!(channel = self.inner.name, "channel is full");
        self.inner.events.emit(IntegrationEvent::ChannelFull {
            channel: self.inner.name.clone(),
        });
        IntegrationError::ChannelFullError(self.inner.name.clone())
    }

    fn closed(&self) -> IntegrationError {
        IntegrationError::InternalError(format!("channel `{}` is closed", self.inner.name))
    }

    /// Sends a message.
    ///
    /// Queue channels enqueue it (waiting or failing when full, per their
    /// [`FullPolicy`]); subscribable channels invoke their subscribers before
    /// returning.
    pub async fn send(&self, message: Message) -> Result<(), IntegrationError> {
        match &self.inner.flavor {
            Flavor::Queue(queue) => match (queue.when_full, queue.send_timeout) {
                (FullPolicy::Fail, _) => queue.sender.try_send(message).map_err(|err| match err {
                    mpsc::error::TrySendError::Full(_) => self.full(),
                    mpsc::error::TrySendError::Closed(_) => self.closed(),
                }),
                (FullPolicy::Block, None) => {
                    queue.sender.send(message).await.map_err(|_| self.closed())
                }
                (FullPolicy::Block, Some(timeout)) => {
                    match tokio::time::timeout(timeout, queue.sender.send(message)).await {
                        Ok(sent) => sent.map_err(|_| self.closed()),
                        Err(_) => Err(self.full()),
                    }
                }
            },
            Flavor::Direct(subscribers) => {
                let handlers = subscribers.snapshot();
                if handlers.is_empty() {
                    return Err(IntegrationError::NoSubscribersError(self.inner.name.clone()));
                }
                let index =
                    subscribers.next_handler.fetch_add(1, Ordering::Relaxed) % handlers.len();
                handlers[index].handle(message).await
            }
            Flavor::PublishSubscribe(subscribers) => {
                let mut first_error = None;
                for handler in subscribers.snapshot() {
                    if let Err(err) = handler.handle(message.clone()).await {
                        warn!(
                            error = err.to_string(),
                            channel = self.inner.name,
                            "subscriber failed"
                        );
                        first_error.get_or_insert(err);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    fn queue(&self, operation: &'static str) -> Result<&QueueChannel, IntegrationError> {
        match &self.inner.flavor {
            Flavor::Queue(queue) => Ok(queue),
            _ => Err(IntegrationError::UnsupportedChannelOperation(
                self.inner.name.clone(),
                operation,
            )),
        }
    }

    fn subscribers(&self, operation: &'static str) -> Result<&Subscribers, IntegrationError> {
        match &self.inner.flavor {
            Flavor::Direct(s) | Flavor::PublishSubscribe(s) => Ok(s),
            Flavor::Queue(_) => Err(IntegrationError::UnsupportedChannelOperation(
                self.inner.name.clone(),
                operation,
            )),
        }
    }

    /// Waits up to `timeout` for a message; `None` when none arrived.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>, IntegrationError> {
        let queue = self.queue("receive")?;
        let received = tokio::time::timeout(timeout, async {
            queue.receiver.lock().await.recv().await
        })
        .await;

        Ok(received.ok().flatten())
    }

    /// Takes a message if one is queued, without waiting.
    pub async fn try_receive(&self) -> Result<Option<Message>, IntegrationError> {
        let queue = self.queue("receive")?;
        let mut receiver = queue.receiver.lock().await;
        Ok(receiver.try_recv().ok())
    }

    /// Messages waiting in a queue channel; zero for other kinds.
    pub fn pending(&self) -> usize {
        match &self.inner.flavor {
            Flavor::Queue(queue) => queue.sender.max_capacity() - queue.sender.capacity(),
            _ => 0,
        }
    }

    pub fn subscribe(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, IntegrationError> {
        let subscribers = self.subscribers("subscribe")?;
        let id = subscribers.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        Ok(id)
    }

    /// Removes a subscriber; `false` when it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(subscribers) = self.subscribers("unsubscribe") else {
            return false;
        };
        let mut handlers = subscribers
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers("subscribe")
            .map(|s| s.snapshot().len())
            .unwrap_or_default()
    }
}
