// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Registry
//!
//! Process-scoped map of named channels shared by every endpoint of a flow.
//! Lookups create missing channels; when several tasks race to create the same
//! name, one wins and all of them get its instance.

use super::{ChannelKind, MessageChannel};
use crate::{errors::IntegrationError, events::EventStream, message::Message};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::debug;

struct RegistryInner {
    channels: RwLock<HashMap<String, MessageChannel>>,
    default_kind: ChannelKind,
    events: EventStream,
}

/// Named channels of an integration flow.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    /// Registry creating direct channels for undeclared names.
    pub fn new(events: EventStream) -> ChannelRegistry {
        ChannelRegistry::with_default_kind(ChannelKind::Direct, events)
    }

    /// Registry creating channels of `default_kind` for undeclared names.
    ///
    /// # Parameters
    /// * `default_kind` - Kind used by [`ChannelRegistry::channel`] when the name is unknown
    /// * `events` - Stream shared by every channel of the registry
    pub fn with_default_kind(default_kind: ChannelKind, events: EventStream) -> ChannelRegistry {
        ChannelRegistry {
            inner: Arc::new(RegistryInner {
                channels: RwLock::new(HashMap::default()),
                default_kind,
                events,
            }),
        }
    }

    pub fn events(&self) -> &EventStream {
        &self.inner.events
    }

    /// Returns the channel, creating it with the default kind when missing.
    ///
    /// # Parameters
    /// * `name` - Channel name
    ///
    /// # Returns
    /// The registered channel, or [`IntegrationError::ConfigurationError`] when
    /// the default kind cannot be built.
    pub async fn channel(&self, name: &str) -> Result<MessageChannel, IntegrationError> {
        self.declare(name, self.inner.default_kind.clone()).await
    }

    /// Returns the channel, creating it with `kind` when missing. An existing
    /// channel is returned as is, whatever its kind.
    ///
    /// # Parameters
    /// * `name` - Channel name
    /// * `kind` - Kind of the channel when it has to be created
    ///
    /// # Returns
    /// The registered channel. A queue kind without capacity is rejected with
    /// [`IntegrationError::ConfigurationError`] and nothing is registered.
    pub async fn declare(
        &self,
        name: &str,
        kind: ChannelKind,
    ) -> Result<MessageChannel, IntegrationError> {
        if let Some(existing) = self.inner.channels.read().await.get(name) {
            return Ok(existing.clone());
        }
        if let ChannelKind::Queue { capacity: 0, .. } = kind {
            return Err(IntegrationError::ConfigurationError(format!(
                "queue channel '{name}' needs a capacity of at least 1"
            )));
        }

        let mut channels = self.inner.channels.write().await;
        let channel = channels
            .entry(name.to_owned())
            .or_insert_with(|| {
                debug!(channel = name, kind = ?kind, "creating channel");
                MessageChannel::new(name, kind, self.inner.events.clone())
            })
            .clone();
        Ok(channel)
    }

    /// Looks up a channel without creating it.
    ///
    /// # Returns
    /// `None` when no channel is registered under `name`.
    pub async fn get(&self, name: &str) -> Option<MessageChannel> {
        self.inner.channels.read().await.get(name).cloned()
    }

    /// Unregisters a channel.
    ///
    /// # Returns
    /// The removed channel, if one was registered.
    pub async fn remove(&self, name: &str) -> Option<MessageChannel> {
        self.inner.channels.write().await.remove(name)
    }

    /// Sorted names of the registered channels.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drops every channel; handles held elsewhere stay usable but are no
    /// longer reachable by name.
    pub async fn clear(&self) {
        self.inner.channels.write().await.clear();
        debug!("channel registry cleared");
    }

    /// Sends to the named channel, creating it with the default kind when missing.
    ///
    /// # Parameters
    /// * `name` - Channel name
    /// * `message` - Message to send
    ///
    /// # Returns
    /// The outcome of [`MessageChannel::send`].
    pub async fn send(&self, name: &str, message: Message) -> Result<(), IntegrationError> {
        self.channel(name).await?.send(message).await
    }

    /// Receives from the named pollable channel.
    ///
    /// # Parameters
    /// * `name` - Channel name
    /// * `timeout` - Longest time to wait for a message
    ///
    /// # Returns
    /// `Ok(None)` when nothing arrived within `timeout`.
    pub async fn receive(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Message>, IntegrationError> {
        self.channel(name).await?.receive(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_return_same_instance_to_racing_callers() {
        let registry = ChannelRegistry::new(EventStream::new());

        let mut tasks = vec![];
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.declare("shared", ChannelKind::queue(8)).await.unwrap()
            }));
        }

        let mut channels = vec![];
        for task in tasks {
            channels.push(task.await.unwrap());
        }
        assert!(channels.windows(2).all(|w| w[0].same_as(&w[1])));
        assert_eq!(registry.names().await, ["shared"]);
    }

    #[tokio::test]
    async fn should_keep_first_declared_kind() {
        let registry = ChannelRegistry::new(EventStream::new());
        let queue = registry.declare("c", ChannelKind::queue(2)).await.unwrap();
        let again = registry.channel("c").await.unwrap();

        assert!(again.same_as(&queue));
        assert!(again.is_pollable());
        assert_eq!(registry.channel("other").await.unwrap().kind(), &ChannelKind::Direct);
    }

    #[tokio::test]
    async fn should_send_and_receive_by_name() {
        let registry = ChannelRegistry::with_default_kind(ChannelKind::queue(4), EventStream::new());
        registry.send("out", Message::new("hello")).await.unwrap();

        let received = registry
            .receive("out", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload().as_text().unwrap(), "hello");
    }

    #[tokio::test]
    async fn should_forget_channels_on_remove_and_clear() {
        let registry = ChannelRegistry::new(EventStream::new());
        let first = registry.channel("a").await.unwrap();
        registry.channel("b").await.unwrap();

        assert!(registry.remove("a").await.is_some());
        assert!(!registry.channel("a").await.unwrap().same_as(&first));

        registry.clear().await;
        assert!(registry.names().await.is_empty());
        assert!(registry.get("b").await.is_none());
    }

    #[tokio::test]
    async fn should_reject_queue_channels_without_capacity() {
        let registry = ChannelRegistry::new(EventStream::new());

        let result = registry.declare("z", ChannelKind::fail_fast_queue(0)).await;

        assert!(matches!(result, Err(IntegrationError::ConfigurationError(_))));
        assert!(registry.get("z").await.is_none());

        let registry = ChannelRegistry::with_default_kind(ChannelKind::queue(0), EventStream::new());
        let sent = registry.send("out", Message::new("lost")).await;
        assert!(matches!(sent, Err(IntegrationError::ConfigurationError(_))));
        assert!(registry.names().await.is_empty());
    }
}
