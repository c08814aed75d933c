// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Endpoints
//!
//! Endpoints move messages between the broker and the internal channels, or
//! between internal channels. Every message passing an endpoint gets one
//! history entry naming the endpoint id and its component type.

pub mod activator;
pub mod file;
pub mod inbound;
pub mod outbound;

use crate::{
    channel::{MessageChannel, MessageHandler, SubscriptionId},
    errors::IntegrationError,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Component type strings recorded in message history.
pub mod component_type {
    pub const INBOUND_CHANNEL_ADAPTER: &str = "amqp:inbound-channel-adapter";
    pub const INBOUND_GATEWAY: &str = "amqp:inbound-gateway";
    pub const OUTBOUND_CHANNEL_ADAPTER: &str = "amqp:outbound-channel-adapter";
    pub const OUTBOUND_GATEWAY: &str = "amqp:outbound-gateway";
    pub const FILE_INBOUND_CHANNEL_ADAPTER: &str = "file:inbound-channel-adapter";
    pub const SERVICE_ACTIVATOR: &str = "service-activator";
}

const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5_000;
const POLL_WAIT: Duration = Duration::from_millis(500);

/// Configuration of an endpoint, fixed once the endpoint is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Name recorded in message history.
    pub id: String,
    /// Channel inbound endpoints send to, or outbound endpoints consume.
    pub channel: String,
    /// Request/reply mode.
    pub gateway: bool,
    pub reply_timeout_ms: u64,
    /// Where replies go when the message names no `replyChannel`.
    pub output_channel: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            id: String::default(),
            channel: String::default(),
            gateway: false,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            output_channel: None,
        }
    }
}

impl EndpointConfig {
    pub fn adapter(id: &str, channel: &str) -> EndpointConfig {
        EndpointConfig {
            id: id.to_owned(),
            channel: channel.to_owned(),
            ..Default::default()
        }
    }

    pub fn gateway(id: &str, channel: &str, reply_timeout_ms: u64) -> EndpointConfig {
        EndpointConfig {
            id: id.to_owned(),
            channel: channel.to_owned(),
            gateway: true,
            reply_timeout_ms,
            output_channel: None,
        }
    }

    pub fn with_output_channel(mut self, channel: &str) -> Self {
        self.output_channel = Some(channel.to_owned());
        self
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), IntegrationError> {
        if self.id.is_empty() || self.channel.is_empty() {
            return Err(IntegrationError::ConfigurationError(
                "endpoint id and channel are required".to_owned(),
            ));
        }
        Ok(())
    }
}

enum Consumption {
    Subscribed(MessageChannel, SubscriptionId),
    Polling(CancellationToken, JoinHandle<()>),
}

/// Feeds a channel's messages to a handler: subscribes to subscribable
/// channels and polls pollable ones from a background task.
pub(crate) struct ChannelConsumer {
    endpoint: String,
    active: AtomicBool,
    state: Mutex<Option<Consumption>>,
}

impl ChannelConsumer {
    pub(crate) fn new(endpoint: &str) -> ChannelConsumer {
        ChannelConsumer {
            endpoint: endpoint.to_owned(),
            active: AtomicBool::new(false),
            state: Mutex::new(None),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) async fn start(
        &self,
        channel: MessageChannel,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), IntegrationError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        if !channel.is_pollable() {
            let id = channel.subscribe(handler)?;
            debug!(endpoint = self.endpoint, channel = channel.name(), "subscribed");
            *state = Some(Consumption::Subscribed(channel, id));
            self.active.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let token = token.clone();
            let endpoint = self.endpoint.clone();
            async move {
                loop {
                    let received = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        received = channel.receive(POLL_WAIT) => received,
                    };

                    match received {
                        Ok(Some(message)) => {
                            if let Err(err) = handler.handle(message).await {
                                error!(
                                    error = err.to_string(),
                                    endpoint = endpoint,
                                    "failure to handle polled message"
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            error!(error = err.to_string(), endpoint = endpoint, "polling stopped");
                            break;
                        }
                    }
                }
            }
        });

        debug!(endpoint = self.endpoint, "polling started");
        *state = Some(Consumption::Polling(token, task));
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        let taken = self.state.lock().await.take();
        self.active.store(false, Ordering::SeqCst);
        match taken {
            Some(Consumption::Subscribed(channel, id)) => {
                channel.unsubscribe(id);
            }
            Some(Consumption::Polling(token, task)) => {
                token.cancel();
                if let Err(err) = task.await {
                    error!(error = err.to_string(), endpoint = self.endpoint, "poller failed");
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{ChannelKind, ChannelRegistry},
        events::EventStream,
        message::Message,
    };
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Collect(StdMutex<Vec<String>>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, message: Message) -> Result<(), IntegrationError> {
            let text = message.payload().as_text().unwrap_or_default().into_owned();
            self.0.lock().unwrap().push(text);
            Ok(())
        }
    }

    #[test]
    fn should_default_reply_timeout() {
        let cfg: EndpointConfig = serde_json::from_str(r#"{"id":"in","channel":"c"}"#).unwrap();
        assert_eq!(cfg.reply_timeout(), Duration::from_secs(5));
        assert!(!cfg.gateway);
        assert!(cfg.validate().is_ok());
        assert!(EndpointConfig::default().validate().is_err());
    }

    #[tokio::test]
    async fn should_poll_pollable_channels_until_stopped() {
        let registry = ChannelRegistry::new(EventStream::new());
        let channel = registry.declare("queue", ChannelKind::queue(4)).await.unwrap();
        let collect = Arc::new(Collect::default());
        let consumer = ChannelConsumer::new("poller");

        consumer.start(channel.clone(), collect.clone()).await.unwrap();
        channel.send(Message::new("one")).await.unwrap();
        for _ in 0..100 {
            if !collect.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*collect.0.lock().unwrap(), ["one"]);

        consumer.stop().await;
        assert!(!consumer.is_active());
        channel.send(Message::new("two")).await.unwrap();
        assert_eq!(channel.pending(), 1);
    }

    #[tokio::test]
    async fn should_subscribe_to_subscribable_channels() {
        let registry = ChannelRegistry::new(EventStream::new());
        let channel = registry.channel("direct").await.unwrap();
        let collect = Arc::new(Collect::default());
        let consumer = ChannelConsumer::new("subscriber");

        consumer.start(channel.clone(), collect.clone()).await.unwrap();
        assert!(consumer.is_active());
        assert_eq!(channel.subscriber_count(), 1);
        channel.send(Message::new("now")).await.unwrap();
        assert_eq!(*collect.0.lock().unwrap(), ["now"]);

        consumer.stop().await;
        assert_eq!(channel.subscriber_count(), 0);
    }
}
