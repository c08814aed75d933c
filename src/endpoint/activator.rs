// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{component_type, ChannelConsumer, EndpointConfig};
use crate::{
    channel::{ChannelRegistry, MessageHandler},
    errors::IntegrationError,
    flow::Lifecycle,
    history,
    message::{headers, Message, Payload},
};
use async_trait::async_trait;
use std::{future::Future, marker::PhantomData, sync::Arc};
use tracing::{debug, warn};

/// Application logic invoked by a [`ServiceActivator`]. Returning `None`
/// ends the flow without a reply.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &Message) -> Result<Option<Payload>, IntegrationError>;
}

/// Adapts an async closure into a [`MessageProcessor`].
pub struct FnProcessor<F, Fut> {
    func: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnProcessor<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Payload>, IntegrationError>> + Send,
{
    pub fn new(func: F) -> FnProcessor<F, Fut> {
        FnProcessor {
            func,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> MessageProcessor for FnProcessor<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Payload>, IntegrationError>> + Send,
{
    async fn process(&self, message: &Message) -> Result<Option<Payload>, IntegrationError> {
        (self.func)(message.clone()).await
    }
}

struct ActivatorHandler {
    config: EndpointConfig,
    registry: ChannelRegistry,
    processor: Arc<dyn MessageProcessor>,
}

#[async_trait]
impl MessageHandler for ActivatorHandler {
    async fn handle(&self, message: Message) -> Result<(), IntegrationError> {
        let message = history::record(&message, &self.config.id, component_type::SERVICE_ACTIVATOR);
        let Some(payload) = self.processor.process(&message).await? else {
            debug!(endpoint = self.config.id, "processor returned no reply");
            return Ok(());
        };
        let reply = message.with_payload(payload);

        if let Some(name) = message.header_str(headers::REPLY_CHANNEL) {
            // temporary reply channels are removed once their gateway gives up
            let Some(channel) = self.registry.get(name).await else {
                warn!(
                    endpoint = self.config.id,
                    channel = name,
                    "reply channel is gone, discarding reply"
                );
                return Ok(());
            };
            return channel.send(reply).await;
        }

        match &self.config.output_channel {
            Some(output) => self.registry.send(output, reply).await,
            None => {
                warn!(endpoint = self.config.id, "no output channel, discarding reply");
                Ok(())
            }
        }
    }
}

/// Invokes a [`MessageProcessor`] for every message of its input channel.
pub struct ServiceActivator {
    handler: Arc<ActivatorHandler>,
    consumer: ChannelConsumer,
}

impl ServiceActivator {
    pub fn new(
        config: EndpointConfig,
        registry: ChannelRegistry,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<ServiceActivator, IntegrationError> {
        config.validate()?;
        Ok(ServiceActivator {
            consumer: ChannelConsumer::new(&config.id),
            handler: Arc::new(ActivatorHandler {
                config,
                registry,
                processor,
            }),
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.handler.config
    }
}

#[async_trait]
impl Lifecycle for ServiceActivator {
    fn name(&self) -> &str {
        &self.handler.config.id
    }

    async fn start(&self) -> Result<(), IntegrationError> {
        let channel = self.handler.registry.channel(&self.handler.config.channel).await?;
        self.consumer.start(channel, self.handler.clone()).await
    }

    async fn stop(&self) -> Result<(), IntegrationError> {
        self.consumer.stop().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.consumer.is_active()
    }
}
