// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Endpoints
//!
//! Turn broker deliveries into messages on an internal channel. In adapter
//! mode the delivery is acknowledged once the channel accepted the message.
//! In gateway mode the endpoint also waits for a reply on a temporary
//! pollable channel, named in the `replyChannel` header, and publishes it to
//! the delivery's `reply_to` queue.

use super::{component_type, EndpointConfig};
use crate::{
    broker::{BrokerConnection, ConnectionFactory, Delivery},
    channel::{ChannelKind, ChannelRegistry},
    config::ContainerConfig,
    container::{ConsumerContainer, DeliveryListener},
    errors::IntegrationError,
    events::{EventStream, IntegrationEvent},
    flow::Lifecycle,
    header_mapper, history,
    message::{headers, Message},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

struct InboundListener {
    config: EndpointConfig,
    registry: ChannelRegistry,
    events: EventStream,
}

fn inbound_type(config: &EndpointConfig) -> &'static str {
    if config.gateway {
        component_type::INBOUND_GATEWAY
    } else {
        component_type::INBOUND_CHANNEL_ADAPTER
    }
}

impl InboundListener {
    /// Sends the request downstream and waits for its reply.
    ///
    /// The send runs to completion: subscribers of direct and pub-sub
    /// channels are never cut short. Only what is left of the reply timeout
    /// is spent waiting on the reply channel, and a reply that only arrives
    /// after the timeout elapsed is discarded.
    async fn exchange(&self, request: Message) -> Result<Message, IntegrationError> {
        let reply_name = format!("{}.reply.{}", self.config.id, Uuid::new_v4());
        let reply_channel = self
            .registry
            .declare(&reply_name, ChannelKind::queue(1))
            .await?;
        let request = request.with_header(headers::REPLY_CHANNEL, reply_name.as_str());

        let started = Instant::now();
        let exchanged = async {
            self.registry.send(&self.config.channel, request).await?;
            match self
                .config
                .reply_timeout()
                .checked_sub(started.elapsed())
                .filter(|remaining| !remaining.is_zero())
            {
                Some(remaining) => reply_channel.receive(remaining).await,
                None => Ok(None),
            }
        }
        .await;
        self.registry.remove(&reply_name).await;

        match exchanged {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(IntegrationError::GatewayTimeoutError(
                self.config.reply_timeout_ms,
            )),
            Err(err) => Err(err),
        }
    }

    async fn reply(
        &self,
        reply: &Message,
        delivery: &Delivery,
        conn: &dyn BrokerConnection,
    ) -> Result<(), IntegrationError> {
        let Some(reply_to) = delivery.properties.reply_to.as_deref() else {
            warn!(endpoint = self.config.id, "request without reply_to, discarding reply");
            return Ok(());
        };

        let (body, mut props) = header_mapper::to_wire(reply)?;
        props.correlation_id = header_mapper::correlation_of(&delivery.properties);
        conn.publish("", reply_to, &body, &props).await?;
        debug!(endpoint = self.config.id, reply_to = reply_to, "reply published");
        Ok(())
    }
}

#[async_trait]
impl DeliveryListener for InboundListener {
    async fn on_delivery(
        &self,
        delivery: &Delivery,
        conn: &dyn BrokerConnection,
    ) -> Result<(), IntegrationError> {
        let message = history::record(
            &header_mapper::to_message(delivery),
            &self.config.id,
            inbound_type(&self.config),
        );

        if !self.config.gateway {
            return self.registry.send(&self.config.channel, message).await;
        }

        match self.exchange(message).await {
            Ok(reply) => self.reply(&reply, delivery, conn).await,
            Err(IntegrationError::GatewayTimeoutError(timeout_ms)) => {
                warn!(
                    endpoint = self.config.id,
                    timeout_ms = timeout_ms,
                    "no reply received in time, acknowledging request"
                );
                self.events.emit(IntegrationEvent::GatewayTimeout {
                    component: self.config.id.clone(),
                    timeout_ms,
                });
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// An inbound channel adapter or gateway bound to a listener container.
pub struct InboundEndpoint {
    config: EndpointConfig,
    container: Arc<ConsumerContainer>,
}

impl InboundEndpoint {
    /// Uses a container configured beforehand; its listener is replaced.
    pub fn with_container(
        config: EndpointConfig,
        registry: ChannelRegistry,
        container: Arc<ConsumerContainer>,
    ) -> Result<InboundEndpoint, IntegrationError> {
        config.validate()?;
        let listener = InboundListener {
            config: config.clone(),
            events: registry.events().clone(),
            registry,
        };
        container.set_listener(Arc::new(listener))?;

        Ok(InboundEndpoint { config, container })
    }

    /// Builds a container named after the endpoint for the given queues.
    pub fn from_factory(
        config: EndpointConfig,
        registry: ChannelRegistry,
        factory: Arc<dyn ConnectionFactory>,
        queues: Vec<QueueDefinition>,
        container_config: ContainerConfig,
    ) -> Result<InboundEndpoint, IntegrationError> {
        let container = Arc::new(ConsumerContainer::new(
            &format!("{}.container", config.id),
            container_config,
            factory,
            registry.events().clone(),
        ));
        container.set_queues(queues)?;
        InboundEndpoint::with_container(config, registry, container)
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn component_type(&self) -> &'static str {
        inbound_type(&self.config)
    }

    pub fn container(&self) -> &Arc<ConsumerContainer> {
        &self.container
    }
}

#[async_trait]
impl Lifecycle for InboundEndpoint {
    fn name(&self) -> &str {
        &self.config.id
    }

    async fn start(&self) -> Result<(), IntegrationError> {
        self.container.start().await
    }

    async fn stop(&self) -> Result<(), IntegrationError> {
        self.container.stop().await
    }

    fn is_running(&self) -> bool {
        self.container.is_running()
    }
}
