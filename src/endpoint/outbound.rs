// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outbound Endpoints
//!
//! Consume an internal channel and publish each message to the broker. In
//! gateway mode the endpoint waits for the broker reply and forwards it to the
//! message's `replyChannel`, or to the configured output channel.

use super::{component_type, ChannelConsumer, EndpointConfig};
use crate::{
    channel::{ChannelRegistry, MessageHandler},
    errors::IntegrationError,
    events::IntegrationEvent,
    flow::Lifecycle,
    header_mapper, history,
    message::{headers, Message},
    template::AmqpTemplate,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where outbound messages are published; messages may override both parts
/// with the `amqp_exchange` and `amqp_routingKey` headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTarget {
    pub exchange: String,
    pub routing_key: String,
}

impl PublishTarget {
    pub fn new(exchange: &str, routing_key: &str) -> PublishTarget {
        PublishTarget {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }

    /// Publishes straight to a queue through the default exchange.
    pub fn queue(name: &str) -> PublishTarget {
        PublishTarget::new("", name)
    }
}

struct OutboundHandler {
    config: EndpointConfig,
    target: PublishTarget,
    registry: ChannelRegistry,
    template: Arc<AmqpTemplate>,
}

impl OutboundHandler {
    fn component_type(&self) -> &'static str {
        if self.config.gateway {
            component_type::OUTBOUND_GATEWAY
        } else {
            component_type::OUTBOUND_CHANNEL_ADAPTER
        }
    }

    fn destination<'a>(&'a self, message: &'a Message) -> (&'a str, &'a str) {
        let (exchange, routing_key) = header_mapper::publish_overrides(message);
        (
            exchange.unwrap_or(&self.target.exchange),
            routing_key.unwrap_or(&self.target.routing_key),
        )
    }

    async fn request(&self, message: &Message) -> Result<Message, IntegrationError> {
        let request = history::record(message, &self.config.id, self.component_type());
        let (exchange, routing_key) = self.destination(&request);

        let reply = self
            .template
            .send_and_receive(exchange, routing_key, &request, self.config.reply_timeout())
            .await
            .inspect_err(|err| {
                if let IntegrationError::ReplyTimeoutError(timeout_ms) = err {
                    self.registry.events().emit(IntegrationEvent::ReplyTimeout {
                        component: self.config.id.clone(),
                        timeout_ms: *timeout_ms,
                    });
                }
            })?;

        let reply = header_mapper::to_message(&reply);
        Ok(history::record(&reply, &self.config.id, self.component_type()))
    }

    /// Forwards a reply to the request's reply channel or the output channel.
    async fn forward(&self, request: &Message, reply: Message) -> Result<(), IntegrationError> {
        if let Some(name) = request.header_str(headers::REPLY_CHANNEL) {
            let Some(channel) = self.registry.get(name).await else {
                warn!(
                    endpoint = self.config.id,
                    channel = name,
                    "reply channel is gone, discarding reply"
                );
                return Ok(());
            };
            let reply = reply.with_header(headers::REPLY_CHANNEL, name);
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

#[async_trait]
impl MessageHandler for OutboundHandler {
    async fn handle(&self, message: Message) -> Result<(), IntegrationError> {
        if self.config.gateway {
            let reply = self.request(&message).await?;
            return self.forward(&message, reply).await;
        }

        let message = history::record(&message, &self.config.id, self.component_type());
        let (exchange, routing_key) = self.destination(&message);
        self.template.send(exchange, routing_key, &message).await?;
        debug!(
            endpoint = self.config.id,
            exchange = exchange,
            routing_key = routing_key,
            "message published"
        );
        Ok(())
    }
}

/// An outbound channel adapter or gateway.
pub struct OutboundEndpoint {
    handler: Arc<OutboundHandler>,
    consumer: ChannelConsumer,
}

impl OutboundEndpoint {
    pub fn new(
        config: EndpointConfig,
        target: PublishTarget,
        registry: ChannelRegistry,
        template: Arc<AmqpTemplate>,
    ) -> Result<OutboundEndpoint, IntegrationError> {
        config.validate()?;
        Ok(OutboundEndpoint {
            consumer: ChannelConsumer::new(&config.id),
            handler: Arc::new(OutboundHandler {
                config,
                target,
                registry,
                template,
            }),
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.handler.config
    }

    pub fn component_type(&self) -> &'static str {
        self.handler.component_type()
    }

    /// Publishes a request and returns the reply, bypassing the channels.
    pub async fn request(&self, message: &Message) -> Result<Message, IntegrationError> {
        self.handler.request(message).await
    }

    /// Processes one message as if it came from the input channel.
    pub async fn handle(&self, message: Message) -> Result<(), IntegrationError> {
        self.handler.handle(message).await
    }
}

#[async_trait]
impl Lifecycle for OutboundEndpoint {
    fn name(&self) -> &str {
        &self.handler.config.id
    }

    async fn start(&self) -> Result<(), IntegrationError> {
        let channel = self.handler.registry.channel(&self.handler.config.channel).await?;
        self.consumer.start(channel, self.handler.clone()).await
    }

    async fn stop(&self) -> Result<(), IntegrationError> {
        self.consumer.stop().await;
        self.handler.template.close().await
    }

    fn is_running(&self) -> bool {
        self.consumer.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{memory::InMemoryBroker, BrokerConnection, ConnectionFactory, QueueDeclaration},
        channel::ChannelKind,
        config::BackoffConfig,
        events::EventStream,
    };
    use futures_util::StreamExt;
    use std::time::Duration;

    async fn setup(queues: &[&str]) -> (InMemoryBroker, ChannelRegistry, Arc<AmqpTemplate>) {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        for name in queues {
            conn.declare_queue(&QueueDeclaration {
                name: (*name).to_owned(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let template = AmqpTemplate::new("template", Arc::new(broker.clone()), BackoffConfig::default());
        (broker, ChannelRegistry::new(EventStream::new()), template)
    }

    fn echo(conn: Arc<dyn BrokerConnection>, queue: &'static str) {
        tokio::spawn(async move {
            let mut requests = conn.consume(queue, "echo").await.unwrap();
            while let Some(Ok(request)) = requests.next().await {
                let mut props = request.properties.clone();
                props.reply_to = None;
                let reply_to = request.properties.reply_to.clone().unwrap_or_default();
                let body = format!("re: {}", String::from_utf8_lossy(&request.body));
                conn.publish("", &reply_to, body.as_bytes(), &props).await.unwrap();
                conn.ack(request.delivery_tag).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn should_publish_with_history_and_header_overrides() {
        let (broker, registry, template) = setup(&["default", "override"]).await;
        let endpoint = OutboundEndpoint::new(
            EndpointConfig::adapter("out", "toBroker"),
            PublishTarget::queue("default"),
            registry.clone(),
            template,
        )
        .unwrap();
        endpoint.start().await.unwrap();

        registry.send("toBroker", Message::new("plain")).await.unwrap();
        registry
            .send(
                "toBroker",
                Message::new("routed").with_header(headers::AMQP_ROUTING_KEY, "override"),
            )
            .await
            .unwrap();

        let published = broker.ready_messages("default");
        assert_eq!(published.len(), 1);
        let wire = crate::broker::Delivery {
            delivery_tag: 1,
            exchange: String::default(),
            routing_key: "default".into(),
            redelivered: false,
            properties: published[0].1.clone(),
            body: published[0].0.clone(),
        };
        let history = history::read(&header_mapper::to_message(&wire));
        assert_eq!(
            history.last().unwrap().component_type,
            component_type::OUTBOUND_CHANNEL_ADAPTER
        );
        assert_eq!(broker.ready_count("override"), 1);
        endpoint.stop().await.unwrap();
    }

    #[tokio::test]
    async fn should_forward_gateway_replies_to_output_channel() {
        let (broker, registry, template) = setup(&["service"]).await;
        echo(broker.connect().await.unwrap(), "service");
        let replies = registry.declare("replies", ChannelKind::queue(4)).await.unwrap();
        let endpoint = OutboundEndpoint::new(
            EndpointConfig::gateway("gw", "requests", 2_000).with_output_channel("replies"),
            PublishTarget::queue("service"),
            registry.clone(),
            template,
        )
        .unwrap();
        endpoint.start().await.unwrap();

        registry.send("requests", Message::new("hi")).await.unwrap();

        let reply = replies.receive(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(reply.payload().as_text().unwrap(), "re: hi");
        let history = history::read(&reply);
        let names: Vec<_> = history.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["gw", "gw"]);
        endpoint.stop().await.unwrap();
    }

    #[tokio::test]
    async fn should_time_out_and_emit_event() {
        let (_broker, registry, template) = setup(&["nobody"]).await;
        let mut received = registry.events().subscribe();
        let endpoint = OutboundEndpoint::new(
            EndpointConfig::gateway("gw", "requests", 50),
            PublishTarget::queue("nobody"),
            registry.clone(),
            template,
        )
        .unwrap();

        let result = endpoint.request(&Message::new("anyone?")).await;
        assert_eq!(result, Err(IntegrationError::ReplyTimeoutError(50)));
        assert_eq!(
            received.recv().await.unwrap(),
            IntegrationEvent::ReplyTimeout {
                component: "gw".into(),
                timeout_ms: 50,
            }
        );
    }
}
