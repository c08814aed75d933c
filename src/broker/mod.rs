// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability
//!
//! The narrow interface the containers, endpoints and templates use to talk to
//! a message broker. The crate never speaks the wire protocol itself:
//! [`amqp::AmqpConnectionFactory`] delegates to `lapin`, and
//! [`memory::InMemoryBroker`] provides the same capability inside the process.

pub mod amqp;
pub mod memory;

use crate::{
    config::BackoffConfig,
    errors::IntegrationError,
    exchange::ExchangeDefinition,
    message::Headers,
    queue::QueueExchangeBinding,
};
use async_trait::async_trait;
use backon::Retryable;
use futures_util::stream::BoxStream;
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// Number of times the broker dead-lettered a delivery, flattened from the
/// first entry of the `x-death` header.
pub const AMQP_HEADERS_X_DEATH_COUNT: &str = "x-death-count";

/// Broker metadata attached to a delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// AMQP `type` property
    pub kind: Option<String>,
    pub headers: Headers,
}

/// One unit of data received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: DeliveryProperties,
    pub body: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, IntegrationError>>;

/// Arguments a queue is declared with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub message_ttl: Option<i32>,
    pub max_length: Option<i32>,
    pub max_length_bytes: Option<i32>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

/// A single queue declaration, as sent to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub passive: bool,
    pub no_wait: bool,
    pub arguments: QueueArguments,
}

/// An open connection (with its channel) to the broker.
///
/// Delivery tags are scoped to the connection that received the delivery.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), IntegrationError>;

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), IntegrationError>;

    async fn bind_queue(&self, binding: &QueueExchangeBinding) -> Result<(), IntegrationError>;

    /// Limits unacknowledged deliveries pushed to this connection.
    async fn qos(&self, prefetch_count: u16) -> Result<(), IntegrationError>;

    /// Starts a push consumer on the queue.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, IntegrationError>;

    /// Pulls a single delivery, if one is ready.
    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, IntegrationError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &DeliveryProperties,
    ) -> Result<(), IntegrationError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), IntegrationError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), IntegrationError>;

    /// Closes the connection; unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<(), IntegrationError>;
}

/// Opens broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, IntegrationError>;
}

/// Connects, retrying transient failures with exponential backoff.
pub(crate) async fn connect_with_backoff(
    factory: &dyn ConnectionFactory,
    backoff: &BackoffConfig,
    component: &str,
) -> Result<Arc<dyn BrokerConnection>, IntegrationError> {
    (|| factory.connect())
        .retry(backoff.builder())
        .when(IntegrationError::is_transient)
        .notify(|err: &IntegrationError, delay: Duration| {
            warn!(
                error = err.to_string(),
                component = component,
                "failure to connect, retrying in {:?}",
                delay
            );
        })
        .await
}
