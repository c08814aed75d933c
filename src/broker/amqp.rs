// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module handles the creation of AMQP connections and channels with
//! `lapin`, and maps the crate's broker capability onto them: declarations,
//! consumers, publishing and acknowledgements.

use super::{
    BrokerConnection, ConnectionFactory, Delivery, DeliveryProperties, DeliveryStream,
    QueueDeclaration, AMQP_HEADERS_X_DEATH_COUNT,
};
use crate::{
    config::RabbitMQConfig,
    errors::IntegrationError,
    exchange::{ExchangeDefinition, ExchangeKind, AMQP_HEADERS_DELAYED_EXCHANGE_TYPE},
    history::MessageHistory,
    message::{headers, HeaderValue, Headers},
    queue::QueueExchangeBinding,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ByteArray, FieldTable, LongInt, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom(ExchangeKind::XMessageDelayed.as_str().to_owned())
            }
        }
    }
}

/// Builds the `exchange_declare` arguments; delayed exchanges carry the type
/// they route like under `x-delayed-type`.
fn exchange_arguments(def: &ExchangeDefinition) -> FieldTable {
    let mut params = BTreeMap::new();
    if let Some(delayed) = &def.delayed_type {
        params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(delayed.as_str())),
        );
    }
    FieldTable::from(params)
}

/// Opens `lapin` connections from a [`RabbitMQConfig`].
#[derive(Debug, Clone)]
pub struct AmqpConnectionFactory {
    config: RabbitMQConfig,
}

impl AmqpConnectionFactory {
    pub fn new(config: RabbitMQConfig) -> Arc<AmqpConnectionFactory> {
        Arc::new(AmqpConnectionFactory { config })
    }
}

#[async_trait]
impl ConnectionFactory for AmqpConnectionFactory {
    /// Establishes a connection and creates a channel on it.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, IntegrationError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.config.app_name.clone()));

        let conn = match Connection::connect(&self.config.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(IntegrationError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpConnection { conn, channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(IntegrationError::ChannelError)
            }
        }
    }
}

/// A `lapin` connection with its single channel.
pub struct AmqpConnection {
    conn: Connection,
    channel: Channel,
}

impl AmqpConnection {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), IntegrationError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                exchange_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(IntegrationError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), IntegrationError> {
        let args = &declaration.arguments;
        let mut queue_args = BTreeMap::new();

        if let Some(exchange) = &args.dead_letter_exchange {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }
        if let Some(key) = &args.dead_letter_routing_key {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }
        if let Some(ttl) = args.message_ttl {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }
        if let Some(max) = args.max_length {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }
        if let Some(max) = args.max_length_bytes {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        match self
            .channel
            .queue_declare(
                &declaration.name,
                QueueDeclareOptions {
                    passive: declaration.passive,
                    durable: declaration.durable,
                    exclusive: declaration.exclusive,
                    auto_delete: declaration.auto_delete,
                    nowait: declaration.no_wait,
                },
                FieldTable::from(queue_args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare queue");
                Err(IntegrationError::DeclareQueueError(declaration.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", declaration.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueExchangeBinding) -> Result<(), IntegrationError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(IntegrationError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), IntegrationError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                IntegrationError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, IntegrationError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(IntegrationError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(delivery_from_lapin)
                    .map_err(|err| IntegrationError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, IntegrationError> {
        match self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Ok(msg) => Ok(msg.map(|m| delivery_from_lapin(m.delivery))),
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "failure to get message");
                Err(IntegrationError::ConsumerError(err.to_string()))
            }
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &DeliveryProperties,
    ) -> Result<(), IntegrationError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties_to_lapin(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(IntegrationError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), IntegrationError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                IntegrationError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), IntegrationError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                IntegrationError::NackMessageError
            })
    }

    async fn close(&self) -> Result<(), IntegrationError> {
        if let Err(err) = self.channel.close(200, "closing").await {
            debug!(error = err.to_string(), "channel already closed");
        }
        self.conn.close(200, "closing").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close connection");
            IntegrationError::InternalError(err.to_string())
        })
    }
}

fn delivery_from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties: properties_from_lapin(&delivery.properties),
        body: delivery.data,
    }
}

fn short_string(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|v| v.as_str().to_owned())
}

pub(crate) fn properties_from_lapin(props: &AMQPProperties) -> DeliveryProperties {
    let mut headers = Headers::default();

    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            if key.as_str() == AMQP_HEADERS_X_DEATH {
                headers.insert(
                    AMQP_HEADERS_X_DEATH_COUNT.to_owned(),
                    HeaderValue::Int(x_death_count(value)),
                );
                continue;
            }

            if let Some(value) = header_from_amqp(key.as_str(), value) {
                headers.insert(key.as_str().to_owned(), value);
            }
        }
    }

    DeliveryProperties {
        content_type: short_string(props.content_type()),
        message_id: short_string(props.message_id()),
        correlation_id: short_string(props.correlation_id()),
        reply_to: short_string(props.reply_to()),
        kind: short_string(props.kind()),
        headers,
    }
}

pub(crate) fn properties_to_lapin(props: &DeliveryProperties) -> BasicProperties {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in &props.headers {
        btree.insert(ShortString::from(key.clone()), header_to_amqp(value));
    }

    let mut properties = BasicProperties::default().with_headers(FieldTable::from(btree));
    if let Some(v) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.message_id {
        properties = properties.with_message_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.reply_to {
        properties = properties.with_reply_to(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.kind {
        properties = properties.with_type(ShortString::from(v.clone()));
    }
    properties
}

fn header_to_amqp(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
        HeaderValue::History(h) => AMQPValue::LongString(LongString::from(h.to_json())),
    }
}

fn header_from_amqp(key: &str, value: &AMQPValue) -> Option<HeaderValue> {
    let value = match value {
        AMQPValue::LongString(v) => {
            let text = String::from_utf8_lossy(v.as_bytes()).into_owned();
            if key == headers::HISTORY {
                if let Some(history) = MessageHistory::from_json(&text) {
                    return Some(HeaderValue::History(history));
                }
            }
            HeaderValue::String(text)
        }
        AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_owned()),
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Timestamp(v) => HeaderValue::Int(*v as i64),
        AMQPValue::ByteArray(v) => HeaderValue::Bytes(v.as_slice().to_vec()),
        _ => return None,
    };
    Some(value)
}

/// Reads `count` from the first entry of an `x-death` header.
fn x_death_count(value: &AMQPValue) -> i64 {
    value
        .as_array()
        .and_then(|arr| arr.as_slice().first())
        .and_then(|entry| entry.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|count| count.as_long_long_int())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{history, message::Message};
    use lapin::types::FieldArray;

    #[test]
    fn should_declare_delayed_exchange_with_its_routing_type() {
        let def = ExchangeDefinition::new("later").fanout_delayed();

        let args = exchange_arguments(&def);
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            Some(&AMQPValue::LongString(LongString::from("fanout")))
        );
        assert_eq!(
            lapin::ExchangeKind::from(&def.kind),
            lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
        );
        assert!(exchange_arguments(&ExchangeDefinition::new("now"))
            .inner()
            .is_empty());
    }

    #[test]
    fn should_round_trip_properties_through_lapin() {
        let mut map = Headers::default();
        map.insert("tenant".into(), HeaderValue::String("acme".into()));
        map.insert("attempt".into(), HeaderValue::Int(2));
        map.insert("urgent".into(), HeaderValue::Bool(true));

        let props = DeliveryProperties {
            content_type: Some("text/plain".into()),
            message_id: Some("m-1".into()),
            correlation_id: Some("c-1".into()),
            reply_to: Some("replies".into()),
            kind: Some("order.created".into()),
            headers: map,
        };

        assert_eq!(properties_from_lapin(&properties_to_lapin(&props)), props);
    }

    #[test]
    fn should_carry_history_as_json_header() {
        let m = history::record(&Message::new("x"), "in", "amqp:inbound-channel-adapter");
        let mut map = Headers::default();
        map.insert(
            headers::HISTORY.into(),
            m.header(headers::HISTORY).cloned().unwrap(),
        );

        let props = DeliveryProperties {
            headers: map,
            ..Default::default()
        };
        let back = properties_from_lapin(&properties_to_lapin(&props));
        assert_eq!(back.headers.get(headers::HISTORY), m.header(headers::HISTORY));
    }

    #[test]
    fn should_flatten_x_death_count() {
        let mut death = BTreeMap::new();
        death.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(3),
        );
        let mut table = BTreeMap::new();
        table.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
                FieldTable::from(death),
            )])),
        );

        let props = BasicProperties::default().with_headers(FieldTable::from(table));
        let mapped = properties_from_lapin(&props);
        assert_eq!(
            mapped.headers.get(AMQP_HEADERS_X_DEATH_COUNT),
            Some(&HeaderValue::Int(3))
        );
        assert!(!mapped.headers.contains_key(AMQP_HEADERS_X_DEATH));
    }
}
