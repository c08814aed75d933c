// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Header Mapping
//!
//! Converts between broker deliveries and internal messages. Inbound, the
//! broker metadata is exposed under `amqp_*` headers next to the user
//! headers. Outbound, `amqp_*` and flow-local headers stay behind and the
//! current trace context is injected.

use crate::{
    broker::{Delivery, DeliveryProperties},
    errors::IntegrationError,
    message::{headers, Headers, Message, MessageBuilder, Payload},
    otel,
};
use opentelemetry::Context;

/// Builds the message an inbound endpoint emits for a delivery.
pub fn to_message(delivery: &Delivery) -> Message {
    let props = &delivery.properties;
    let payload = Payload::from_wire(delivery.body.clone(), props.content_type.as_deref());

    let mut builder = MessageBuilder::with_payload(payload)
        .headers(props.headers.clone())
        .header(headers::AMQP_RECEIVED_ROUTING_KEY, delivery.routing_key.as_str())
        .header(headers::AMQP_RECEIVED_EXCHANGE, delivery.exchange.as_str())
        .header(headers::AMQP_DELIVERY_TAG, delivery.delivery_tag as i64)
        .header(headers::AMQP_REDELIVERED, delivery.redelivered);

    let optional = [
        (headers::CONTENT_TYPE, &props.content_type),
        (headers::AMQP_MESSAGE_ID, &props.message_id),
        (headers::AMQP_CORRELATION_ID, &props.correlation_id),
        (headers::AMQP_REPLY_TO, &props.reply_to),
        (headers::AMQP_TYPE, &props.kind),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            builder = builder.header(key, value.as_str());
        }
    }

    builder.build()
}

fn stays_local(key: &str) -> bool {
    key.starts_with("amqp_") || key == headers::REPLY_CHANNEL || key == headers::CONTENT_TYPE
}

/// Encodes a message for publishing: body plus broker properties.
pub fn to_wire(message: &Message) -> Result<(Vec<u8>, DeliveryProperties), IntegrationError> {
    let body = message.payload().to_bytes()?.into_owned();

    let mut wire_headers: Headers = message
        .headers()
        .iter()
        .filter(|(key, _)| !stays_local(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    otel::inject(&Context::current(), &mut wire_headers);

    let content_type = message
        .header_str(headers::CONTENT_TYPE)
        .unwrap_or(message.payload().content_type());

    Ok((
        body,
        DeliveryProperties {
            content_type: Some(content_type.to_owned()),
            message_id: Some(message.id().to_string()),
            correlation_id: message
                .header_str(headers::AMQP_CORRELATION_ID)
                .map(str::to_owned),
            reply_to: None,
            kind: message.header_str(headers::AMQP_TYPE).map(str::to_owned),
            headers: wire_headers,
        },
    ))
}

/// Exchange and routing key overrides carried by a message.
pub(crate) fn publish_overrides(message: &Message) -> (Option<&str>, Option<&str>) {
    (
        message.header_str(headers::AMQP_EXCHANGE),
        message.header_str(headers::AMQP_ROUTING_KEY),
    )
}

pub(crate) fn correlation_of(props: &DeliveryProperties) -> Option<String> {
    props
        .correlation_id
        .clone()
        .or_else(|| props.message_id.clone())
}
