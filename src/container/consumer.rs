// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Settlement
//!
//! Runs the listener on one delivery and settles it with the broker. The
//! policy:
//! 1. listener success: ack
//! 2. listener failure with attempts left: republish with `x-retry-count`
//!    incremented, to the retry queue when the queue has one (the broker holds
//!    it for the retry TTL and dead-letters it back) or straight back to the
//!    queue, then ack the original
//! 3. retries exhausted with a DLQ: publish to the DLQ, then ack
//! 4. retries exhausted without a DLQ: nack without requeue
//!
//! A failed republish nacks the delivery with requeue so the broker keeps it.

use super::WorkerContext;
use crate::{
    broker::{BrokerConnection, Delivery, DeliveryProperties, AMQP_HEADERS_X_DEATH_COUNT},
    errors::IntegrationError,
    events::IntegrationEvent,
    message::{HeaderValue, Headers},
    otel,
    queue::QueueDefinition,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Attempts already made for a delivery, set on every retry republish.
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";

/// Processes and settles a single delivery.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    ctx: &WorkerContext,
    queue: &QueueDefinition,
    delivery: &Delivery,
    conn: &dyn BrokerConnection,
) -> Result<(), IntegrationError> {
    let attempt = extract_attempt(&delivery.properties.headers);
    let (_ctx, mut span) = otel::new_span(&delivery.properties.headers, tracer, queue.name());

    debug!(
        queue = queue.name(),
        exchange = delivery.exchange,
        delivery_tag = delivery.delivery_tag,
        "received"
    );

    let result = ctx.listener.on_delivery(delivery, conn).await;
    let Err(err) = result else {
        debug!("message successfully processed");
        return match conn.ack(delivery.delivery_tag).await {
            Err(e) => {
                error!(error = e.to_string(), "error whiling ack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(IntegrationError::AckMessageError)
            }
            _ => {
                span.set_status(Status::Ok);
                Ok(())
            }
        };
    };

    span.record_error(&err);
    let retries = queue.retries().unwrap_or(ctx.config.default_retries);
    let will_retry = attempt < i64::from(retries);
    ctx.events.emit(IntegrationEvent::HandlerFailed {
        queue: queue.name().to_owned(),
        error: err.to_string(),
        attempt,
        will_retry,
    });

    if will_retry {
        let target = queue.retry_name().unwrap_or(queue.name());
        warn!(
            error = err.to_string(),
            queue = queue.name(),
            attempt = attempt,
            "error whiling handling msg, requeuing for latter"
        );

        let props = with_attempt(&delivery.properties, attempt + 1);
        if let Err(e) = conn.publish("", target, &delivery.body, &props).await {
            error!(error = e.to_string(), "error whiling requeuing");
            span.set_status(Status::Error {
                description: Cow::from("error to requeuing msg"),
            });
            nack(conn, delivery, true).await?;
            return Err(IntegrationError::RequeuingMessageError);
        }

        span.set_status(Status::Error {
            description: Cow::from("msg was sent to retry"),
        });
        return ack(conn, delivery).await;
    }

    let Some(dlq) = queue.dlq_name() else {
        error!(
            error = err.to_string(),
            queue = queue.name(),
            "too many attempts, removing message from queue"
        );
        span.set_status(Status::Error {
            description: Cow::from("msg was dropped"),
        });
        nack(conn, delivery, false).await?;
        ctx.events.emit(IntegrationEvent::DeliveryDropped {
            queue: queue.name().to_owned(),
            error: err.to_string(),
        });
        return Ok(());
    };

    error!(queue = queue.name(), "too many attempts, sending to dlq");
    let props = with_attempt(&delivery.properties, attempt);
    if let Err(e) = conn.publish("", dlq, &delivery.body, &props).await {
        error!(error = e.to_string(), "error whiling sending to dlq");
        span.set_status(Status::Error {
            description: Cow::from("error to send msg to dlq"),
        });
        nack(conn, delivery, true).await?;
        return Err(IntegrationError::PublishingToDQLError);
    }

    span.set_status(Status::Error {
        description: Cow::from("msg was sent to dlq"),
    });
    ack(conn, delivery).await?;
    ctx.events.emit(IntegrationEvent::DeadLettered {
        queue: queue.name().to_owned(),
        dlq: dlq.to_owned(),
    });
    Ok(())
}

async fn ack(conn: &dyn BrokerConnection, delivery: &Delivery) -> Result<(), IntegrationError> {
    conn.ack(delivery.delivery_tag).await.map_err(|e| {
        error!(error = e.to_string(), "error whiling ack msg");
        IntegrationError::AckMessageError
    })
}

async fn nack(
    conn: &dyn BrokerConnection,
    delivery: &Delivery,
    requeue: bool,
) -> Result<(), IntegrationError> {
    conn.nack(delivery.delivery_tag, requeue).await.map_err(|e| {
        error!(error = e.to_string(), "error whiling nack msg");
        IntegrationError::NackMessageError
    })
}

/// Attempts made so far: the republish counter or the broker's dead-letter
/// count, whichever is larger.
fn extract_attempt(headers: &Headers) -> i64 {
    let count = |key: &str| {
        headers
            .get(key)
            .and_then(HeaderValue::as_int)
            .unwrap_or_default()
    };

    count(AMQP_HEADERS_RETRY_COUNT).max(count(AMQP_HEADERS_X_DEATH_COUNT))
}

fn with_attempt(props: &DeliveryProperties, attempt: i64) -> DeliveryProperties {
    let mut props = props.clone();
    props
        .headers
        .insert(AMQP_HEADERS_RETRY_COUNT.to_owned(), HeaderValue::Int(attempt));
    props
}
