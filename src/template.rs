// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Template
//!
//! Publishes messages to the broker, connecting lazily with backoff. Request
//! and reply goes through a private reply queue consumed by a background task;
//! replies are matched to waiting requests by correlation id.

use crate::{
    broker::{connect_with_backoff, BrokerConnection, ConnectionFactory, Delivery, QueueDeclaration},
    config::BackoffConfig,
    errors::IntegrationError,
    header_mapper,
    message::Message,
};
use futures_util::StreamExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{oneshot, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<Delivery>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ReplyListener {
    queue: String,
    conn: Arc<dyn BrokerConnection>,
    pending: PendingReplies,
    task: JoinHandle<()>,
}

/// Publishes messages and performs request/reply exchanges with the broker.
pub struct AmqpTemplate {
    name: String,
    factory: Arc<dyn ConnectionFactory>,
    backoff: BackoffConfig,
    connection: AsyncMutex<Option<Arc<dyn BrokerConnection>>>,
    replies: AsyncMutex<Option<ReplyListener>>,
}

impl AmqpTemplate {
    pub fn new(
        name: &str,
        factory: Arc<dyn ConnectionFactory>,
        backoff: BackoffConfig,
    ) -> Arc<AmqpTemplate> {
        Arc::new(AmqpTemplate {
            name: name.to_owned(),
            factory,
            backoff,
            connection: AsyncMutex::new(None),
            replies: AsyncMutex::new(None),
        })
    }

    async fn connection(&self) -> Result<Arc<dyn BrokerConnection>, IntegrationError> {
        let mut current = self.connection.lock().await;
        if let Some(conn) = current.as_ref() {
            return Ok(conn.clone());
        }

        let conn = connect_with_backoff(self.factory.as_ref(), &self.backoff, &self.name).await?;
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Drops the cached connection so the next publish reconnects.
    async fn invalidate(&self, failed: &Arc<dyn BrokerConnection>) {
        let mut current = self.connection.lock().await;
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, failed)) {
            *current = None;
            let _ = failed.close().await;
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        reply: Option<(&str, &str)>,
    ) -> Result<(), IntegrationError> {
        let (body, mut props) = header_mapper::to_wire(message)?;
        if let Some((reply_to, correlation_id)) = reply {
            props.reply_to = Some(reply_to.to_owned());
            props.correlation_id = Some(correlation_id.to_owned());
        }

        let conn = self.connection().await?;
        if let Err(err) = conn.publish(exchange, routing_key, &body, &props).await {
            error!(
                error = err.to_string(),
                exchange = exchange,
                routing_key = routing_key,
                "error publishing message"
            );
            self.invalidate(&conn).await;
            return Err(err);
        }
        Ok(())
    }

    /// Publishes a message.
    pub async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), IntegrationError> {
        self.publish(exchange, routing_key, message, None).await
    }

    /// Publishes a request and waits up to `timeout` for its reply.
    pub async fn send_and_receive(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        timeout: Duration,
    ) -> Result<Delivery, IntegrationError> {
        let (reply_queue, pending) = self.reply_listener().await?;
        let correlation_id = Uuid::new_v4().to_string();

        let (sender, receiver) = oneshot::channel();
        lock(&pending).insert(correlation_id.clone(), sender);

        let published = self
            .publish(
                exchange,
                routing_key,
                message,
                Some((reply_queue.as_str(), correlation_id.as_str())),
            )
            .await;
        if let Err(err) = published {
            lock(&pending).remove(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(IntegrationError::ConsumerError(format!(
                "reply queue `{reply_queue}` closed"
            ))),
            Err(_) => {
                lock(&pending).remove(&correlation_id);
                warn!(
                    template = self.name,
                    correlation_id = correlation_id,
                    "no reply received in time"
                );
                Err(IntegrationError::ReplyTimeoutError(timeout.as_millis() as u64))
            }
        }
    }

    /// Returns the reply queue, declaring it and starting its consumer on
    /// first use or after the previous consumer ended.
    async fn reply_listener(&self) -> Result<(String, PendingReplies), IntegrationError> {
        let mut replies = self.replies.lock().await;
        if let Some(listener) = replies.as_ref() {
            if !listener.task.is_finished() {
                return Ok((listener.queue.clone(), listener.pending.clone()));
            }
            debug!(template = self.name, "reply consumer ended, recreating it");
            let _ = listener.conn.close().await;
        }

        let conn = connect_with_backoff(self.factory.as_ref(), &self.backoff, &self.name).await?;
        let queue = format!("{}.replies.{}", self.name, Uuid::new_v4());
        let declared = async {
            conn.declare_queue(&QueueDeclaration {
                name: queue.clone(),
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            })
            .await?;
            conn.consume(&queue, &queue).await
        }
        .await;
        let mut deliveries = match declared {
            Ok(deliveries) => deliveries,
            Err(err) => {
                let _ = conn.close().await;
                return Err(err);
            }
        };

        let pending = PendingReplies::default();
        let task = tokio::spawn({
            let pending = pending.clone();
            let conn = conn.clone();
            async move {
                while let Some(result) = deliveries.next().await {
                    let delivery = match result {
                        Ok(delivery) => delivery,
                        Err(err) => {
                            error!(error = err.to_string(), "errors consume reply");
                            break;
                        }
                    };

                    if let Err(err) = conn.ack(delivery.delivery_tag).await {
                        error!(error = err.to_string(), "error whiling ack reply");
                    }

                    let waiting = delivery
                        .properties
                        .correlation_id
                        .as_ref()
                        .and_then(|id| lock(&pending).remove(id));
                    match waiting {
                        Some(sender) => {
                            let _ = sender.send(delivery);
                        }
                        None => warn!(
                            correlation_id = ?delivery.properties.correlation_id,
                            "discarding late or unknown reply"
                        ),
                    }
                }
            }
        });

        debug!(template = self.name, queue = queue, "reply consumer started");
        *replies = Some(ReplyListener {
            queue: queue.clone(),
            conn,
            pending: pending.clone(),
            task,
        });
        Ok((queue, pending))
    }

    /// Stops the reply consumer and closes the connections.
    pub async fn close(&self) -> Result<(), IntegrationError> {
        if let Some(listener) = self.replies.lock().await.take() {
            listener.task.abort();
            listener.conn.close().await?;
        }
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close().await?;
        }
        Ok(())
    }
}
