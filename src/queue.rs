// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides types for defining broker queues and their bindings to
//! exchanges. It includes support for Dead Letter Queues (DLQ) and retry
//! queues, which the listener containers use to route failed deliveries.

/// Definition of a queue with its configuration parameters.
///
/// Besides the standard queue options it carries the failure routing used by
/// the containers: an optional DLQ, and an optional retry queue holding failed
/// deliveries for `retry_ttl` milliseconds before dead-lettering them back to
/// this queue, at most `retries` times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) retries: Option<u32>,
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the Dead Letter Queue.
    ///
    /// # Returns
    /// `Some("<name>-dlq")` once [`QueueDefinition::with_dlq`] was applied, None otherwise
    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    /// Name of the delaying retry queue.
    ///
    /// # Returns
    /// `Some("<name>-retry")` once [`QueueDefinition::with_retry`] was applied, None otherwise
    pub fn retry_name(&self) -> Option<&str> {
        self.retry_name.as_deref()
    }

    /// Retry limit applied by the containers.
    ///
    /// # Returns
    /// The maximum number of redeliveries, or None when failed deliveries are
    /// not retried
    pub fn retries(&self) -> Option<u32> {
        self.retries
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Checks for existence without creating the queue.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// # Parameters
    /// * `ttl` - Time in milliseconds a message may stay in the queue
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue named `<name>-dlq`.
    ///
    /// Deliveries that exhausted their retries are published there.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a retry queue named `<name>-retry`.
    ///
    /// # Parameters
    /// * `ttl` - Time in milliseconds a failed delivery waits before redelivery
    /// * `retries` - Maximum number of retry attempts
    pub fn with_retry(mut self, ttl: i32, retries: u32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retries = Some(retries);
        self.retry_ttl = Some(ttl);
        self
    }

    /// Sets the retry limit without a delaying retry queue; failed deliveries
    /// are republished straight to this queue.
    ///
    /// # Parameters
    /// * `retries` - Maximum number of retry attempts
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Binding of a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueExchangeBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueExchangeBinding {
    /// Creates a new binding for the given queue with an empty exchange and key.
    pub fn new(queue: &str) -> QueueExchangeBinding {
        QueueExchangeBinding {
            queue_name: queue.to_owned(),
            exchange_name: "".to_owned(),
            routing_key: "".to_owned(),
        }
    }

    /// Sets the exchange the queue is bound to.
    ///
    /// # Parameters
    /// * `exchange` - Name of an exchange declared through [`crate::exchange::ExchangeDefinition`]
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key of the binding.
    ///
    /// # Parameters
    /// * `key` - Routing key, or binding pattern for topic exchanges
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
