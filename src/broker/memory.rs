// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local broker implementing [`BrokerConnection`] and
//! [`ConnectionFactory`]. It supports the subset of AMQP semantics the
//! containers rely on:
//! - default exchange routing by queue name, plus direct/fanout/topic exchanges
//! - push consumers (round-robin per queue) and `basic_get`
//! - per-connection delivery tags, ack/nack, requeue on nack or close
//! - dead-lettering on `nack(requeue = false)` and on message TTL expiry
//!
//! It is useful for tests and for running flows without a RabbitMQ server.

use super::{
    BrokerConnection, ConnectionFactory, Delivery, DeliveryProperties, DeliveryStream,
    QueueDeclaration, AMQP_HEADERS_X_DEATH_COUNT,
};
use crate::{
    errors::IntegrationError,
    exchange::ExchangeDefinition,
    message::HeaderValue,
    queue::QueueExchangeBinding,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: DeliveryProperties,
    body: Vec<u8>,
}

struct MemoryConsumer {
    tag: String,
    connection: Arc<ConnectionState>,
    sender: mpsc::UnboundedSender<Result<Delivery, IntegrationError>>,
}

struct MemoryQueue {
    declaration: QueueDeclaration,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    bindings: Vec<QueueExchangeBinding>,
    queues: HashMap<String, MemoryQueue>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    next_message: AtomicU64,
    next_connection: AtomicU64,
    unreachable: AtomicBool,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
    acks: AtomicUsize,
    nacks: AtomicUsize,
    opened: Mutex<Vec<Weak<ConnectionState>>>,
}

struct ConnectionState {
    id: u64,
    next_tag: AtomicU64,
    unacked: Mutex<HashMap<u64, (String, StoredMessage)>>,
    closed: AtomicBool,
}

impl ConnectionState {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Cheaply clonable handle to an in-memory broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    /// Makes every connection attempt fail until set back to `true`.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Successful connections opened so far.
    pub fn connection_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn ack_count(&self) -> usize {
        self.inner.acks.load(Ordering::SeqCst)
    }

    pub fn nack_count(&self) -> usize {
        self.inner.nacks.load(Ordering::SeqCst)
    }

    /// Deliveries waiting in the queue, not yet handed to a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.inner.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    /// Bodies and properties of the ready deliveries of a queue, oldest first.
    pub fn ready_messages(&self, queue: &str) -> Vec<(Vec<u8>, DeliveryProperties)> {
        lock(&self.inner.state)
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| (m.body.clone(), m.properties.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.inner.state).queues.contains_key(queue)
    }

    /// Closes every open connection, as a broker restart would.
    pub async fn close_all_connections(&self) {
        let open: Vec<Arc<ConnectionState>> = lock(&self.inner.opened)
            .drain(..)
            .filter_map(|state| state.upgrade())
            .collect();

        for state in open {
            let conn = InMemoryConnection {
                broker: self.inner.clone(),
                state,
            };
            if let Err(err) = conn.close().await {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }
    }

    fn open(&self) -> Result<InMemoryConnection, IntegrationError> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(IntegrationError::ConnectionError(
                "broker unreachable".to_owned(),
            ));
        }

        let failing = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(IntegrationError::ConnectionError(
                "connection refused".to_owned(),
            ));
        }

        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(ConnectionState {
            id: self.inner.next_connection.fetch_add(1, Ordering::SeqCst),
            next_tag: AtomicU64::new(1),
            unacked: Mutex::new(HashMap::default()),
            closed: AtomicBool::new(false),
        });

        let mut opened = lock(&self.inner.opened);
        opened.retain(|state| state.strong_count() > 0);
        opened.push(Arc::downgrade(&state));

        Ok(InMemoryConnection {
            broker: self.inner.clone(),
            state,
        })
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, IntegrationError> {
        Ok(Arc::new(self.open()?))
    }
}

impl BrokerInner {
    fn queues_for(
        state: &BrokerState,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Vec<String>, IntegrationError> {
        if exchange.is_empty() {
            return Ok(state
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(def) = state.exchanges.get(exchange) else {
            warn!(exchange = exchange, "publishing to an undeclared exchange");
            return Err(IntegrationError::PublishingError);
        };

        Ok(state
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange && def.routes(&b.routing_key, routing_key))
            .map(|b| b.queue_name.clone())
            .collect())
    }

    /// Hands the message to a live consumer of the queue or stores it.
    fn enqueue(self: &Arc<Self>, state: &mut BrokerState, queue: &str, message: StoredMessage, front: bool) {
        let Some(q) = state.queues.get_mut(queue) else {
            debug!(queue = queue, "dropping message for a deleted queue");
            return;
        };

        let message = match Self::push_to_consumer(q, queue, message) {
            Ok(()) => return,
            Err(message) => message,
        };

        let expiry = q.declaration.arguments.message_ttl;
        let id = message.id;
        if front {
            q.ready.push_front(message);
        } else {
            q.ready.push_back(message);
        }

        if let Some(ttl) = expiry {
            let broker = self.clone();
            let queue = queue.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ttl.max(0) as u64)).await;
                broker.expire(&queue, id);
            });
        }
    }

    fn push_to_consumer(
        q: &mut MemoryQueue,
        queue: &str,
        message: StoredMessage,
    ) -> Result<(), StoredMessage> {
        q.consumers
            .retain(|c| !c.connection.is_closed() && !c.sender.is_closed());

        let mut message = message;
        while !q.consumers.is_empty() {
            let index = q.next_consumer % q.consumers.len();
            q.next_consumer = q.next_consumer.wrapping_add(1);
            let consumer = &q.consumers[index];

            let tag = consumer.connection.next_tag.fetch_add(1, Ordering::SeqCst);
            lock(&consumer.connection.unacked).insert(tag, (queue.to_owned(), message.clone()));

            let delivery = to_delivery(tag, &message);
            if consumer.sender.send(Ok(delivery)).is_ok() {
                return Ok(());
            }

            if let Some((_, m)) = lock(&consumer.connection.unacked).remove(&tag) {
                message = m;
            }
            q.consumers.remove(index);
        }

        Err(message)
    }

    /// Moves ready messages to consumers that became available.
    fn drain(q: &mut MemoryQueue, queue: &str) {
        while let Some(message) = q.ready.pop_front() {
            if let Err(message) = Self::push_to_consumer(q, queue, message) {
                q.ready.push_front(message);
                return;
            }
        }
    }

    fn expire(self: &Arc<Self>, queue: &str, id: u64) {
        let mut state = lock(&self.state);
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(position) = q.ready.iter().position(|m| m.id == id) else {
            return;
        };
        let Some(message) = q.ready.remove(position) else {
            return;
        };

        debug!(queue = queue, "message expired");
        self.dead_letter(&mut state, queue, message);
    }

    /// Routes a rejected or expired message to the queue's dead letter target.
    fn dead_letter(self: &Arc<Self>, state: &mut BrokerState, queue: &str, message: StoredMessage) {
        let Some(args) = state.queues.get(queue).map(|q| q.declaration.arguments.clone()) else {
            return;
        };

        let (Some(exchange), routing_key) = (args.dead_letter_exchange, args.dead_letter_routing_key)
        else {
            debug!(queue = queue, "dropping rejected message without dead letter exchange");
            return;
        };
        let routing_key = routing_key.unwrap_or_else(|| message.routing_key.clone());

        let mut message = message;
        let count = message
            .properties
            .headers
            .get(AMQP_HEADERS_X_DEATH_COUNT)
            .and_then(HeaderValue::as_int)
            .unwrap_or_default();
        message.properties.headers.insert(
            AMQP_HEADERS_X_DEATH_COUNT.to_owned(),
            HeaderValue::Int(count + 1),
        );
        message.redelivered = false;
        message.exchange = exchange.clone();
        message.routing_key = routing_key.clone();

        match Self::queues_for(state, &exchange, &routing_key) {
            Ok(targets) => {
                for target in targets {
                    let copy = StoredMessage {
                        id: self.next_message.fetch_add(1, Ordering::SeqCst),
                        ..message.clone()
                    };
                    self.enqueue(state, &target, copy, false);
                }
            }
            Err(err) => warn!(error = err.to_string(), "failure to dead letter message"),
        }
    }
}

fn to_delivery(tag: u64, message: &StoredMessage) -> Delivery {
    Delivery {
        delivery_tag: tag,
        exchange: message.exchange.clone(),
        routing_key: message.routing_key.clone(),
        redelivered: message.redelivered,
        properties: message.properties.clone(),
        body: message.body.clone(),
    }
}

/// A connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    broker: Arc<BrokerInner>,
    state: Arc<ConnectionState>,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), IntegrationError> {
        if self.state.is_closed() {
            return Err(IntegrationError::ChannelError);
        }
        Ok(())
    }

    fn settle(&self, delivery_tag: u64) -> Option<(String, StoredMessage)> {
        lock(&self.state.unacked).remove(&delivery_tag)
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), IntegrationError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);

        if def.passive && !state.exchanges.contains_key(&def.name) {
            return Err(IntegrationError::DeclareExchangeError(def.name.clone()));
        }
        state
            .exchanges
            .entry(def.name.clone())
            .or_insert_with(|| def.clone());
        Ok(())
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), IntegrationError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);

        if declaration.passive && !state.queues.contains_key(&declaration.name) {
            return Err(IntegrationError::DeclareQueueError(declaration.name.clone()));
        }
        state
            .queues
            .entry(declaration.name.clone())
            .or_insert_with(|| MemoryQueue {
                declaration: declaration.clone(),
                ready: VecDeque::default(),
                consumers: vec![],
                next_consumer: 0,
            });
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueExchangeBinding) -> Result<(), IntegrationError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);

        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(IntegrationError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn qos(&self, _prefetch_count: u16) -> Result<(), IntegrationError> {
        self.ensure_open()
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, IntegrationError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);

        let Some(q) = state.queues.get_mut(queue) else {
            return Err(IntegrationError::ConsumerDeclarationError(queue.to_owned()));
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        q.consumers.push(MemoryConsumer {
            tag: consumer_tag.to_owned(),
            connection: self.state.clone(),
            sender,
        });
        BrokerInner::drain(q, queue);

        debug!(
            queue = queue,
            consumer = consumer_tag,
            connection = self.state.id,
            "consumer registered"
        );

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, IntegrationError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);

        let Some(q) = state.queues.get_mut(queue) else {
            return Err(IntegrationError::ConsumerError(queue.to_owned()));
        };
        let Some(message) = q.ready.pop_front() else {
            return Ok(None);
        };

        let tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = to_delivery(tag, &message);
        lock(&self.state.unacked).insert(tag, (queue.to_owned(), message));
        Ok(Some(delivery))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &DeliveryProperties,
    ) -> Result<(), IntegrationError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);

        let targets = BrokerInner::queues_for(&state, exchange, routing_key)?;
        if targets.is_empty() {
            debug!(
                exchange = exchange,
                routing_key = routing_key,
                "message is unroutable"
            );
        }

        for target in targets {
            let message = StoredMessage {
                id: self.broker.next_message.fetch_add(1, Ordering::SeqCst),
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                properties: properties.clone(),
                body: body.to_vec(),
            };
            self.broker.enqueue(&mut state, &target, message, false);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), IntegrationError> {
        match self.settle(delivery_tag) {
            Some(_) => {
                self.broker.acks.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => {
                warn!(delivery_tag = delivery_tag, "ack for unknown delivery tag");
                Err(IntegrationError::AckMessageError)
            }
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), IntegrationError> {
        let Some((queue, mut message)) = self.settle(delivery_tag) else {
            warn!(delivery_tag = delivery_tag, "nack for unknown delivery tag");
            return Err(IntegrationError::NackMessageError);
        };
        self.broker.nacks.fetch_add(1, Ordering::SeqCst);

        let mut state = lock(&self.broker.state);
        if requeue {
            message.redelivered = true;
            self.broker.enqueue(&mut state, &queue, message, true);
        } else {
            self.broker.dead_letter(&mut state, &queue, message);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), IntegrationError> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut pending: Vec<(u64, (String, StoredMessage))> =
            lock(&self.state.unacked).drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);

        let mut state = lock(&self.broker.state);
        for q in state.queues.values_mut() {
            q.consumers
                .retain(|c| !Arc::ptr_eq(&c.connection, &self.state));
        }

        // newest first so the oldest ends up at the head of its queue
        for (_, (queue, mut message)) in pending.into_iter().rev() {
            message.redelivered = true;
            self.broker.enqueue(&mut state, &queue, message, true);
        }

        debug!(connection = self.state.id, "connection closed");
        Ok(())
    }
}

impl std::fmt::Debug for MemoryConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConsumer")
            .field("tag", &self.tag)
            .field("connection", &self.connection.id)
            .finish()
    }
}
