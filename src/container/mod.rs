// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener Containers
//!
//! A [`ConsumerContainer`] owns the worker tasks and broker connections that
//! feed a set of queues to a single [`DeliveryListener`]. Two concurrency
//! strategies are available, selected by [`ContainerKind`]:
//!
//! - `Pooled`: `concurrency` workers, each with its own connection, consuming
//!   every queue and processing one delivery at a time.
//! - `Direct`: one shared connection with `consumers_per_queue` consumers per
//!   queue, whose deliveries run on a pool bounded by `pool_size` permits.
//!
//! Both settle every delivery exactly once (see [`consumer`]).

pub(crate) mod consumer;
mod direct;
mod pooled;

use crate::{
    broker::{connect_with_backoff, BrokerConnection, ConnectionFactory, Delivery},
    config::{ContainerConfig, ContainerKind},
    errors::IntegrationError,
    events::{EventStream, IntegrationEvent},
    flow::Lifecycle,
    queue::QueueDefinition,
    topology,
};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::Mutex as AsyncMutex, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Receives the deliveries of a container.
///
/// Returning `Ok` acknowledges the delivery; an error hands it to the retry
/// and dead-letter policy. `conn` is the connection the delivery arrived on,
/// usable for replies.
#[async_trait]
pub trait DeliveryListener: Send + Sync {
    async fn on_delivery(
        &self,
        delivery: &Delivery,
        conn: &dyn BrokerConnection,
    ) -> Result<(), IntegrationError>;
}

/// A queue fed to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub container: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ContainerState {
    queues: Vec<QueueDefinition>,
    listener: Option<Arc<dyn DeliveryListener>>,
}

struct Running {
    token: CancellationToken,
    workers: JoinSet<()>,
    shared: Arc<WorkerContext>,
}

/// State shared by the workers of a running container.
pub(crate) struct WorkerContext {
    pub(crate) container: String,
    pub(crate) config: ContainerConfig,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) listener: Arc<dyn DeliveryListener>,
    pub(crate) events: EventStream,
    pub(crate) token: CancellationToken,
    factory: Arc<dyn ConnectionFactory>,
    connections: Mutex<Vec<Arc<dyn BrokerConnection>>>,
}

impl WorkerContext {
    /// Opens a connection ready to consume: connected with backoff and qos set.
    pub(crate) async fn open(&self) -> Result<Arc<dyn BrokerConnection>, IntegrationError> {
        let conn =
            connect_with_backoff(self.factory.as_ref(), &self.config.backoff, &self.container)
                .await
                .inspect_err(|err| self.connection_failed(err))?;

        if let Err(err) = conn.qos(self.config.prefetch_count).await {
            let _ = conn.close().await;
            return Err(err);
        }

        lock(&self.connections).push(conn.clone());
        Ok(conn)
    }

    /// Replaces a failed connection, retrying until the container stops.
    pub(crate) async fn reconnect(&self) -> Option<Arc<dyn BrokerConnection>> {
        loop {
            let opened = tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                opened = self.open() => opened,
            };

            match opened {
                Ok(conn) => {
                    debug!(container = self.container, "reconnected");
                    return Some(conn);
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        container = self.container,
                        "failure to reconnect"
                    );
                    let pause = Duration::from_millis(self.config.backoff.max_delay_ms);
                    tokio::select! {
                        _ = self.token.cancelled() => return None,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }
    }

    /// Forgets and closes a connection whose consumers failed.
    pub(crate) async fn discard(&self, conn: &Arc<dyn BrokerConnection>) {
        lock(&self.connections).retain(|c| !Arc::ptr_eq(c, conn));
        if let Err(err) = conn.close().await {
            debug!(error = err.to_string(), "failure to close a failed connection");
        }
    }

    pub(crate) fn connection_failed(&self, err: &IntegrationError) {
        self.events.emit(IntegrationEvent::ConnectionFailed {
            component: self.container.clone(),
            error: err.to_string(),
        });
    }

    async fn close_all(&self) {
        let connections: Vec<_> = lock(&self.connections).drain(..).collect();
        for conn in connections {
            if let Err(err) = conn.close().await {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }
    }
}

/// Feeds deliveries from a set of queues to a listener.
pub struct ConsumerContainer {
    id: String,
    config: ContainerConfig,
    factory: Arc<dyn ConnectionFactory>,
    events: EventStream,
    state: Mutex<ContainerState>,
    running: AtomicBool,
    run: AsyncMutex<Option<Running>>,
}

impl ConsumerContainer {
    /// Creates a stopped container without queues or listener.
    ///
    /// # Parameters
    /// * `id` - Name used in logs, events and [`QueueBinding`]s
    /// * `config` - Consumer type, concurrency, prefetch and failure policy
    /// * `factory` - Source of the broker connections
    /// * `events` - Stream receiving connection and delivery failures
    pub fn new(
        id: &str,
        config: ContainerConfig,
        factory: Arc<dyn ConnectionFactory>,
        events: EventStream,
    ) -> ConsumerContainer {
        ConsumerContainer {
            id: id.to_owned(),
            config,
            factory,
            events,
            state: Mutex::new(ContainerState::default()),
            running: AtomicBool::new(false),
            run: AsyncMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn configurable(&self) -> Result<MutexGuard<'_, ContainerState>, IntegrationError> {
        if self.is_running() {
            return Err(IntegrationError::ConfigurationError(format!(
                "container `{}` is running",
                self.id
            )));
        }
        Ok(lock(&self.state))
    }

    /// Consumes from plain queues, using the container's default retries.
    ///
    /// # Returns
    /// A ConfigurationError while the container is running
    pub fn set_queue_names(&self, names: &[&str]) -> Result<(), IntegrationError> {
        self.set_queues(names.iter().map(|name| QueueDefinition::new(name)).collect())
    }

    /// Replaces the consumed queues; their DLQ and retry settings drive the
    /// failure policy.
    ///
    /// # Returns
    /// A ConfigurationError while the container is running
    pub fn set_queues(&self, queues: Vec<QueueDefinition>) -> Result<(), IntegrationError> {
        self.configurable()?.queues = queues;
        Ok(())
    }

    /// # Parameters
    /// * `listener` - Receiver of every delivery of every queue
    ///
    /// # Returns
    /// A ConfigurationError while the container is running
    pub fn set_listener(&self, listener: Arc<dyn DeliveryListener>) -> Result<(), IntegrationError> {
        self.configurable()?.listener = Some(listener);
        Ok(())
    }

    /// Names of the consumed queues, in configuration order.
    pub fn queue_names(&self) -> Vec<String> {
        lock(&self.state)
            .queues
            .iter()
            .map(|q| q.name().to_owned())
            .collect()
    }

    /// Pairs each consumed queue with this container.
    ///
    /// # Returns
    /// One [`QueueBinding`] per queue, in configuration order
    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.queue_names()
            .into_iter()
            .map(|queue| QueueBinding {
                queue,
                container: self.id.clone(),
            })
            .collect()
    }

    /// Starts consuming. Does nothing when already running.
    ///
    /// # Returns
    /// A ConfigurationError for an invalid config, a missing listener or no
    /// queues; broker failures while declaring the queues are returned as is
    pub async fn start(&self) -> Result<(), IntegrationError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            debug!(container = self.id, "container already running");
            return Ok(());
        }

        self.config.validate()?;
        let (queues, listener) = {
            let state = lock(&self.state);
            (state.queues.clone(), state.listener.clone())
        };
        if queues.is_empty() {
            return Err(IntegrationError::ConfigurationError(format!(
                "container `{}` has no queues",
                self.id
            )));
        }
        let Some(listener) = listener else {
            return Err(IntegrationError::ConfigurationError(format!(
                "container `{}` has no listener",
                self.id
            )));
        };

        let token = CancellationToken::new();
        let shared = Arc::new(WorkerContext {
            container: self.id.clone(),
            config: self.config.clone(),
            queues,
            listener,
            events: self.events.clone(),
            token: token.clone(),
            factory: self.factory.clone(),
            connections: Mutex::new(vec![]),
        });

        let mut workers = JoinSet::new();
        let spawned = match self.config.kind {
            ContainerKind::Pooled => pooled::spawn(&shared, &mut workers).await,
            ContainerKind::Direct => direct::spawn(&shared, &mut workers).await,
        };
        if let Err(err) = spawned {
            error!(error = err.to_string(), container = self.id, "failure to start container");
            token.cancel();
            workers.abort_all();
            shared.close_all().await;
            return Err(err);
        }

        debug!(
            container = self.id,
            kind = ?self.config.kind,
            workers = workers.len(),
            "container started"
        );
        *run = Some(Running {
            token,
            workers,
            shared,
        });
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stops taking deliveries, lets in-flight ones finish within the
    /// shutdown timeout, then aborts the workers and closes the connections.
    pub async fn stop(&self) -> Result<(), IntegrationError> {
        let mut run = self.run.lock().await;
        let Some(mut running) = run.take() else {
            return Ok(());
        };

        running.token.cancel();
        let drained = tokio::time::timeout(self.config.shutdown_timeout(), async {
            while running.workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                container = self.id,
                "in-flight deliveries did not finish in time, aborting workers"
            );
            running.workers.abort_all();
            while running.workers.join_next().await.is_some() {}
        }

        running.shared.close_all().await;
        self.running.store(false, Ordering::SeqCst);
        debug!(container = self.id, "container stopped");
        Ok(())
    }
}

/// Declares the queues of the container when configured to.
pub(crate) async fn declare_queues(
    ctx: &WorkerContext,
    conn: &dyn BrokerConnection,
) -> Result<(), IntegrationError> {
    if !ctx.config.declare_queues {
        return Ok(());
    }
    for queue in &ctx.queues {
        topology::declare_queue(conn, queue).await?;
    }
    Ok(())
}

#[async_trait]
impl Lifecycle for ConsumerContainer {
    fn name(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<(), IntegrationError> {
        ConsumerContainer::start(self).await
    }

    async fn stop(&self) -> Result<(), IntegrationError> {
        ConsumerContainer::stop(self).await
    }

    fn is_running(&self) -> bool {
        ConsumerContainer::is_running(self)
    }
}
