// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Direct consumers: one connection shared by `consumers_per_queue` push
//! consumers per queue. Each consumer handles its deliveries in order, and a
//! semaphore of `pool_size` permits bounds how many run at once across the
//! container.

use super::{consumer::consume, declare_queues, WorkerContext};
use crate::{broker::BrokerConnection, errors::IntegrationError, queue::QueueDefinition};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error};

/// The connection every consumer of the container shares. The first consumer
/// to notice a failure replaces it; the others pick up the replacement.
struct SharedConnection {
    current: Mutex<Arc<dyn BrokerConnection>>,
}

impl SharedConnection {
    async fn get(&self) -> Arc<dyn BrokerConnection> {
        self.current.lock().await.clone()
    }

    async fn replace(
        &self,
        ctx: &WorkerContext,
        failed: &Arc<dyn BrokerConnection>,
    ) -> Option<Arc<dyn BrokerConnection>> {
        let mut current = self.current.lock().await;
        if !Arc::ptr_eq(&*current, failed) {
            return Some(current.clone());
        }

        ctx.discard(failed).await;
        let fresh = ctx.reconnect().await?;
        *current = fresh.clone();
        Some(fresh)
    }
}

pub(super) async fn spawn(
    ctx: &Arc<WorkerContext>,
    workers: &mut JoinSet<()>,
) -> Result<(), IntegrationError> {
    let conn = ctx.open().await?;
    declare_queues(ctx, conn.as_ref()).await?;

    let shared = Arc::new(SharedConnection {
        current: Mutex::new(conn),
    });
    let permits = Arc::new(Semaphore::new(ctx.config.pool_size));

    for queue in &ctx.queues {
        for index in 0..ctx.config.consumers_per_queue {
            workers.spawn(run(
                ctx.clone(),
                shared.clone(),
                permits.clone(),
                queue.clone(),
                index,
            ));
        }
    }
    Ok(())
}

async fn run(
    ctx: Arc<WorkerContext>,
    shared: Arc<SharedConnection>,
    permits: Arc<Semaphore>,
    queue: QueueDefinition,
    index: usize,
) {
    let mut conn = shared.get().await;
    loop {
        let Err(err) = work(&ctx, &permits, &queue, index, &conn).await else {
            debug!(container = ctx.container, queue = queue.name(), "consumer stopped");
            return;
        };

        error!(
            error = err.to_string(),
            container = ctx.container,
            queue = queue.name(),
            "consumer lost its connection"
        );
        ctx.connection_failed(&err);

        conn = match shared.replace(&ctx, &conn).await {
            Some(fresh) => fresh,
            None => return,
        };
    }
}

async fn work(
    ctx: &WorkerContext,
    permits: &Semaphore,
    queue: &QueueDefinition,
    index: usize,
    conn: &Arc<dyn BrokerConnection>,
) -> Result<(), IntegrationError> {
    let tracer = global::tracer("amqp consumer");
    let tag = format!("{}-{}-{}", ctx.container, queue.name(), index);
    let mut deliveries = conn.consume(queue.name(), &tag).await?;

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => return Ok(()),
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => return Err(err),
            None if ctx.token.is_cancelled() => return Ok(()),
            None => {
                return Err(IntegrationError::ConsumerError(format!(
                    "delivery stream of `{}` closed",
                    queue.name()
                )))
            }
        };

        // unsettled deliveries go back to the queue when the connection closes
        let _permit = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => return Ok(()),
            permit = permits.acquire() => permit.map_err(|_| {
                IntegrationError::InternalError("worker pool closed".to_owned())
            })?,
        };

        if let Err(err) = consume(&tracer, ctx, queue, &delivery, conn.as_ref()).await {
            error!(error = err.to_string(), "error consume msg");
        }
    }
}
