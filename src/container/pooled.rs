// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Pooled workers: each owns a connection, consumes every queue of the
//! container on it and processes deliveries one at a time, in arrival order.

use super::{consumer::consume, declare_queues, WorkerContext};
use crate::{broker::BrokerConnection, errors::IntegrationError};
use futures_util::{stream, StreamExt};
use opentelemetry::global;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Opens one connection per worker, then spawns the workers.
pub(super) async fn spawn(
    ctx: &Arc<WorkerContext>,
    workers: &mut JoinSet<()>,
) -> Result<(), IntegrationError> {
    let mut connections = Vec::with_capacity(ctx.config.concurrency);
    for index in 0..ctx.config.concurrency {
        let conn = ctx.open().await?;
        if index == 0 {
            declare_queues(ctx, conn.as_ref()).await?;
        }
        connections.push(conn);
    }

    for (index, conn) in connections.into_iter().enumerate() {
        workers.spawn(run(ctx.clone(), index, conn));
    }
    Ok(())
}

async fn run(ctx: Arc<WorkerContext>, index: usize, conn: Arc<dyn BrokerConnection>) {
    let mut conn = conn;
    loop {
        let Err(err) = work(&ctx, index, conn.as_ref()).await else {
            debug!(container = ctx.container, worker = index, "worker stopped");
            return;
        };

        error!(
            error = err.to_string(),
            container = ctx.container,
            worker = index,
            "worker lost its connection"
        );
        ctx.connection_failed(&err);
        ctx.discard(&conn).await;

        conn = match ctx.reconnect().await {
            Some(fresh) => fresh,
            None => return,
        };
    }
}

/// Consumes until cancelled (`Ok`) or until the connection fails.
async fn work(
    ctx: &WorkerContext,
    index: usize,
    conn: &dyn BrokerConnection,
) -> Result<(), IntegrationError> {
    let tracer = global::tracer("amqp consumer");

    let mut streams = Vec::with_capacity(ctx.queues.len());
    for (queue_index, queue) in ctx.queues.iter().enumerate() {
        let tag = format!("{}-{}-{}", ctx.container, index, queue.name());
        let deliveries = conn.consume(queue.name(), &tag).await?;
        streams.push(deliveries.map(move |d| (queue_index, d)).boxed());
    }
    let mut deliveries = stream::select_all(streams);

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => return Ok(()),
            next = deliveries.next() => next,
        };

        match next {
            Some((queue_index, Ok(delivery))) => {
                let queue = &ctx.queues[queue_index];
                if let Err(err) = consume(&tracer, ctx, queue, &delivery, conn).await {
                    error!(error = err.to_string(), "error consume msg");
                }
            }
            Some((_, Err(err))) => return Err(err),
            None if ctx.token.is_cancelled() => return Ok(()),
            None => {
                return Err(IntegrationError::ConsumerError(
                    "delivery streams closed".to_owned(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        broker::memory::InMemoryBroker,
        config::ContainerConfig,
        container::{
            tests::{eventually, fast_backoff, publish, RecordingListener},
            ConsumerContainer,
        },
        events::{EventStream, IntegrationEvent},
        queue::QueueDefinition,
    };
    use std::sync::Arc;

    fn pooled(broker: &InMemoryBroker, concurrency: usize, events: EventStream) -> ConsumerContainer {
        ConsumerContainer::new(
            "pooled",
            ContainerConfig {
                backoff: fast_backoff(),
                ..ContainerConfig::pooled(concurrency)
            },
            Arc::new(broker.clone()),
            events,
        )
    }

    #[tokio::test]
    async fn should_preserve_order_with_single_worker() {
        let broker = InMemoryBroker::new();
        let c = pooled(&broker, 1, EventStream::new());
        c.set_queue_names(&["ordered"]).unwrap();
        let listener = Arc::new(RecordingListener::default());
        c.set_listener(listener.clone()).unwrap();
        c.start().await.unwrap();

        let expected: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
        for body in &expected {
            publish(&broker, "ordered", body).await;
        }

        eventually(|| listener.seen().len() == expected.len()).await;
        assert_eq!(listener.seen(), expected);
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn should_consume_every_bound_queue() {
        let broker = InMemoryBroker::new();
        let c = pooled(&broker, 2, EventStream::new());
        c.set_queue_names(&["a", "b"]).unwrap();
        let listener = Arc::new(RecordingListener::default());
        c.set_listener(listener.clone()).unwrap();
        c.start().await.unwrap();

        publish(&broker, "a", "from a").await;
        publish(&broker, "b", "from b").await;

        eventually(|| listener.seen().len() == 2).await;
        let mut seen = listener.seen();
        seen.sort();
        assert_eq!(seen, ["from a", "from b"]);
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn should_retry_then_dead_letter_failing_deliveries() {
        let broker = InMemoryBroker::new();
        let c = pooled(&broker, 1, EventStream::new());
        c.set_queues(vec![QueueDefinition::new("jobs").with_dlq().with_retries(2)])
            .unwrap();
        let listener = Arc::new(RecordingListener::default());
        c.set_listener(listener.clone()).unwrap();
        c.start().await.unwrap();

        publish(&broker, "jobs", "fail always").await;

        eventually(|| broker.ready_count("jobs-dlq") == 1).await;
        assert_eq!(listener.seen().len(), 3);
        assert_eq!(broker.nack_count(), 0);
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn should_reconnect_worker_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let events = EventStream::new();
        let mut received = events.subscribe();
        let c = pooled(&broker, 1, events);
        c.set_queue_names(&["q"]).unwrap();
        let listener = Arc::new(RecordingListener::default());
        c.set_listener(listener.clone()).unwrap();
        c.start().await.unwrap();

        // a consumer on a closed connection ends its stream
        broker.close_all_connections().await;
        assert!(matches!(
            received.recv().await.unwrap(),
            IntegrationEvent::ConnectionFailed { component, .. } if component == "pooled"
        ));

        eventually(|| broker.connection_count() >= 2).await;
        publish(&broker, "q", "after reconnect").await;
        eventually(|| listener.seen() == ["after reconnect"]).await;
        c.stop().await.unwrap();
    }
}
