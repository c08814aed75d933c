// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Integration Event Stream
//!
//! Errors that components recover from on their own (reconnects, gateway
//! timeouts, backpressure, dead-lettering) are published here so they can be
//! logged or asserted on by an external observer.

use tokio::sync::broadcast;
use tracing::debug;

const EVENT_STREAM_CAPACITY: usize = 1024;

/// Something that happened inside an integration flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationEvent {
    /// A container or worker could not reach the broker.
    ConnectionFailed { component: String, error: String },
    /// An inbound gateway gave up waiting for a downstream reply.
    GatewayTimeout { component: String, timeout_ms: u64 },
    /// An outbound gateway gave up waiting for a broker reply.
    ReplyTimeout { component: String, timeout_ms: u64 },
    /// A send was rejected by a full pollable channel.
    ChannelFull { channel: String },
    /// The listener failed; the delivery is retried when `will_retry`.
    HandlerFailed {
        queue: String,
        error: String,
        attempt: i64,
        will_retry: bool,
    },
    /// Retries exhausted, the delivery was published to the DLQ.
    DeadLettered { queue: String, dlq: String },
    /// Retries exhausted and no DLQ configured.
    DeliveryDropped { queue: String, error: String },
    /// A polled file could not be read; it is tried again on the next poll.
    FileReadFailed {
        adapter: String,
        path: String,
        error: String,
    },
}

/// Fan-out stream of [`IntegrationEvent`]s.
#[derive(Debug, Clone)]
pub struct EventStream {
    sender: broadcast::Sender<IntegrationEvent>,
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStream {
    pub fn new() -> EventStream {
        let (sender, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        EventStream { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntegrationEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event; dropped when nobody listens.
    pub fn emit(&self, event: IntegrationEvent) {
        if self.sender.send(event).is_err() {
            debug!("integration event emitted without subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_fan_out_events() {
        let stream = EventStream::new();
        let mut a = stream.subscribe();
        let mut b = stream.clone().subscribe();

        stream.emit(IntegrationEvent::ChannelFull {
            channel: "out".into(),
        });

        let expected = IntegrationEvent::ChannelFull {
            channel: "out".into(),
        };
        assert_eq!(a.recv().await.unwrap(), expected);
        assert_eq!(b.recv().await.unwrap(), expected);
    }

    #[test]
    fn should_not_fail_without_subscribers() {
        EventStream::new().emit(IntegrationEvent::DeadLettered {
            queue: "q".into(),
            dlq: "q-dlq".into(),
        });
    }
}
