// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Integration Endpoints
//!
//! This module provides the error type shared by every component of the crate:
//! broker connections, listener containers, endpoints and internal channels.
//! The first group of variants is the integration-level taxonomy (connection,
//! configuration, timeouts, backpressure, handler failures); the rest describe
//! the individual broker operation that failed.

use thiserror::Error;

/// Represents errors that can occur while running an integration flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrationError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// The broker could not be reached; retried with backoff by containers
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Invalid setup, never retried
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// An inbound gateway did not receive a downstream reply in time
    #[error("no reply received within {0}ms")]
    GatewayTimeoutError(u64),

    /// An outbound gateway did not receive a broker reply in time
    #[error("no reply received from the broker within {0}ms")]
    ReplyTimeoutError(u64),

    /// A pollable channel is at capacity
    #[error("channel `{0}` is full")]
    ChannelFullError(String),

    /// Downstream processing failed
    #[error("failure to handle message: {0}")]
    HandlerError(String),

    /// A point-to-point channel had nobody to dispatch to
    #[error("channel `{0}` has no subscribers")]
    NoSubscribersError(String),

    /// An operation was attempted on a channel of the wrong kind
    #[error("channel `{0}` does not support {1}")]
    UnsupportedChannelOperation(String, &'static str),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error requeuing a message
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDQLError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl IntegrationError {
    /// Whether a container should retry the operation after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IntegrationError::ConnectionError(_)
                | IntegrationError::ChannelError
                | IntegrationError::ConsumerDeclarationError(_)
                | IntegrationError::ConsumerError(_)
        )
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, IntegrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_transient_errors() {
        assert!(IntegrationError::ConnectionError("refused".into()).is_transient());
        assert!(IntegrationError::ChannelError.is_transient());
        assert!(!IntegrationError::ConfigurationError("no queues".into()).is_transient());
        assert!(!IntegrationError::GatewayTimeoutError(10).is_transient());
    }

    #[test]
    fn should_render_messages() {
        assert_eq!(
            IntegrationError::ChannelFullError("out".into()).to_string(),
            "channel `out` is full"
        );
        assert_eq!(
            IntegrationError::BindingExchangeToQueueError("ex".into(), "q".into()).to_string(),
            "failure to binding exchange `ex` to queue `q`"
        );
    }
}
