// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing mechanism of the broker: they decide which bound
//! queues receive a published delivery. Definitions here are broker-agnostic;
//! each [`BrokerConnection`](crate::broker::BrokerConnection) maps them to its
//! own declaration call.

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: routes on an exact match of routing keys
/// - Fanout: broadcasts to all bound queues
/// - Topic: routes on `*`/`#` pattern matching of routing keys
/// - Headers: routes on header values (the in-memory broker routes to every binding)
/// - XMessageDelayed: delayed delivery, routing like its `x-delayed-type` (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl ExchangeKind {
    /// Returns the exchange type name as declared on the broker.
    ///
    /// # Returns
    /// `"direct"`, `"fanout"`, `"topic"`, `"headers"` or `"x-delayed-message"`
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XMessageDelayed => "x-delayed-message",
        }
    }

    /// Whether a binding with `binding_key` receives a delivery published with `routing_key`.
    pub fn matches(&self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Direct | ExchangeKind::XMessageDelayed => binding_key == routing_key,
            ExchangeKind::Fanout | ExchangeKind::Headers => true,
            ExchangeKind::Topic => {
                let pattern: Vec<&str> = binding_key.split('.').collect();
                let words: Vec<&str> = routing_key.split('.').collect();
                topic_matches(&pattern, &words)
            }
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.first(), words.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], words)
                || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &words[1..]),
        (Some(p), Some(w)) if p == w => topic_matches(&pattern[1..], &words[1..]),
        _ => false,
    }
}

/// Definition of an exchange with its configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) delayed_type: Option<ExchangeKind>,
}

impl ExchangeDefinition {
    /// Creates a new direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            delayed_type: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn direct_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.delayed_type = Some(ExchangeKind::Direct);
        self
    }

    /// Creates a delayed fanout exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn fanout_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.delayed_type = Some(ExchangeKind::Fanout);
        self
    }

    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Checks for existence without creating the exchange.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Routing behavior, resolving delayed exchanges to their underlying type.
    pub(crate) fn routes(&self, binding_key: &str, routing_key: &str) -> bool {
        match (&self.kind, &self.delayed_type) {
            (ExchangeKind::XMessageDelayed, Some(kind)) => kind.matches(binding_key, routing_key),
            (kind, _) => kind.matches(binding_key, routing_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_match_direct_and_fanout() {
        assert!(ExchangeKind::Direct.matches("orders", "orders"));
        assert!(!ExchangeKind::Direct.matches("orders", "orders.created"));
        assert!(ExchangeKind::Fanout.matches("", "anything"));
    }

    #[test]
    fn should_match_topic_patterns() {
        let topic = ExchangeKind::Topic;
        assert!(topic.matches("orders.*", "orders.created"));
        assert!(!topic.matches("orders.*", "orders.created.eu"));
        assert!(topic.matches("orders.#", "orders.created.eu"));
        assert!(topic.matches("orders.#", "orders"));
        assert!(topic.matches("#", "a.b.c"));
        assert!(topic.matches("*.created", "invoices.created"));
        assert!(!topic.matches("*.created", "created"));
    }

    #[test]
    fn should_name_exchange_kinds_as_on_the_wire() {
        assert_eq!(ExchangeKind::Direct.as_str(), "direct");
        assert_eq!(ExchangeKind::Fanout.as_str(), "fanout");
        assert_eq!(ExchangeKind::Topic.as_str(), "topic");
        assert_eq!(ExchangeKind::Headers.as_str(), "headers");
        assert_eq!(ExchangeKind::XMessageDelayed.as_str(), "x-delayed-message");
    }

    #[test]
    fn should_route_delayed_exchange_like_its_type() {
        let fanout = ExchangeDefinition::new("delayed").fanout_delayed();
        assert_eq!(fanout.kind, ExchangeKind::XMessageDelayed);
        assert!(fanout.routes("a", "b"));

        let direct = ExchangeDefinition::new("delayed").direct_delayed();
        assert!(!direct.routes("a", "b"));
        assert!(direct.routes("a", "a"));
    }
}
