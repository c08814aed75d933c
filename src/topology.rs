// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module provides functionality for defining and installing broker
//! topology: exchanges, queues and the bindings between them. Queue
//! definitions expand into the declarations their failure routing needs:
//! - a retry queue that holds failed deliveries for the retry TTL and then
//!   dead-letters them back to the main queue
//! - a DLQ, which the main queue dead-letters rejected deliveries to

use crate::{
    broker::{BrokerConnection, QueueArguments, QueueDeclaration},
    errors::IntegrationError,
    exchange::ExchangeDefinition,
    queue::{QueueDefinition, QueueExchangeBinding},
};
use tracing::debug;

/// A set of exchanges, queues and bindings to install on a broker.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueExchangeBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueExchangeBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology: exchanges, then queues, then bindings.
    pub async fn install(&self, conn: &dyn BrokerConnection) -> Result<(), IntegrationError> {
        for exch in &self.exchanges {
            conn.declare_exchange(exch).await?;
        }

        for def in &self.queues {
            declare_queue(conn, def).await?;
        }

        for binding in &self.queues_binding {
            conn.bind_queue(binding).await?;
        }

        debug!("topology installed");
        Ok(())
    }
}

fn base_declaration(def: &QueueDefinition, name: &str) -> QueueDeclaration {
    QueueDeclaration {
        name: name.to_owned(),
        durable: def.durable,
        exclusive: def.exclusive,
        auto_delete: def.delete,
        passive: def.passive,
        no_wait: def.no_wait,
        arguments: QueueArguments::default(),
    }
}

/// Expands a queue definition into its declarations, in dependency order.
pub fn queue_declarations(def: &QueueDefinition) -> Vec<QueueDeclaration> {
    let mut declarations = vec![];

    if let (Some(retry_name), Some(ttl)) = (&def.retry_name, def.retry_ttl) {
        let mut retry = base_declaration(def, retry_name);
        retry.arguments = QueueArguments {
            message_ttl: Some(ttl),
            dead_letter_exchange: Some("".to_owned()),
            dead_letter_routing_key: Some(def.name.clone()),
            ..Default::default()
        };
        declarations.push(retry);
    }

    if let Some(dlq_name) = &def.dlq_name {
        declarations.push(base_declaration(def, dlq_name));
    }

    let mut main = base_declaration(def, &def.name);
    main.arguments = QueueArguments {
        message_ttl: def.ttl,
        max_length: def.max_length,
        max_length_bytes: def.max_length_bytes,
        dead_letter_exchange: def.dlq_name.as_ref().map(|_| "".to_owned()),
        dead_letter_routing_key: def.dlq_name.clone(),
    };
    declarations.push(main);

    declarations
}

/// Declares a queue together with its retry queue and DLQ.
pub async fn declare_queue(
    conn: &dyn BrokerConnection,
    def: &QueueDefinition,
) -> Result<(), IntegrationError> {
    for declaration in queue_declarations(def) {
        debug!("creating queue: {}", declaration.name);
        conn.declare_queue(&declaration).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{memory::InMemoryBroker, ConnectionFactory, DeliveryProperties};

    #[test]
    fn should_expand_retry_and_dlq() {
        let def = QueueDefinition::new("orders")
            .durable()
            .with_dlq()
            .with_retry(1_000, 3);

        let declarations = queue_declarations(&def);
        let names: Vec<_> = declarations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["orders-retry", "orders-dlq", "orders"]);

        let retry = &declarations[0].arguments;
        assert_eq!(retry.message_ttl, Some(1_000));
        assert_eq!(retry.dead_letter_routing_key.as_deref(), Some("orders"));

        let main = &declarations[2];
        assert!(main.durable);
        assert_eq!(
            main.arguments.dead_letter_routing_key.as_deref(),
            Some("orders-dlq")
        );
    }

    #[test]
    fn should_declare_plain_queue_without_dead_lettering() {
        let declarations = queue_declarations(&QueueDefinition::new("plain").ttl(500));
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].arguments.message_ttl, Some(500));
        assert!(declarations[0].arguments.dead_letter_exchange.is_none());
    }

    #[tokio::test]
    async fn should_install_topology_on_broker() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();

        Topology::new()
            .exchange(ExchangeDefinition::new("orders").fanout())
            .queue(QueueDefinition::new("billing").with_dlq())
            .queue(QueueDefinition::new("shipping"))
            .queue_binding(QueueExchangeBinding::new("billing").exchange("orders"))
            .queue_binding(QueueExchangeBinding::new("shipping").exchange("orders"))
            .install(conn.as_ref())
            .await
            .unwrap();

        assert!(broker.queue_exists("billing-dlq"));
        conn.publish("orders", "", b"order", &DeliveryProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.ready_count("billing"), 1);
        assert_eq!(broker.ready_count("shipping"), 1);
    }

    #[tokio::test]
    async fn should_fail_binding_unknown_exchange() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();

        let result = Topology::new()
            .queue(QueueDefinition::new("q"))
            .queue_binding(QueueExchangeBinding::new("q").exchange("missing"))
            .install(conn.as_ref())
            .await;

        assert_eq!(
            result,
            Err(IntegrationError::BindingExchangeToQueueError(
                "missing".into(),
                "q".into()
            ))
        );
    }
}
