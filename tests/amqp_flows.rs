// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_integration::{
    broker::{memory::InMemoryBroker, ConnectionFactory, DeliveryProperties},
    config::{BackoffConfig, ContainerConfig},
    endpoint::{
        activator::{FnProcessor, MessageProcessor, ServiceActivator},
        component_type,
        inbound::InboundEndpoint,
        outbound::{OutboundEndpoint, PublishTarget},
        EndpointConfig,
    },
    events::IntegrationEvent,
    header_mapper, history,
    queue::QueueDefinition,
    template::AmqpTemplate,
    ChannelKind, IntegrationError, IntegrationFlow, Message, Payload,
};
use std::{sync::Arc, time::Duration};

fn backoff() -> BackoffConfig {
    BackoffConfig {
        min_delay_ms: 1,
        max_delay_ms: 5,
        max_retries: 2,
        jitter: false,
    }
}

fn container_config(mut config: ContainerConfig) -> ContainerConfig {
    config.backoff = backoff();
    config.shutdown_timeout_ms = 500;
    config
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Uppercases text payloads; fails the ones starting with `poison`.
fn upper() -> Arc<dyn MessageProcessor> {
    Arc::new(FnProcessor::new(|message: Message| async move {
        let text = message.payload().as_text().unwrap_or_default().into_owned();
        if text.starts_with("poison") {
            return Err(IntegrationError::HandlerError(text));
        }
        Ok(Some(Payload::from(text.to_uppercase())))
    }))
}

async fn publish(broker: &InMemoryBroker, queue: &str, body: &str) {
    let conn = broker.connect().await.unwrap();
    conn.publish("", queue, body.as_bytes(), &DeliveryProperties::default())
        .await
        .unwrap();
    conn.close().await.unwrap();
}

async fn inbound_adapter_delivers_with_history(config: ContainerConfig) {
    let broker = InMemoryBroker::new();
    let mut flow = IntegrationFlow::new();
    let orders = flow
        .registry()
        .declare("orders.in", ChannelKind::queue(16))
        .await
        .unwrap();
    let inbound = InboundEndpoint::from_factory(
        EndpointConfig::adapter("ordersAdapter", "orders.in"),
        flow.registry().clone(),
        Arc::new(broker.clone()),
        vec![QueueDefinition::new("orders")],
        container_config(config),
    )
    .unwrap();
    flow.register(Arc::new(inbound));
    flow.start().await.unwrap();

    for body in ["one", "two", "three"] {
        publish(&broker, "orders", body).await;
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        let message = orders
            .receive(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        let history = history::read(&message);
        assert_eq!(history.len(), 1);
        assert_eq!(
            history.last().unwrap().component_type,
            component_type::INBOUND_CHANNEL_ADAPTER
        );
        received.push(message.payload().as_text().unwrap().into_owned());
    }
    received.sort();
    assert_eq!(received, ["one", "three", "two"]);

    eventually(|| broker.ack_count() == 3).await;
    flow.stop().await.unwrap();
    assert_eq!(broker.ready_count("orders"), 0);
}

#[tokio::test]
async fn should_deliver_through_pooled_inbound_adapter() {
    inbound_adapter_delivers_with_history(ContainerConfig::pooled(2)).await;
}

#[tokio::test]
async fn should_deliver_through_direct_inbound_adapter() {
    inbound_adapter_delivers_with_history(ContainerConfig::direct(2, 2)).await;
}

/// Registers an inbound gateway on `rpc` answered by an uppercasing activator.
fn serve_rpc(flow: &mut IntegrationFlow, broker: &InMemoryBroker, reply_timeout_ms: u64) {
    let activator = ServiceActivator::new(
        EndpointConfig::adapter("upper", "rpc.requests"),
        flow.registry().clone(),
        upper(),
    )
    .unwrap();
    let gateway = InboundEndpoint::from_factory(
        EndpointConfig::gateway("rpcGateway", "rpc.requests", reply_timeout_ms),
        flow.registry().clone(),
        Arc::new(broker.clone()),
        vec![QueueDefinition::new("rpc")],
        container_config(ContainerConfig::pooled(1)),
    )
    .unwrap();

    flow.register(Arc::new(activator));
    flow.register(Arc::new(gateway));
}

#[tokio::test]
async fn should_answer_broker_requests_through_inbound_gateway() {
    let broker = InMemoryBroker::new();
    let mut flow = IntegrationFlow::new();
    serve_rpc(&mut flow, &broker, 2_000);
    flow.start().await.unwrap();

    let client = AmqpTemplate::new("client", Arc::new(broker.clone()), backoff());
    let reply = client
        .send_and_receive("", "rpc", &Message::new("ping"), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(reply.body, b"PING");
    let history = history::read(&header_mapper::to_message(&reply));
    let types: Vec<_> = history
        .entries()
        .iter()
        .map(|e| e.component_type.as_str())
        .collect();
    assert_eq!(
        types,
        [component_type::INBOUND_GATEWAY, component_type::SERVICE_ACTIVATOR]
    );

    client.close().await.unwrap();
    flow.stop().await.unwrap();
}

#[tokio::test]
async fn should_ack_and_report_gateway_timeouts() {
    let broker = InMemoryBroker::new();
    let mut flow = IntegrationFlow::new();
    flow.registry()
        .declare("slow.requests", ChannelKind::queue(8))
        .await
        .unwrap();
    let mut events = flow.events().subscribe();
    let gateway = InboundEndpoint::from_factory(
        EndpointConfig::gateway("slowGateway", "slow.requests", 50),
        flow.registry().clone(),
        Arc::new(broker.clone()),
        vec![QueueDefinition::new("slow")],
        container_config(ContainerConfig::pooled(1)),
    )
    .unwrap();
    flow.register(Arc::new(gateway));
    flow.start().await.unwrap();

    let started = tokio::time::Instant::now();
    publish(&broker, "slow", "anyone?").await;

    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let event @ IntegrationEvent::GatewayTimeout { .. } = events.recv().await.unwrap() {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(
        event,
        IntegrationEvent::GatewayTimeout {
            component: "slowGateway".into(),
            timeout_ms: 50,
        }
    );
    eventually(|| broker.ack_count() == 1).await;

    flow.stop().await.unwrap();
}

#[tokio::test]
async fn should_round_trip_through_outbound_and_inbound_gateways() {
    let broker = InMemoryBroker::new();
    let mut flow = IntegrationFlow::new();
    serve_rpc(&mut flow, &broker, 2_000);
    let answers = flow
        .registry()
        .declare("answers", ChannelKind::queue(4))
        .await
        .unwrap();
    let outbound = OutboundEndpoint::new(
        EndpointConfig::gateway("client", "client.requests", 2_000).with_output_channel("answers"),
        PublishTarget::queue("rpc"),
        flow.registry().clone(),
        AmqpTemplate::new("client", Arc::new(broker.clone()), backoff()),
    )
    .unwrap();
    flow.register(Arc::new(outbound));
    flow.start().await.unwrap();

    flow.registry()
        .send("client.requests", Message::new("hi"))
        .await
        .unwrap();

    let answer = answers
        .receive(Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer.payload().as_text().unwrap(), "HI");
    let history = history::read(&answer);
    let names: Vec<_> = history.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["client", "rpcGateway", "upper", "client"]);

    flow.stop().await.unwrap();
}

#[tokio::test]
async fn should_publish_through_outbound_adapter() {
    let broker = InMemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    rabbitmq_integration::topology::declare_queue(conn.as_ref(), &QueueDefinition::new("audit"))
        .await
        .unwrap();

    let mut flow = IntegrationFlow::new();
    let outbound = OutboundEndpoint::new(
        EndpointConfig::adapter("auditAdapter", "audit.out"),
        PublishTarget::queue("audit"),
        flow.registry().clone(),
        AmqpTemplate::new("audit", Arc::new(broker.clone()), backoff()),
    )
    .unwrap();
    flow.register(Arc::new(outbound));
    flow.start().await.unwrap();

    flow.registry()
        .send("audit.out", Message::new("logged in"))
        .await
        .unwrap();

    let delivery = conn.basic_get("audit").await.unwrap().unwrap();
    assert_eq!(delivery.body, b"logged in");
    let last = history::read(&header_mapper::to_message(&delivery))
        .last()
        .cloned()
        .unwrap();
    assert_eq!(last.name, "auditAdapter");
    assert_eq!(last.component_type, component_type::OUTBOUND_CHANNEL_ADAPTER);

    flow.stop().await.unwrap();
}

#[tokio::test]
async fn should_dead_letter_after_retries_are_exhausted() {
    let broker = InMemoryBroker::new();
    let mut flow = IntegrationFlow::new();
    let mut events = flow.events().subscribe();
    let activator = ServiceActivator::new(
        EndpointConfig::adapter("worker", "jobs.in"),
        flow.registry().clone(),
        upper(),
    )
    .unwrap();
    let inbound = InboundEndpoint::from_factory(
        EndpointConfig::adapter("jobsAdapter", "jobs.in"),
        flow.registry().clone(),
        Arc::new(broker.clone()),
        vec![QueueDefinition::new("jobs").with_dlq().with_retries(1)],
        container_config(ContainerConfig::pooled(1)),
    )
    .unwrap();
    flow.register(Arc::new(activator));
    flow.register(Arc::new(inbound));
    flow.start().await.unwrap();

    publish(&broker, "jobs", "poison pill").await;

    eventually(|| broker.ready_count("jobs-dlq") == 1).await;
    let mut failures = 0;
    let dead_lettered = loop {
        match events.recv().await.unwrap() {
            IntegrationEvent::HandlerFailed { .. } => failures += 1,
            event @ IntegrationEvent::DeadLettered { .. } => break event,
            _ => {}
        }
    };
    assert_eq!(failures, 2);
    assert_eq!(
        dead_lettered,
        IntegrationEvent::DeadLettered {
            queue: "jobs".into(),
            dlq: "jobs-dlq".into(),
        }
    );

    flow.stop().await.unwrap();
}
