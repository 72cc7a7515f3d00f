//! Integration tests for broker consumption and fan-out.

#![allow(clippy::unwrap_used)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use courier_consumer::{
    BrokerMessage, ConsumerConfig, ConsumerError, EventConsumer, InMemoryBroker, MessageBroker,
    ProcessOutcome,
};
use courier_core::{DeliveryStatus, EventId, LogAction};
use courier_delivery::{DeliveryEngine, EngineConfig};
use courier_testing::{wait_for, EventMessageBuilder, TestEnv, DEFAULT_WAIT_TIMEOUT};
use serde_json::json;
use wiremock::{matchers, Mock, ResponseTemplate};

struct Harness {
    env: TestEnv,
    broker: Arc<InMemoryBroker>,
    consumer: EventConsumer,
}

impl Harness {
    async fn new() -> Result<Self> {
        let env = TestEnv::new().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&env.http)
            .await;
        let engine = DeliveryEngine::new(
            env.repository.clone(),
            EngineConfig::default(),
            Arc::new(env.clock.clone()),
        )?;
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = EventConsumer::new(broker.clone(), engine, ConsumerConfig::default());
        Ok(Self { env, broker, consumer })
    }

    async fn deliver(&self, routing_key: Option<&str>, body: Vec<u8>) -> std::result::Result<ProcessOutcome, ConsumerError> {
        self.broker.publish(routing_key, body)?;
        let message = self.broker.receive().await?.unwrap();
        Ok(self.consumer.handle_message(&message).await?)
    }
}

#[tokio::test]
async fn event_fans_out_to_every_matching_destination() -> Result<()> {
    let h = Harness::new().await?;
    let exact = h.env.create_destination(h.env.destination().event_types(&["user.created"])).await;
    let wildcard = h.env.create_destination(h.env.destination().event_types(&["user.*"])).await;
    h.env.create_destination(h.env.destination().event_types(&["order.*"])).await;
    h.env.create_destination(h.env.destination().inactive()).await;

    let body = EventMessageBuilder::new("user.created").id("evt_1").data(json!({"name": "ada"}));
    let outcome = h.deliver(None, body.build()).await?;

    assert_eq!(outcome, ProcessOutcome::FannedOut { deliveries: 2 });
    let deliveries = h.env.repository.deliveries_for_event(&EventId::from("evt_1")).await;
    let mut destinations: Vec<_> = deliveries.iter().map(|d| d.destination_id).collect();
    destinations.sort_by_key(|id| id.0);
    let mut expected = vec![exact, wildcard];
    expected.sort_by_key(|id| id.0);
    assert_eq!(destinations, expected);

    for delivery in &deliveries {
        h.env.wait_for_delivery_status(delivery.id, DeliveryStatus::Delivered).await?;
    }
    let created_logs = h
        .env
        .repository
        .logs()
        .await
        .iter()
        .filter(|log| log.action == LogAction::DeliveryCreated)
        .count();
    assert_eq!(created_logs, 2);
    assert_eq!(h.broker.acked().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn redelivered_event_is_acked_without_side_effects() -> Result<()> {
    let h = Harness::new().await?;
    h.env.create_destination(h.env.destination()).await;
    h.env.create_destination(h.env.destination()).await;
    let body = EventMessageBuilder::new("user.created").id("evt_1").build();

    let first = h.deliver(None, body.clone()).await?;
    let second = h.deliver(None, body.clone()).await?;
    let third = h.deliver(None, body).await?;

    assert_eq!(first, ProcessOutcome::FannedOut { deliveries: 2 });
    assert_eq!(second, ProcessOutcome::Duplicate);
    assert_eq!(third, ProcessOutcome::Duplicate);
    assert_eq!(h.env.repository.deliveries_for_event(&EventId::from("evt_1")).await.len(), 2);
    assert_eq!(h.broker.acked().await.len(), 3);

    let stats = h.consumer.stats().await;
    assert_eq!((stats.fanned_out, stats.duplicates, stats.deliveries_created), (1, 2, 2));
    Ok(())
}

#[tokio::test]
async fn envelope_keeps_producer_data_bytes() -> Result<()> {
    let h = Harness::new().await?;
    let destination_id = h.env.create_destination(h.env.destination()).await;
    let body = br#"{"id":"evt_9","event":"user.created","data":{"zeta":1,"alpha":[true,null]}}"#;

    h.deliver(None, body.to_vec()).await?;

    let delivery = h.env.repository.deliveries().await.pop().unwrap();
    assert_eq!(delivery.destination_id, destination_id);
    assert!(delivery.payload.starts_with(r#"{"id":"evt_9","event":"user.created","timestamp":""#));
    assert!(delivery.payload.ends_with(r#","data":{"zeta":1,"alpha":[true,null]}}"#));
    Ok(())
}

#[tokio::test]
async fn aliases_and_routing_key_are_accepted() -> Result<()> {
    let h = Harness::new().await?;
    h.env.create_destination(h.env.destination().event_types(&["order.*"])).await;

    let aliased = EventMessageBuilder::new("order.paid").id("evt_a").with_aliases().build();
    let keyed = EventMessageBuilder::new("ignored").id("evt_b").without_event_type().build();

    let first = h.deliver(None, aliased).await?;
    let second = h.deliver(Some("order.refunded"), keyed).await?;

    assert_eq!(first, ProcessOutcome::FannedOut { deliveries: 1 });
    assert_eq!(second, ProcessOutcome::FannedOut { deliveries: 1 });
    let refunded = h.env.repository.deliveries_for_event(&EventId::from("evt_b")).await;
    assert_eq!(refunded[0].event_type, "order.refunded");
    Ok(())
}

#[tokio::test]
async fn unmatched_and_malformed_messages_are_acked() -> Result<()> {
    let h = Harness::new().await?;
    h.env.create_destination(h.env.destination().event_types(&["billing.*"])).await;

    let unmatched = h.deliver(None, EventMessageBuilder::new("user.created").build()).await?;
    let no_id = h.deliver(None, EventMessageBuilder::new("user.created").without_id().build()).await?;
    let garbage = h.deliver(None, b"\x00\x01".to_vec()).await?;

    assert_eq!(unmatched, ProcessOutcome::NoMatchingDestinations);
    assert!(matches!(no_id, ProcessOutcome::Malformed { .. }));
    assert!(matches!(garbage, ProcessOutcome::Malformed { .. }));
    assert_eq!(h.broker.acked().await.len(), 3);
    assert!(h.broker.nacked().await.is_empty());
    assert!(h.env.repository.deliveries().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn repository_failure_nacks_and_redelivery_recovers() -> Result<()> {
    let h = Harness::new().await?;
    h.env.create_destination(h.env.destination()).await;
    h.env.repository.inject_error("connection reset").await;
    let body = EventMessageBuilder::new("user.created").id("evt_1").build();

    let failed = h.deliver(None, body).await;

    assert!(matches!(failed, Err(ConsumerError::Repository(_))));
    assert_eq!(h.broker.nacked().await.len(), 1);
    assert!(h.env.repository.deliveries().await.is_empty());

    let redelivered = h.broker.receive().await?.unwrap();
    assert!(redelivered.redelivered);
    let outcome = h.consumer.handle_message(&redelivered).await?;

    assert_eq!(outcome, ProcessOutcome::FannedOut { deliveries: 1 });
    assert_eq!(h.consumer.stats().await.requeued, 1);
    Ok(())
}

#[tokio::test]
async fn running_consumer_processes_until_shutdown() -> Result<()> {
    let h = Harness::new().await?;
    h.env.create_destination(h.env.destination()).await;
    for n in 0..5 {
        h.broker.publish(None, EventMessageBuilder::new("user.created").id(format!("evt_{n}")).build())?;
    }

    let handle = h.consumer.clone().spawn();
    let repository = h.env.repository.clone();
    wait_for("five delivered deliveries", DEFAULT_WAIT_TIMEOUT, || {
        let repository = repository.clone();
        async move {
            let deliveries = repository.deliveries().await;
            deliveries.len() == 5
                && deliveries.iter().all(|d| d.status == DeliveryStatus::Delivered)
        }
    })
    .await?;
    handle.shutdown().await?;

    assert_eq!(h.broker.acked().await.len(), 5);
    assert_eq!(h.broker.unacked_count().await, 0);
    assert_eq!(h.env.wait_for_requests(5).await?.len(), 5);
    Ok(())
}

#[tokio::test]
async fn closed_broker_stops_the_loop() -> Result<()> {
    let h = Harness::new().await?;
    let handle = h.consumer.clone().spawn();

    h.broker.close();

    wait_for("consumer loop to exit", Duration::from_secs(2), || async {
        handle.is_finished()
    })
    .await?;
    handle.shutdown().await?;
    Ok(())
}

/// Counts messages handed out and not yet settled, and slows every ack.
#[derive(Debug)]
struct SlowAckBroker {
    inner: InMemoryBroker,
    outstanding: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl MessageBroker for SlowAckBroker {
    async fn receive(&self) -> courier_consumer::Result<Option<BrokerMessage>> {
        let message = self.inner.receive().await?;
        if message.is_some() {
            let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }
        Ok(message)
    }

    async fn ack(&self, message: &BrokerMessage) -> courier_consumer::Result<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.inner.ack(message).await
    }

    async fn nack(&self, message: &BrokerMessage) -> courier_consumer::Result<()> {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.inner.nack(message).await
    }
}

#[tokio::test]
async fn prefetch_bounds_messages_in_flight() -> Result<()> {
    let h = Harness::new().await?;
    h.env.create_destination(h.env.destination()).await;
    let broker = Arc::new(SlowAckBroker {
        inner: InMemoryBroker::new(),
        outstanding: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    for n in 0..5 {
        broker.inner.publish(None, EventMessageBuilder::new("user.created").id(format!("evt_{n}")).build())?;
    }
    let engine = DeliveryEngine::new(
        h.env.repository.clone(),
        EngineConfig::default(),
        Arc::new(h.env.clock.clone()),
    )?;
    let config = ConsumerConfig { prefetch: 2, ..ConsumerConfig::default() };
    let handle = EventConsumer::new(broker.clone(), engine, config).spawn();

    let acked = || async { broker.inner.acked().await.len() == 5 };
    wait_for("all messages acked", DEFAULT_WAIT_TIMEOUT, acked).await?;
    handle.shutdown().await?;

    assert_eq!(broker.peak.load(Ordering::SeqCst), 2);
    assert_eq!(broker.inner.unacked_count().await, 0);
    assert_eq!(h.env.repository.deliveries().await.len(), 5);
    Ok(())
}
