//! Integration tests for the delivery engine.
//!
//! Each test runs against an in-memory repository, a test clock and a
//! wiremock destination, and checks the persisted delivery state after each
//! attempt.

#![allow(clippy::unwrap_used)]

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use courier_core::{
    Clock, Delivery, DeliveryEvent, DeliveryRepository, DeliveryStatus, DestinationId, ErrorKind,
    EventId, LogAction, RealClock, SigningSecret,
};
use courier_delivery::{
    signature, AttemptOutcome, DeliveryEngine, DeliveryError, EngineConfig, RetryScheduler,
    SchedulerConfig, SkipReason, TEST_EVENT_TYPE,
};
use courier_testing::{DestinationBuilder, RecordingEventHandler, TestEnv};
use serde_json::value::RawValue;
use wiremock::{matchers, Mock, ResponseTemplate};

const UNREACHABLE_URL: &str = "http://127.0.0.1:1/webhook";

fn engine(env: &TestEnv) -> DeliveryEngine {
    DeliveryEngine::new(env.repository.clone(), EngineConfig::default(), Arc::new(env.clock.clone()))
        .unwrap()
}

async fn seed(
    env: &TestEnv,
    engine: &DeliveryEngine,
    destination_id: DestinationId,
    event_id: &str,
) -> Result<Delivery> {
    let destination = env.stored_destination(destination_id).await?;
    let data = RawValue::from_string(r#"{"user_id":42,"plan":"pro"}"#.to_string())?;
    let delivery = engine
        .prepare_deliveries(&[destination], &EventId::from(event_id), "user.created", &data)?
        .pop()
        .context("no delivery prepared")?;
    env.repository.create_delivery(delivery).await?.context("delivery already existed")
}

async fn respond_with(env: &TestEnv, status: u16) {
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&env.http)
        .await;
}

#[tokio::test]
async fn successful_attempt_marks_delivered_and_resets_failures() -> Result<()> {
    let env = TestEnv::new().await;
    respond_with(&env, 200).await;
    let engine = engine(&env);
    let destination_id = env.create_destination(env.destination()).await;
    env.repository.increment_failure_count(destination_id, env.clock.now_utc()).await?;
    env.repository.increment_failure_count(destination_id, env.clock.now_utc()).await?;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;

    let outcome = engine.attempt_delivery(delivery.id).await?;

    assert_eq!(outcome, AttemptOutcome::Delivered { status_code: 200 });
    let stored = env.stored_delivery(delivery.id).await?;
    assert_eq!(stored.status, DeliveryStatus::Delivered);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.response_status, Some(200));
    assert_eq!(stored.delivered_at, Some(env.clock.now_utc()));
    assert!(stored.next_retry_at.is_none());
    assert!(stored.error_kind.is_none());

    let destination = env.stored_destination(destination_id).await?;
    assert_eq!(destination.success_count, 1);
    assert_eq!(destination.failure_count, 2);
    assert_eq!(destination.consecutive_failures, 0);

    let actions: Vec<_> = env.repository.logs().await.iter().map(|log| log.action).collect();
    assert_eq!(actions, vec![LogAction::DeliverySucceeded]);
    assert_eq!(engine.stats().await.successful_deliveries, 1);
    Ok(())
}

#[tokio::test]
async fn request_body_is_the_signed_envelope() -> Result<()> {
    let env = TestEnv::new().await;
    respond_with(&env, 204).await;
    let engine = engine(&env);
    let destination_id =
        env.create_destination(env.destination().header("X-Tenant", "acme")).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;

    engine.attempt_delivery(delivery.id).await?;

    let requests = env.wait_for_requests(1).await?;
    let request = &requests[0];
    let header = |name: &str| {
        request.headers.get(name).and_then(|value| value.to_str().ok()).unwrap_or_default()
    };

    assert_eq!(request.body, delivery.payload.as_bytes());
    let secret = env.stored_destination(destination_id).await?.secret;
    assert!(signature::verify(&request.body, header("X-Webhook-Signature"), &secret));
    assert_eq!(header("Content-Type"), "application/json");
    assert_eq!(header("X-Webhook-ID"), destination_id.to_string());
    assert_eq!(header("X-Event-ID"), "evt_1");
    assert_eq!(header("X-Event-Type"), "user.created");
    assert_eq!(header("X-Delivery-ID"), delivery.id.to_string());
    assert_eq!(header("X-Delivery-Attempt"), "1");
    assert_eq!(header("X-Tenant"), "acme");

    let envelope: serde_json::Value = serde_json::from_slice(&request.body)?;
    assert_eq!(envelope["id"], "evt_1");
    assert_eq!(envelope["event"], "user.created");
    assert_eq!(envelope["data"]["plan"], "pro");
    assert!(envelope["timestamp"].is_string());
    Ok(())
}

#[tokio::test]
async fn unreachable_destination_backs_off_then_fails() -> Result<()> {
    let env = TestEnv::new().await;
    let engine = engine(&env);
    let destination_id =
        env.create_destination(DestinationBuilder::new(UNREACHABLE_URL).max_attempts(3)).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;
    let t0 = env.clock.now_utc();

    let first = engine.attempt_delivery(delivery.id).await?;
    assert_eq!(
        first,
        AttemptOutcome::RetryScheduled {
            next_retry_at: t0 + ChronoDuration::milliseconds(1000),
            error_kind: ErrorKind::Network,
        }
    );
    let stored = env.stored_delivery(delivery.id).await?;
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.error_kind, Some(ErrorKind::Network));

    env.clock.advance(Duration::from_millis(1000));
    let second = engine.attempt_delivery(delivery.id).await?;
    assert_eq!(
        second,
        AttemptOutcome::RetryScheduled {
            next_retry_at: t0 + ChronoDuration::milliseconds(1000 + 2000),
            error_kind: ErrorKind::Network,
        }
    );

    env.clock.advance(Duration::from_millis(2000));
    let third = engine.attempt_delivery(delivery.id).await?;
    assert_eq!(third, AttemptOutcome::Failed { error_kind: ErrorKind::Network });

    let stored = env.stored_delivery(delivery.id).await?;
    assert_eq!(stored.status, DeliveryStatus::Failed);
    assert_eq!(stored.attempts, 3);
    assert!(stored.next_retry_at.is_none());

    let destination = env.stored_destination(destination_id).await?;
    assert_eq!(destination.failure_count, 3);
    assert_eq!(destination.consecutive_failures, 3);

    let failed_logs =
        env.repository.logs().await.iter().filter(|l| l.action == LogAction::DeliveryFailed).count();
    assert_eq!(failed_logs, 1);

    let stats = engine.stats().await;
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.retries_scheduled, 2);
    assert_eq!(stats.permanent_failures, 1);
    Ok(())
}

#[tokio::test]
async fn client_errors_consume_retry_budget_like_server_errors() -> Result<()> {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such hook"))
        .mount(&env.http)
        .await;
    let engine = engine(&env);
    let destination_id = env.create_destination(env.destination()).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;

    let outcome = engine.attempt_delivery(delivery.id).await?;

    assert!(matches!(
        outcome,
        AttemptOutcome::RetryScheduled { error_kind: ErrorKind::HttpStatus(404), .. }
    ));
    let stored = env.stored_delivery(delivery.id).await?;
    assert_eq!(stored.response_status, Some(404));
    assert_eq!(stored.response_body.as_deref(), Some("no such hook"));
    assert_eq!(stored.error_message.as_deref(), Some("HTTP 404"));
    Ok(())
}

#[tokio::test]
async fn manual_retry_reopens_exhausted_delivery() -> Result<()> {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&env.http)
        .await;
    respond_with(&env, 200).await;
    let engine = engine(&env);
    let destination_id = env.create_destination(env.destination().max_attempts(1)).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;

    let outcome = engine.attempt_delivery(delivery.id).await?;
    assert_eq!(outcome, AttemptOutcome::Failed { error_kind: ErrorKind::HttpStatus(500) });

    let reopened = engine.retry_delivery(delivery.id).await?;
    assert_eq!(reopened.status, DeliveryStatus::Pending);
    assert_eq!(reopened.attempts, 1);
    assert_eq!(reopened.next_retry_at, Some(env.clock.now_utc()));

    let delivered = env.wait_for_delivery_status(delivery.id, DeliveryStatus::Delivered).await?;
    assert_eq!(delivered.attempts, 2);
    assert!(env.repository.logs().await.iter().any(|l| l.action == LogAction::DeliveryRetried));
    Ok(())
}

#[tokio::test]
async fn delivered_delivery_cannot_be_retried_or_reattempted() -> Result<()> {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.http)
        .await;
    let engine = engine(&env);
    let destination_id = env.create_destination(env.destination()).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;
    engine.attempt_delivery(delivery.id).await?;

    let retry = engine.retry_delivery(delivery.id).await;
    let again = engine.attempt_delivery(delivery.id).await?;

    assert!(matches!(retry, Err(DeliveryError::InvalidState { .. })));
    assert_eq!(again, AttemptOutcome::Skipped { reason: SkipReason::NotPending });
    assert_eq!(env.stored_delivery(delivery.id).await?.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn inactive_destination_leaves_delivery_untouched() -> Result<()> {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&env.http)
        .await;
    let engine = engine(&env);
    let destination_id = env.create_destination(env.destination()).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;
    env.repository.set_destination_active(destination_id, false).await;

    let outcome = engine.attempt_delivery(delivery.id).await?;

    assert_eq!(outcome, AttemptOutcome::Skipped { reason: SkipReason::DestinationInactive });
    assert_eq!(env.stored_delivery(delivery.id).await?, delivery);
    Ok(())
}

#[tokio::test]
async fn missing_destination_fails_without_consuming_an_attempt() -> Result<()> {
    let env = TestEnv::new().await;
    let engine = engine(&env);
    let ghost = env.destination().build();
    let data = RawValue::from_string("{}".to_string())?;
    let delivery = engine
        .prepare_deliveries(&[ghost], &EventId::from("evt_1"), "user.created", &data)?
        .pop()
        .context("no delivery prepared")?;
    env.repository.create_delivery(delivery.clone()).await?;

    let outcome = engine.attempt_delivery(delivery.id).await?;

    assert_eq!(outcome, AttemptOutcome::Failed { error_kind: ErrorKind::Unknown });
    let stored = env.stored_delivery(delivery.id).await?;
    assert_eq!(stored.status, DeliveryStatus::Failed);
    assert_eq!(stored.attempts, 0);
    Ok(())
}

#[tokio::test]
async fn failing_destination_does_not_affect_sibling_delivery() -> Result<()> {
    let env = TestEnv::new().await;
    Mock::given(matchers::path("/good"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&env.http)
        .await;
    Mock::given(matchers::path("/bad"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&env.http)
        .await;
    let engine = engine(&env);
    let good = env
        .create_destination(DestinationBuilder::new(format!("{}/good", env.http.uri())))
        .await;
    let bad =
        env.create_destination(DestinationBuilder::new(format!("{}/bad", env.http.uri()))).await;
    let good_delivery = seed(&env, &engine, good, "evt_1").await?;
    let bad_delivery = seed(&env, &engine, bad, "evt_1").await?;

    let bad_outcome = engine.attempt_delivery(bad_delivery.id).await?;
    let good_outcome = engine.attempt_delivery(good_delivery.id).await?;

    assert!(matches!(bad_outcome, AttemptOutcome::RetryScheduled { .. }));
    assert_eq!(good_outcome, AttemptOutcome::Delivered { status_code: 200 });
    assert_eq!(env.stored_delivery(good_delivery.id).await?.status, DeliveryStatus::Delivered);
    assert_eq!(env.stored_destination(good).await?.failure_count, 0);
    assert_eq!(env.stored_destination(bad).await?.failure_count, 1);
    Ok(())
}

#[tokio::test]
async fn rotated_secret_re_signs_stored_payload() -> Result<()> {
    let env = TestEnv::new().await;
    respond_with(&env, 200).await;
    let engine = engine(&env);
    let destination_id = env.create_destination(env.destination().secret("old")).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;

    let mut destination = env.stored_destination(destination_id).await?;
    destination.secret = SigningSecret::new("new");
    env.repository.add_destination(destination).await;

    engine.attempt_delivery(delivery.id).await?;

    let stored = env.stored_delivery(delivery.id).await?;
    let new_secret = SigningSecret::new("new");
    assert_eq!(stored.payload, delivery.payload);
    assert_ne!(stored.signature, delivery.signature);
    assert!(signature::verify(stored.payload.as_bytes(), &stored.signature, &new_secret));

    let requests = env.wait_for_requests(1).await?;
    let sent = requests[0].headers.get("X-Webhook-Signature").unwrap().to_str()?;
    assert_eq!(sent, stored.signature);
    Ok(())
}

#[tokio::test]
async fn send_test_delivers_synthetic_event() -> Result<()> {
    let env = TestEnv::new().await;
    respond_with(&env, 200).await;
    let engine = engine(&env);
    let destination_id = env.create_destination(env.destination().event_types(&["order.*"])).await;

    let delivery = engine.send_test(destination_id).await?;

    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.event_type, TEST_EVENT_TYPE);
    assert!(delivery.event_id.as_str().starts_with("test_"));
    assert_eq!(delivery.max_attempts, 1);
    let actions: Vec<_> = env.repository.logs().await.iter().map(|l| l.action).collect();
    assert!(actions.contains(&LogAction::DestinationTested));
    Ok(())
}

#[tokio::test]
async fn send_test_rejects_unknown_and_inactive_destinations() -> Result<()> {
    let env = TestEnv::new().await;
    let engine = engine(&env);
    let inactive = env.create_destination(env.destination().inactive()).await;

    let unknown = engine.send_test(DestinationId::new()).await;
    let disabled = engine.send_test(inactive).await;

    assert!(matches!(unknown, Err(DeliveryError::NotFound { entity: "destination", .. })));
    assert!(matches!(disabled, Err(DeliveryError::InvalidState { .. })));
    Ok(())
}

#[tokio::test]
async fn outcomes_are_reported_to_event_handler() -> Result<()> {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&env.http)
        .await;
    respond_with(&env, 200).await;
    let handler = RecordingEventHandler::new();
    let engine = DeliveryEngine::with_event_handler(
        env.repository.clone(),
        EngineConfig::default(),
        Arc::new(env.clock.clone()),
        handler.clone(),
    )?;
    let destination_id = env.create_destination(env.destination()).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;

    engine.attempt_delivery(delivery.id).await?;
    env.clock.advance(Duration::from_secs(1));
    engine.attempt_delivery(delivery.id).await?;

    let events = handler.wait_for_events(2, Duration::from_secs(2)).await;
    match (&events[0], &events[1]) {
        (DeliveryEvent::Failed(failed), DeliveryEvent::Succeeded(succeeded)) => {
            assert_eq!(failed.error_kind, ErrorKind::HttpStatus(502));
            assert!(!failed.is_terminal());
            assert_eq!(failed.attempt_number, 1);
            assert_eq!(succeeded.attempt_number, 2);
            assert_eq!(succeeded.delivery_id, delivery.id);
        },
        other => panic!("unexpected events: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn concurrent_attempts_on_one_delivery_send_once() -> Result<()> {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&env.http)
        .await;
    let engine = engine(&env);
    let destination_id = env.create_destination(env.destination()).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;

    let (first, second) =
        tokio::join!(engine.attempt_delivery(delivery.id), engine.attempt_delivery(delivery.id));

    let outcomes = [first?, second?];
    let delivered = outcomes
        .iter()
        .filter(|o| matches!(o, AttemptOutcome::Delivered { .. }))
        .count();
    let skipped = outcomes.iter().filter(|o| matches!(o, AttemptOutcome::Skipped { .. })).count();
    assert_eq!((delivered, skipped), (1, 1));
    assert_eq!(env.stored_delivery(delivery.id).await?.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn rate_limited_destination_waits_for_tokens() -> Result<()> {
    let env = TestEnv::new().await;
    respond_with(&env, 200).await;
    let engine = engine(&env);
    let destination_id = env.create_destination(env.destination().rate_limit(1)).await;
    let first = seed(&env, &engine, destination_id, "evt_1").await?;
    let second = seed(&env, &engine, destination_id, "evt_2").await?;

    engine.attempt_delivery(first.id).await?;
    engine.attempt_delivery(second.id).await?;

    assert!(env.clock.elapsed() >= Duration::from_secs(1));
    assert_eq!(env.stored_delivery(second.id).await?.status, DeliveryStatus::Delivered);
    Ok(())
}

#[tokio::test]
async fn attempt_before_next_retry_at_is_skipped() -> Result<()> {
    let env = TestEnv::new().await;
    respond_with(&env, 500).await;
    let engine = engine(&env);
    let destination_id = env.create_destination(env.destination()).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;

    let first = engine.attempt_delivery(delivery.id).await?;
    let early = engine.attempt_delivery(delivery.id).await?;

    assert!(matches!(first, AttemptOutcome::RetryScheduled { .. }));
    assert_eq!(early, AttemptOutcome::Skipped { reason: SkipReason::NotDue });
    assert_eq!(env.stored_delivery(delivery.id).await?.attempts, 1);
    assert_eq!(env.http.received_requests().await.unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn repeated_queueing_does_not_skip_backoff() -> Result<()> {
    let env = TestEnv::new().await;
    respond_with(&env, 500).await;
    let engine = DeliveryEngine::new(
        env.repository.clone(),
        EngineConfig { max_concurrent_deliveries: 1, ..EngineConfig::default() },
        Arc::new(env.clock.clone()),
    )?;
    let scheduler = RetryScheduler::new(engine.clone(), SchedulerConfig::default());
    let destination_id = env.create_destination(env.destination()).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;
    let t0 = env.clock.now_utc();

    assert!(engine.queue_delivery(delivery.id));
    assert!(engine.queue_delivery(delivery.id));
    scheduler.process_pending_deliveries().await?;
    engine.shutdown(Duration::from_secs(5)).await?;

    let stored = env.stored_delivery(delivery.id).await?;
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert_eq!(stored.next_retry_at, Some(t0 + ChronoDuration::seconds(1)));
    assert_eq!(env.http.received_requests().await.unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn throttled_destination_does_not_hold_up_others() -> Result<()> {
    let env = TestEnv::new().await;
    respond_with(&env, 200).await;
    let engine = DeliveryEngine::new(
        env.repository.clone(),
        EngineConfig { max_concurrent_deliveries: 2, ..EngineConfig::default() },
        Arc::new(RealClock::new()),
    )?;
    let throttled = env.create_destination(env.destination().rate_limit(1)).await;
    let open = env.create_destination(env.destination()).await;
    for n in 0..4 {
        let delivery = seed(&env, &engine, throttled, &format!("evt_{n}")).await?;
        assert!(engine.queue_delivery(delivery.id));
    }

    let started = Instant::now();
    let unthrottled = seed(&env, &engine, open, "evt_open").await?;
    assert!(engine.queue_delivery(unthrottled.id));
    env.wait_for_delivery_status(unthrottled.id, DeliveryStatus::Delivered).await?;

    assert!(
        started.elapsed() < Duration::from_millis(500),
        "unthrottled delivery took {:?}",
        started.elapsed()
    );
    engine.shutdown(Duration::from_secs(10)).await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_waits_for_queued_attempts() -> Result<()> {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
        .mount(&env.http)
        .await;
    let engine = engine(&env);
    let destination_id = env.create_destination(env.destination()).await;
    let delivery = seed(&env, &engine, destination_id, "evt_1").await?;

    assert!(engine.queue_delivery(delivery.id));
    engine.shutdown(Duration::from_secs(5)).await?;

    assert_eq!(env.stored_delivery(delivery.id).await?.status, DeliveryStatus::Delivered);
    assert!(!engine.queue_delivery(delivery.id));
    Ok(())
}
