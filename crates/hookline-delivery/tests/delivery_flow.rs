//! End-to-end delivery pipeline tests against a mock destination.
//!
//! Runs the engine with the in-memory store, a recording queue, and a
//! controllable clock, so every state transition and schedule is
//! observable and deterministic (jitter disabled).

use std::{collections::HashMap, sync::Arc, time::Duration};

use hookline_core::{
    models::{FailureKind, Webhook, WebhookEndpoint},
    CircuitState, Clock, TestClock, WebhookConfig, WebhookStatus,
};
use hookline_delivery::{
    engine::{DeliveryEngine, NewWebhook},
    error::DeliveryError,
    queue::mock::RecordingQueue,
    store::{mock::MemoryStore, DeliveryStore},
};
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

struct TestEnv {
    store: Arc<MemoryStore>,
    queue: Arc<RecordingQueue>,
    clock: Arc<TestClock>,
    engine: DeliveryEngine,
}

fn test_config() -> WebhookConfig {
    WebhookConfig {
        retry_jitter_factor: 0.0,
        connect_timeout_secs: 1,
        read_timeout_secs: 1,
        ..WebhookConfig::default()
    }
}

fn env_with(config: WebhookConfig) -> TestEnv {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(RecordingQueue::new());
    let clock = Arc::new(TestClock::default_start());
    let engine = DeliveryEngine::new(
        store.clone() as Arc<dyn DeliveryStore>,
        queue.clone(),
        clock.clone(),
        config,
    )
    .expect("engine construction");
    TestEnv { store, queue, clock, engine }
}

fn env() -> TestEnv {
    env_with(test_config())
}

impl TestEnv {
    async fn seed_endpoint(&self, url: &str) -> WebhookEndpoint {
        let endpoint =
            WebhookEndpoint::new(url.to_string(), "127.0.0.1".to_string(), self.clock.now());
        self.store.add_endpoint(endpoint.clone()).await;
        endpoint
    }

    async fn seed_webhook(&self, endpoint: &WebhookEndpoint, max_attempts: i32) -> Webhook {
        let webhook = Webhook::new(
            endpoint.id,
            endpoint.url.clone(),
            serde_json::json!({"event": "order.created", "order_id": 42}),
            HashMap::new(),
            max_attempts,
            None,
            serde_json::Value::Null,
            self.clock.now(),
        );
        self.store.add_webhook(webhook.clone()).await;
        webhook
    }
}

#[tokio::test]
async fn transient_failure_then_success_delivers_on_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let env = env();
    let endpoint = env.seed_endpoint(&server.uri()).await;
    let webhook = env.seed_webhook(&endpoint, 5).await;

    env.engine.process(webhook.id).await.unwrap();

    let after_first = env.store.webhook(webhook.id).await.unwrap();
    assert_eq!(after_first.status, WebhookStatus::Failed);
    assert_eq!(after_first.attempt_count, 1);
    // One attempt consumed, so the schedule targets attempt 2.
    assert_eq!(
        after_first.scheduled_at,
        Some(env.clock.now() + chrono::Duration::seconds(120))
    );

    let endpoint_state = env.store.endpoint(endpoint.id).await.unwrap();
    assert_eq!(endpoint_state.failure_count, 1);

    env.clock.advance(Duration::from_secs(120));
    env.engine.process(webhook.id).await.unwrap();

    let delivered = env.store.webhook(webhook.id).await.unwrap();
    assert_eq!(delivered.status, WebhookStatus::Delivered);
    assert_eq!(delivered.attempt_count, 2);
    assert!(delivered.delivered_at.is_some());
    assert_eq!(delivered.scheduled_at, None);

    let attempts = env.store.attempts(webhook.id).await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].attempt_number, 1);
    assert!(!attempts[0].success);
    assert_eq!(attempts[0].response_status, Some(503));
    assert_eq!(attempts[0].error_kind, Some(FailureKind::ServerError));
    assert_eq!(attempts[1].attempt_number, 2);
    assert!(attempts[1].success);
    assert_eq!(attempts[1].response_status, Some(200));

    let endpoint_state = env.store.endpoint(endpoint.id).await.unwrap();
    assert_eq!(endpoint_state.success_count, 1);
    assert!(endpoint_state.last_success_at.is_some());
}

#[tokio::test]
async fn permanent_failure_goes_dead_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let env = env();
    let endpoint = env.seed_endpoint(&server.uri()).await;
    let webhook = env.seed_webhook(&endpoint, 5).await;

    env.engine.process(webhook.id).await.unwrap();

    let dead = env.store.webhook(webhook.id).await.unwrap();
    assert_eq!(dead.status, WebhookStatus::Dead);
    assert_eq!(dead.attempt_count, 1);
    assert_eq!(dead.scheduled_at, None);
    assert!(dead.failed_at.is_some());

    let attempts = env.store.attempts(webhook.id).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].error_kind, Some(FailureKind::ClientError));

    // Dead is terminal: another invocation is a no-op.
    env.engine.process(webhook.id).await.unwrap();
    assert_eq!(env.store.attempts(webhook.id).await.len(), 1);
}

#[tokio::test]
async fn transport_failures_exhaust_budget_and_go_dead() {
    let env = env();
    // Nothing listens on port 1, so every attempt fails in transport.
    let endpoint = env.seed_endpoint("http://127.0.0.1:1/hooks").await;
    let webhook = env.seed_webhook(&endpoint, 3).await;

    for _ in 0..3 {
        env.clock.advance(Duration::from_secs(3600));
        env.engine.process(webhook.id).await.unwrap();
    }

    let dead = env.store.webhook(webhook.id).await.unwrap();
    assert_eq!(dead.status, WebhookStatus::Dead);
    assert_eq!(dead.attempt_count, 3);

    let attempts = env.store.attempts(webhook.id).await;
    assert_eq!(attempts.len(), 3);
    for (i, attempt) in attempts.iter().enumerate() {
        assert_eq!(attempt.attempt_number, i as i32 + 1);
        assert!(!attempt.success);
        assert_eq!(attempt.response_status, None);
        assert_eq!(attempt.error_kind, Some(FailureKind::ConnectionFailed));
    }

    // Budget exhausted: further invocations never dispatch.
    env.engine.process(webhook.id).await.unwrap();
    assert_eq!(env.store.attempts(webhook.id).await.len(), 3);
}

#[tokio::test]
async fn repeated_failures_open_circuit_and_probe_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(5)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let env = env();
    let endpoint = env.seed_endpoint(&server.uri()).await;
    let webhook = env.seed_webhook(&endpoint, 10).await;

    // Five consecutive failures reach the threshold.
    for _ in 0..5 {
        env.clock.advance(Duration::from_secs(3600));
        env.engine.process(webhook.id).await.unwrap();
    }

    let tripped = env.store.endpoint(endpoint.id).await.unwrap();
    assert_eq!(tripped.circuit_state, CircuitState::Open);
    assert_eq!(tripped.failure_count, 5);
    assert!(tripped.circuit_opened_at.is_some());

    // During cooldown the engine refuses without consuming an attempt.
    let before = env.store.webhook(webhook.id).await.unwrap();
    env.engine.process(webhook.id).await.unwrap();
    let deferred = env.store.webhook(webhook.id).await.unwrap();
    assert_eq!(deferred.status, before.status);
    assert_eq!(deferred.attempt_count, 5);
    assert_eq!(
        deferred.scheduled_at,
        Some(env.clock.now() + chrono::Duration::seconds(300))
    );
    assert_eq!(env.store.attempts(webhook.id).await.len(), 5);

    // After cooldown the probe goes through and closes the circuit.
    env.clock.advance(Duration::from_secs(300));
    env.engine.process(webhook.id).await.unwrap();

    let delivered = env.store.webhook(webhook.id).await.unwrap();
    assert_eq!(delivered.status, WebhookStatus::Delivered);
    assert_eq!(delivered.attempt_count, 6);

    let recovered = env.store.endpoint(endpoint.id).await.unwrap();
    assert_eq!(recovered.circuit_state, CircuitState::Closed);
    assert_eq!(recovered.failure_count, 0);
    assert_eq!(recovered.circuit_opened_at, None);
    assert_eq!(recovered.success_count, 1);
}

#[tokio::test]
async fn open_circuit_defers_without_dispatching() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let env = env();
    let mut endpoint = env.seed_endpoint(&server.uri()).await;
    endpoint.open_circuit(env.clock.now());
    env.store.add_endpoint(endpoint.clone()).await;
    let webhook = env.seed_webhook(&endpoint, 5).await;

    env.engine.process(webhook.id).await.unwrap();

    let deferred = env.store.webhook(webhook.id).await.unwrap();
    assert_eq!(deferred.status, WebhookStatus::Pending);
    assert_eq!(deferred.attempt_count, 0);
    assert_eq!(
        deferred.scheduled_at,
        Some(env.clock.now() + chrono::Duration::seconds(300))
    );
    assert!(env.store.attempts(webhook.id).await.is_empty());
}

#[tokio::test]
async fn enqueue_is_idempotent_on_key() {
    let env = env();

    let mut first = NewWebhook::new("https://example.com/hooks", serde_json::json!({"n": 1}));
    first.idempotency_key = Some("order-42".to_string());
    let created = env.engine.enqueue(first).await.unwrap();

    let mut second = NewWebhook::new("https://example.com/hooks", serde_json::json!({"n": 2}));
    second.idempotency_key = Some("order-42".to_string());
    let duplicate = env.engine.enqueue(second).await.unwrap();

    assert_eq!(duplicate.id, created.id);
    // The original payload wins.
    assert_eq!(duplicate.payload, serde_json::json!({"n": 1}));
    // Only the first enqueue reached the queue.
    assert_eq!(env.queue.submitted_ids().await, vec![created.id]);
}

#[tokio::test]
async fn enqueue_reuses_endpoint_for_same_url() {
    let env = env();

    let a = env
        .engine
        .enqueue(NewWebhook::new("https://example.com/hooks", serde_json::json!({"n": 1})))
        .await
        .unwrap();
    let b = env
        .engine
        .enqueue(NewWebhook::new("https://example.com/hooks", serde_json::json!({"n": 2})))
        .await
        .unwrap();
    let other = env
        .engine
        .enqueue(NewWebhook::new("https://other.example.com/hooks", serde_json::json!({})))
        .await
        .unwrap();

    assert_eq!(a.endpoint_id, b.endpoint_id);
    assert_ne!(a.endpoint_id, other.endpoint_id);
}

#[tokio::test]
async fn delivered_webhook_is_never_reprocessed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let env = env();
    let endpoint = env.seed_endpoint(&server.uri()).await;
    let mut webhook = env.seed_webhook(&endpoint, 5).await;
    webhook.mark_delivered(env.clock.now());
    env.store.add_webhook(webhook.clone()).await;

    env.engine.process(webhook.id).await.unwrap();
    assert!(env.store.attempts(webhook.id).await.is_empty());
}

#[tokio::test]
async fn backoff_schedule_doubles_across_retries() {
    let env = env();
    let endpoint = env.seed_endpoint("http://127.0.0.1:1/hooks").await;
    let webhook = env.seed_webhook(&endpoint, 5).await;

    env.engine.process(webhook.id).await.unwrap();
    let first = env.store.webhook(webhook.id).await.unwrap();
    assert_eq!(first.scheduled_at, Some(env.clock.now() + chrono::Duration::seconds(120)));

    env.clock.advance(Duration::from_secs(120));
    env.engine.process(webhook.id).await.unwrap();
    let second = env.store.webhook(webhook.id).await.unwrap();
    assert_eq!(
        second.scheduled_at,
        Some(env.clock.now() + chrono::Duration::seconds(240))
    );
}

#[tokio::test]
async fn storage_failures_propagate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let env = env();
    let endpoint = env.seed_endpoint(&server.uri()).await;
    let webhook = env.seed_webhook(&endpoint, 5).await;

    env.store.inject_write_error("connection reset").await;
    let result = env.engine.process(webhook.id).await;
    assert!(matches!(result, Err(DeliveryError::Storage(_))));
}
