//! Delivery orchestration: enqueue and per-attempt processing.
//!
//! `process` drives exactly one delivery attempt. Retries are not loops
//! inside the engine; each attempt is a fresh invocation scheduled through
//! the job queue, so a crashed process loses at most the attempt that was
//! in flight.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use hookline_core::{
    models::{Webhook, WebhookAttempt, WebhookId},
    Clock, WebhookConfig, WebhookStatus,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    circuit::{CircuitBreaker, CircuitConfig},
    classify,
    dispatch::{DispatchConfig, DispatchOutcome, Dispatcher},
    error::{DeliveryError, Result},
    queue::JobQueue,
    retry::RetryPolicy,
    schedule::RetryScheduler,
    store::DeliveryStore,
};

/// Input for enqueueing a webhook.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    /// Destination URL. Must be http or https with a host.
    pub url: String,

    /// JSON payload to deliver.
    pub payload: serde_json::Value,

    /// Custom headers merged over the defaults at dispatch time.
    pub headers: HashMap<String, String>,

    /// Attempt budget override; defaults to the configured budget.
    pub max_attempts: Option<i32>,

    /// Deduplication key. Re-enqueueing with the same key returns the
    /// original webhook untouched.
    pub idempotency_key: Option<String>,

    /// Earliest time the first attempt may run.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Caller-defined metadata stored with the webhook.
    pub metadata: Option<serde_json::Value>,
}

impl NewWebhook {
    /// Creates an enqueue request with the required fields.
    pub fn new(url: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            payload,
            headers: HashMap::new(),
            max_attempts: None,
            idempotency_key: None,
            scheduled_at: None,
            metadata: None,
        }
    }
}

/// Orchestrates webhook delivery attempts.
pub struct DeliveryEngine {
    store: Arc<dyn DeliveryStore>,
    dispatcher: Dispatcher,
    breaker: CircuitBreaker,
    scheduler: RetryScheduler,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    config: WebhookConfig,
}

impl DeliveryEngine {
    /// Wires up an engine from the delivery configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` when the configuration fails
    /// validation or the HTTP client cannot be built.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        config: WebhookConfig,
    ) -> Result<Self> {
        config.validate().map_err(|e| DeliveryError::Configuration(e.to_string()))?;

        let dispatcher = Dispatcher::new(DispatchConfig::from_config(&config))?;
        let breaker = CircuitBreaker::new(store.clone(), CircuitConfig::from_config(&config));
        let scheduler =
            RetryScheduler::new(store.clone(), RetryPolicy::from_config(&config), clock.clone());

        Ok(Self { store, dispatcher, breaker, scheduler, queue, clock, config })
    }

    /// Accepts a webhook for delivery.
    ///
    /// Validates the URL, applies idempotency, resolves the destination
    /// endpoint, persists the webhook, and submits the first attempt to
    /// the job queue (delayed when `scheduled_at` is in the future).
    pub async fn enqueue(&self, new: NewWebhook) -> Result<Webhook> {
        let parsed = url::Url::parse(&new.url)
            .map_err(|e| DeliveryError::invalid_url(format!("{}: {e}", new.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DeliveryError::invalid_url(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| DeliveryError::invalid_url("missing host"))?
            .to_string();

        if let Some(key) = new.idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_webhook_by_idempotency_key(key).await? {
                debug!(webhook_id = %existing.id, idempotency_key = key, "duplicate enqueue");
                return Ok(existing);
            }
        }

        let now = self.clock.now();
        let endpoint = self.store.find_or_create_endpoint(new.url.clone(), host, now).await?;

        let mut webhook = Webhook::new(
            endpoint.id,
            new.url,
            new.payload,
            new.headers,
            new.max_attempts.unwrap_or(self.config.default_max_attempts),
            new.idempotency_key,
            new.metadata.unwrap_or(serde_json::Value::Null),
            now,
        );
        webhook.scheduled_at = new.scheduled_at.filter(|at| *at > now);

        if let Err(e) = self.store.insert_webhook(webhook.clone()).await {
            // Two racing enqueues with the same key both miss the lookup;
            // the unique index decides and the loser returns the winner.
            if let (hookline_core::CoreError::ConstraintViolation(_), Some(key)) =
                (&e, webhook.idempotency_key.as_deref())
            {
                if let Some(existing) = self.store.find_webhook_by_idempotency_key(key).await? {
                    return Ok(existing);
                }
            }
            return Err(e.into());
        }

        self.queue.submit(webhook.id, webhook.scheduled_at).await?;

        info!(
            webhook_id = %webhook.id,
            endpoint_id = %endpoint.id,
            scheduled_at = ?webhook.scheduled_at,
            "webhook enqueued"
        );

        Ok(webhook)
    }

    /// Runs one delivery attempt for the webhook.
    ///
    /// Missing or non-deliverable webhooks are a no-op so duplicate queue
    /// submissions are harmless. A circuit refusal defers the webhook
    /// without consuming an attempt or recording anything.
    pub async fn process(&self, id: WebhookId) -> Result<()> {
        let Some(mut webhook) = self.store.find_webhook(id).await? else {
            debug!(webhook_id = %id, "webhook not found, skipping");
            return Ok(());
        };

        if !webhook.is_deliverable() {
            debug!(webhook_id = %id, status = %webhook.status, "webhook not deliverable");
            return Ok(());
        }

        let Some(mut endpoint) = self.store.find_endpoint(webhook.endpoint_id).await? else {
            warn!(webhook_id = %id, endpoint_id = %webhook.endpoint_id, "endpoint missing");
            return Ok(());
        };

        let now = self.clock.now();

        if !self.breaker.allow_request(&mut endpoint, now).await? {
            let resume_at = now
                + chrono::Duration::from_std(self.breaker.cooldown())
                    .unwrap_or(chrono::Duration::MAX);
            self.store.set_webhook_schedule(webhook.id, resume_at).await?;
            info!(
                webhook_id = %id,
                endpoint_id = %endpoint.id,
                resume_at = %resume_at,
                "circuit open, delivery deferred"
            );
            return Ok(());
        }

        webhook.mark_processing(now);
        self.store.update_webhook(webhook.clone()).await?;
        let attempt_number = self.store.increment_attempts(webhook.id).await?;
        webhook.attempt_count = attempt_number;

        let outcome = self.dispatcher.dispatch(&webhook).await;
        let finished = self.clock.now();

        // Every dispatch consumes an attempt and leaves an audit record,
        // including attempts that never reached the destination.
        self.store
            .record_attempt(build_attempt(&webhook, attempt_number, &outcome, finished))
            .await?;

        if outcome.is_success() {
            webhook.mark_delivered(finished);
            self.store.update_webhook(webhook.clone()).await?;
            self.breaker.record_success(&mut endpoint, finished).await?;
            info!(
                webhook_id = %id,
                attempt = attempt_number,
                status = outcome.status().unwrap_or_default(),
                "webhook delivered"
            );
            return Ok(());
        }

        self.breaker.record_failure(&mut endpoint, finished).await?;

        if classify::is_permanent_failure(&outcome) {
            webhook.mark_dead(finished);
            self.store.update_webhook(webhook.clone()).await?;
            warn!(
                webhook_id = %id,
                attempt = attempt_number,
                status = outcome.status().unwrap_or_default(),
                "permanent failure, webhook dead"
            );
            return Ok(());
        }

        webhook.mark_failed(finished);
        self.store.update_webhook(webhook.clone()).await?;

        if webhook.status == WebhookStatus::Failed {
            self.scheduler.schedule_retry(&mut webhook).await?;
        } else {
            warn!(
                webhook_id = %id,
                attempts = attempt_number,
                "attempt budget exhausted, webhook dead"
            );
        }

        Ok(())
    }
}

fn build_attempt(
    webhook: &Webhook,
    attempt_number: i32,
    outcome: &DispatchOutcome,
    now: DateTime<Utc>,
) -> WebhookAttempt {
    match outcome {
        DispatchOutcome::Completed { status, success, body, headers, duration_ms } => {
            WebhookAttempt {
                id: Uuid::new_v4(),
                webhook_id: webhook.id,
                attempt_number,
                success: *success,
                response_status: Some(i32::from(*status)),
                response_body: Some(body.clone()),
                response_headers: sqlx::types::Json(headers.clone()),
                error_kind: classify::failure_kind(outcome),
                error_message: if *success { None } else { Some(format!("http status {status}")) },
                duration_ms: *duration_ms,
                created_at: now,
            }
        },
        DispatchOutcome::TransportFailed { error, duration_ms } => WebhookAttempt {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            attempt_number,
            success: false,
            response_status: None,
            response_body: None,
            response_headers: sqlx::types::Json(HashMap::new()),
            error_kind: classify::failure_kind(outcome),
            error_message: Some(error.to_string()),
            duration_ms: *duration_ms,
            created_at: now,
        },
    }
}
