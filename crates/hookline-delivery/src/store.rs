//! Storage abstraction for the delivery pipeline.
//!
//! Everything the engine, scheduler, sweep, and circuit breaker need from
//! persistence goes through [`DeliveryStore`]. Production uses the
//! PostgreSQL repositories from `hookline-core`; tests use the in-memory
//! [`mock::MemoryStore`] for deterministic behavior without a database.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookline_core::{
    error::Result,
    models::{Webhook, WebhookAttempt, WebhookEndpoint, WebhookId},
    CircuitUpdate, EndpointId,
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the delivery pipeline.
///
/// Counter updates (`increment_attempts`, `record_endpoint_failure`) are
/// atomic and return the post-update value so concurrent workers never
/// base decisions on stale reads.
pub trait DeliveryStore: Send + Sync + 'static {
    /// Finds a webhook by ID.
    fn find_webhook(&self, id: WebhookId) -> BoxFuture<'_, Option<Webhook>>;

    /// Finds a webhook by its idempotency key.
    fn find_webhook_by_idempotency_key(&self, key: &str) -> BoxFuture<'_, Option<Webhook>>;

    /// Inserts a newly enqueued webhook.
    fn insert_webhook(&self, webhook: Webhook) -> BoxFuture<'_, ()>;

    /// Persists the lifecycle fields of a webhook.
    ///
    /// Never writes `attempt_count`; that column changes only through
    /// [`DeliveryStore::increment_attempts`].
    fn update_webhook(&self, webhook: Webhook) -> BoxFuture<'_, ()>;

    /// Atomically consumes one delivery attempt, returning the new count.
    fn increment_attempts(&self, id: WebhookId) -> BoxFuture<'_, i32>;

    /// Sets the retry schedule for a webhook.
    fn set_webhook_schedule(&self, id: WebhookId, at: DateTime<Utc>) -> BoxFuture<'_, ()>;

    /// Clears the retry schedule before re-enqueueing.
    fn clear_webhook_schedule(&self, id: WebhookId) -> BoxFuture<'_, ()>;

    /// Failed webhooks whose retry time has arrived, oldest schedule first.
    fn webhooks_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BoxFuture<'_, Vec<Webhook>>;

    /// Failed webhooks with retries remaining but no schedule.
    fn failed_unscheduled_webhooks(&self, limit: i64) -> BoxFuture<'_, Vec<Webhook>>;

    /// Finds an endpoint by ID.
    fn find_endpoint(&self, id: EndpointId) -> BoxFuture<'_, Option<WebhookEndpoint>>;

    /// Resolves the endpoint for a URL, creating it on first sight.
    fn find_or_create_endpoint(
        &self,
        url: String,
        host: String,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, WebhookEndpoint>;

    /// Atomically records a successful delivery on the endpoint.
    fn record_endpoint_success(&self, id: EndpointId, now: DateTime<Utc>) -> BoxFuture<'_, ()>;

    /// Atomically records a failed delivery, returning the new streak.
    fn record_endpoint_failure(&self, id: EndpointId, now: DateTime<Utc>) -> BoxFuture<'_, i64>;

    /// Applies a circuit breaker transition.
    fn update_circuit(
        &self,
        id: EndpointId,
        update: CircuitUpdate,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, ()>;

    /// Records a delivery attempt for the audit trail.
    fn record_attempt(&self, attempt: WebhookAttempt) -> BoxFuture<'_, ()>;

    /// All attempts for a webhook in attempt order.
    fn attempts_for(&self, webhook_id: WebhookId) -> BoxFuture<'_, Vec<WebhookAttempt>>;
}

/// Production store backed by the PostgreSQL repositories.
pub struct PostgresDeliveryStore {
    storage: Arc<hookline_core::storage::Storage>,
}

impl PostgresDeliveryStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<hookline_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStore for PostgresDeliveryStore {
    fn find_webhook(&self, id: WebhookId) -> BoxFuture<'_, Option<Webhook>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.find_by_id(id).await })
    }

    fn find_webhook_by_idempotency_key(&self, key: &str) -> BoxFuture<'_, Option<Webhook>> {
        let storage = self.storage.clone();
        let key = key.to_string();
        Box::pin(async move { storage.webhooks.find_by_idempotency_key(&key).await })
    }

    fn insert_webhook(&self, webhook: Webhook) -> BoxFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.create(&webhook).await })
    }

    fn update_webhook(&self, webhook: Webhook) -> BoxFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.update(&webhook).await })
    }

    fn increment_attempts(&self, id: WebhookId) -> BoxFuture<'_, i32> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.increment_attempts(id).await })
    }

    fn set_webhook_schedule(&self, id: WebhookId, at: DateTime<Utc>) -> BoxFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.set_scheduled_at(id, at).await })
    }

    fn clear_webhook_schedule(&self, id: WebhookId) -> BoxFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.clear_scheduled_at(id).await })
    }

    fn webhooks_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BoxFuture<'_, Vec<Webhook>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.due_for_retry(now, limit).await })
    }

    fn failed_unscheduled_webhooks(&self, limit: i64) -> BoxFuture<'_, Vec<Webhook>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.failed_unscheduled(limit).await })
    }

    fn find_endpoint(&self, id: EndpointId) -> BoxFuture<'_, Option<WebhookEndpoint>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.endpoints.find_by_id(id).await })
    }

    fn find_or_create_endpoint(
        &self,
        url: String,
        host: String,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, WebhookEndpoint> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.endpoints.find_or_create_by_url(&url, &host, now).await })
    }

    fn record_endpoint_success(&self, id: EndpointId, now: DateTime<Utc>) -> BoxFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.endpoints.record_success(id, now).await })
    }

    fn record_endpoint_failure(&self, id: EndpointId, now: DateTime<Utc>) -> BoxFuture<'_, i64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.endpoints.record_failure(id, now).await })
    }

    fn update_circuit(
        &self,
        id: EndpointId,
        update: CircuitUpdate,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.endpoints.update_circuit(id, update, now).await })
    }

    fn record_attempt(&self, attempt: WebhookAttempt) -> BoxFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.attempts.create(&attempt).await })
    }

    fn attempts_for(&self, webhook_id: WebhookId) -> BoxFuture<'_, Vec<WebhookAttempt>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.attempts.find_by_webhook(webhook_id).await })
    }
}

pub mod mock {
    //! In-memory store for tests.
    //!
    //! Mirrors the semantics of the PostgreSQL repositories, including the
    //! rule that `update_webhook` never writes the attempt counter.

    use std::{collections::HashMap, sync::Arc};

    use hookline_core::error::CoreError;
    use tokio::sync::RwLock;

    use super::{
        BoxFuture, CircuitUpdate, DateTime, DeliveryStore, EndpointId, Result, Utc, Webhook,
        WebhookAttempt, WebhookEndpoint, WebhookId,
    };

    /// Deterministic in-memory implementation of [`DeliveryStore`].
    #[derive(Default)]
    pub struct MemoryStore {
        webhooks: Arc<RwLock<HashMap<WebhookId, Webhook>>>,
        endpoints: Arc<RwLock<HashMap<EndpointId, WebhookEndpoint>>>,
        attempts: Arc<RwLock<Vec<WebhookAttempt>>>,
        fail_next_write: Arc<RwLock<Option<String>>>,
    }

    impl MemoryStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a webhook.
        pub async fn add_webhook(&self, webhook: Webhook) {
            self.webhooks.write().await.insert(webhook.id, webhook);
        }

        /// Seeds an endpoint.
        pub async fn add_endpoint(&self, endpoint: WebhookEndpoint) {
            self.endpoints.write().await.insert(endpoint.id, endpoint);
        }

        /// Current state of a webhook.
        pub async fn webhook(&self, id: WebhookId) -> Option<Webhook> {
            self.webhooks.read().await.get(&id).cloned()
        }

        /// Current state of an endpoint.
        pub async fn endpoint(&self, id: EndpointId) -> Option<WebhookEndpoint> {
            self.endpoints.read().await.get(&id).cloned()
        }

        /// All recorded attempts for a webhook in attempt order.
        pub async fn attempts(&self, webhook_id: WebhookId) -> Vec<WebhookAttempt> {
            let mut attempts: Vec<_> = self
                .attempts
                .read()
                .await
                .iter()
                .filter(|a| a.webhook_id == webhook_id)
                .cloned()
                .collect();
            attempts.sort_by_key(|a| a.attempt_number);
            attempts
        }

        /// Makes the next webhook write fail with a database error.
        pub async fn inject_write_error(&self, message: impl Into<String>) {
            *self.fail_next_write.write().await = Some(message.into());
        }

        async fn take_injected_error(&self) -> Result<()> {
            if let Some(message) = self.fail_next_write.write().await.take() {
                return Err(CoreError::Database(message));
            }
            Ok(())
        }
    }

    impl DeliveryStore for MemoryStore {
        fn find_webhook(&self, id: WebhookId) -> BoxFuture<'_, Option<Webhook>> {
            Box::pin(async move { Ok(self.webhooks.read().await.get(&id).cloned()) })
        }

        fn find_webhook_by_idempotency_key(&self, key: &str) -> BoxFuture<'_, Option<Webhook>> {
            let key = key.to_string();
            Box::pin(async move {
                Ok(self
                    .webhooks
                    .read()
                    .await
                    .values()
                    .find(|w| w.idempotency_key.as_deref() == Some(key.as_str()))
                    .cloned())
            })
        }

        fn insert_webhook(&self, webhook: Webhook) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.take_injected_error().await?;
                self.webhooks.write().await.insert(webhook.id, webhook);
                Ok(())
            })
        }

        fn update_webhook(&self, webhook: Webhook) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.take_injected_error().await?;
                if let Some(stored) = self.webhooks.write().await.get_mut(&webhook.id) {
                    stored.status = webhook.status;
                    stored.scheduled_at = webhook.scheduled_at;
                    stored.delivered_at = webhook.delivered_at;
                    stored.failed_at = webhook.failed_at;
                    stored.updated_at = webhook.updated_at;
                }
                Ok(())
            })
        }

        fn increment_attempts(&self, id: WebhookId) -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let mut webhooks = self.webhooks.write().await;
                let webhook = webhooks
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("webhook {id} not found")))?;
                webhook.attempt_count += 1;
                Ok(webhook.attempt_count)
            })
        }

        fn set_webhook_schedule(&self, id: WebhookId, at: DateTime<Utc>) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                if let Some(webhook) = self.webhooks.write().await.get_mut(&id) {
                    webhook.scheduled_at = Some(at);
                }
                Ok(())
            })
        }

        fn clear_webhook_schedule(&self, id: WebhookId) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                if let Some(webhook) = self.webhooks.write().await.get_mut(&id) {
                    webhook.scheduled_at = None;
                }
                Ok(())
            })
        }

        fn webhooks_due_for_retry(
            &self,
            now: DateTime<Utc>,
            limit: i64,
        ) -> BoxFuture<'_, Vec<Webhook>> {
            Box::pin(async move {
                let mut due: Vec<_> = self
                    .webhooks
                    .read()
                    .await
                    .values()
                    .filter(|w| {
                        w.status == hookline_core::WebhookStatus::Failed
                            && w.attempt_count < w.max_attempts
                            && w.scheduled_at.is_some_and(|at| at <= now)
                    })
                    .cloned()
                    .collect();
                due.sort_by_key(|w| w.scheduled_at);
                due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
                Ok(due)
            })
        }

        fn failed_unscheduled_webhooks(&self, limit: i64) -> BoxFuture<'_, Vec<Webhook>> {
            Box::pin(async move {
                let mut stranded: Vec<_> = self
                    .webhooks
                    .read()
                    .await
                    .values()
                    .filter(|w| {
                        w.status == hookline_core::WebhookStatus::Failed
                            && w.attempt_count < w.max_attempts
                            && w.scheduled_at.is_none()
                    })
                    .cloned()
                    .collect();
                stranded.sort_by_key(|w| w.updated_at);
                stranded.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
                Ok(stranded)
            })
        }

        fn find_endpoint(&self, id: EndpointId) -> BoxFuture<'_, Option<WebhookEndpoint>> {
            Box::pin(async move { Ok(self.endpoints.read().await.get(&id).cloned()) })
        }

        fn find_or_create_endpoint(
            &self,
            url: String,
            host: String,
            now: DateTime<Utc>,
        ) -> BoxFuture<'_, WebhookEndpoint> {
            Box::pin(async move {
                let mut endpoints = self.endpoints.write().await;
                if let Some(existing) = endpoints.values().find(|e| e.url == url) {
                    return Ok(existing.clone());
                }
                let endpoint = WebhookEndpoint::new(url, host, now);
                endpoints.insert(endpoint.id, endpoint.clone());
                Ok(endpoint)
            })
        }

        fn record_endpoint_success(
            &self,
            id: EndpointId,
            now: DateTime<Utc>,
        ) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                if let Some(endpoint) = self.endpoints.write().await.get_mut(&id) {
                    endpoint.record_success(now);
                }
                Ok(())
            })
        }

        fn record_endpoint_failure(
            &self,
            id: EndpointId,
            now: DateTime<Utc>,
        ) -> BoxFuture<'_, i64> {
            Box::pin(async move {
                let mut endpoints = self.endpoints.write().await;
                let endpoint = endpoints
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("endpoint {id} not found")))?;
                endpoint.record_failure(now);
                Ok(endpoint.failure_count)
            })
        }

        fn update_circuit(
            &self,
            id: EndpointId,
            update: CircuitUpdate,
            now: DateTime<Utc>,
        ) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                if let Some(endpoint) = self.endpoints.write().await.get_mut(&id) {
                    endpoint.circuit_state = update.state;
                    endpoint.circuit_opened_at = update.opened_at;
                    if update.reset_failures {
                        endpoint.failure_count = 0;
                    }
                    endpoint.updated_at = now;
                }
                Ok(())
            })
        }

        fn record_attempt(&self, attempt: WebhookAttempt) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.attempts.write().await.push(attempt);
                Ok(())
            })
        }

        fn attempts_for(&self, webhook_id: WebhookId) -> BoxFuture<'_, Vec<WebhookAttempt>> {
            Box::pin(async move { Ok(self.attempts(webhook_id).await) })
        }
    }
}
