//! Repository for destination endpoints and persisted circuit state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{CircuitState, EndpointId, WebhookEndpoint},
};

/// Persisted circuit breaker transition.
///
/// Captures the target state plus the bookkeeping that rides along with
/// it, so a transition lands in a single UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitUpdate {
    /// New circuit state.
    pub state: CircuitState,
    /// Open timestamp; Some exactly when `state` is `Open`.
    pub opened_at: Option<DateTime<Utc>>,
    /// Whether the consecutive-failure streak resets (circuit close).
    pub reset_failures: bool,
}

impl CircuitUpdate {
    /// Transition to `Open` stamped at the given time.
    pub fn open(now: DateTime<Utc>) -> Self {
        Self { state: CircuitState::Open, opened_at: Some(now), reset_failures: false }
    }

    /// Transition to `HalfOpen` for a probe request.
    pub fn half_open() -> Self {
        Self { state: CircuitState::HalfOpen, opened_at: None, reset_failures: false }
    }

    /// Transition to `Closed`, resetting the failure streak.
    pub fn close() -> Self {
        Self { state: CircuitState::Closed, opened_at: None, reset_failures: true }
    }
}

/// Repository for webhook endpoint rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a repository backed by the given pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new endpoint row.
    pub async fn create(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_endpoints (
                id, url, host, success_count, failure_count, circuit_state,
                circuit_opened_at, last_success_at, last_failure_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(endpoint.id)
        .bind(&endpoint.url)
        .bind(&endpoint.host)
        .bind(endpoint.success_count)
        .bind(endpoint.failure_count)
        .bind(endpoint.circuit_state)
        .bind(endpoint.circuit_opened_at)
        .bind(endpoint.last_success_at)
        .bind(endpoint.last_failure_at)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds an endpoint by ID.
    pub async fn find_by_id(&self, id: EndpointId) -> Result<Option<WebhookEndpoint>> {
        let endpoint =
            sqlx::query_as::<_, WebhookEndpoint>("SELECT * FROM webhook_endpoints WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(endpoint)
    }

    /// Resolves the endpoint for a URL, creating it on first sight.
    ///
    /// Concurrent enqueues for the same URL race on the unique index; the
    /// upsert makes both land on the same row.
    pub async fn find_or_create_by_url(
        &self,
        url: &str,
        host: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookEndpoint> {
        let endpoint = sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            INSERT INTO webhook_endpoints (
                id, url, host, success_count, failure_count, circuit_state,
                circuit_opened_at, last_success_at, last_failure_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, 0, 0, 'closed', NULL, NULL, NULL, $4, $4)
            ON CONFLICT (url) DO UPDATE SET url = EXCLUDED.url
            RETURNING *
            "#,
        )
        .bind(EndpointId::new())
        .bind(url)
        .bind(host)
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Atomically records a successful delivery.
    pub async fn record_success(&self, id: EndpointId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_endpoints
            SET success_count = success_count + 1,
                last_success_at = $2,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Atomically records a failed delivery.
    ///
    /// Returns the post-increment consecutive failure count used for the
    /// circuit breaker threshold check.
    pub async fn record_failure(&self, id: EndpointId, now: DateTime<Utc>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            UPDATE webhook_endpoints
            SET failure_count = failure_count + 1,
                last_failure_at = $2,
                updated_at = $2
            WHERE id = $1
            RETURNING failure_count
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }

    /// Applies a circuit breaker transition in one statement.
    pub async fn update_circuit(
        &self,
        id: EndpointId,
        update: CircuitUpdate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_endpoints
            SET circuit_state = $2,
                circuit_opened_at = $3,
                failure_count = CASE WHEN $4 THEN 0 ELSE failure_count END,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.state)
        .bind(update.opened_at)
        .bind(update.reset_failures)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
