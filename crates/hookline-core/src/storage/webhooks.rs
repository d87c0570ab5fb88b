//! Repository for webhook lifecycle persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Webhook, WebhookId},
};

/// Repository for webhook rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a repository backed by the given pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Shared access to the underlying pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new webhook row.
    pub async fn create(&self, webhook: &Webhook) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhooks (
                id, endpoint_id, url, payload, headers, status,
                attempt_count, max_attempts, scheduled_at, delivered_at,
                failed_at, idempotency_key, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(webhook.id)
        .bind(webhook.endpoint_id)
        .bind(&webhook.url)
        .bind(&webhook.payload)
        .bind(webhook.headers.clone())
        .bind(webhook.status)
        .bind(webhook.attempt_count)
        .bind(webhook.max_attempts)
        .bind(webhook.scheduled_at)
        .bind(webhook.delivered_at)
        .bind(webhook.failed_at)
        .bind(&webhook.idempotency_key)
        .bind(&webhook.metadata)
        .bind(webhook.created_at)
        .bind(webhook.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a webhook by ID.
    pub async fn find_by_id(&self, id: WebhookId) -> Result<Option<Webhook>> {
        let webhook = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(webhook)
    }

    /// Finds a webhook by its idempotency key.
    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Webhook>> {
        let webhook =
            sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(webhook)
    }

    /// Persists the lifecycle fields of a webhook.
    ///
    /// Does not write `attempt_count`; that column only changes through
    /// [`Repository::increment_attempts`] so concurrent workers cannot
    /// clobber each other's increments.
    pub async fn update(&self, webhook: &Webhook) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhooks
            SET status = $2,
                scheduled_at = $3,
                delivered_at = $4,
                failed_at = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(webhook.id)
        .bind(webhook.status)
        .bind(webhook.scheduled_at)
        .bind(webhook.delivered_at)
        .bind(webhook.failed_at)
        .bind(webhook.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Atomically consumes one delivery attempt.
    ///
    /// Returns the post-increment attempt count, which doubles as the
    /// attempt number of the dispatch about to run.
    pub async fn increment_attempts(&self, id: WebhookId) -> Result<i32> {
        let (count,): (i32,) = sqlx::query_as(
            r#"
            UPDATE webhooks
            SET attempt_count = attempt_count + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING attempt_count
            "#,
        )
        .bind(id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }

    /// Sets the retry schedule for a webhook.
    pub async fn set_scheduled_at(&self, id: WebhookId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE webhooks SET scheduled_at = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Clears the retry schedule before re-enqueueing.
    pub async fn clear_scheduled_at(&self, id: WebhookId) -> Result<()> {
        sqlx::query("UPDATE webhooks SET scheduled_at = NULL, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Failed webhooks whose retry time has arrived.
    ///
    /// Only webhooks with budget remaining qualify. Ordered by schedule so
    /// the longest-overdue webhooks go first.
    pub async fn due_for_retry(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Webhook>> {
        let webhooks = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT * FROM webhooks
            WHERE status = 'failed'
              AND attempt_count < max_attempts
              AND scheduled_at IS NOT NULL
              AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(webhooks)
    }

    /// Failed webhooks that lost their retry schedule.
    ///
    /// These are stranded: retries remain but nothing will pick them up
    /// until a schedule is assigned again.
    pub async fn failed_unscheduled(&self, limit: i64) -> Result<Vec<Webhook>> {
        let webhooks = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT * FROM webhooks
            WHERE status = 'failed'
              AND attempt_count < max_attempts
              AND scheduled_at IS NULL
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(webhooks)
    }
}
