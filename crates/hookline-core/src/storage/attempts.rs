//! Repository for delivery attempt audit records.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{WebhookAttempt, WebhookId},
};

/// Repository for attempt rows. Rows are append-only.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a repository backed by the given pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts an attempt record.
    pub async fn create(&self, attempt: &WebhookAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_attempts (
                id, webhook_id, attempt_number, success, response_status,
                response_body, response_headers, error_kind, error_message,
                duration_ms, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.webhook_id)
        .bind(attempt.attempt_number)
        .bind(attempt.success)
        .bind(attempt.response_status)
        .bind(&attempt.response_body)
        .bind(attempt.response_headers.clone())
        .bind(attempt.error_kind)
        .bind(&attempt.error_message)
        .bind(attempt.duration_ms)
        .bind(attempt.created_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// All attempts for a webhook in attempt order.
    pub async fn find_by_webhook(&self, webhook_id: WebhookId) -> Result<Vec<WebhookAttempt>> {
        let attempts = sqlx::query_as::<_, WebhookAttempt>(
            "SELECT * FROM webhook_attempts WHERE webhook_id = $1 ORDER BY attempt_number ASC",
        )
        .bind(webhook_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }
}
