//! Database access layer implementing the repository pattern.
//!
//! The repositories translate between domain models and the PostgreSQL
//! schema. All database access goes through this module; the delivery
//! crate never issues SQL of its own.

use std::sync::Arc;

use sqlx::PgPool;

pub mod attempts;
pub mod endpoints;
pub mod webhooks;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for webhook lifecycle operations.
    pub webhooks: Arc<webhooks::Repository>,

    /// Repository for destination endpoints and circuit state.
    pub endpoints: Arc<endpoints::Repository>,

    /// Repository for delivery attempt audit records.
    pub attempts: Arc<attempts::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            webhooks: Arc::new(webhooks::Repository::new(pool.clone())),
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            attempts: Arc::new(attempts::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.webhooks.pool()).await?;

        Ok(())
    }
}
