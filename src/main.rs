//! Hookline webhook delivery service.
//!
//! Main entry point. Initializes the database, delivery engine, and
//! worker pool, then coordinates graceful startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookline_core::{storage::Storage, RealClock};
use hookline_delivery::{
    circuit::{CircuitBreaker, CircuitConfig},
    engine::DeliveryEngine,
    queue::TokioJobQueue,
    retry::RetryPolicy,
    schedule::RetryScheduler,
    store::{DeliveryStore, PostgresDeliveryStore},
    sweep::RetrySweep,
    worker::WorkerPool,
};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

mod config;

use config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting hookline webhook delivery service");

    let config = AppConfig::load()?;
    info!(
        database_url = %config.database_url_masked(),
        workers = config.worker_count,
        sweep_interval_secs = config.sweep_interval_secs,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    run_migrations(&db_pool).await?;
    info!("database ready");

    let storage = Storage::new(db_pool.clone());
    storage.health_check().await.context("database health check failed")?;

    let store: Arc<dyn DeliveryStore> =
        Arc::new(PostgresDeliveryStore::new(Arc::new(storage)));
    let clock = Arc::new(RealClock);
    let (queue, receiver) = TokioJobQueue::new();
    let queue = Arc::new(queue);

    let engine = Arc::new(DeliveryEngine::new(
        store.clone(),
        queue.clone(),
        clock.clone(),
        config.webhook.clone(),
    )?);

    let breaker = Arc::new(CircuitBreaker::new(
        store.clone(),
        CircuitConfig::from_config(&config.webhook),
    ));
    let sweep = Arc::new(RetrySweep::new(
        store.clone(),
        breaker,
        queue.clone(),
        clock.clone(),
        config.sweep_batch_size,
    ));
    let scheduler = Arc::new(RetryScheduler::new(
        store,
        RetryPolicy::from_config(&config.webhook),
        clock,
    ));

    let mut workers = WorkerPool::new(engine, receiver);
    workers.spawn_workers(config.worker_count);
    workers.spawn_maintenance(
        sweep,
        scheduler,
        Duration::from_secs(config.sweep_interval_secs),
        config.sweep_batch_size,
    );

    info!("hookline is ready to deliver webhooks");

    shutdown_signal().await;
    info!("shutdown signal received, draining workers");

    workers.shutdown_graceful(Duration::from_secs(config.shutdown_grace_secs)).await;

    db_pool.close().await;
    info!("hookline shutdown complete");

    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,hookline=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &AppConfig) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_) if retries < MAX_RETRIES => {
                retries += 1;
                info!(attempt = retries, max_retries = MAX_RETRIES, "database connection failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Ensures the schema exists.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS webhook_endpoints (
            id UUID PRIMARY KEY,
            url TEXT NOT NULL UNIQUE,
            host TEXT NOT NULL,
            success_count BIGINT NOT NULL DEFAULT 0,
            failure_count BIGINT NOT NULL DEFAULT 0,
            circuit_state TEXT NOT NULL DEFAULT 'closed',
            circuit_opened_at TIMESTAMPTZ,
            last_success_at TIMESTAMPTZ,
            last_failure_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create webhook_endpoints table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS webhooks (
            id UUID PRIMARY KEY,
            endpoint_id UUID NOT NULL REFERENCES webhook_endpoints(id),
            url TEXT NOT NULL,
            payload JSONB NOT NULL,
            headers JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            scheduled_at TIMESTAMPTZ,
            delivered_at TIMESTAMPTZ,
            failed_at TIMESTAMPTZ,
            idempotency_key TEXT,
            metadata JSONB NOT NULL DEFAULT 'null'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create webhooks table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS webhook_attempts (
            id UUID PRIMARY KEY,
            webhook_id UUID NOT NULL REFERENCES webhooks(id),
            attempt_number INTEGER NOT NULL,
            success BOOLEAN NOT NULL,
            response_status INTEGER,
            response_body TEXT,
            response_headers JSONB NOT NULL DEFAULT '{}'::jsonb,
            error_kind TEXT,
            error_message TEXT,
            duration_ms BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create webhook_attempts table")?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_webhooks_idempotency_key
        ON webhooks(idempotency_key)
        WHERE idempotency_key IS NOT NULL
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create idempotency key index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_webhooks_retry_due
        ON webhooks(scheduled_at)
        WHERE status = 'failed' AND scheduled_at IS NOT NULL
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create retry due index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_webhook_attempts_webhook
        ON webhook_attempts(webhook_id, attempt_number)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create attempts index")?;

    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received CTRL+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
