//! Worker pool consuming delivery jobs from the queue.
//!
//! Workers pull webhook IDs from the shared channel and run them through
//! the engine one at a time. A cancellation token coordinates graceful
//! shutdown; in-flight attempts are given a drain window to finish.

use std::{sync::Arc, time::Duration};

use hookline_core::models::WebhookId;
use tokio::{
    sync::{mpsc::UnboundedReceiver, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{engine::DeliveryEngine, schedule::RetryScheduler, sweep::RetrySweep};

/// Pool of delivery workers plus the periodic maintenance task.
pub struct WorkerPool {
    engine: Arc<DeliveryEngine>,
    receiver: Arc<Mutex<UnboundedReceiver<WebhookId>>>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a pool reading from the given queue receiver.
    pub fn new(engine: Arc<DeliveryEngine>, receiver: UnboundedReceiver<WebhookId>) -> Self {
        Self {
            engine,
            receiver: Arc::new(Mutex::new(receiver)),
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Spawns `count` delivery workers.
    pub fn spawn_workers(&mut self, count: usize) {
        for worker_id in 0..count {
            let engine = self.engine.clone();
            let receiver = self.receiver.clone();
            let shutdown = self.shutdown.clone();

            self.handles.push(tokio::spawn(async move {
                debug!(worker_id, "delivery worker started");
                loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = async { receiver.lock().await.recv().await } => next,
                    };

                    match next {
                        Some(webhook_id) => {
                            if let Err(e) = engine.process(webhook_id).await {
                                error!(worker_id, %webhook_id, error = %e, "delivery attempt failed");
                            }
                        },
                        None => break,
                    }
                }
                debug!(worker_id, "delivery worker stopped");
            }));
        }

        info!(count, "delivery workers spawned");
    }

    /// Spawns the periodic maintenance task.
    ///
    /// Each tick repairs stranded schedules, then sweeps due retries back
    /// onto the queue.
    pub fn spawn_maintenance(
        &mut self,
        sweep: Arc<RetrySweep>,
        scheduler: Arc<RetryScheduler>,
        interval: Duration,
        batch_size: i64,
    ) {
        let shutdown = self.shutdown.clone();

        self.handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {},
                }

                if let Err(e) = scheduler.schedule_all_pending(batch_size).await {
                    warn!(error = %e, "schedule repair pass failed");
                }
                if let Err(e) = sweep.run_once().await {
                    warn!(error = %e, "retry sweep pass failed");
                }
            }
            debug!("maintenance task stopped");
        }));
    }

    /// Signals shutdown and waits for workers to drain.
    ///
    /// Workers past the drain window are abandoned, not aborted; their
    /// in-flight attempt completes or fails on its own.
    pub async fn shutdown_graceful(self, drain: Duration) {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + drain;

        for handle in self.handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("worker did not stop within drain window");
            }
        }

        info!("worker pool shut down");
    }
}
