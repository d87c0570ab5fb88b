//! Retry scheduling for failed webhooks.
//!
//! Computes when a failed webhook should next run and persists the
//! schedule. Also repairs webhooks that ended up failed with retries
//! remaining but no schedule, which can happen when a process dies
//! between marking a failure and scheduling the retry.

use std::sync::Arc;

use hookline_core::{models::Webhook, Clock, WebhookStatus};
use tracing::{debug, info};

use crate::{error::Result, retry::RetryPolicy, store::DeliveryStore};

/// Schedules retries for failed webhooks.
pub struct RetryScheduler {
    store: Arc<dyn DeliveryStore>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    /// Creates a scheduler with the given backoff policy.
    pub fn new(store: Arc<dyn DeliveryStore>, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { store, policy, clock }
    }

    /// Schedules the next retry for a failed webhook.
    ///
    /// Returns false without touching anything when the webhook is not in
    /// `Failed` state or its attempt budget is exhausted. Otherwise the
    /// backoff delay is computed for the attempt about to be scheduled,
    /// `attempt_count + 1`, the schedule is persisted, and the entity is
    /// updated in place.
    pub async fn schedule_retry(&self, webhook: &mut Webhook) -> Result<bool> {
        if webhook.status != WebhookStatus::Failed || webhook.attempts_exhausted() {
            return Ok(false);
        }

        let now = self.clock.now();
        let next_retry_at = self.policy.next_retry_at(webhook.attempt_count + 1, now);
        webhook.scheduled_at = Some(next_retry_at);
        self.store.set_webhook_schedule(webhook.id, next_retry_at).await?;

        debug!(
            webhook_id = %webhook.id,
            attempt = webhook.attempt_count,
            next_retry_at = %next_retry_at,
            "retry scheduled"
        );

        Ok(true)
    }

    /// Re-schedules failed webhooks that lost their retry schedule.
    ///
    /// Returns the number of webhooks repaired.
    pub async fn schedule_all_pending(&self, limit: i64) -> Result<usize> {
        let stranded = self.store.failed_unscheduled_webhooks(limit).await?;
        let mut scheduled = 0;

        for mut webhook in stranded {
            if self.schedule_retry(&mut webhook).await? {
                scheduled += 1;
            }
        }

        if scheduled > 0 {
            info!(count = scheduled, "re-scheduled stranded webhooks");
        }

        Ok(scheduled)
    }
}
