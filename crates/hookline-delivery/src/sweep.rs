//! Periodic sweep re-submitting webhooks whose retry time arrived.
//!
//! The queue only holds submissions made while the process was alive; the
//! durable schedule lives on the webhook rows. The sweep bridges the two
//! by scanning for due webhooks and pushing them back onto the queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hookline_core::{models::Webhook, Clock};
use tracing::{debug, info, warn};

use crate::{circuit::CircuitBreaker, error::Result, queue::JobQueue, store::DeliveryStore};

/// Scans for due retries and re-submits them.
pub struct RetrySweep {
    store: Arc<dyn DeliveryStore>,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    batch_size: i64,
}

impl RetrySweep {
    /// Creates a sweep over the given store and queue.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        breaker: Arc<CircuitBreaker>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        batch_size: i64,
    ) -> Self {
        Self { store, breaker, queue, clock, batch_size }
    }

    /// Runs one sweep pass, returning the number of webhooks submitted.
    ///
    /// A failure on one webhook is logged and does not abort the batch.
    pub async fn run_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = self.store.webhooks_due_for_retry(now, self.batch_size).await?;
        let mut submitted = 0;

        for webhook in due {
            match self.resubmit(&webhook, now).await {
                Ok(true) => submitted += 1,
                Ok(false) => {},
                Err(e) => {
                    warn!(webhook_id = %webhook.id, error = %e, "sweep entry failed");
                },
            }
        }

        if submitted > 0 {
            info!(count = submitted, "retry sweep submitted webhooks");
        }

        Ok(submitted)
    }

    /// Re-submits one due webhook unless its endpoint circuit refuses.
    ///
    /// On refusal the schedule is left in place so a later sweep picks the
    /// webhook up once the cooldown elapses.
    async fn resubmit(&self, webhook: &Webhook, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut endpoint) = self.store.find_endpoint(webhook.endpoint_id).await? else {
            warn!(webhook_id = %webhook.id, "endpoint missing, skipping sweep entry");
            return Ok(false);
        };

        if !self.breaker.allow_request(&mut endpoint, now).await? {
            debug!(
                webhook_id = %webhook.id,
                endpoint_id = %endpoint.id,
                "circuit open, leaving webhook scheduled"
            );
            return Ok(false);
        }

        self.store.clear_webhook_schedule(webhook.id).await?;
        self.queue.submit(webhook.id, None).await?;

        Ok(true)
    }
}
