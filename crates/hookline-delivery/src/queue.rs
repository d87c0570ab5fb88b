//! Job queue abstraction for delivery invocations.
//!
//! The engine never calls itself recursively; every attempt starts from a
//! queue submission. Production runs on an in-process tokio channel with
//! at-least-once semantics; delivery is idempotent against duplicate
//! submissions because the engine re-checks webhook state on every run.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookline_core::models::WebhookId;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{DeliveryError, Result};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Submission interface for delivery jobs.
pub trait JobQueue: Send + Sync + 'static {
    /// Submits a webhook for processing.
    ///
    /// With `not_before` set, the job must not run before that instant.
    fn submit(&self, webhook_id: WebhookId, not_before: Option<DateTime<Utc>>)
        -> BoxFuture<'_, ()>;
}

/// In-process queue backed by an unbounded tokio channel.
///
/// Delayed submissions are parked on a sleeper task and sent when their
/// time arrives. Pending sleepers are lost on process exit; the retry
/// sweep re-submits anything that was missed.
pub struct TokioJobQueue {
    sender: mpsc::UnboundedSender<WebhookId>,
}

impl TokioJobQueue {
    /// Creates the queue, returning the receiver for the worker pool.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WebhookId>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl JobQueue for TokioJobQueue {
    fn submit(
        &self,
        webhook_id: WebhookId,
        not_before: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, ()> {
        let sender = self.sender.clone();
        Box::pin(async move {
            let delay = not_before
                .map(|at| (at - Utc::now()).to_std().unwrap_or_default())
                .unwrap_or_default();

            if delay.is_zero() {
                return sender.send(webhook_id).map_err(|_| DeliveryError::QueueClosed);
            }

            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if sender.send(webhook_id).is_err() {
                    warn!(%webhook_id, "queue closed before delayed submission fired");
                }
            });

            Ok(())
        })
    }
}

pub mod mock {
    //! Recording queue for tests.

    use tokio::sync::Mutex;

    use super::{Arc, BoxFuture, DateTime, JobQueue, Utc, WebhookId};

    /// Queue that records submissions instead of running them.
    #[derive(Default)]
    pub struct RecordingQueue {
        submissions: Arc<Mutex<Vec<(WebhookId, Option<DateTime<Utc>>)>>>,
    }

    impl RecordingQueue {
        /// Creates an empty recording queue.
        pub fn new() -> Self {
            Self::default()
        }

        /// All submissions in order.
        pub async fn submissions(&self) -> Vec<(WebhookId, Option<DateTime<Utc>>)> {
            self.submissions.lock().await.clone()
        }

        /// Webhook IDs submitted, ignoring delays.
        pub async fn submitted_ids(&self) -> Vec<WebhookId> {
            self.submissions.lock().await.iter().map(|(id, _)| *id).collect()
        }
    }

    impl JobQueue for RecordingQueue {
        fn submit(
            &self,
            webhook_id: WebhookId,
            not_before: Option<DateTime<Utc>>,
        ) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.submissions.lock().await.push((webhook_id, not_before));
                Ok(())
            })
        }
    }
}
