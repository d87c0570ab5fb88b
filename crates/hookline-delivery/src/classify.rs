//! Failure classification for dispatch outcomes.
//!
//! Pure decision functions shared by the engine and the retry machinery.
//! Retryable and permanent are deliberately not complements: a status
//! outside both sets (an unexpected 3xx, say) falls through to the generic
//! failure path and retries until the budget runs out.

use hookline_core::models::FailureKind;

use crate::dispatch::{DispatchOutcome, TransportError};

/// Status codes worth retrying.
pub const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Whether the failed outcome is worth retrying.
///
/// Transport failures are always retryable; the destination may simply be
/// restarting. Responses are retryable only for the statuses in
/// [`RETRYABLE_STATUS`].
pub fn is_retryable(outcome: &DispatchOutcome) -> bool {
    match outcome {
        DispatchOutcome::TransportFailed { .. } => true,
        DispatchOutcome::Completed { status, .. } => RETRYABLE_STATUS.contains(status),
    }
}

/// Whether the outcome is a permanent failure that retrying cannot fix.
///
/// Only response-based: a 4xx other than 429 means the request itself is
/// rejected. Transport failures are never permanent.
pub fn is_permanent_failure(outcome: &DispatchOutcome) -> bool {
    match outcome {
        DispatchOutcome::TransportFailed { .. } => false,
        DispatchOutcome::Completed { status, success, .. } => {
            !success && (400..500).contains(status) && *status != 429
        },
    }
}

/// Classifies a failed outcome for the attempt record.
///
/// Returns None for successful outcomes.
pub fn failure_kind(outcome: &DispatchOutcome) -> Option<FailureKind> {
    match outcome {
        DispatchOutcome::Completed { success: true, .. } => None,
        DispatchOutcome::Completed { status, .. } => Some(match status {
            429 => FailureKind::RateLimited,
            400..=499 => FailureKind::ClientError,
            500..=599 => FailureKind::ServerError,
            _ => FailureKind::Unknown,
        }),
        DispatchOutcome::TransportFailed { error, .. } => Some(match error {
            TransportError::Timeout => FailureKind::Timeout,
            TransportError::ConnectionFailed => FailureKind::ConnectionFailed,
            TransportError::Tls => FailureKind::Tls,
            TransportError::Other(_) => FailureKind::Unknown,
        }),
    }
}
