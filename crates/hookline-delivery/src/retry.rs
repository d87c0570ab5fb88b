//! Exponential backoff with additive jitter.
//!
//! Delay for attempt n is `min(base * 2^(n-1), max)` plus a random jitter
//! of up to `jitter_factor` times the capped delay, rounded down to whole
//! seconds. Jitter is strictly additive: a retry never fires earlier than
//! the capped backoff, and with jitter the delay may exceed the cap by at
//! most `jitter_factor * max`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hookline_core::WebhookConfig;
use rand::Rng;

/// Backoff policy for retry scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay for the first retry.
    pub base_delay: Duration,

    /// Cap for the deterministic backoff component.
    pub max_delay: Duration,

    /// Jitter factor in `[0.0, 1.0]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WebhookConfig::default())
    }
}

impl RetryPolicy {
    /// Derives the policy from the delivery configuration.
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay(),
            max_delay: config.max_retry_delay(),
            jitter_factor: config.retry_jitter_factor,
        }
    }

    /// Delay before the retry following attempt `attempt_number` (1-based).
    pub fn delay_for_attempt(&self, attempt_number: i32) -> Duration {
        let attempt = attempt_number.max(1) as u32;
        // Saturate the exponent so very long-lived webhooks cannot overflow.
        let exponent = attempt.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let backoff = self.base_delay.saturating_mul(multiplier);
        let capped = std::cmp::min(backoff, self.max_delay);

        capped + self.jitter(capped)
    }

    /// Absolute time of the next retry after attempt `attempt_number`.
    pub fn next_retry_at(&self, attempt_number: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(attempt_number);
        now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
    }

    /// Additive jitter in whole seconds, up to `jitter_factor * capped`.
    fn jitter(&self, capped: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return Duration::ZERO;
        }

        let clamped = self.jitter_factor.clamp(0.0, 1.0);
        let mut rng = rand::rng();
        let jitter_secs = (rng.random_range(0.0..1.0) * clamped * capped.as_secs_f64()).floor();

        Duration::from_secs(jitter_secs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = no_jitter();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(480));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(960));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = no_jitter();

        // 60 * 2^6 = 3840 exceeds the 3600s cap.
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(3600));
        assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(3600));
    }

    #[test]
    fn large_attempt_numbers_do_not_overflow() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for_attempt(i32::MAX), policy.max_delay);
    }

    #[test]
    fn nonpositive_attempts_use_base_delay() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(-3), Duration::from_secs(60));
    }

    #[test]
    fn jitter_is_strictly_additive_and_bounded() {
        let policy = RetryPolicy { jitter_factor: 0.5, ..RetryPolicy::default() };
        let capped = Duration::from_secs(60);

        for _ in 0..200 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= capped, "jitter must never shorten the delay: {delay:?}");
            assert!(
                delay <= capped + Duration::from_secs(30),
                "jitter exceeds factor bound: {delay:?}"
            );
        }
    }

    #[test]
    fn jitter_produces_variation() {
        let policy = RetryPolicy { jitter_factor: 0.5, ..RetryPolicy::default() };
        let mut seen = std::collections::HashSet::new();

        for _ in 0..100 {
            seen.insert(policy.delay_for_attempt(1).as_secs());
        }

        assert!(seen.len() > 1, "expected varied delays, saw {seen:?}");
    }

    #[test]
    fn jitter_is_whole_seconds() {
        let policy = RetryPolicy { jitter_factor: 0.5, ..RetryPolicy::default() };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert_eq!(delay.subsec_nanos(), 0);
        }
    }

    #[test]
    fn next_retry_at_offsets_from_now() {
        let policy = no_jitter();
        let now = Utc::now();
        assert_eq!(policy.next_retry_at(2, now), now + chrono::Duration::seconds(120));
    }
}
