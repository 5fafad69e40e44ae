//! Reconnection Policy
//!
//! Exponential backoff with a bounded attempt budget:
//!
//! ```text
//! delay(n) = base_delay * 2^n      n = 0, 1, ..., max_attempts - 1
//! ```
//!
//! With the defaults (3 s, 5 attempts) the retries fire after 3, 6, 12, 24
//! and 48 seconds. Reaching `Streaming` resets the budget. A subscription
//! marked as intentionally closed never schedules a retry, and marking it
//! drops any retry already pending.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Sleep};

use crate::config::StreamConfig;

/// A scheduled reconnect; dropping it cancels the timer
#[derive(Debug)]
pub struct PendingRetry {
    attempt: u32,
    delay: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl PendingRetry {
    /// Zero-based attempt number this retry consumes
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Backoff delay chosen for this retry
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait for the backoff to elapse
    pub async fn wait(&mut self) {
        self.sleep.as_mut().await;
    }
}

/// Retry bookkeeping for one subscription key
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_attempts: u32,
    attempts: u32,
    intentional_close: bool,
}

impl ReconnectPolicy {
    /// Create from stream configuration
    #[must_use]
    pub fn new(config: &StreamConfig) -> Self {
        Self::with_limits(config.reconnect_base_delay(), config.max_reconnect_attempts)
    }

    /// Create with explicit limits
    #[must_use]
    pub fn with_limits(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            attempts: 0,
            intentional_close: false,
        }
    }

    /// Retries consumed since the last healthy connection
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Configured budget
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff for a zero-based attempt number
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Whether another retry is allowed
    #[must_use]
    pub fn should_retry(&self) -> bool {
        !self.intentional_close && self.attempts < self.max_attempts
    }

    /// Consume one attempt and start its backoff timer
    ///
    /// Returns `None` when the budget is exhausted or the subscription was
    /// closed on purpose.
    pub fn schedule_retry(&mut self) -> Option<PendingRetry> {
        if !self.should_retry() {
            return None;
        }
        let attempt = self.attempts;
        let delay = self.delay_for_attempt(attempt);
        self.attempts += 1;
        Some(PendingRetry {
            attempt,
            delay,
            sleep: Box::pin(sleep(delay)),
        })
    }

    /// The connection is healthy again
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// Suppress all further retries
    pub fn mark_intentional_close(&mut self) {
        self.intentional_close = true;
    }

    /// Allow retries again
    pub fn clear_intentional_close(&mut self) {
        self.intentional_close = false;
    }

    /// Whether the subscription was closed on purpose
    #[must_use]
    pub fn is_intentional_close(&self) -> bool {
        self.intentional_close
    }
}
