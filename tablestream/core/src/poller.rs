//! Fallback Poller
//!
//! Periodic snapshot re-fetch used while no live stream exists: streaming
//! disabled by configuration, or the reconnection budget exhausted. A
//! successful stream stops it. Poll failures are logged by the owner and
//! never stop the timer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::error::StreamError;
use crate::models::{AvailabilitySnapshot, SubscriptionKey};
use crate::transport::SnapshotSource;

/// Interval timer plus the fetch it drives
pub struct FallbackPoller {
    key: SubscriptionKey,
    source: Arc<dyn SnapshotSource>,
    interval: Option<Interval>,
    polls: u64,
}

impl FallbackPoller {
    /// Create a stopped poller for `key`
    pub fn new(key: SubscriptionKey, source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            key,
            source,
            interval: None,
            polls: 0,
        }
    }

    /// Start ticking every `period`; no-op if already running
    ///
    /// The first tick fires one full period from now, since the caller
    /// already holds a fresh snapshot. A zero period is refused.
    pub fn start(&mut self, period: Duration) {
        if self.interval.is_some() {
            return;
        }
        if period.is_zero() {
            tracing::warn!(key = %self.key, "Refusing to poll with a zero interval");
            return;
        }
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
        tracing::info!(key = %self.key, period_ms = period.as_millis() as u64, "Fallback polling started");
    }

    /// Stop ticking; no-op if stopped
    pub fn stop(&mut self) {
        if self.interval.take().is_some() {
            tracing::info!(key = %self.key, polls = self.polls, "Fallback polling stopped");
        }
    }

    /// Whether the timer is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Ticks delivered since creation
    #[must_use]
    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// Wait for the next tick (pending forever while stopped)
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
                self.polls += 1;
            }
            None => std::future::pending().await,
        }
    }

    /// A detached fetch for the current key
    pub fn fetch(
        &self,
    ) -> impl Future<Output = Result<AvailabilitySnapshot, StreamError>> + Send + 'static {
        let source = Arc::clone(&self.source);
        let key = self.key.clone();
        async move { source.get_available_slots(&key).await }
    }
}
