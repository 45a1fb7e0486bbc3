//! Clock abstraction for testable time-dependent behavior.
//!
//! Lease expiry, idle backoff, heartbeats, and every protocol timeout flow
//! through a [`TimeProvider`] so tests can collapse sleeps and move the clock
//! without conditional compilation.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep as tokio_sleep;

/// Source of current time and suspension.
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Suspends the task for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Current UTC wall-clock time.
    #[must_use]
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic instant for elapsed-time measurement.
    #[must_use]
    fn instant(&self) -> Instant;
}

/// Shared handle to a time provider.
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// Wall-clock provider for production use.
#[derive(Debug, Clone, Default)]
pub struct RealTimeProvider;

impl RealTimeProvider {
    /// Creates a real time provider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for RealTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Test provider that collapses sleeps and supports moving the clock forward.
///
/// `sleep` yields for at most one millisecond so async operations still
/// interleave; `advance` shifts the reported wall-clock time, which is how
/// tests expire leases without waiting.
#[derive(Debug)]
pub struct MockTimeProvider {
    offset: Mutex<ChronoDuration>,
}

impl Default for MockTimeProvider {
    fn default() -> Self {
        Self {
            offset: Mutex::new(ChronoDuration::zero()),
        }
    }
}

impl MockTimeProvider {
    /// Creates a mock provider with zero offset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the reported wall-clock time forward.
    ///
    /// # Panics
    ///
    /// Panics if `duration` does not fit in a `chrono::Duration`.
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().expect("time offset lock poisoned");
        *offset += ChronoDuration::from_std(duration).expect("advance duration out of range");
    }
}

#[async_trait]
impl TimeProvider for MockTimeProvider {
    async fn sleep(&self, duration: Duration) {
        // Yield briefly so concurrent tasks make progress.
        tokio_sleep(duration.min(Duration::from_millis(1))).await;
    }

    fn now(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock().expect("time offset lock poisoned");
        Utc::now() + offset
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Creates the production provider.
#[must_use]
pub fn production_time_provider() -> SharedTimeProvider {
    Arc::new(RealTimeProvider::new())
}

/// Creates a test provider that collapses sleeps.
#[must_use]
pub fn mock_time_provider() -> Arc<MockTimeProvider> {
    Arc::new(MockTimeProvider::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_sleep_collapses_long_delays() {
        let provider = MockTimeProvider::new();
        let start = Instant::now();
        provider.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn mock_advance_shifts_now() {
        let provider = MockTimeProvider::new();
        let before = provider.now();
        provider.advance(Duration::from_secs(3600));
        let after = provider.now();
        assert!(after - before >= ChronoDuration::seconds(3600));
    }
}
