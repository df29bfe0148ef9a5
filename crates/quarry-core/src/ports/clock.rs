//! Clock port: time reads and timed waits behind one seam, so retry timing
//! and cache expiry are deterministic in tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Sleep until `deadline`; returns immediately if it already passed.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// Production clock: wall time plus a tokio sleep.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let now = Utc::now();
        if deadline <= now {
            return;
        }
        let wait = (deadline - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::time::sleep(wait).await;
    }
}

/// Test clock: starts at a fixed instant, can be advanced by hand, and
/// jumps straight to the deadline instead of sleeping.
#[derive(Clone)]
pub struct FixedClock {
    now: std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Arc::new(std::sync::Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.lock() = to;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        {
            let mut now = self.lock();
            if deadline > *now {
                *now = deadline;
            }
        }
        // Let concurrently admitted work make progress.
        tokio::task::yield_now().await;
    }
}
