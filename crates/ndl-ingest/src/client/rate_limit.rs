// Request pacing shared by every call the client makes

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Spaces outbound requests at least `interval` apart.
///
/// The lock is held while waiting, so concurrent callers are granted in arrival order and
/// never burst past the limit.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_grant: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Limiter allowing `requests_per_second` grants per second (0 is treated as 1).
    pub fn new(requests_per_second: u32) -> Self {
        let rps = requests_per_second.max(1);
        Self::with_interval(Duration::from_secs(1) / rps)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last_grant: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until a request may be sent.
    pub async fn acquire(&self) {
        let mut last = self.last_grant.lock().await;
        if let Some(previous) = *last {
            sleep_until(previous + self.interval).await;
        }
        *last = Some(Instant::now());
    }
}
