use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window request limiter.
///
/// Never waits: a call over the ceiling is refused immediately.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    hits: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Allow `limit` acquisitions per `window`.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    /// Allow `limit` acquisitions per minute.
    #[must_use]
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    /// Record a hit if under the ceiling.
    pub async fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        Self::evict(&mut hits, now, self.window);

        if hits.len() >= self.limit as usize {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Acquisitions left in the current window.
    pub async fn remaining(&self) -> u32 {
        let mut hits = self.hits.lock().await;
        Self::evict(&mut hits, Instant::now(), self.window);
        let used = u32::try_from(hits.len()).unwrap_or(u32::MAX);
        self.limit.saturating_sub(used)
    }

    fn evict(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = hits.front() {
            if now.saturating_duration_since(*oldest) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }
    }
}
