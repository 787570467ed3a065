//! Outbound gateway send throttling.
//!
//! Discord permits 120 gateway commands per 60 seconds. The limiter is set
//! conservatively to 110 per 60 seconds; heartbeats bypass it so a saturated
//! command stream cannot starve the keepalive.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Default allowance: 110 frames per 60 seconds.
pub const DEFAULT_RATE: u32 = 110;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Single-token cooldown limiter for outbound frames.
///
/// `acquire` completes once a token is available and never fails. The refill
/// time is `interval / rate`; concurrent callers queue on the internal mutex,
/// so a released token wakes exactly one waiter and the pool cannot be
/// overspent by a thundering herd.
#[derive(Debug)]
pub struct SendLimiter {
    next_token: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl SendLimiter {
    /// A limiter allowing `rate` acquisitions per `interval`.
    pub fn new(rate: u32, interval: Duration) -> Self {
        Self {
            next_token: Mutex::new(None),
            cooldown: interval / rate.max(1),
        }
    }

    /// Take one token, waiting out the cooldown if it is not ready yet.
    pub async fn acquire(&self) {
        let mut next_token = self.next_token.lock().await;
        if let Some(ready_at) = *next_token {
            sleep_until(ready_at).await;
        }
        *next_token = Some(Instant::now() + self.cooldown);
    }

    /// The spacing enforced between two acquisitions.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

impl Default for SendLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_INTERVAL)
    }
}
