//! Sliding-window request throttle
//!
//! Each provider adapter and the socket transport own one instance. The
//! window is a list of past request instants pruned on every call; a request
//! is admitted only when both the per-minute and per-hour caps have room.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Request history and caps for one limiter
#[derive(Debug)]
pub struct RateWindow {
    /// Admitted request instants, oldest first
    timestamps: VecDeque<Instant>,
    /// Maximum requests in any 60s window (0 = unlimited)
    per_minute: u32,
    /// Maximum requests in any 3600s window (0 = unlimited)
    per_hour: u32,
}

impl RateWindow {
    fn new(per_minute: u32, per_hour: u32) -> Self {
        Self {
            timestamps: VecDeque::new(),
            per_minute,
            per_hour,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.timestamps.front() {
            if now.saturating_duration_since(*front) >= HOUR {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn minute_count(&self, now: Instant) -> usize {
        self.timestamps
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < MINUTE)
            .count()
    }

    /// Admit a request at `now`, or return how long to wait before retrying.
    fn admit(&mut self, now: Instant) -> Result<(), Duration> {
        self.prune(now);

        let minute_count = self.minute_count(now);
        let hour_count = self.timestamps.len();

        let minute_full = self.per_minute > 0 && minute_count >= self.per_minute as usize;
        let hour_full = self.per_hour > 0 && hour_count >= self.per_hour as usize;

        if !minute_full && !hour_full {
            self.timestamps.push_back(now);
            return Ok(());
        }

        let mut wait = Duration::ZERO;
        if minute_full {
            // The slot frees when the oldest request inside the minute ages out
            let oldest_in_minute = self.timestamps[hour_count - minute_count];
            wait = wait.max(MINUTE.saturating_sub(now.saturating_duration_since(oldest_in_minute)));
        }
        if hour_full {
            if let Some(oldest) = self.timestamps.front() {
                wait = wait.max(HOUR.saturating_sub(now.saturating_duration_since(*oldest)));
            }
        }

        Err(wait.max(Duration::from_millis(1)))
    }
}

/// Sliding-window rate limiter safe to share between concurrent callers
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<RateWindow>,
}

impl RateLimiter {
    /// Create a limiter with per-minute and per-hour caps
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        Self {
            window: Mutex::new(RateWindow::new(per_minute, per_hour)),
        }
    }

    /// Create a limiter with only a per-minute cap
    pub fn per_minute(per_minute: u32) -> Self {
        Self::new(per_minute, 0)
    }

    /// Suspend until a request slot is available, then claim it
    pub async fn wait_for_rate_limit(&self) {
        loop {
            let admitted = self.window.lock().admit(Instant::now());
            match admitted {
                Ok(()) => return,
                Err(wait) => {
                    debug!("Rate limit reached, waiting {:?}", wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Claim a slot if one is free right now
    pub fn try_acquire(&self) -> bool {
        self.window.lock().admit(Instant::now()).is_ok()
    }

    /// Slots left in the current minute window, `None` when uncapped
    pub fn remaining_in_minute(&self) -> Option<u32> {
        let mut window = self.window.lock();
        if window.per_minute == 0 {
            return None;
        }
        let now = Instant::now();
        window.prune(now);
        let used = window.minute_count(now) as u32;
        Some(window.per_minute.saturating_sub(used))
    }

    /// Clear all request history
    pub fn reset(&self) {
        self.window.lock().timestamps.clear();
    }
}
