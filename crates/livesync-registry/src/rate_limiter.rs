//! Sliding-window rate limiting for upstream API calls.
//!
//! Permits at most `max_requests` calls within any trailing `window`.
//! Timestamps older than the window are pruned lazily on every check.
//! Windows are measured on the monotonic clock, so wall-clock steps do not
//! widen or shrink them.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Sliding-window rate limiter.
pub struct SlidingWindowLimiter {
    /// Maximum requests per window.
    max_requests: u32,
    /// Window length.
    window: Duration,
    /// Timestamps of recent requests, oldest first.
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// Create a new limiter.
    ///
    /// # Arguments
    /// * `max_requests` - Maximum requests per window
    /// * `window` - Trailing window length
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests as usize)),
        }
    }

    /// Check if a request is permitted right now.
    pub fn can_make_request(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        self.prune(&mut timestamps, now);
        timestamps.len() < self.max_requests as usize
    }

    /// Record a request made now.
    pub fn record_request(&self) {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        self.prune(&mut timestamps, now);
        timestamps.push_back(now);

        if timestamps.len() >= self.max_requests as usize {
            warn!(
                count = timestamps.len(),
                max = self.max_requests,
                "Rate window exhausted"
            );
        }
    }

    /// Check and record in one step. Returns false without recording when
    /// the window is full.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        self.prune(&mut timestamps, now);
        if timestamps.len() >= self.max_requests as usize {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Requests recorded within the current window.
    pub fn current_count(&self) -> u32 {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        self.prune(&mut timestamps, now);
        timestamps.len() as u32
    }

    /// Remaining capacity in the current window.
    pub fn remaining(&self) -> u32 {
        self.max_requests.saturating_sub(self.current_count())
    }

    /// Time until the oldest recorded request leaves the window.
    /// Zero when the window is empty.
    pub fn reset_in(&self) -> Duration {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        self.prune(&mut timestamps, now);
        match timestamps.front() {
            Some(&oldest) => {
                self.window.saturating_sub(now.saturating_duration_since(oldest))
            }
            None => Duration::ZERO,
        }
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Forget all recorded requests.
    pub fn reset(&self) {
        self.timestamps.lock().clear();
    }

    fn prune(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while timestamps
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= self.window)
        {
            timestamps.pop_front();
        }
    }
}
