//! Heartbeat tracking for the push connection.
//!
//! A ping is due after `interval` of silence. Once sent, a response must
//! arrive within `timeout` or the connection is considered dead.

use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct HeartbeatState {
    last_ping: Option<Instant>,
    last_message: Instant,
    waiting_for_pong: bool,
    last_rtt: Option<Duration>,
}

/// Heartbeat manager for one connection.
pub struct HeartbeatManager {
    interval: Duration,
    timeout: Duration,
    state: RwLock<HeartbeatState>,
}

impl HeartbeatManager {
    pub fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
            state: RwLock::new(HeartbeatState {
                last_ping: None,
                last_message: Instant::now(),
                waiting_for_pong: false,
                last_rtt: None,
            }),
        }
    }

    /// Reset on (re)connection.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.last_ping = None;
        state.last_message = Instant::now();
        state.waiting_for_pong = false;
    }

    pub fn record_ping(&self) {
        let mut state = self.state.write();
        state.last_ping = Some(Instant::now());
        state.waiting_for_pong = true;
    }

    pub fn record_pong(&self) {
        let mut state = self.state.write();
        state.waiting_for_pong = false;
        if let Some(sent) = state.last_ping {
            let rtt = sent.elapsed();
            state.last_rtt = Some(rtt);
            debug!(rtt_ms = rtt.as_millis() as u64, "Received pong");
        }
    }

    /// Any inbound frame counts as activity.
    pub fn record_message(&self) {
        self.state.write().last_message = Instant::now();
    }

    /// Ping outstanding for longer than the timeout.
    pub fn is_timed_out(&self) -> bool {
        let state = self.state.read();
        state.waiting_for_pong && state.last_ping.is_some_and(|t| t.elapsed() > self.timeout)
    }

    /// Silence has lasted a full interval and no ping is outstanding.
    pub fn should_send_heartbeat(&self) -> bool {
        let state = self.state.read();
        !state.waiting_for_pong && state.last_message.elapsed() >= self.interval
    }

    /// How often the connection loop should check.
    pub fn check_period(&self) -> Duration {
        (self.interval / 2).max(Duration::from_millis(1))
    }

    /// Round-trip time of the last answered ping.
    pub fn last_rtt_ms(&self) -> Option<u64> {
        self.state.read().last_rtt.map(|rtt| rtt.as_millis() as u64)
    }

    pub fn time_since_last_message(&self) -> Duration {
        self.state.read().last_message.elapsed()
    }
}
