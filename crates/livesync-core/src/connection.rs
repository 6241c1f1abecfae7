//! Connection state and user-facing quality tiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a connection (push transport or polled account).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// States in which fallback polling should run.
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Coarse quality tier shown to users instead of raw error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Disconnected,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    /// Derive a tier from state, round-trip latency and age of the newest data.
    ///
    /// Unknown latency counts as fair-at-best.
    pub fn assess(state: ConnectionState, latency_ms: Option<u64>, data_age_ms: Option<i64>) -> Self {
        if !state.is_connected() {
            return Self::Disconnected;
        }

        let latency = latency_ms.unwrap_or(500);
        let age = data_age_ms.unwrap_or(i64::MAX);

        if latency < 100 && age < 5_000 {
            Self::Excellent
        } else if latency < 300 && age < 15_000 {
            Self::Good
        } else if latency < 1_000 && age < 60_000 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_tiers() {
        use ConnectionState::*;
        assert_eq!(
            ConnectionQuality::assess(Connected, Some(50), Some(1_000)),
            ConnectionQuality::Excellent
        );
        assert_eq!(
            ConnectionQuality::assess(Connected, Some(250), Some(1_000)),
            ConnectionQuality::Good
        );
        assert_eq!(
            ConnectionQuality::assess(Connected, Some(50), Some(30_000)),
            ConnectionQuality::Fair
        );
        assert_eq!(
            ConnectionQuality::assess(Connected, Some(2_000), Some(1_000)),
            ConnectionQuality::Poor
        );
        assert_eq!(
            ConnectionQuality::assess(Connected, Some(10), None),
            ConnectionQuality::Poor
        );
        assert_eq!(
            ConnectionQuality::assess(Error, Some(10), Some(10)),
            ConnectionQuality::Disconnected
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert!(ConnectionState::Error.is_down());
        assert!(!ConnectionState::Connecting.is_down());
    }
}
