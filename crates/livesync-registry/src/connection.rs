//! Per-entity connection registry.
//!
//! Tracks `disconnected -> connecting -> connected -> (error|disconnected)`
//! for each configured entity independently of how it is reached. After an
//! entity exhausts its retry budget, auto-reconnect stays off until
//! `reconnect_account` is called.

use crate::error::{RegistryError, RegistryResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use livesync_core::{BackoffPolicy, ConnectionQuality, ConnectionState, SharedClock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Retry budget and backoff shared by all entities.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Failures tolerated before auto-reconnect stops.
    pub retry_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            backoff: BackoffPolicy::exponential(1_000, 30_000),
        }
    }
}

/// What the caller should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// Retry budget spent; wait for an explicit reconnect.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub limited: bool,
    pub requests_remaining: u32,
}

/// Monitoring view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub entity_id: String,
    pub status: ConnectionState,
    pub last_connection_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_connection: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_error: Option<String>,
    pub rate_limit_status: RateLimitStatus,
    pub auto_reconnect: bool,
}

impl ConnectionStatus {
    fn new(entity_id: String) -> Self {
        Self {
            entity_id,
            status: ConnectionState::Disconnected,
            last_connection_attempt: None,
            last_successful_connection: None,
            retry_count: 0,
            connection_error: None,
            rate_limit_status: RateLimitStatus::default(),
            auto_reconnect: true,
        }
    }

    /// Quality tier from state and data age.
    pub fn quality(&self, now: DateTime<Utc>) -> ConnectionQuality {
        let age = self
            .last_successful_connection
            .map(|t| (now - t).num_milliseconds());
        ConnectionQuality::assess(self.status, None, age)
    }
}

/// Registry of per-entity connection state.
pub struct ConnectionRegistry {
    entries: DashMap<String, ConnectionStatus>,
    wakeups: DashMap<String, Arc<Notify>>,
    config: RegistryConfig,
    clock: SharedClock,
}

impl ConnectionRegistry {
    /// Register every entity as disconnected.
    pub fn new<I, S>(entity_ids: I, config: RegistryConfig, clock: SharedClock) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = DashMap::new();
        let wakeups = DashMap::new();
        for id in entity_ids {
            let id = id.into();
            wakeups.insert(id.clone(), Arc::new(Notify::new()));
            entries.insert(id.clone(), ConnectionStatus::new(id));
        }
        info!(entities = entries.len(), "Connection registry initialized");

        Self {
            entries,
            wakeups,
            config,
            clock,
        }
    }

    pub fn mark_connecting(&self, entity_id: &str) -> RegistryResult<()> {
        let now = self.clock.now();
        self.with_entry(entity_id, |entry| {
            entry.status = ConnectionState::Connecting;
            entry.last_connection_attempt = Some(now);
        })
    }

    /// Success resets the retry count and clears the last error.
    pub fn mark_connected(&self, entity_id: &str) -> RegistryResult<()> {
        let now = self.clock.now();
        self.with_entry(entity_id, |entry| {
            if entry.retry_count > 0 {
                info!(entity_id = %entry.entity_id, retries = entry.retry_count, "Entity reconnected");
            }
            entry.status = ConnectionState::Connected;
            entry.retry_count = 0;
            entry.last_successful_connection = Some(now);
            entry.connection_error = None;
            entry.auto_reconnect = true;
        })
    }

    pub fn mark_disconnected(&self, entity_id: &str) -> RegistryResult<()> {
        self.with_entry(entity_id, |entry| {
            entry.status = ConnectionState::Disconnected;
        })
    }

    /// Record a failure and decide on the next attempt.
    ///
    /// Delays grow as `base * factor^retry_count` capped at the policy
    /// maximum; the count is taken before it is incremented.
    pub fn mark_error(&self, entity_id: &str, error: impl Into<String>) -> RegistryResult<ReconnectDecision> {
        let error = error.into();
        let retry_attempts = self.config.retry_attempts;
        let backoff = self.config.backoff;

        self.with_entry(entity_id, |entry| {
            entry.status = ConnectionState::Error;
            entry.connection_error = Some(error.clone());

            let decision = if entry.retry_count >= retry_attempts {
                entry.auto_reconnect = false;
                ReconnectDecision::Exhausted
            } else {
                ReconnectDecision::Retry(backoff.delay(entry.retry_count))
            };
            entry.retry_count = entry.retry_count.saturating_add(1);

            match decision {
                ReconnectDecision::Retry(delay) => warn!(
                    entity_id = %entry.entity_id,
                    retry_count = entry.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Entity connection failed, retry scheduled"
                ),
                ReconnectDecision::Exhausted => warn!(
                    entity_id = %entry.entity_id,
                    retry_count = entry.retry_count,
                    error = %error,
                    "Entity retry budget exhausted, auto-reconnect stopped"
                ),
            }
            decision
        })
    }

    pub fn update_rate_limit(&self, entity_id: &str, limited: bool, requests_remaining: u32) -> RegistryResult<()> {
        self.with_entry(entity_id, |entry| {
            entry.rate_limit_status = RateLimitStatus {
                limited,
                requests_remaining,
            };
        })
    }

    /// Reset the retry budget and wake the entity's monitor task.
    ///
    /// Returns false for an unknown entity.
    pub fn reconnect_account(&self, entity_id: &str) -> bool {
        let reset = self.with_entry(entity_id, |entry| {
            entry.retry_count = 0;
            entry.status = ConnectionState::Connecting;
            entry.auto_reconnect = true;
        });
        if reset.is_err() {
            warn!(entity_id, "Reconnect requested for unknown entity");
            return false;
        }

        if let Some(wakeup) = self.wakeups.get(entity_id) {
            wakeup.notify_one();
        }
        info!(entity_id, "Manual reconnect requested");
        true
    }

    /// Wakeup handle for an entity's monitor task.
    pub fn reconnect_signal(&self, entity_id: &str) -> Option<Arc<Notify>> {
        self.wakeups.get(entity_id).map(|w| w.value().clone())
    }

    /// One entry per registered entity, sorted by id. Side-effect free.
    pub fn get_connection_status(&self) -> Vec<ConnectionStatus> {
        let mut all: Vec<ConnectionStatus> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        all
    }

    pub fn status(&self, entity_id: &str) -> Option<ConnectionStatus> {
        self.entries.get(entity_id).map(|e| e.value().clone())
    }

    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn with_entry<T>(&self, entity_id: &str, f: impl FnOnce(&mut ConnectionStatus) -> T) -> RegistryResult<T> {
        let mut entry = self
            .entries
            .get_mut(entity_id)
            .ok_or_else(|| RegistryError::UnknownEntity(entity_id.to_string()))?;
        Ok(f(entry.value_mut()))
    }
}
