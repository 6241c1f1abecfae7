//! Store state and feed message types.
//!
//! These types are serialized for the REST snapshot and the WebSocket feed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use livesync_alerts::Alert;
use livesync_core::{AccountSnapshot, ConnectionState, PositionSnapshot, PriceSnapshot, SystemStatus};
use livesync_registry::ConnectionStatus;
use serde::Serialize;

/// Latest snapshot per entity, partitioned by category.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreState {
    /// Accounts by account id.
    pub accounts: BTreeMap<String, AccountSnapshot>,
    /// Open positions by position id.
    pub positions: BTreeMap<String, PositionSnapshot>,
    /// Quotes by symbol.
    pub prices: BTreeMap<String, PriceSnapshot>,
    /// Backend component health by component name.
    pub system_status: BTreeMap<String, SystemStatus>,
    /// Push transport state.
    pub connection_status: ConnectionState,
    /// Per-account pull connection state by entity id.
    pub entity_connections: BTreeMap<String, ConnectionStatus>,
    /// Alerts, most severe first.
    pub alerts: Vec<Alert>,
    /// Time of the last applied change.
    pub last_update: Option<DateTime<Utc>>,
}

/// Store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub messages_processed: u64,
    pub messages_dropped: u64,
    pub notifications: u64,
    pub pending_deltas: usize,
}

/// WebSocket feed messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "state", rename_all = "snake_case")]
pub enum FeedMessage {
    /// Full state sent on connect.
    Snapshot(StoreState),
    /// Full state after a coalesced change.
    Update(StoreState),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serialization() {
        let state = StoreState::default();
        let json = serde_json::to_value(&state).unwrap();

        assert_eq!(json["connectionStatus"], "disconnected");
        assert!(json["accounts"].as_object().unwrap().is_empty());
        assert!(json["lastUpdate"].is_null());
    }

    #[test]
    fn test_feed_message_tagging() {
        let msg = FeedMessage::Update(StoreState::default());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"update\""));
        assert!(json.contains("\"state\":{"));
    }
}
