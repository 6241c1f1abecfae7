//! Push message envelope.
//!
//! Every frame on the push channel is a JSON object of the form
//! `{ "type": ..., "data": {...}, "timestamp": ISO-8601, "correlation_id": ... }`.
//! Decoding maps the open-ended `type` string onto a closed set of kinds;
//! unrecognized kinds survive as `MessageKind::Unknown` so the consumer can
//! log and drop them instead of failing.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{CoreError, Result};

/// Known message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AccountUpdate,
    PositionUpdate,
    PriceUpdate,
    SystemStatus,
    Heartbeat,
    Ping,
    Pong,
    /// Anything else. Carries the raw wire name for logging.
    Unknown(String),
}

impl MessageKind {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::AccountUpdate => "ACCOUNT_UPDATE",
            Self::PositionUpdate => "POSITION_UPDATE",
            Self::PriceUpdate => "PRICE_UPDATE",
            Self::SystemStatus => "SYSTEM_STATUS",
            Self::Heartbeat => "HEARTBEAT",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Unknown(raw) => raw,
        }
    }

    /// Map a wire name onto a kind. Matching is case-insensitive.
    pub fn from_wire(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "ACCOUNT_UPDATE" => Self::AccountUpdate,
            "POSITION_UPDATE" => Self::PositionUpdate,
            "PRICE_UPDATE" => Self::PriceUpdate,
            "SYSTEM_STATUS" => Self::SystemStatus,
            "HEARTBEAT" => Self::Heartbeat,
            "PING" => Self::Ping,
            "PONG" => Self::Pong,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    /// Transport-level kinds that never reach the store.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Heartbeat | Self::Ping | Self::Pong)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&raw))
    }
}

/// Typed push envelope. Consumed once, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}

/// Lenient wire shape used only for decoding.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default, alias = "correlationId")]
    correlation_id: Option<String>,
}

impl Message {
    /// Create a message stamped now with a fresh correlation id.
    pub fn new(kind: MessageKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Application-level heartbeat ping.
    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, serde_json::Value::Null)
    }

    /// Override the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Override the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Decode a wire frame.
    ///
    /// Returns `CoreError::Validation` when the frame is not a JSON object,
    /// has no `type`, carries a non-object `data`, or has an unparseable
    /// timestamp. A missing `data` decodes as `null`.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_str(text)
            .map_err(|e| CoreError::Validation(format!("not an envelope: {e}")))?;

        let kind = match raw.kind {
            Some(k) if !k.trim().is_empty() => MessageKind::from_wire(k.trim()),
            _ => return Err(CoreError::Validation("missing type".to_string())),
        };

        if !(raw.data.is_object() || raw.data.is_null()) {
            return Err(CoreError::Validation(format!(
                "{kind}: data must be an object"
            )));
        }

        let timestamp = match raw.timestamp {
            Some(ts) => DateTime::parse_from_rfc3339(&ts)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| CoreError::Validation(format!("{kind}: bad timestamp {ts}: {e}")))?,
            None => Utc::now(),
        };

        Ok(Self {
            kind,
            data: raw.data,
            timestamp,
            correlation_id: raw
                .correlation_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        })
    }

    /// Encode to a wire frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the `data` payload into a typed snapshot.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| CoreError::Payload {
            kind: self.kind.to_string(),
            reason: e.to_string(),
        })
    }
}
