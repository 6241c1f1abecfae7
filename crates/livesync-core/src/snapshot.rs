//! Entity snapshots carried by push messages and pull responses.
//!
//! Money fields use `Decimal`. Upstream payloads use either snake_case or
//! camelCase field names, so both are accepted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

fn default_now() -> DateTime<Utc> {
    Utc::now()
}

/// Account health class derived from margin level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Healthy,
    Warning,
    Danger,
    MarginCall,
}

impl AccountStatus {
    /// Margin level (percent) below which the account is in margin call.
    pub const MARGIN_CALL_LEVEL: Decimal = Decimal::from_parts(50, 0, 0, false, 0);
    /// Margin level below which the account is in the critical class.
    pub const DANGER_LEVEL: Decimal = Decimal::from_parts(100, 0, 0, false, 0);
    /// Margin level at and above which the account is healthy.
    pub const HEALTHY_LEVEL: Decimal = Decimal::from_parts(300, 0, 0, false, 0);

    /// Classify a margin level.
    ///
    /// - `< 50`: margin call
    /// - `50..100`: danger
    /// - `100..300`: warning
    /// - `>= 300`: healthy
    pub fn from_margin_level(margin_level: Decimal) -> Self {
        if margin_level < Self::MARGIN_CALL_LEVEL {
            Self::MarginCall
        } else if margin_level < Self::DANGER_LEVEL {
            Self::Danger
        } else if margin_level < Self::HEALTHY_LEVEL {
            Self::Warning
        } else {
            Self::Healthy
        }
    }

    /// Critical class: margin call or danger.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Danger | Self::MarginCall)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Danger => "danger",
            Self::MarginCall => "margin_call",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest known state of one brokerage account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    #[serde(alias = "accountId", alias = "id")]
    pub account_id: String,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub equity: Decimal,
    #[serde(default)]
    pub margin: Decimal,
    #[serde(default, alias = "freeMargin")]
    pub free_margin: Decimal,
    #[serde(default, alias = "marginLevel")]
    pub margin_level: Decimal,
    /// Always recomputed by `with_derived_status`; any upstream value is ignored.
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default = "default_now", alias = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            balance: Decimal::ZERO,
            equity: Decimal::ZERO,
            margin: Decimal::ZERO,
            free_margin: Decimal::ZERO,
            margin_level: Decimal::ZERO,
            status: AccountStatus::Healthy,
            updated_at: Utc::now(),
        }
    }

    /// Status implied by the margin figures.
    ///
    /// An account with no margin in use reports a margin level of zero;
    /// that is no exposure, not a margin call.
    pub fn derive_status(&self) -> AccountStatus {
        if self.margin.is_zero() {
            AccountStatus::Healthy
        } else {
            AccountStatus::from_margin_level(self.margin_level)
        }
    }

    /// Replace `status` with the derived one.
    pub fn with_derived_status(mut self) -> Self {
        self.status = self.derive_status();
        self
    }

    /// Drawdown of equity against balance, in percent. Zero when in profit.
    pub fn drawdown_pct(&self) -> Decimal {
        if self.balance <= Decimal::ZERO || self.equity >= self.balance {
            return Decimal::ZERO;
        }
        (self.balance - self.equity) / self.balance * Decimal::ONE_HUNDRED
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    #[serde(alias = "long", alias = "BUY", alias = "POSITION_TYPE_BUY")]
    Buy,
    #[serde(alias = "short", alias = "SELL", alias = "POSITION_TYPE_SELL")]
    Sell,
}

/// One open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    #[serde(alias = "positionId", alias = "id")]
    pub position_id: String,
    #[serde(default, alias = "accountId")]
    pub account_id: String,
    pub symbol: String,
    #[serde(alias = "type")]
    pub side: PositionSide,
    #[serde(default)]
    pub volume: Decimal,
    #[serde(default, alias = "openPrice")]
    pub open_price: Decimal,
    #[serde(default, alias = "currentPrice")]
    pub current_price: Option<Decimal>,
    #[serde(default)]
    pub profit: Decimal,
    #[serde(default = "default_now", alias = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Latest quote for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(default = "default_now", alias = "updatedAt", alias = "time")]
    pub updated_at: DateTime<Utc>,
}

impl PriceSnapshot {
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Health report from one backend component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    #[serde(alias = "service", alias = "name")]
    pub component: String,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default, alias = "latencyMs")]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default = "default_now", alias = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

fn default_healthy() -> bool {
    true
}
