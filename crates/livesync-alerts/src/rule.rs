//! Threshold rules evaluated against account snapshots.

use livesync_core::AccountSnapshot;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alert severity. Ordered `Info < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Snapshot figure a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    MarginLevel,
    Equity,
    FreeMargin,
    /// Equity drawdown against balance, in percent.
    DrawdownPct,
}

impl Metric {
    /// Current value, or `None` when the metric does not apply.
    ///
    /// Margin-based metrics do not apply to an account with no margin in use.
    pub fn extract(&self, account: &AccountSnapshot) -> Option<Decimal> {
        match self {
            Self::MarginLevel if account.margin.is_zero() => None,
            Self::FreeMargin if account.margin.is_zero() => None,
            Self::MarginLevel => Some(account.margin_level),
            Self::FreeMargin => Some(account.free_margin),
            Self::Equity => Some(account.equity),
            Self::DrawdownPct => Some(account.drawdown_pct()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Comparator {
    pub fn holds(&self, value: Decimal, threshold: Decimal) -> bool {
        match self {
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
        }
    }
}

/// One threshold rule. `rule_type` names the alert and must be unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub rule_type: String,
    pub metric: Metric,
    pub comparator: Comparator,
    pub threshold: Decimal,
    pub severity: Severity,
    #[serde(default)]
    pub message: String,
}

impl AlertRule {
    pub fn new(
        rule_type: impl Into<String>,
        metric: Metric,
        comparator: Comparator,
        threshold: Decimal,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule_type: rule_type.into(),
            metric,
            comparator,
            threshold,
            severity,
            message: message.into(),
        }
    }

    /// Current value if the rule is met.
    pub fn check(&self, account: &AccountSnapshot) -> Option<Decimal> {
        self.metric
            .extract(account)
            .filter(|value| self.comparator.holds(*value, self.threshold))
    }

    /// Current value whether or not the rule is met.
    pub fn observe(&self, account: &AccountSnapshot) -> Option<Decimal> {
        self.metric.extract(account)
    }
}

/// Margin and drawdown rules applied when none are configured.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "margin_call",
            Metric::MarginLevel,
            Comparator::Lt,
            Decimal::ONE_HUNDRED,
            Severity::Critical,
            "Margin level below 100%",
        ),
        AlertRule::new(
            "low_margin",
            Metric::MarginLevel,
            Comparator::Lt,
            Decimal::from(200),
            Severity::Warning,
            "Margin level below 200%",
        ),
        AlertRule::new(
            "margin_watch",
            Metric::MarginLevel,
            Comparator::Lt,
            Decimal::from(300),
            Severity::Info,
            "Margin level below 300%",
        ),
        AlertRule::new(
            "drawdown",
            Metric::DrawdownPct,
            Comparator::Gte,
            Decimal::from(20),
            Severity::Warning,
            "Equity drawdown of 20% or more",
        ),
        AlertRule::new(
            "no_free_margin",
            Metric::FreeMargin,
            Comparator::Lte,
            Decimal::ZERO,
            Severity::Critical,
            "No free margin left",
        ),
    ]
}
