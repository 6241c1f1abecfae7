//! Rule evaluation and alert bookkeeping.
//!
//! Alert ids are `"{entity_id}:{rule_type}"`, so a rule that fires again for
//! the same entity updates its alert instead of adding a new one. Alerts stay
//! until dismissed; a rule that stops holding only clears `triggered`.

use crate::error::{AlertError, AlertResult};
use crate::rule::{AlertRule, Metric, Severity};
use chrono::{DateTime, Utc};
use livesync_core::{AccountSnapshot, SharedClock};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

/// One alert for one (entity, rule) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub entity_id: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub metric: Metric,
    pub threshold: Decimal,
    pub current_value: Decimal,
    pub severity: Severity,
    pub message: String,
    pub triggered: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time the rule went from not met to met.
    pub triggered_at: DateTime<Utc>,
}

pub fn alert_id(entity_id: &str, rule_type: &str) -> String {
    format!("{entity_id}:{rule_type}")
}

/// Evaluates a fixed rule set and keeps the resulting alerts.
pub struct AlertDeriver {
    rules: Vec<AlertRule>,
    alerts: Mutex<BTreeMap<String, Alert>>,
    clock: SharedClock,
}

impl AlertDeriver {
    /// Build a deriver. Rule types must be non-empty and unique.
    pub fn new(rules: Vec<AlertRule>, clock: SharedClock) -> AlertResult<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if rule.rule_type.trim().is_empty() {
                return Err(AlertError::InvalidRule("empty rule_type".to_string()));
            }
            if !seen.insert(rule.rule_type.as_str()) {
                return Err(AlertError::DuplicateRule(rule.rule_type.clone()));
            }
        }

        info!(rules = rules.len(), "Alert deriver initialized");
        Ok(Self {
            rules,
            alerts: Mutex::new(BTreeMap::new()),
            clock,
        })
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Evaluate every rule against a fresh snapshot.
    ///
    /// Returns the alerts this snapshot triggered, new or updated.
    pub fn evaluate(&self, account: &AccountSnapshot) -> Vec<Alert> {
        let now = self.clock.now();
        let mut alerts = self.alerts.lock();
        let mut fired = Vec::new();

        for rule in &self.rules {
            let id = alert_id(&account.account_id, &rule.rule_type);

            match rule.check(account) {
                Some(value) => {
                    let alert = alerts.entry(id.clone()).or_insert_with(|| Alert {
                        id: id.clone(),
                        entity_id: account.account_id.clone(),
                        rule_type: rule.rule_type.clone(),
                        metric: rule.metric,
                        threshold: rule.threshold,
                        current_value: value,
                        severity: rule.severity,
                        message: rule.message.clone(),
                        triggered: false,
                        created_at: now,
                        updated_at: now,
                        triggered_at: now,
                    });

                    if !alert.triggered {
                        alert.triggered = true;
                        alert.triggered_at = now;
                        warn!(
                            alert_id = %id,
                            severity = %alert.severity,
                            value = %value,
                            threshold = %alert.threshold,
                            "Alert triggered"
                        );
                    }
                    alert.current_value = value;
                    alert.updated_at = now;
                    fired.push(alert.clone());
                }
                None => {
                    if let Some(alert) = alerts.get_mut(&id) {
                        if alert.triggered {
                            alert.triggered = false;
                            alert.updated_at = now;
                            if let Some(value) = rule.observe(account) {
                                alert.current_value = value;
                            }
                            info!(alert_id = %id, "Alert condition cleared");
                        }
                    }
                }
            }
        }

        fired
    }

    /// Remove an alert. Returns false if it does not exist.
    pub fn dismiss(&self, id: &str) -> bool {
        let removed = self.alerts.lock().remove(id).is_some();
        if removed {
            info!(alert_id = %id, "Alert dismissed");
        }
        removed
    }

    /// All alerts, most severe first, then by id.
    pub fn alerts(&self) -> Vec<Alert> {
        let mut all: Vec<Alert> = self.alerts.lock().values().cloned().collect();
        all.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Alerts whose rule currently holds.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts().into_iter().filter(|a| a.triggered).collect()
    }

    pub fn alerts_for(&self, entity_id: &str) -> Vec<Alert> {
        self.alerts()
            .into_iter()
            .filter(|a| a.entity_id == entity_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
