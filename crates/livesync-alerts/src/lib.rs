//! Rule-based alerts for the livesync pipeline.
//!
//! `AlertDeriver` evaluates a fixed set of `AlertRule`s against each fresh
//! `AccountSnapshot`. Alerts are keyed per (entity, rule) and persist until
//! dismissed.

pub mod deriver;
pub mod error;
pub mod rule;

pub use deriver::{alert_id, Alert, AlertDeriver};
pub use error::{AlertError, AlertResult};
pub use rule::{default_rules, AlertRule, Comparator, Metric, Severity};
