//! Rule evaluation and alert lifecycle for the training platform.
//!
//! A [`evaluator::RuleEvaluator`] fetches the metric window of a rule and runs
//! the [`SeriesEvaluator`] matching its type (threshold, trend or anomaly).
//! The resulting [`EvaluationResult`] is fed to the
//! [`state::AlertStateManager`], which owns the table of firing alerts, and
//! the [`gate::NotificationGate`] decides whether a firing alert may notify.

pub mod evaluator;
pub mod gate;
pub mod rules;
pub mod state;


use chrono::{DateTime, Utc};
use trainalert_common::types::{AlertRule, EvaluationResult, MetricPoint, RuleType};

/// A detection strategy turning a rule and its metric window into a verdict.
///
/// Implementations are pure: they never fail, and report missing or
/// insufficient data as a non-triggered result carrying a diagnostic message.
pub trait SeriesEvaluator: Send + Sync {
    /// The rule type this strategy handles.
    fn rule_type(&self) -> RuleType;

    /// Evaluates `series` (ordered oldest first) against `rule` at `now`.
    fn evaluate(&self, rule: &AlertRule, series: &[MetricPoint], now: DateTime<Utc>)
        -> EvaluationResult;
}
