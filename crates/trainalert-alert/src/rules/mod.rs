pub mod anomaly;
pub mod threshold;
pub mod trend;

use crate::SeriesEvaluator;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use trainalert_common::types::{AlertRule, EvaluationResult, MetricPoint, RuleType};

/// Runs the built-in strategy for the rule's type.
pub fn evaluate_series(
    rule: &AlertRule,
    series: &[MetricPoint],
    now: DateTime<Utc>,
) -> EvaluationResult {
    match rule.rule_type {
        RuleType::Threshold => threshold::ThresholdEvaluator.evaluate(rule, series, now),
        RuleType::Trend => trend::TrendEvaluator.evaluate(rule, series, now),
        RuleType::Anomaly => anomaly::AnomalyEvaluator::default().evaluate(rule, series, now),
    }
}

/// A non-triggered verdict explaining why the rule could not fire.
pub(crate) fn not_triggered(
    rule: &AlertRule,
    threshold: f64,
    message: String,
    now: DateTime<Utc>,
) -> EvaluationResult {
    EvaluationResult {
        rule_id: rule.id,
        triggered: false,
        value: 0.0,
        threshold,
        level: None,
        message,
        context: Map::new(),
        timestamp: now,
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn metric_label(rule: &AlertRule) -> &str {
    rule.metric_name.as_deref().unwrap_or(&rule.name)
}

pub(crate) fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
