use super::{metric_label, not_triggered, number};
use crate::SeriesEvaluator;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use trainalert_common::types::{AlertRule, EvaluationResult, MetricPoint, RuleType, Severity};

/// Compares the latest point against the warning and critical thresholds.
///
/// When both tiers are configured and both match, the critical tier wins.
pub struct ThresholdEvaluator;

impl SeriesEvaluator for ThresholdEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::Threshold
    }

    fn evaluate(
        &self,
        rule: &AlertRule,
        series: &[MetricPoint],
        now: DateTime<Utc>,
    ) -> EvaluationResult {
        let reported = rule.critical_threshold.or(rule.warning_threshold).unwrap_or(0.0);
        let Some(latest) = series.last() else {
            return not_triggered(rule, reported, "no data points in window".to_string(), now);
        };
        if rule.warning_threshold.is_none() && rule.critical_threshold.is_none() {
            return not_triggered(rule, 0.0, "no threshold configured".to_string(), now);
        }

        let op = rule.operator;
        let value = latest.value;
        let critical = rule
            .critical_threshold
            .filter(|t| op.check(value, *t))
            .map(|t| (t, Severity::Critical));
        let warning = rule
            .warning_threshold
            .filter(|t| op.check(value, *t))
            .map(|t| (t, Severity::Warning));

        let mut context = Map::new();
        context.insert("operator".to_string(), Value::String(op.to_string()));
        context.insert("latest_at".to_string(), Value::String(latest.timestamp.to_rfc3339()));
        if let Some(w) = rule.warning_threshold {
            context.insert("warning_threshold".to_string(), number(w));
        }
        if let Some(c) = rule.critical_threshold {
            context.insert("critical_threshold".to_string(), number(c));
        }

        let metric = metric_label(rule);
        match critical.or(warning) {
            Some((threshold, level)) => {
                context.insert("level".to_string(), Value::String(level.to_string()));
                EvaluationResult {
                    rule_id: rule.id,
                    triggered: true,
                    value,
                    threshold,
                    level: Some(level),
                    message: format!(
                        "{metric} is {value:.2}, {} {level} threshold {threshold:.2}",
                        op.describe()
                    ),
                    context,
                    timestamp: now,
                }
            }
            None => EvaluationResult {
                rule_id: rule.id,
                triggered: false,
                value,
                threshold: reported,
                level: None,
                message: format!("{metric} is {value:.2}, within thresholds"),
                context,
                timestamp: now,
            },
        }
    }
}
