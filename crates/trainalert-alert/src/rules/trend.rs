use super::{mean, metric_label, not_triggered, number};
use crate::SeriesEvaluator;
use chrono::{DateTime, Utc};
use serde_json::Map;
use trainalert_common::types::{AlertRule, EvaluationResult, MetricPoint, RuleType, FLOAT_EPSILON};

/// Minimum number of points for a trend verdict.
pub const MIN_TREND_POINTS: usize = 2;

/// Measures how far the latest point deviates from the window mean, in percent.
///
/// The magnitude of the deviation is compared with the critical threshold
/// (falling back to the warning threshold) using the rule's operator.
pub struct TrendEvaluator;

impl SeriesEvaluator for TrendEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::Trend
    }

    fn evaluate(
        &self,
        rule: &AlertRule,
        series: &[MetricPoint],
        now: DateTime<Utc>,
    ) -> EvaluationResult {
        let Some(threshold) = rule.critical_threshold.or(rule.warning_threshold) else {
            return not_triggered(rule, 0.0, "no threshold configured".to_string(), now);
        };
        if series.len() < MIN_TREND_POINTS {
            return not_triggered(
                rule,
                threshold,
                format!(
                    "insufficient data for trend: need at least {MIN_TREND_POINTS} points, got {}",
                    series.len()
                ),
                now,
            );
        }

        let values: Vec<f64> = series.iter().map(|p| p.value).collect();
        let average = mean(&values);
        let latest = values[values.len() - 1];
        if average.abs() < FLOAT_EPSILON {
            return not_triggered(
                rule,
                threshold,
                "window mean is zero, change rate undefined".to_string(),
                now,
            );
        }

        let change_percent = (latest - average) / average * 100.0;
        let triggered = rule.operator.check(change_percent.abs(), threshold);

        let mut context = Map::new();
        context.insert("mean".to_string(), number(average));
        context.insert("latest".to_string(), number(latest));
        context.insert("change_percent".to_string(), number(change_percent));
        context.insert("points".to_string(), series.len().into());

        let metric = metric_label(rule);
        let message = if triggered {
            format!("{metric} changed {change_percent:.2}% from window mean, threshold {threshold:.2}%")
        } else {
            format!("{metric} changed {change_percent:.2}% from window mean, within range")
        };

        EvaluationResult {
            rule_id: rule.id,
            triggered,
            value: change_percent,
            threshold,
            level: None,
            message,
            context,
            timestamp: now,
        }
    }
}
