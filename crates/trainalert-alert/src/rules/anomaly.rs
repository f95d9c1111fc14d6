use super::{mean, metric_label, not_triggered, number};
use crate::SeriesEvaluator;
use chrono::{DateTime, Utc};
use serde_json::Map;
use trainalert_common::types::{AlertRule, EvaluationResult, MetricPoint, RuleType};

/// Minimum number of points for a meaningful standard deviation.
pub const MIN_ANOMALY_POINTS: usize = 10;

/// Default Z-score threshold when the rule carries none.
pub const DEFAULT_Z_THRESHOLD: f64 = 3.0;

/// Z-score detector over the evaluation window.
///
/// Uses the population standard deviation; a window with zero variance never
/// triggers.
pub struct AnomalyEvaluator {
    pub min_points: usize,
    pub default_threshold: f64,
}

impl Default for AnomalyEvaluator {
    fn default() -> Self {
        Self {
            min_points: MIN_ANOMALY_POINTS,
            default_threshold: DEFAULT_Z_THRESHOLD,
        }
    }
}

impl SeriesEvaluator for AnomalyEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::Anomaly
    }

    fn evaluate(
        &self,
        rule: &AlertRule,
        series: &[MetricPoint],
        now: DateTime<Utc>,
    ) -> EvaluationResult {
        // A stored zero means unset.
        let threshold = rule
            .critical_threshold
            .filter(|t| *t > 0.0)
            .unwrap_or(self.default_threshold);
        if series.len() < self.min_points {
            return not_triggered(
                rule,
                threshold,
                format!(
                    "insufficient data for anomaly detection: need at least {} points, got {}",
                    self.min_points,
                    series.len()
                ),
                now,
            );
        }

        let values: Vec<f64> = series.iter().map(|p| p.value).collect();
        let average = mean(&values);
        let variance =
            values.iter().map(|v| (v - average).powi(2)).sum::<f64>() / values.len() as f64;
        let std_dev = variance.sqrt();
        let latest = values[values.len() - 1];

        let mut context = Map::new();
        context.insert("mean".to_string(), number(average));
        context.insert("std_dev".to_string(), number(std_dev));
        context.insert("latest".to_string(), number(latest));

        if std_dev < f64::EPSILON {
            let mut result = not_triggered(
                rule,
                threshold,
                "zero variance in window, no anomaly".to_string(),
                now,
            );
            result.context = context;
            return result;
        }

        let z_score = (latest - average).abs() / std_dev;
        context.insert("z_score".to_string(), number(z_score));
        let triggered = z_score > threshold;

        let metric = metric_label(rule);
        let message = if triggered {
            format!("{metric} anomaly: latest {latest:.2} has z-score {z_score:.2} above {threshold:.2}")
        } else {
            format!("{metric} z-score {z_score:.2} within {threshold:.2}")
        };

        EvaluationResult {
            rule_id: rule.id,
            triggered,
            value: z_score,
            threshold,
            level: None,
            message,
            context,
            timestamp: now,
        }
    }
}
