use crate::rules::evaluate_series;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use trainalert_common::types::{AlertRule, EvaluationResult, RuleType};
use trainalert_storage::{MetricStore, StorageError};

/// Why a rule produced no verdict this cycle. None of these are fatal; the
/// rule is simply retried on its next due tick.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("rule {rule_id} has no metric reference and none could be resolved from '{expression}'")]
    UnresolvedMetric { rule_id: i64, expression: String },

    #[error("metric '{metric}' returned no points in the evaluation window")]
    EmptySeries { metric: String },

    #[error("metric fetch for '{metric}' failed: {source}")]
    Fetch {
        metric: String,
        #[source]
        source: StorageError,
    },

    #[error("metric fetch for '{metric}' timed out after {timeout_secs}s")]
    Timeout { metric: String, timeout_secs: u64 },

    #[error("anomaly detection is disabled")]
    AnomalyDisabled,
}

/// Fetches a rule's metric window and runs its detection strategy.
pub struct RuleEvaluator {
    metrics: Arc<dyn MetricStore>,
    fetch_timeout: std::time::Duration,
    anomaly_enabled: bool,
}

impl RuleEvaluator {
    pub fn new(
        metrics: Arc<dyn MetricStore>,
        fetch_timeout: std::time::Duration,
        anomaly_enabled: bool,
    ) -> Self {
        Self {
            metrics,
            fetch_timeout,
            anomaly_enabled,
        }
    }

    pub async fn evaluate(
        &self,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) -> Result<EvaluationResult, EvaluationError> {
        if rule.rule_type == RuleType::Anomaly && !self.anomaly_enabled {
            return Err(EvaluationError::AnomalyDisabled);
        }

        let metric = self.metric_name(rule).await?;
        let start = now - Duration::seconds(rule.evaluation_window_secs as i64);

        let series = tokio::time::timeout(
            self.fetch_timeout,
            self.metrics.fetch_series(&metric, start, now),
        )
        .await
        .map_err(|_| EvaluationError::Timeout {
            metric: metric.clone(),
            timeout_secs: self.fetch_timeout.as_secs(),
        })?
        .map_err(|source| EvaluationError::Fetch {
            metric: metric.clone(),
            source,
        })?;

        if series.is_empty() {
            return Err(EvaluationError::EmptySeries { metric });
        }

        let result = evaluate_series(rule, &series, now);
        tracing::debug!(
            rule_id = rule.id,
            metric = %metric,
            points = series.len(),
            triggered = result.triggered,
            value = result.value,
            "Rule evaluated"
        );
        Ok(result)
    }

    /// Explicit metric reference first; the free-text condition is only a fallback.
    async fn metric_name(&self, rule: &AlertRule) -> Result<String, EvaluationError> {
        if let Some(name) = &rule.metric_name {
            return Ok(name.clone());
        }
        let unresolved = || EvaluationError::UnresolvedMetric {
            rule_id: rule.id,
            expression: rule.condition_expression.clone(),
        };
        match self
            .metrics
            .resolve_metric_name(&rule.condition_expression)
            .await
        {
            Ok(Some(name)) => Ok(name),
            Ok(None) => Err(unresolved()),
            Err(e) => {
                tracing::warn!(rule_id = rule.id, error = %e, "Metric name resolution failed");
                Err(unresolved())
            }
        }
    }
}
