use crate::error::{Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trainalert_common::types::{AlertRule, CompareOp, ResourceRef, RuleType, Severity};

/// A rule row as persisted by the rule store.
///
/// List and object columns are JSON-encoded strings, so a single bad row can
/// only be detected when it is converted with [`RuleRecord::into_rule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: i64,
    pub name: String,
    pub rule_type: String,
    #[serde(default)]
    pub condition_expression: String,
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub warning_threshold: Option<f64>,
    #[serde(default)]
    pub critical_threshold: Option<f64>,
    #[serde(default = "default_threshold_condition")]
    pub threshold_condition: String,
    #[serde(default = "default_window_secs")]
    pub evaluation_window_secs: i64,
    #[serde(default = "default_interval_secs")]
    pub evaluation_interval_secs: i64,
    #[serde(default)]
    pub trigger_duration_secs: i64,
    #[serde(default)]
    pub recovery_duration_secs: i64,
    #[serde(default = "default_alert_level")]
    pub alert_level: String,
    #[serde(default)]
    pub severity_score: Option<i32>,
    /// JSON array of channel names.
    #[serde(default)]
    pub notification_channels: String,
    /// `None` falls back to the engine-wide default.
    #[serde(default)]
    pub notification_throttle_minutes: Option<i64>,
    #[serde(default)]
    pub silence_duration_secs: i64,
    /// JSON object decoded into a [`ResourceRef`].
    #[serde(default)]
    pub filter_resources: String,
    /// JSON array of rule ids.
    #[serde(default)]
    pub dependency_rules: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub last_evaluation_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_trigger_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trigger_count: i64,
}

fn default_threshold_condition() -> String {
    "gt".to_string()
}

fn default_window_secs() -> i64 {
    300
}

fn default_interval_secs() -> i64 {
    60
}

fn default_alert_level() -> String {
    "warning".to_string()
}

fn default_status() -> String {
    "active".to_string()
}

impl RuleRecord {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    /// Converts the row into an evaluable rule.
    ///
    /// `default_throttle_minutes` is applied when the row leaves its throttle unset.
    pub fn into_rule(self, default_throttle_minutes: u32) -> Result<AlertRule> {
        let id = self.id;
        let enabled = self.is_active();
        let invalid = |reason: String| StorageError::InvalidRule {
            rule_id: id,
            reason,
        };

        let rule_type: RuleType = self.rule_type.parse().map_err(invalid)?;
        let operator: CompareOp = self.threshold_condition.parse().map_err(invalid)?;
        let severity: Severity = self.alert_level.parse().map_err(invalid)?;

        let notification_channels: Vec<String> = decode_json_column(&self.notification_channels)
            .map_err(|e| invalid(format!("notification_channels: {e}")))?;
        let resource: ResourceRef = decode_json_column(&self.filter_resources)
            .map_err(|e| invalid(format!("filter_resources: {e}")))?;
        let depends_on: Vec<i64> = decode_json_column(&self.dependency_rules)
            .map_err(|e| invalid(format!("dependency_rules: {e}")))?;

        if self.evaluation_window_secs <= 0 {
            return Err(invalid(format!(
                "evaluation window must be positive, got {}",
                self.evaluation_window_secs
            )));
        }

        let metric_name = self.metric_name.filter(|m| !m.trim().is_empty());

        Ok(AlertRule {
            id,
            name: self.name,
            rule_type,
            condition_expression: self.condition_expression,
            metric_name,
            warning_threshold: self.warning_threshold,
            critical_threshold: self.critical_threshold,
            operator,
            evaluation_window_secs: self.evaluation_window_secs as u64,
            evaluation_interval_secs: self.evaluation_interval_secs.max(0) as u64,
            trigger_duration_secs: self.trigger_duration_secs.max(0) as u64,
            recovery_duration_secs: self.recovery_duration_secs.max(0) as u64,
            severity,
            severity_score: self
                .severity_score
                .unwrap_or_else(|| severity.default_score()),
            notification_channels,
            notification_throttle_minutes: self
                .notification_throttle_minutes
                .map(|m| m.max(0) as u32)
                .unwrap_or(default_throttle_minutes),
            silence_duration_secs: self.silence_duration_secs.max(0) as u64,
            resource,
            depends_on,
            enabled,
            last_evaluation_at: self.last_evaluation_at,
            last_trigger_at: self.last_trigger_at,
            trigger_count: self.trigger_count.max(0) as u64,
        })
    }
}

/// Empty columns decode to the type's default.
fn decode_json_column<T>(raw: &str) -> std::result::Result<T, serde_json::Error>
where
    T: serde::de::DeserializeOwned + Default,
{
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw)
}
