use anyhow::Context;
use serde::{Deserialize, Serialize};
use trainalert_common::types::ResourceRef;
use trainalert_notify::dispatcher::DispatcherConfig;
use trainalert_notify::plugin::ChannelConfig;
use trainalert_notify::template::TemplateConfig;
use trainalert_storage::RuleRecord;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub notification: DispatcherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Overrides of the built-in message templates.
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{path}'"))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{path}'"))?;
        Ok(config)
    }
}

/// Evaluation engine settings (`[engine]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 规则评估的全局节拍（秒）
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,
    #[serde(default = "default_max_concurrent_rules")]
    pub max_concurrent_rules: usize,
    #[serde(default = "default_alert_retention_days")]
    pub alert_retention_days: u32,
    #[serde(default = "default_true")]
    pub enable_grouping: bool,
    #[serde(default = "default_true")]
    pub enable_suppression: bool,
    /// Applied only to rules that leave their throttle unset.
    #[serde(default = "default_throttle_minutes")]
    pub default_throttle_minutes: u32,
    #[serde(default = "default_true")]
    pub anomaly_detection_enabled: bool,
    #[serde(default = "default_bridge_interval_secs")]
    pub bridge_interval_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_metric_fetch_timeout_secs")]
    pub metric_fetch_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: default_evaluation_interval_secs(),
            max_concurrent_rules: default_max_concurrent_rules(),
            alert_retention_days: default_alert_retention_days(),
            enable_grouping: true,
            enable_suppression: true,
            default_throttle_minutes: default_throttle_minutes(),
            anomaly_detection_enabled: true,
            bridge_interval_secs: default_bridge_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            metric_fetch_timeout_secs: default_metric_fetch_timeout_secs(),
        }
    }
}

fn default_evaluation_interval_secs() -> u64 {
    30
}

fn default_max_concurrent_rules() -> usize {
    10
}

fn default_alert_retention_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

fn default_throttle_minutes() -> u32 {
    5
}

fn default_bridge_interval_secs() -> u64 {
    5
}

fn default_cleanup_interval_secs() -> u64 {
    86400
}

fn default_metric_fetch_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "data/trainalert.db".to_string()
}

// ---- Rules seed file types (used by `init-rules` CLI subcommand) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesSeedFile {
    #[serde(default)]
    pub rules: Vec<SeedAlertRule>,
}

/// A rule as written by hand in a seed file: list and object fields are
/// plain JSON rather than the encoded columns of [`RuleRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedAlertRule {
    /// Left empty, the store assigns one.
    #[serde(default)]
    pub id: Option<i64>,
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
    #[serde(default = "default_seed_operator")]
    pub operator: String,
    #[serde(default = "default_seed_window_secs")]
    pub evaluation_window_secs: i64,
    #[serde(default = "default_seed_interval_secs")]
    pub evaluation_interval_secs: i64,
    #[serde(default)]
    pub trigger_duration_secs: i64,
    #[serde(default)]
    pub recovery_duration_secs: i64,
    #[serde(default = "default_seed_severity")]
    pub severity: String,
    #[serde(default)]
    pub severity_score: Option<i32>,
    #[serde(default)]
    pub notification_channels: Vec<String>,
    #[serde(default)]
    pub notification_throttle_minutes: Option<i64>,
    #[serde(default = "default_silence_secs")]
    pub silence_duration_secs: i64,
    #[serde(default)]
    pub resource: ResourceRef,
    #[serde(default)]
    pub depends_on: Vec<i64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SeedAlertRule {
    pub fn into_record(self) -> serde_json::Result<RuleRecord> {
        Ok(RuleRecord {
            id: self.id.unwrap_or(0),
            name: self.name,
            rule_type: self.rule_type,
            condition_expression: self.condition_expression,
            metric_name: self.metric_name,
            warning_threshold: self.warning_threshold,
            critical_threshold: self.critical_threshold,
            threshold_condition: self.operator,
            evaluation_window_secs: self.evaluation_window_secs,
            evaluation_interval_secs: self.evaluation_interval_secs,
            trigger_duration_secs: self.trigger_duration_secs,
            recovery_duration_secs: self.recovery_duration_secs,
            alert_level: self.severity,
            severity_score: self.severity_score,
            notification_channels: serde_json::to_string(&self.notification_channels)?,
            notification_throttle_minutes: self.notification_throttle_minutes,
            silence_duration_secs: self.silence_duration_secs,
            filter_resources: serde_json::to_string(&self.resource)?,
            dependency_rules: serde_json::to_string(&self.depends_on)?,
            status: if self.enabled { "active" } else { "disabled" }.to_string(),
            last_evaluation_at: None,
            last_trigger_at: None,
            trigger_count: 0,
        })
    }
}

fn default_seed_operator() -> String {
    "gt".to_string()
}

fn default_seed_window_secs() -> i64 {
    300
}

fn default_seed_interval_secs() -> i64 {
    60
}

fn default_seed_severity() -> String {
    "warning".to_string()
}

fn default_silence_secs() -> i64 {
    600
}
