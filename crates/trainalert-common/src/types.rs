use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tolerance used by `eq`/`neq` comparisons on metric values.
pub const FLOAT_EPSILON: f64 = 0.001;

/// Alert severity level, ordered from lowest to highest.
///
/// # Examples
///
/// ```
/// use trainalert_common::types::Severity;
///
/// let sev: Severity = "warning".parse().unwrap();
/// assert_eq!(sev, Severity::Warning);
/// assert_eq!(sev.to_string(), "warning");
/// assert!(Severity::Fatal > Severity::Critical);
/// assert!(Severity::Critical > Severity::Info);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Fatal,
}

impl Severity {
    /// Default numeric score used when a rule does not carry its own.
    pub fn default_score(self) -> i32 {
        match self {
            Severity::Info => 10,
            Severity::Warning => 50,
            Severity::Critical => 80,
            Severity::Fatal => 100,
        }
    }

    /// Critical and fatal alerts additionally reach `critical_recipients`.
    pub fn is_critical(self) -> bool {
        self >= Severity::Critical
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            "fatal" => Ok(Severity::Fatal),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// Comparison operator applied between an observed value and a threshold.
///
/// # Examples
///
/// ```
/// use trainalert_common::types::CompareOp;
///
/// let op: CompareOp = "gte".parse().unwrap();
/// assert!(op.check(90.0, 90.0));
/// let eq: CompareOp = "eq".parse().unwrap();
/// assert!(eq.check(1.0004, 1.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "gt", alias = "greater_than")]
    GreaterThan,
    #[serde(rename = "gte", alias = "greater_equal")]
    GreaterEqual,
    #[serde(rename = "lt", alias = "less_than")]
    LessThan,
    #[serde(rename = "lte", alias = "less_equal")]
    LessEqual,
    #[serde(rename = "eq", alias = "equal")]
    Equal,
    #[serde(rename = "neq", alias = "not_equal")]
    NotEqual,
}

impl CompareOp {
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessEqual => value <= threshold,
            Self::Equal => (value - threshold).abs() < FLOAT_EPSILON,
            Self::NotEqual => (value - threshold).abs() >= FLOAT_EPSILON,
        }
    }

    /// Wording used in alert messages (`"cpu_usage above 90.00"`).
    pub fn describe(&self) -> &'static str {
        match self {
            Self::GreaterThan => "above",
            Self::GreaterEqual => "at or above",
            Self::LessThan => "below",
            Self::LessEqual => "at or below",
            Self::Equal => "equal to",
            Self::NotEqual => "not equal to",
        }
    }
}

impl std::str::FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gt" | "greater_than" | ">" => Ok(Self::GreaterThan),
            "gte" | "greater_equal" | ">=" => Ok(Self::GreaterEqual),
            "lt" | "less_than" | "<" => Ok(Self::LessThan),
            "lte" | "less_equal" | "<=" => Ok(Self::LessEqual),
            "eq" | "equal" | "==" => Ok(Self::Equal),
            "neq" | "not_equal" | "!=" => Ok(Self::NotEqual),
            _ => Err(format!("unknown compare operator: {s}")),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GreaterThan => write!(f, "gt"),
            Self::GreaterEqual => write!(f, "gte"),
            Self::LessThan => write!(f, "lt"),
            Self::LessEqual => write!(f, "lte"),
            Self::Equal => write!(f, "eq"),
            Self::NotEqual => write!(f, "neq"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Threshold,
    Trend,
    Anomaly,
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleType::Threshold => write!(f, "threshold"),
            RuleType::Trend => write!(f, "trend"),
            RuleType::Anomaly => write!(f, "anomaly"),
        }
    }
}

impl std::str::FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "threshold" => Ok(RuleType::Threshold),
            "trend" => Ok(RuleType::Trend),
            "anomaly" => Ok(RuleType::Anomaly),
            _ => Err(format!("unknown rule type: {s}")),
        }
    }
}

/// The monitored object an alert is raised against (a training job, a node, a queue...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    /// 资源类型（如 job、node、queue）
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub instance_id: String,
}

impl ResourceRef {
    /// Identity used for alert keys and suppression matching.
    pub fn key(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }

    pub fn is_empty(&self) -> bool {
        self.resource_type.is_empty() && self.resource_id.is_empty()
    }

    pub fn display(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let name = if self.resource_name.is_empty() {
            &self.resource_id
        } else {
            &self.resource_name
        };
        format!("{}:{}", self.resource_type, name)
    }
}

/// A monitoring rule as loaded into the evaluator's rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub name: String,
    pub rule_type: RuleType,
    /// Free-text condition, only consulted when `metric_name` is unset.
    pub condition_expression: String,
    pub metric_name: Option<String>,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
    pub operator: CompareOp,
    pub evaluation_window_secs: u64,
    pub evaluation_interval_secs: u64,
    pub trigger_duration_secs: u64,
    pub recovery_duration_secs: u64,
    pub severity: Severity,
    pub severity_score: i32,
    /// 通知渠道名称列表
    pub notification_channels: Vec<String>,
    /// 0 disables throttling.
    pub notification_throttle_minutes: u32,
    pub silence_duration_secs: u64,
    pub resource: ResourceRef,
    /// Rules whose firing alerts subsume this one.
    pub depends_on: Vec<i64>,
    pub enabled: bool,
    pub last_evaluation_at: Option<DateTime<Utc>>,
    pub last_trigger_at: Option<DateTime<Utc>>,
    pub trigger_count: u64,
}

impl AlertRule {
    /// Whether the rule's own cadence allows another evaluation at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_evaluation_at {
            None => true,
            Some(last) => {
                now - last >= chrono::Duration::seconds(self.evaluation_interval_secs as i64)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Transient output of one rule evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub rule_id: i64,
    pub triggered: bool,
    pub value: f64,
    pub threshold: f64,
    /// Tier picked by threshold evaluation; `None` for trend and anomaly.
    pub level: Option<Severity>,
    pub message: String,
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
    Acknowledged,
    Suppressed,
    Silenced,
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertStatus::Firing => write!(f, "firing"),
            AlertStatus::Resolved => write!(f, "resolved"),
            AlertStatus::Acknowledged => write!(f, "acknowledged"),
            AlertStatus::Suppressed => write!(f, "suppressed"),
            AlertStatus::Silenced => write!(f, "silenced"),
        }
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firing" => Ok(AlertStatus::Firing),
            "resolved" => Ok(AlertStatus::Resolved),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "suppressed" => Ok(AlertStatus::Suppressed),
            "silenced" => Ok(AlertStatus::Silenced),
            _ => Err(format!("unknown alert status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub id: String,
    pub rule_id: i64,
    pub rule_name: String,
    pub severity: Severity,
    pub severity_score: i32,
    pub message: String,
    pub summary: String,
    pub resource: ResourceRef,
    pub trigger_value: f64,
    pub threshold_value: f64,
    /// In-memory status; `Firing` while present in the active table.
    pub status: AlertStatus,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub occurrence_count: u64,
    pub context: Map<String, Value>,
    pub notification_sent: bool,
    pub notification_count: u32,
    pub last_notification_at: Option<DateTime<Utc>>,
    pub escalation_level: u32,
    pub group_id: Option<String>,
    pub correlation_id: String,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub silenced_until: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// First non-triggered evaluation seen while a recovery duration is pending.
    #[serde(skip)]
    pub recovering_since: Option<DateTime<Utc>>,
}

impl ActiveAlert {
    pub fn is_silenced(&self, now: DateTime<Utc>) -> bool {
        self.silenced_until.is_some_and(|until| now < until)
    }

    /// Status written to the alert record store, which also reflects
    /// operator actions taken on a firing alert.
    pub fn record_status(&self, now: DateTime<Utc>) -> AlertStatus {
        if self.status != AlertStatus::Firing {
            self.status
        } else if self.is_silenced(now) {
            AlertStatus::Silenced
        } else if self.acknowledged_at.is_some() {
            AlertStatus::Acknowledged
        } else {
            AlertStatus::Firing
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyAction {
    Firing,
    Resolved,
    Acknowledged,
}

impl std::fmt::Display for NotifyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyAction::Firing => write!(f, "firing"),
            NotifyAction::Resolved => write!(f, "resolved"),
            NotifyAction::Acknowledged => write!(f, "acknowledged"),
        }
    }
}

/// A delivery request handed from the bridge to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertNotification {
    pub id: String,
    pub alert: ActiveAlert,
    pub rule: AlertRule,
    pub action: NotifyAction,
    pub created_at: DateTime<Utc>,
}

/// A notification that could not be delivered after all retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedNotification {
    pub id: String,
    pub notification_id: String,
    pub alert_id: String,
    pub rule_id: i64,
    pub channel: String,
    pub action: NotifyAction,
    pub error: String,
    pub attempts: u32,
    /// Rendered message body at the time of failure.
    pub payload: String,
    pub failed_at: DateTime<Utc>,
}

/// Format an evaluation context map into a human-readable string.
///
/// # Examples
///
/// ```
/// use serde_json::{json, Map};
/// use trainalert_common::types::format_context;
///
/// let mut ctx = Map::new();
/// ctx.insert("mean".to_string(), json!(42.5));
/// ctx.insert("z_score".to_string(), json!(3.2));
/// let s = format_context(&ctx);
/// assert_eq!(s, "mean=42.5, z_score=3.2");
/// ```
pub fn format_context(context: &Map<String, Value>) -> String {
    if context.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<String> = context
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect();
    pairs.sort();
    pairs.join(", ")
}
