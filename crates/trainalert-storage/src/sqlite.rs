use crate::error::{Result, StorageError};
use crate::memory::match_metric_name;
use crate::{
    AlertRecord, AlertRecordStore, FailedNotificationStore, MetricStore, RuleRecord, RuleStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use trainalert_common::types::{ActiveAlert, AlertStatus, FailedNotification, MetricPoint};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metric_points (
    metric_name TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    value REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metric_points_name_ts ON metric_points(metric_name, timestamp);

CREATE TABLE IF NOT EXISTS alert_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    rule_type TEXT NOT NULL,
    condition_expression TEXT NOT NULL DEFAULT '',
    metric_name TEXT,
    warning_threshold REAL,
    critical_threshold REAL,
    threshold_condition TEXT NOT NULL DEFAULT 'gt',
    evaluation_window_secs INTEGER NOT NULL DEFAULT 300,
    evaluation_interval_secs INTEGER NOT NULL DEFAULT 60,
    trigger_duration_secs INTEGER NOT NULL DEFAULT 0,
    recovery_duration_secs INTEGER NOT NULL DEFAULT 0,
    alert_level TEXT NOT NULL DEFAULT 'warning',
    severity_score INTEGER,
    notification_channels TEXT NOT NULL DEFAULT '[]',
    notification_throttle_minutes INTEGER,
    silence_duration_secs INTEGER NOT NULL DEFAULT 0,
    filter_resources TEXT NOT NULL DEFAULT '{}',
    dependency_rules TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'active',
    last_evaluation_at INTEGER,
    last_trigger_at INTEGER,
    trigger_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS alert_records (
    id TEXT PRIMARY KEY,
    rule_id INTEGER NOT NULL,
    rule_name TEXT NOT NULL,
    severity TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL,
    resource_key TEXT NOT NULL DEFAULT '',
    trigger_value REAL NOT NULL,
    threshold_value REAL NOT NULL,
    first_occurrence INTEGER NOT NULL,
    last_occurrence INTEGER NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_alert_records_last ON alert_records(last_occurrence);

CREATE TABLE IF NOT EXISTS failed_notifications (
    id TEXT PRIMARY KEY,
    notification_id TEXT NOT NULL,
    alert_id TEXT NOT NULL,
    rule_id INTEGER NOT NULL,
    channel TEXT NOT NULL,
    action TEXT NOT NULL,
    error TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    payload TEXT NOT NULL,
    failed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_failed_notifications_at ON failed_notifications(failed_at);
";

/// SQLite-backed implementation of every store trait, sharing one connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Other(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "Opened alert store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(|_| StorageError::Lock("sqlite"))?;
        f(&conn)
    }

    pub fn write_points(&self, metric_name: &str, points: &[MetricPoint]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO metric_points (metric_name, timestamp, value) VALUES (?1, ?2, ?3)",
                )?;
                for p in points {
                    stmt.execute(params![metric_name, p.timestamp.timestamp_millis(), p.value])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Inserts a rule row and returns its id. A non-positive `record.id` lets
    /// SQLite assign one.
    pub fn insert_rule(&self, record: &RuleRecord) -> Result<i64> {
        self.with_conn(|conn| {
            let id = (record.id > 0).then_some(record.id);
            conn.execute(
                "INSERT OR REPLACE INTO alert_rules (id, name, rule_type, condition_expression, metric_name,
                    warning_threshold, critical_threshold, threshold_condition, evaluation_window_secs,
                    evaluation_interval_secs, trigger_duration_secs, recovery_duration_secs, alert_level,
                    severity_score, notification_channels, notification_throttle_minutes,
                    silence_duration_secs, filter_resources, dependency_rules, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                params![
                    id,
                    &record.name,
                    &record.rule_type,
                    &record.condition_expression,
                    &record.metric_name,
                    record.warning_threshold,
                    record.critical_threshold,
                    &record.threshold_condition,
                    record.evaluation_window_secs,
                    record.evaluation_interval_secs,
                    record.trigger_duration_secs,
                    record.recovery_duration_secs,
                    &record.alert_level,
                    record.severity_score,
                    &record.notification_channels,
                    record.notification_throttle_minutes,
                    record.silence_duration_secs,
                    &record.filter_resources,
                    &record.dependency_rules,
                    &record.status,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_rule(&self, rule_id: i64) -> Result<Option<RuleRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!("{RULE_SELECT} WHERE id = ?1"))?;
            Ok(stmt.query_row(params![rule_id], row_to_rule).optional()?)
        })
    }

    pub fn get_alert_record(&self, alert_id: &str) -> Result<Option<AlertRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, rule_id, rule_name, severity, status, message, resource_key, trigger_value,
                        threshold_value, first_occurrence, last_occurrence, occurrence_count
                 FROM alert_records WHERE id = ?1",
            )?;
            let row = stmt
                .query_row(params![alert_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, f64>(7)?,
                        row.get::<_, f64>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, i64>(10)?,
                        row.get::<_, i64>(11)?,
                    ))
                })
                .optional()?;
            let Some((id, rule_id, rule_name, severity, status, message, resource_key, trigger_value, threshold_value, first, last, count)) = row else {
                return Ok(None);
            };
            Ok(Some(AlertRecord {
                id,
                rule_id,
                rule_name,
                severity: severity.parse().map_err(StorageError::Other)?,
                status: status.parse().map_err(StorageError::Other)?,
                message,
                resource_key,
                trigger_value,
                threshold_value,
                first_occurrence: from_millis(first),
                last_occurrence: from_millis(last),
                occurrence_count: count.max(0) as u64,
            }))
        })
    }
}

const RULE_SELECT: &str = "SELECT id, name, rule_type, condition_expression, metric_name, warning_threshold,
    critical_threshold, threshold_condition, evaluation_window_secs, evaluation_interval_secs,
    trigger_duration_secs, recovery_duration_secs, alert_level, severity_score, notification_channels,
    notification_throttle_minutes, silence_duration_secs, filter_resources, dependency_rules, status,
    last_evaluation_at, last_trigger_at, trigger_count FROM alert_rules";

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<RuleRecord> {
    Ok(RuleRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        rule_type: row.get(2)?,
        condition_expression: row.get(3)?,
        metric_name: row.get(4)?,
        warning_threshold: row.get(5)?,
        critical_threshold: row.get(6)?,
        threshold_condition: row.get(7)?,
        evaluation_window_secs: row.get(8)?,
        evaluation_interval_secs: row.get(9)?,
        trigger_duration_secs: row.get(10)?,
        recovery_duration_secs: row.get(11)?,
        alert_level: row.get(12)?,
        severity_score: row.get(13)?,
        notification_channels: row.get(14)?,
        notification_throttle_minutes: row.get(15)?,
        silence_duration_secs: row.get(16)?,
        filter_resources: row.get(17)?,
        dependency_rules: row.get(18)?,
        status: row.get(19)?,
        last_evaluation_at: row.get::<_, Option<i64>>(20)?.map(from_millis),
        last_trigger_at: row.get::<_, Option<i64>>(21)?.map(from_millis),
        trigger_count: row.get(22)?,
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[async_trait]
impl MetricStore for SqliteStore {
    async fn fetch_series(
        &self,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp, value FROM metric_points
                 WHERE metric_name = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(
                params![metric_name, start.timestamp_millis(), end.timestamp_millis()],
                |row| {
                    Ok(MetricPoint {
                        timestamp: from_millis(row.get(0)?),
                        value: row.get(1)?,
                    })
                },
            )?;
            let mut points = Vec::new();
            for row in rows {
                points.push(row?);
            }
            Ok(points)
        })
    }

    async fn resolve_metric_name(&self, condition_expression: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT DISTINCT metric_name FROM metric_points")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(match_metric_name(
                names.iter().map(String::as_str),
                condition_expression,
            ))
        })
    }
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn load_active_rules(&self) -> Result<Vec<RuleRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached(&format!("{RULE_SELECT} WHERE status = 'active' ORDER BY id"))?;
            let rules = stmt
                .query_map([], row_to_rule)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rules)
        })
    }

    async fn update_last_evaluation(&self, rule_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE alert_rules SET last_evaluation_at = ?1 WHERE id = ?2",
                params![at.timestamp_millis(), rule_id],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound {
                    entity: "alert_rule",
                    id: rule_id.to_string(),
                });
            }
            Ok(())
        })
    }

    async fn increment_trigger_count(&self, rule_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE alert_rules SET trigger_count = trigger_count + 1, last_trigger_at = ?1 WHERE id = ?2",
                params![at.timestamp_millis(), rule_id],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound {
                    entity: "alert_rule",
                    id: rule_id.to_string(),
                });
            }
            Ok(())
        })
    }
}

#[async_trait]
impl AlertRecordStore for SqliteStore {
    async fn insert_alert_record(&self, alert: &ActiveAlert) -> Result<()> {
        let record = AlertRecord::from_alert(alert);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alert_records (id, rule_id, rule_name, severity, status, message, resource_key,
                    trigger_value, threshold_value, first_occurrence, last_occurrence, occurrence_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    &record.id,
                    record.rule_id,
                    &record.rule_name,
                    record.severity.to_string(),
                    record.status.to_string(),
                    &record.message,
                    &record.resource_key,
                    record.trigger_value,
                    record.threshold_value,
                    record.first_occurrence.timestamp_millis(),
                    record.last_occurrence.timestamp_millis(),
                    record.occurrence_count as i64,
                ],
            )?;
            Ok(())
        })
    }

    async fn update_alert_record(
        &self,
        alert_id: &str,
        status: AlertStatus,
        occurrence_count: u64,
        last_occurrence: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE alert_records SET status = ?1, occurrence_count = ?2, last_occurrence = ?3 WHERE id = ?4",
                params![
                    status.to_string(),
                    occurrence_count as i64,
                    last_occurrence.timestamp_millis(),
                    alert_id,
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound {
                    entity: "alert_record",
                    id: alert_id.to_string(),
                });
            }
            Ok(())
        })
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM alert_records WHERE last_occurrence < ?1",
                params![cutoff.timestamp_millis()],
            )?;
            Ok(removed as u64)
        })
    }
}

#[async_trait]
impl FailedNotificationStore for SqliteStore {
    async fn insert_failed(&self, failed: &FailedNotification) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO failed_notifications (id, notification_id, alert_id, rule_id, channel,
                    action, error, attempts, payload, failed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    &failed.id,
                    &failed.notification_id,
                    &failed.alert_id,
                    failed.rule_id,
                    &failed.channel,
                    failed.action.to_string(),
                    &failed.error,
                    failed.attempts,
                    &failed.payload,
                    failed.failed_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    async fn delete_failed_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM failed_notifications WHERE failed_at < ?1",
                params![cutoff.timestamp_millis()],
            )?;
            Ok(removed as u64)
        })
    }

    async fn count_failed(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM failed_notifications", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
    }
}
