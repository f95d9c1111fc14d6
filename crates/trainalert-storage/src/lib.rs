//! Persistence collaborators of the alerting core.
//!
//! The evaluation and delivery crates only see the traits defined here:
//! [`MetricStore`] supplies time series, [`RuleStore`] owns rule definitions
//! and their bookkeeping, [`AlertRecordStore`] receives alert history and
//! [`FailedNotificationStore`] keeps the permanently-failed delivery trail.
//!
//! Two implementations are provided: [`memory::MemoryStore`] for tests and
//! embedding, and [`sqlite::SqliteStore`] backed by a single SQLite file in
//! WAL mode.

pub mod error;
pub mod memory;
pub mod rule_record;
pub mod sqlite;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trainalert_common::types::{ActiveAlert, AlertStatus, FailedNotification, MetricPoint, Severity};

pub use error::{Result, StorageError};
pub use rule_record::RuleRecord;

/// Source of metric time series.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Returns the points of `metric_name` within `[start, end]`, oldest first.
    async fn fetch_series(
        &self,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>>;

    /// Best-effort lookup of a metric referenced by a free-text condition,
    /// used for rules that carry no explicit metric name.
    async fn resolve_metric_name(&self, condition_expression: &str) -> Result<Option<String>>;
}

/// Owner of rule definitions and evaluation bookkeeping.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn load_active_rules(&self) -> Result<Vec<RuleRecord>>;

    async fn update_last_evaluation(&self, rule_id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Increments `trigger_count` and stamps `last_trigger_at`.
    async fn increment_trigger_count(&self, rule_id: i64, at: DateTime<Utc>) -> Result<()>;
}

/// Durable alert history. Records are appended on create and field-updated afterwards.
#[async_trait]
pub trait AlertRecordStore: Send + Sync {
    async fn insert_alert_record(&self, alert: &ActiveAlert) -> Result<()>;

    async fn update_alert_record(
        &self,
        alert_id: &str,
        status: AlertStatus,
        occurrence_count: u64,
        last_occurrence: DateTime<Utc>,
    ) -> Result<()>;

    /// Deletes records whose last occurrence is before `cutoff`; returns the count removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Trail of notifications that exhausted their retries.
#[async_trait]
pub trait FailedNotificationStore: Send + Sync {
    async fn insert_failed(&self, failed: &FailedNotification) -> Result<()>;

    async fn delete_failed_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn count_failed(&self) -> Result<u64>;
}

/// A persisted alert row as read back from an [`AlertRecordStore`] implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub rule_id: i64,
    pub rule_name: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub message: String,
    pub resource_key: String,
    pub trigger_value: f64,
    pub threshold_value: f64,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub occurrence_count: u64,
}

impl AlertRecord {
    pub fn from_alert(alert: &ActiveAlert) -> Self {
        Self {
            id: alert.id.clone(),
            rule_id: alert.rule_id,
            rule_name: alert.rule_name.clone(),
            severity: alert.severity,
            status: alert.status,
            message: alert.message.clone(),
            resource_key: alert.resource.key(),
            trigger_value: alert.trigger_value,
            threshold_value: alert.threshold_value,
            first_occurrence: alert.first_occurrence,
            last_occurrence: alert.last_occurrence,
            occurrence_count: alert.occurrence_count,
        }
    }
}
