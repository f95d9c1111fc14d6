use crate::error::{Result, StorageError};
use crate::{
    AlertRecord, AlertRecordStore, FailedNotificationStore, MetricStore, RuleRecord, RuleStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use trainalert_common::types::{ActiveAlert, AlertStatus, FailedNotification, MetricPoint};

/// Process-local implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    series: RwLock<HashMap<String, Vec<MetricPoint>>>,
    rules: RwLock<Vec<RuleRecord>>,
    alerts: RwLock<HashMap<String, AlertRecord>>,
    failed: RwLock<Vec<FailedNotification>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends points to a series, keeping it ordered by timestamp.
    pub fn push_points(&self, metric_name: &str, points: &[MetricPoint]) -> Result<()> {
        let mut series = self.series.write().map_err(|_| StorageError::Lock("series"))?;
        let entry = series.entry(metric_name.to_string()).or_default();
        entry.extend_from_slice(points);
        entry.sort_by_key(|p| p.timestamp);
        Ok(())
    }

    /// Inserts or replaces a rule row by id.
    pub fn upsert_rule(&self, record: RuleRecord) -> Result<()> {
        let mut rules = self.rules.write().map_err(|_| StorageError::Lock("rules"))?;
        match rules.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => rules.push(record),
        }
        Ok(())
    }

    pub fn rule(&self, rule_id: i64) -> Option<RuleRecord> {
        let rules = self.rules.read().ok()?;
        rules.iter().find(|r| r.id == rule_id).cloned()
    }

    pub fn alert_record(&self, alert_id: &str) -> Option<AlertRecord> {
        let alerts = self.alerts.read().ok()?;
        alerts.get(alert_id).cloned()
    }

    pub fn alert_records(&self) -> Vec<AlertRecord> {
        self.alerts
            .read()
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn failed_notifications(&self) -> Vec<FailedNotification> {
        self.failed.read().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn fetch_series(
        &self,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>> {
        let series = self.series.read().map_err(|_| StorageError::Lock("series"))?;
        let points = series
            .get(metric_name)
            .ok_or_else(|| StorageError::NotFound {
                entity: "metric",
                id: metric_name.to_string(),
            })?;
        Ok(points
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .copied()
            .collect())
    }

    async fn resolve_metric_name(&self, condition_expression: &str) -> Result<Option<String>> {
        let series = self.series.read().map_err(|_| StorageError::Lock("series"))?;
        Ok(match_metric_name(series.keys().map(String::as_str), condition_expression))
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn load_active_rules(&self) -> Result<Vec<RuleRecord>> {
        let rules = self.rules.read().map_err(|_| StorageError::Lock("rules"))?;
        Ok(rules.iter().filter(|r| r.is_active()).cloned().collect())
    }

    async fn update_last_evaluation(&self, rule_id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut rules = self.rules.write().map_err(|_| StorageError::Lock("rules"))?;
        let rule = find_rule(&mut rules, rule_id)?;
        rule.last_evaluation_at = Some(at);
        Ok(())
    }

    async fn increment_trigger_count(&self, rule_id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut rules = self.rules.write().map_err(|_| StorageError::Lock("rules"))?;
        let rule = find_rule(&mut rules, rule_id)?;
        rule.trigger_count += 1;
        rule.last_trigger_at = Some(at);
        Ok(())
    }
}

fn find_rule(rules: &mut [RuleRecord], rule_id: i64) -> Result<&mut RuleRecord> {
    rules
        .iter_mut()
        .find(|r| r.id == rule_id)
        .ok_or_else(|| StorageError::NotFound {
            entity: "alert_rule",
            id: rule_id.to_string(),
        })
}

#[async_trait]
impl AlertRecordStore for MemoryStore {
    async fn insert_alert_record(&self, alert: &ActiveAlert) -> Result<()> {
        let mut alerts = self.alerts.write().map_err(|_| StorageError::Lock("alerts"))?;
        alerts.insert(alert.id.clone(), AlertRecord::from_alert(alert));
        Ok(())
    }

    async fn update_alert_record(
        &self,
        alert_id: &str,
        status: AlertStatus,
        occurrence_count: u64,
        last_occurrence: DateTime<Utc>,
    ) -> Result<()> {
        let mut alerts = self.alerts.write().map_err(|_| StorageError::Lock("alerts"))?;
        let record = alerts
            .get_mut(alert_id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "alert_record",
                id: alert_id.to_string(),
            })?;
        record.status = status;
        record.occurrence_count = occurrence_count;
        record.last_occurrence = last_occurrence;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut alerts = self.alerts.write().map_err(|_| StorageError::Lock("alerts"))?;
        let before = alerts.len();
        alerts.retain(|_, r| r.last_occurrence >= cutoff);
        Ok((before - alerts.len()) as u64)
    }
}

#[async_trait]
impl FailedNotificationStore for MemoryStore {
    async fn insert_failed(&self, failed: &FailedNotification) -> Result<()> {
        let mut trail = self.failed.write().map_err(|_| StorageError::Lock("failed"))?;
        trail.push(failed.clone());
        Ok(())
    }

    async fn delete_failed_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut trail = self.failed.write().map_err(|_| StorageError::Lock("failed"))?;
        let before = trail.len();
        trail.retain(|f| f.failed_at >= cutoff);
        Ok((before - trail.len()) as u64)
    }

    async fn count_failed(&self) -> Result<u64> {
        let trail = self.failed.read().map_err(|_| StorageError::Lock("failed"))?;
        Ok(trail.len() as u64)
    }
}

/// Picks the longest known metric name contained in the expression,
/// ignoring case. Longest-first keeps `gpu_memory_usage` from matching as
/// `memory_usage`.
pub(crate) fn match_metric_name<'a>(
    known: impl Iterator<Item = &'a str>,
    condition_expression: &str,
) -> Option<String> {
    let expr = condition_expression.to_lowercase();
    known
        .filter(|name| !name.is_empty() && expr.contains(&name.to_lowercase()))
        .max_by_key(|name| name.len())
        .map(str::to_string)
}
