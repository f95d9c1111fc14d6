use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use trainalert_common::types::{
    ActiveAlert, AlertRule, AlertStatus, EvaluationResult, ResourceRef, Severity,
};
use trainalert_storage::{AlertRecordStore, RuleStore};

/// Identity of an alert episode: one firing alert per (rule, resource).
type AlertKey = (i64, String);

/// Lifecycle change produced by [`AlertStateManager::apply`].
#[derive(Debug, Clone)]
pub enum Transition {
    /// A new episode started; a `firing` notification is requested.
    Created(ActiveAlert),
    /// An existing episode saw another triggered evaluation.
    Updated(ActiveAlert),
    /// The episode ended; a `resolved` notification is requested.
    Resolved(ActiveAlert),
}

#[derive(Default)]
struct AlertTable {
    active: HashMap<AlertKey, ActiveAlert>,
    /// First triggered evaluation of a not-yet-created alert whose rule has a
    /// trigger duration.
    pending: HashMap<AlertKey, DateTime<Utc>>,
}

impl AlertTable {
    fn find_mut(&mut self, alert_id: &str) -> Option<&mut ActiveAlert> {
        self.active.values_mut().find(|a| a.id == alert_id)
    }
}

/// Owner of the active-alert table.
///
/// Every read and write goes through one lock. Persistence happens after the
/// lock is released; store failures are logged and never roll back the
/// in-memory transition.
pub struct AlertStateManager {
    table: RwLock<AlertTable>,
    records: Arc<dyn AlertRecordStore>,
    rules: Arc<dyn RuleStore>,
    enable_grouping: bool,
}

impl AlertStateManager {
    pub fn new(
        records: Arc<dyn AlertRecordStore>,
        rules: Arc<dyn RuleStore>,
        enable_grouping: bool,
    ) -> Self {
        Self {
            table: RwLock::new(AlertTable::default()),
            records,
            rules,
            enable_grouping,
        }
    }

    fn key(rule: &AlertRule) -> AlertKey {
        (rule.id, rule.resource.key())
    }

    /// Folds one evaluation result into the table.
    pub async fn apply(&self, rule: &AlertRule, result: &EvaluationResult) -> Option<Transition> {
        let now = result.timestamp;
        let key = Self::key(rule);

        let transition = {
            let mut table = self.table.write().await;
            if result.triggered {
                self.apply_triggered(&mut table, key, rule, result, now)
            } else {
                Self::apply_clear(&mut table, &key, rule, now)
            }
        };

        match &transition {
            Some(Transition::Created(alert)) => self.persist_created(alert, now).await,
            Some(Transition::Updated(alert)) | Some(Transition::Resolved(alert)) => {
                self.persist_update(alert, now).await
            }
            None => {}
        }
        transition
    }

    fn apply_triggered(
        &self,
        table: &mut AlertTable,
        key: AlertKey,
        rule: &AlertRule,
        result: &EvaluationResult,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if let Some(alert) = table.active.get_mut(&key) {
            alert.occurrence_count += 1;
            alert.last_occurrence = now;
            alert.trigger_value = result.value;
            alert.threshold_value = result.threshold;
            alert.message = result.message.clone();
            alert.context = result.context.clone();
            alert.recovering_since = None;
            if let Some(level) = result.level {
                let level = alert_severity(rule, level);
                if level != alert.severity {
                    alert.severity = level;
                    alert.severity_score = severity_score(rule, level);
                }
            }
            return Some(Transition::Updated(alert.clone()));
        }

        if rule.trigger_duration_secs > 0 {
            let since = *table.pending.entry(key.clone()).or_insert(now);
            if now - since < Duration::seconds(rule.trigger_duration_secs as i64) {
                tracing::debug!(
                    rule_id = rule.id,
                    pending_secs = (now - since).num_seconds(),
                    "Condition triggered, waiting for trigger duration"
                );
                return None;
            }
            table.pending.remove(&key);
        }

        let alert = self.new_alert(rule, result, now);
        tracing::info!(
            alert_id = %alert.id,
            rule_id = rule.id,
            severity = %alert.severity,
            value = alert.trigger_value,
            threshold = alert.threshold_value,
            "Alert created"
        );
        table.active.insert(key, alert.clone());
        Some(Transition::Created(alert))
    }

    fn apply_clear(
        table: &mut AlertTable,
        key: &AlertKey,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        table.pending.remove(key);

        let alert = table.active.get_mut(key)?;
        if rule.recovery_duration_secs > 0 {
            let since = *alert.recovering_since.get_or_insert(now);
            if now - since < Duration::seconds(rule.recovery_duration_secs as i64) {
                return None;
            }
        }

        let mut alert = table.active.remove(key)?;
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        alert.recovering_since = None;
        tracing::info!(
            alert_id = %alert.id,
            rule_id = rule.id,
            occurrences = alert.occurrence_count,
            "Alert resolved"
        );
        Some(Transition::Resolved(alert))
    }

    fn new_alert(&self, rule: &AlertRule, result: &EvaluationResult, now: DateTime<Utc>) -> ActiveAlert {
        let id = trainalert_common::id::next_id();
        let severity = result.level.map_or(rule.severity, |level| alert_severity(rule, level));
        let resource: ResourceRef = rule.resource.clone();
        let summary = if resource.is_empty() {
            format!("[{severity}] {}", rule.name)
        } else {
            format!("[{severity}] {} on {}", rule.name, resource.display())
        };
        ActiveAlert {
            correlation_id: id.clone(),
            id,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            severity,
            severity_score: severity_score(rule, severity),
            message: result.message.clone(),
            summary,
            resource,
            trigger_value: result.value,
            threshold_value: result.threshold,
            status: AlertStatus::Firing,
            first_occurrence: now,
            last_occurrence: now,
            occurrence_count: 1,
            context: result.context.clone(),
            notification_sent: false,
            notification_count: 0,
            last_notification_at: None,
            escalation_level: 0,
            group_id: self.enable_grouping.then(|| format!("rule-{}", rule.id)),
            acknowledged_at: None,
            acknowledged_by: None,
            silenced_until: None,
            resolved_at: None,
            recovering_since: None,
        }
    }

    async fn persist_created(&self, alert: &ActiveAlert, now: DateTime<Utc>) {
        if let Err(e) = self.records.insert_alert_record(alert).await {
            tracing::error!(alert_id = %alert.id, error = %e, "Failed to insert alert record");
        }
        if let Err(e) = self.rules.increment_trigger_count(alert.rule_id, now).await {
            tracing::error!(rule_id = alert.rule_id, error = %e, "Failed to increment trigger count");
        }
    }

    async fn persist_update(&self, alert: &ActiveAlert, now: DateTime<Utc>) {
        if let Err(e) = self
            .records
            .update_alert_record(
                &alert.id,
                alert.record_status(now),
                alert.occurrence_count,
                alert.last_occurrence,
            )
            .await
        {
            tracing::error!(alert_id = %alert.id, error = %e, "Failed to update alert record");
        }
    }

    /// Snapshot of every firing alert, oldest first.
    pub async fn active_alerts(&self) -> Vec<ActiveAlert> {
        let table = self.table.read().await;
        let mut alerts: Vec<ActiveAlert> = table.active.values().cloned().collect();
        alerts.sort_by_key(|a| a.first_occurrence);
        alerts
    }

    pub async fn active_count(&self) -> usize {
        self.table.read().await.active.len()
    }

    pub async fn get(&self, alert_id: &str) -> Option<ActiveAlert> {
        let table = self.table.read().await;
        table.active.values().find(|a| a.id == alert_id).cloned()
    }

    /// Reserves the throttle window when a notification is enqueued, so the
    /// bridge does not offer the same alert again while delivery is in flight.
    pub async fn mark_enqueued(&self, alert_id: &str, at: DateTime<Utc>) {
        let mut table = self.table.write().await;
        if let Some(alert) = table.find_mut(alert_id) {
            alert.last_notification_at = Some(at);
        }
    }

    /// Records a successful delivery. Returns `false` when the alert is no
    /// longer active (already resolved).
    pub async fn mark_notified(&self, alert_id: &str, at: DateTime<Utc>) -> bool {
        let mut table = self.table.write().await;
        let Some(alert) = table.find_mut(alert_id) else {
            return false;
        };
        if alert.notification_sent {
            alert.escalation_level += 1;
        }
        alert.notification_sent = true;
        alert.notification_count += 1;
        alert.last_notification_at = Some(at);
        true
    }

    /// Marks an alert acknowledged; it stays firing but receives no further reminders.
    pub async fn acknowledge(
        &self,
        alert_id: &str,
        by: &str,
        now: DateTime<Utc>,
    ) -> Option<ActiveAlert> {
        let alert = {
            let mut table = self.table.write().await;
            let alert = table.find_mut(alert_id)?;
            alert.acknowledged_at = Some(now);
            alert.acknowledged_by = Some(by.to_string());
            alert.clone()
        };
        tracing::info!(alert_id, acknowledged_by = by, "Alert acknowledged");
        self.persist_update(&alert, now).await;
        Some(alert)
    }

    /// Withholds notifications for this alert until `until`.
    pub async fn silence(
        &self,
        alert_id: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<ActiveAlert> {
        let alert = {
            let mut table = self.table.write().await;
            let alert = table.find_mut(alert_id)?;
            alert.silenced_until = Some(until);
            alert.clone()
        };
        tracing::info!(alert_id, until = %until, "Alert silenced");
        self.persist_update(&alert, now).await;
        Some(alert)
    }
}

/// A critical verdict on a fatal rule keeps the rule's severity.
fn alert_severity(rule: &AlertRule, level: Severity) -> Severity {
    if level == Severity::Critical && rule.severity > Severity::Critical {
        rule.severity
    } else {
        level
    }
}

fn severity_score(rule: &AlertRule, severity: Severity) -> i32 {
    if severity == rule.severity {
        rule.severity_score
    } else {
        severity.default_score()
    }
}
