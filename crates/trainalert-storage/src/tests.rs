use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use crate::{AlertRecordStore, FailedNotificationStore, MetricStore, RuleRecord, RuleStore, StorageError};
use chrono::{DateTime, Duration, Utc};
use serde_json::Map;
use tempfile::TempDir;
use trainalert_common::types::{
    ActiveAlert, AlertStatus, CompareOp, FailedNotification, MetricPoint, NotifyAction,
    ResourceRef, RuleType, Severity,
};

fn setup() -> (TempDir, SqliteStore) {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("alerts.db")).unwrap();
    (dir, store)
}

fn rule_record(id: i64) -> RuleRecord {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": "GPU 利用率过高",
        "rule_type": "threshold",
        "metric_name": "gpu_utilization",
        "critical_threshold": 90.0,
        "warning_threshold": 75.0,
        "threshold_condition": "gte",
        "alert_level": "critical",
        "notification_channels": "[\"ops-email\", \"ops-dingtalk\"]",
        "filter_resources": "{\"resource_type\":\"node\",\"resource_id\":\"gpu-node-3\"}",
    }))
    .unwrap()
}

fn make_alert(id: &str, last_occurrence: DateTime<Utc>) -> ActiveAlert {
    ActiveAlert {
        id: id.to_string(),
        rule_id: 1,
        rule_name: "cpu_usage".to_string(),
        severity: Severity::Critical,
        severity_score: 80,
        message: "cpu_usage above 90.00".to_string(),
        summary: String::new(),
        resource: ResourceRef::default(),
        trigger_value: 95.0,
        threshold_value: 90.0,
        status: AlertStatus::Firing,
        first_occurrence: last_occurrence,
        last_occurrence,
        occurrence_count: 1,
        context: Map::new(),
        notification_sent: false,
        notification_count: 0,
        last_notification_at: None,
        escalation_level: 0,
        group_id: None,
        correlation_id: id.to_string(),
        acknowledged_at: None,
        acknowledged_by: None,
        silenced_until: None,
        resolved_at: None,
        recovering_since: None,
    }
}

fn make_failed(id: &str, failed_at: DateTime<Utc>) -> FailedNotification {
    FailedNotification {
        id: id.to_string(),
        notification_id: format!("n-{id}"),
        alert_id: "a-1".to_string(),
        rule_id: 1,
        channel: "ops-email".to_string(),
        action: NotifyAction::Firing,
        error: "connection refused".to_string(),
        attempts: 3,
        payload: "body".to_string(),
        failed_at,
    }
}

#[test]
fn rule_record_converts_json_columns() {
    let rule = rule_record(7).into_rule(5).unwrap();
    assert_eq!(rule.rule_type, RuleType::Threshold);
    assert_eq!(rule.operator, CompareOp::GreaterEqual);
    assert_eq!(rule.notification_channels, vec!["ops-email", "ops-dingtalk"]);
    assert_eq!(rule.resource.resource_id, "gpu-node-3");
    assert_eq!(rule.severity_score, Severity::Critical.default_score());
    assert_eq!(rule.notification_throttle_minutes, 5);
    assert!(rule.enabled);
}

#[test]
fn disabled_row_converts_to_disabled_rule() {
    let mut record = rule_record(11);
    record.status = "disabled".to_string();
    let rule = record.into_rule(5).unwrap();
    assert!(!rule.enabled);
    assert_eq!(rule.name, "GPU 利用率过高");
    assert_eq!(rule.metric_name.as_deref(), Some("gpu_utilization"));
}

#[test]
fn rule_record_rejects_malformed_channels() {
    let mut record = rule_record(8);
    record.notification_channels = "not json".to_string();
    match record.into_rule(5) {
        Err(StorageError::InvalidRule { rule_id, reason }) => {
            assert_eq!(rule_id, 8);
            assert!(reason.contains("notification_channels"));
        }
        other => panic!("expected InvalidRule, got {other:?}"),
    }
}

#[test]
fn rule_record_rejects_unknown_type() {
    let mut record = rule_record(9);
    record.rule_type = "forecast".to_string();
    assert!(matches!(
        record.into_rule(0),
        Err(StorageError::InvalidRule { rule_id: 9, .. })
    ));
}

#[test]
fn explicit_zero_throttle_is_kept() {
    let mut record = rule_record(10);
    record.notification_throttle_minutes = Some(0);
    assert_eq!(record.into_rule(5).unwrap().notification_throttle_minutes, 0);
}

#[tokio::test]
async fn sqlite_fetch_series_is_ordered_and_bounded() {
    let (_dir, store) = setup();
    let now = Utc::now();
    let points: Vec<MetricPoint> = [30, 10, 20, 400]
        .iter()
        .map(|secs| MetricPoint {
            timestamp: now - Duration::seconds(*secs),
            value: *secs as f64,
        })
        .collect();
    store.write_points("cpu_usage", &points).unwrap();

    let series = store
        .fetch_series("cpu_usage", now - Duration::seconds(300), now)
        .await
        .unwrap();
    let values: Vec<f64> = series.iter().map(|p| p.value).collect();
    assert_eq!(values, vec![30.0, 20.0, 10.0]);
}

#[tokio::test]
async fn sqlite_resolves_metric_from_expression() {
    let (_dir, store) = setup();
    let now = Utc::now();
    let point = [MetricPoint { timestamp: now, value: 1.0 }];
    store.write_points("memory_usage", &point).unwrap();
    store.write_points("gpu_memory_usage", &point).unwrap();

    let name = store
        .resolve_metric_name("avg(GPU_MEMORY_USAGE) > 80")
        .await
        .unwrap();
    assert_eq!(name.as_deref(), Some("gpu_memory_usage"));
    assert!(store.resolve_metric_name("disk_io > 5").await.unwrap().is_none());
}

#[tokio::test]
async fn sqlite_rule_bookkeeping() {
    let (_dir, store) = setup();
    let id = store.insert_rule(&rule_record(0)).unwrap();
    assert!(id > 0);

    let now = Utc::now();
    store.update_last_evaluation(id, now).await.unwrap();
    store.increment_trigger_count(id, now).await.unwrap();
    store.increment_trigger_count(id, now).await.unwrap();

    let rules = store.load_active_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].trigger_count, 2);
    assert_eq!(
        rules[0].last_evaluation_at.map(|t| t.timestamp_millis()),
        Some(now.timestamp_millis())
    );

    let missing = store.update_last_evaluation(9999, now).await;
    assert!(matches!(missing, Err(StorageError::NotFound { .. })));
}

#[tokio::test]
async fn sqlite_inactive_rules_are_not_loaded() {
    let (_dir, store) = setup();
    let mut record = rule_record(0);
    record.status = "inactive".to_string();
    store.insert_rule(&record).unwrap();
    assert!(store.load_active_rules().await.unwrap().is_empty());
}

#[tokio::test]
async fn sqlite_alert_record_lifecycle() {
    let (_dir, store) = setup();
    let now = Utc::now();
    store.insert_alert_record(&make_alert("a-1", now)).await.unwrap();
    store
        .update_alert_record("a-1", AlertStatus::Resolved, 4, now)
        .await
        .unwrap();

    let record = store.get_alert_record("a-1").unwrap().unwrap();
    assert_eq!(record.status, AlertStatus::Resolved);
    assert_eq!(record.occurrence_count, 4);
}

#[tokio::test]
async fn sqlite_retention_deletes_only_old_rows() {
    let (_dir, store) = setup();
    let now = Utc::now();
    store
        .insert_alert_record(&make_alert("old", now - Duration::days(40)))
        .await
        .unwrap();
    store.insert_alert_record(&make_alert("new", now)).await.unwrap();
    store
        .insert_failed(&make_failed("f-old", now - Duration::days(10)))
        .await
        .unwrap();
    store.insert_failed(&make_failed("f-new", now)).await.unwrap();

    let removed = store.delete_older_than(now - Duration::days(30)).await.unwrap();
    assert_eq!(removed, 1);
    assert!(store.get_alert_record("old").unwrap().is_none());
    assert!(store.get_alert_record("new").unwrap().is_some());

    let removed = store
        .delete_failed_older_than(now - Duration::days(7))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.count_failed().await.unwrap(), 1);
}

#[tokio::test]
async fn memory_store_unknown_metric_is_not_found() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let result = store.fetch_series("nope", now - Duration::minutes(5), now).await;
    assert!(matches!(result, Err(StorageError::NotFound { entity: "metric", .. })));
}

#[tokio::test]
async fn memory_store_tracks_rule_bookkeeping() {
    let store = MemoryStore::new();
    store.upsert_rule(rule_record(3)).unwrap();
    let now = Utc::now();
    store.increment_trigger_count(3, now).await.unwrap();
    let rule = store.rule(3).unwrap();
    assert_eq!(rule.trigger_count, 1);
    assert_eq!(rule.last_trigger_at, Some(now));
}
