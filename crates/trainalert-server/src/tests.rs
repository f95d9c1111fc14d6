use crate::config::{SeedAlertRule, ServerConfig};
use crate::retention::RetentionCleaner;
use crate::scheduler::RuleTable;
use crate::service::{AlertService, Stores};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use trainalert_common::types::{
    AlertStatus, FailedNotification, MetricPoint, NotifyAction, ResourceRef,
};
use trainalert_notify::dispatcher::BackoffPolicy;
use trainalert_notify::error::NotifyError;
use trainalert_notify::plugin::ChannelConfig;
use trainalert_notify::ratelimit::RateLimitScope;
use trainalert_storage::memory::MemoryStore;
use trainalert_storage::sqlite::SqliteStore;
use trainalert_storage::{FailedNotificationStore, RuleRecord, RuleStore, StorageError};

fn cpu_rule(id: i64) -> SeedAlertRule {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("cpu-{id}"),
        "rule_type": "threshold",
        "metric_name": "cpu_usage",
        "critical_threshold": 90.0,
        "operator": "gt",
        "evaluation_interval_secs": 60,
        "notification_channels": ["ops"],
        "notification_throttle_minutes": 5
    }))
    .unwrap()
}

fn point(at: DateTime<Utc>, value: f64) -> MetricPoint {
    MetricPoint {
        timestamp: at,
        value,
    }
}

async fn service_with(store: &Arc<MemoryStore>, rules: Vec<SeedAlertRule>) -> AlertService {
    for rule in rules {
        store.upsert_rule(rule.into_record().unwrap()).unwrap();
    }
    let svc = AlertService::new(&ServerConfig::default(), Stores::shared(store.clone()));
    svc.reload_rules().await.unwrap();
    svc
}

fn failed_at(id: &str, at: DateTime<Utc>) -> FailedNotification {
    FailedNotification {
        id: id.to_string(),
        notification_id: format!("n-{id}"),
        alert_id: "alert-1".to_string(),
        rule_id: 1,
        channel: "ops".to_string(),
        action: NotifyAction::Firing,
        error: "HTTP 500".to_string(),
        attempts: 4,
        payload: String::new(),
        failed_at: at,
    }
}

// ---- config ----

#[test]
fn empty_config_uses_defaults() {
    let config: ServerConfig = toml::from_str("").unwrap();
    assert_eq!(config.engine.evaluation_interval_secs, 30);
    assert_eq!(config.engine.max_concurrent_rules, 10);
    assert_eq!(config.engine.alert_retention_days, 30);
    assert_eq!(config.engine.default_throttle_minutes, 5);
    assert!(config.engine.enable_grouping);
    assert!(config.engine.enable_suppression);
    assert_eq!(config.notification.max_queue_size, 1000);
    assert_eq!(config.notification.max_concurrent_senders, 5);
    assert_eq!(config.notification.retry_max_attempts, 3);
    assert_eq!(config.notification.retry_backoff, BackoffPolicy::Exponential);
    assert_eq!(config.notification.rate_limit_scope, RateLimitScope::PerChannel);
    assert_eq!(config.notification.failed_retention_days, 7);
    assert_eq!(config.storage.database_path, "data/trainalert.db");
    assert!(config.channels.is_empty());
}

#[test]
fn config_parses_channels_and_templates() {
    let raw = r#"
[engine]
evaluation_interval_secs = 10
anomaly_detection_enabled = false

[notification]
retry_backoff = "fixed"
rate_limit_scope = "global"
max_queue_size = 50

[[channels]]
name = "ops-hook"
channel_type = "webhook"
recipients = ["https://hooks.example.com/a"]
critical_recipients = ["https://hooks.example.com/oncall"]

[channels.config]
url = "https://hooks.example.com/default"
secret = "s3cret"

[[templates]]
channel_type = "webhook"
action = "resolved"
subject = "OK {{rule_name}}"
body = "{{rule_name}} recovered"
"#;
    let config: ServerConfig = toml::from_str(raw).unwrap();
    assert_eq!(config.engine.evaluation_interval_secs, 10);
    assert_eq!(config.engine.max_concurrent_rules, 10);
    assert!(!config.engine.anomaly_detection_enabled);
    assert_eq!(config.notification.retry_backoff, BackoffPolicy::Fixed);
    assert_eq!(config.notification.rate_limit_scope, RateLimitScope::Global);
    assert_eq!(config.notification.max_queue_size, 50);

    let channel = &config.channels[0];
    assert_eq!(channel.name, "ops-hook");
    assert!(channel.enabled);
    assert_eq!(channel.config["secret"], "s3cret");
    assert_eq!(channel.critical_recipients.len(), 1);

    let template = &config.templates[0];
    assert_eq!(template.action, Some(NotifyAction::Resolved));
}

#[test]
fn load_error_names_the_file() {
    let err = ServerConfig::load("/nonexistent/trainalert.toml").unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/trainalert.toml"));
}

#[test]
fn load_reads_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.toml");
    std::fs::write(
        &path,
        "[engine]\nmax_concurrent_rules = 4\n\n[storage]\ndatabase_path = \"/var/lib/trainalert/alerts.db\"\n",
    )
    .unwrap();

    let config = ServerConfig::load(path.to_str().unwrap()).unwrap();
    assert_eq!(config.engine.max_concurrent_rules, 4);
    assert_eq!(config.storage.database_path, "/var/lib/trainalert/alerts.db");
}

#[test]
fn seed_rule_converts_into_evaluable_rule() {
    let seed: SeedAlertRule = serde_json::from_value(json!({
        "name": "gpu-mem",
        "rule_type": "anomaly",
        "metric_name": "gpu_memory_usage",
        "critical_threshold": 3.0,
        "severity": "critical",
        "notification_channels": ["ops", "sms"],
        "resource": { "resource_type": "job", "resource_id": "resnet-train" },
        "depends_on": [7]
    }))
    .unwrap();

    let record: RuleRecord = seed.into_record().unwrap();
    assert_eq!(record.id, 0);
    assert!(record.is_active());

    let rule = record.into_rule(5).unwrap();
    assert_eq!(rule.notification_channels, vec!["ops", "sms"]);
    assert_eq!(rule.resource.key(), "job/resnet-train");
    assert_eq!(rule.depends_on, vec![7]);
    assert_eq!(rule.notification_throttle_minutes, 5);
    assert_eq!(rule.silence_duration_secs, 600);
    assert_eq!(rule.severity_score, 80);
}

#[test]
fn disabled_seed_rule_is_stored_inactive() {
    let mut seed = cpu_rule(3);
    seed.enabled = false;
    assert_eq!(seed.into_record().unwrap().status, "disabled");
}

// ---- rule table & scheduler ----

#[tokio::test]
async fn rule_table_tracks_last_evaluation() {
    let table = RuleTable::new();
    let now = Utc::now();
    let mut recent = cpu_rule(1).into_record().unwrap().into_rule(5).unwrap();
    recent.last_evaluation_at = Some(now - Duration::seconds(30));
    let fresh = cpu_rule(2).into_record().unwrap().into_rule(5).unwrap();
    table.replace(vec![recent, fresh]).await;

    let due: Vec<i64> = table.due(now).await.iter().map(|r| r.id).collect();
    assert_eq!(due, vec![2]);

    table.mark_evaluated(2, now).await;
    table.mark_evaluated(1, now - Duration::seconds(5)).await;
    assert_eq!(table.last_evaluation_at().await, Some(now));
    assert!(table.due(now).await.is_empty());
    assert_eq!(table.due(now + Duration::seconds(60)).await.len(), 2);
}

#[tokio::test]
async fn evaluation_respects_rule_cadence() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    store
        .push_points("cpu_usage", &[point(now - Duration::seconds(10), 50.0)])
        .unwrap();
    let svc = service_with(&store, vec![cpu_rule(1)]).await;

    assert_eq!(svc.evaluate_now(now).await, 1);
    assert_eq!(svc.evaluate_now(now + Duration::seconds(30)).await, 0);
    assert_eq!(svc.evaluate_now(now + Duration::seconds(60)).await, 1);
    assert_eq!(
        store.rule(1).unwrap().last_evaluation_at,
        Some(now + Duration::seconds(60))
    );
}

#[tokio::test]
async fn skipped_rules_still_record_evaluation_time() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    // no points for cpu_usage at all
    let svc = service_with(&store, vec![cpu_rule(1)]).await;

    assert_eq!(svc.evaluate_now(now).await, 1);
    assert!(svc.active_alerts().await.is_empty());
    assert_eq!(store.rule(1).unwrap().last_evaluation_at, Some(now));
}

// ---- service ----

#[tokio::test]
async fn reload_skips_invalid_rules() {
    let store = Arc::new(MemoryStore::new());
    let mut bad = cpu_rule(2).into_record().unwrap();
    bad.rule_type = "bogus".to_string();
    store.upsert_rule(bad).unwrap();

    let svc = service_with(&store, vec![cpu_rule(1)]).await;
    assert_eq!(svc.reload_rules().await.unwrap(), 1);
    assert_eq!(svc.status().await.rule_count, 1);
}

struct UnreachableRules;

#[async_trait]
impl RuleStore for UnreachableRules {
    async fn load_active_rules(&self) -> trainalert_storage::Result<Vec<RuleRecord>> {
        Err(StorageError::Other("connection refused".to_string()))
    }

    async fn update_last_evaluation(&self, _: i64, _: DateTime<Utc>) -> trainalert_storage::Result<()> {
        Ok(())
    }

    async fn increment_trigger_count(&self, _: i64, _: DateTime<Utc>) -> trainalert_storage::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn start_fails_when_rule_store_unreachable() {
    let memory = Arc::new(MemoryStore::new());
    let stores = Stores {
        metrics: memory.clone(),
        rules: Arc::new(UnreachableRules),
        alerts: memory.clone(),
        failed: memory,
    };
    let svc = AlertService::new(&ServerConfig::default(), stores);

    let err = svc.start(CancellationToken::new()).await.unwrap_err();
    assert!(format!("{err:#}").contains("connection refused"));
}

#[tokio::test]
async fn acknowledge_notifies_and_stops_reminders() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    store
        .push_points("cpu_usage", &[point(now - Duration::seconds(10), 95.0)])
        .unwrap();
    let svc = service_with(&store, vec![cpu_rule(1)]).await;

    svc.evaluate_now(now).await;
    let queued = svc.queue().drain().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].action, NotifyAction::Firing);

    let alert_id = svc.active_alerts().await[0].id.clone();
    let acked = svc.acknowledge_alert(&alert_id, "alice").await.unwrap();
    assert_eq!(acked.acknowledged_by.as_deref(), Some("alice"));
    assert_eq!(acked.status, AlertStatus::Firing);
    assert_eq!(
        store.alert_record(&alert_id).unwrap().status,
        AlertStatus::Acknowledged
    );

    let queued = svc.queue().drain().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].action, NotifyAction::Acknowledged);

    assert_eq!(svc.bridge_now(now + Duration::minutes(10)).await, 0);
    assert!(svc.acknowledge_alert("missing", "alice").await.is_none());
}

#[tokio::test]
async fn silence_defaults_to_rule_duration() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    store
        .push_points("cpu_usage", &[point(now - Duration::seconds(10), 95.0)])
        .unwrap();
    let svc = service_with(&store, vec![cpu_rule(1)]).await;
    svc.evaluate_now(now).await;
    svc.queue().drain().await;

    let alert_id = svc.active_alerts().await[0].id.clone();
    let silenced = svc.silence_alert(&alert_id, None).await.unwrap();
    let secs = (silenced.silenced_until.unwrap() - now).num_seconds();
    assert!((600..610).contains(&secs), "silenced for {secs}s");

    // a reminder would be due after the throttle window, but the alert is silenced
    assert_eq!(svc.bridge_now(now + Duration::minutes(6)).await, 0);

    let silenced = svc
        .silence_alert(&alert_id, Some(Duration::minutes(1)))
        .await
        .unwrap();
    assert!(silenced.silenced_until.unwrap() < now + Duration::minutes(2));
    assert_eq!(svc.bridge_now(now + Duration::minutes(6)).await, 1);
}

#[tokio::test]
async fn status_reports_engine_and_pipeline_counts() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    store
        .push_points("cpu_usage", &[point(now - Duration::seconds(10), 95.0)])
        .unwrap();
    let svc = service_with(&store, vec![cpu_rule(1), cpu_rule(2)]).await;
    svc.evaluate_now(now).await;

    let status = svc.status().await;
    assert_eq!(status.rule_count, 2);
    assert_eq!(status.active_alert_count, 2);
    assert_eq!(status.last_evaluation_at, Some(now));
    assert_eq!(status.queue_depth, 2);
    assert_eq!(status.queue_capacity, 1000);
    assert_eq!(status.enqueued, 2);
    assert_eq!(status.dropped, 0);
    assert_eq!(status.failed_total, Some(0));
    assert_eq!(status.channel_count, 0);
    assert!(status.template_count > 0);
}

#[tokio::test]
async fn channels_register_at_runtime() {
    let store = Arc::new(MemoryStore::new());
    let svc = service_with(&store, vec![]).await;

    let pager: ChannelConfig = serde_json::from_value(json!({
        "name": "pager",
        "channel_type": "pagerduty"
    }))
    .unwrap();
    assert!(matches!(
        svc.register_channel(&pager),
        Err(NotifyError::UnknownChannelType(_))
    ));

    let hook: ChannelConfig = serde_json::from_value(json!({
        "name": "ops",
        "channel_type": "webhook",
        "config": { "url": "https://hooks.example.com/x", "bearer_token": "tok" }
    }))
    .unwrap();
    svc.register_channel(&hook).unwrap();

    let channels = svc.list_channels();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].name, "ops");
    assert_eq!(channels[0].config["bearer_token"], "***");
}

#[tokio::test]
async fn configured_channels_with_bad_config_are_skipped() {
    let store = Arc::new(MemoryStore::new());
    let mut config = ServerConfig::default();
    config.channels = vec![
        serde_json::from_value(json!({
            "name": "sms",
            "channel_type": "sms",
            "config": { "gateway_url": "https://sms.example.com", "api_key": "k", "phone_numbers": ["12ab"] }
        }))
        .unwrap(),
        serde_json::from_value(json!({
            "name": "ops",
            "channel_type": "webhook",
            "config": { "url": "https://hooks.example.com/x" }
        }))
        .unwrap(),
    ];

    let svc = AlertService::new(&config, Stores::shared(store));
    let names: Vec<String> = svc.list_channels().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["ops"]);
}

#[tokio::test]
async fn sqlite_backed_service_persists_alert_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("alerts.db")).unwrap());
    store.insert_rule(&cpu_rule(1).into_record().unwrap()).unwrap();
    let now = Utc::now();
    store
        .write_points("cpu_usage", &[point(now - Duration::seconds(10), 95.0)])
        .unwrap();

    let svc = AlertService::new(&ServerConfig::default(), Stores::shared(store.clone()));
    assert_eq!(svc.reload_rules().await.unwrap(), 1);
    assert_eq!(svc.evaluate_now(now).await, 1);

    let alert_id = svc.active_alerts().await[0].id.clone();
    let record = store.get_alert_record(&alert_id).unwrap().unwrap();
    assert_eq!(record.status, AlertStatus::Firing);
    assert_eq!(record.occurrence_count, 1);

    let rule = store.get_rule(1).unwrap().unwrap();
    assert_eq!(rule.trigger_count, 1);
    assert!(rule.last_evaluation_at.is_some());

    store
        .write_points("cpu_usage", &[point(now + Duration::seconds(50), 20.0)])
        .unwrap();
    svc.evaluate_now(now + Duration::seconds(60)).await;
    let record = store.get_alert_record(&alert_id).unwrap().unwrap();
    assert_eq!(record.status, AlertStatus::Resolved);
}

// ---- retention ----

#[tokio::test]
async fn retention_purges_expired_history() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    let old = now - Duration::days(40);
    store
        .push_points("cpu_usage", &[point(old - Duration::seconds(10), 95.0)])
        .unwrap();
    let svc = service_with(&store, vec![cpu_rule(1)]).await;
    svc.evaluate_now(old).await;
    assert_eq!(store.alert_records().len(), 1);

    store
        .insert_failed(&failed_at("f-old", now - Duration::days(10)))
        .await
        .unwrap();
    store
        .insert_failed(&failed_at("f-new", now - Duration::days(1)))
        .await
        .unwrap();

    let cleaner = RetentionCleaner::new(store.clone(), store.clone(), 30, 7);
    let report = cleaner.run_once(now).await;
    assert_eq!(report.alert_records, 1);
    assert_eq!(report.failed_notifications, 1);
    assert!(store.alert_records().is_empty());
    assert_eq!(store.failed_notifications()[0].id, "f-new");

    let again = cleaner.run_once(now).await;
    assert_eq!(again.alert_records + again.failed_notifications, 0);
}

#[tokio::test]
async fn resource_scoped_rule_builds_summary() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    store
        .push_points("cpu_usage", &[point(now - Duration::seconds(10), 95.0)])
        .unwrap();
    let mut rule = cpu_rule(1);
    rule.resource = ResourceRef {
        resource_type: "job".to_string(),
        resource_id: "j-42".to_string(),
        resource_name: "resnet-train".to_string(),
        instance_id: String::new(),
    };
    let svc = service_with(&store, vec![rule]).await;
    svc.evaluate_now(now).await;

    let alert = &svc.active_alerts().await[0];
    assert_eq!(alert.summary, "[critical] cpu-1 on job:resnet-train");
    assert_eq!(alert.group_id.as_deref(), Some("rule-1"));
}
