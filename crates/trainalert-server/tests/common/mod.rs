#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use trainalert_common::types::MetricPoint;
use trainalert_notify::dispatcher::{BackoffPolicy, DeliveryReport, DispatcherConfig};
use trainalert_notify::{NotificationChannel, RecipientResult, RenderedMessage, SendResponse};
use trainalert_server::config::{SeedAlertRule, ServerConfig};
use trainalert_server::service::{AlertService, Stores};
use trainalert_storage::memory::MemoryStore;

/// One recorded send: (action, subject, recipients).
pub type SentMessage = (String, String, Vec<String>);

/// Channel double that records what it is asked to send.
pub struct RecordingChannel {
    sent: Mutex<Vec<SentMessage>>,
    calls: AtomicU32,
    always_fail: bool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            always_fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.sent().into_iter().map(|(action, _, _)| action).collect()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn send(&self, message: &RenderedMessage, recipients: &[String]) -> Result<SendResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail {
            anyhow::bail!("gateway unavailable");
        }
        self.sent.lock().unwrap().push((
            message.context.action.clone(),
            message.subject.clone(),
            recipients.to_vec(),
        ));
        Ok(SendResponse {
            recipient_results: recipients
                .iter()
                .map(|r| RecipientResult::success(r.clone()))
                .collect(),
            ..Default::default()
        })
    }

    fn channel_type(&self) -> &str {
        "webhook"
    }

    fn instance_id(&self) -> &str {
        "recording"
    }
}

/// Default configuration with no rate limit and instant retries.
pub fn fast_config() -> ServerConfig {
    ServerConfig {
        notification: DispatcherConfig {
            rate_limit_per_minute: 0,
            retry_backoff: BackoffPolicy::Fixed,
            retry_backoff_secs: 0,
            timeout_secs: 5,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn cpu_rule(id: i64, throttle_minutes: i64) -> SeedAlertRule {
    serde_json::from_value(json!({
        "id": id,
        "name": "cpu_usage",
        "rule_type": "threshold",
        "metric_name": "cpu_usage",
        "critical_threshold": 90.0,
        "operator": "gt",
        "evaluation_interval_secs": 60,
        "notification_channels": ["ops"],
        "notification_throttle_minutes": throttle_minutes
    }))
    .expect("valid seed rule")
}

pub fn push(store: &MemoryStore, at: DateTime<Utc>, value: f64) -> Result<()> {
    store.push_points("cpu_usage", &[MetricPoint { timestamp: at, value }])?;
    Ok(())
}

pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub service: AlertService,
    pub channel: Arc<RecordingChannel>,
}

/// Memory-backed service with the given rules loaded and a recording
/// channel registered as `ops` (recipient `team`, critical recipient `oncall`).
pub async fn build_test_context(
    config: ServerConfig,
    rules: Vec<SeedAlertRule>,
    channel: RecordingChannel,
) -> Result<TestContext> {
    let store = Arc::new(MemoryStore::new());
    for rule in rules {
        store.upsert_rule(rule.into_record()?)?;
    }
    let service = AlertService::new(&config, Stores::shared(store.clone()));
    service.reload_rules().await?;

    let channel = Arc::new(channel);
    service.registry().register_instance(
        "ops",
        channel.clone(),
        vec!["team".to_string()],
        vec!["oncall".to_string()],
    );

    Ok(TestContext {
        store,
        service,
        channel,
    })
}

/// Dispatches everything currently queued, inline.
pub async fn deliver_queued(service: &AlertService) -> Vec<DeliveryReport> {
    let cancel = CancellationToken::new();
    let mut reports = Vec::new();
    for notification in service.queue().drain().await {
        reports.push(service.dispatcher().dispatch(&notification, &cancel).await);
    }
    reports
}
