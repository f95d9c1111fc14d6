use crate::dedup::DedupCache;
use crate::error::NotifyError;
use crate::plugin::{ChannelRegistry, RegisteredChannel};
use crate::queue::NotificationQueue;
use crate::ratelimit::{RateLimitScope, RateLimiter};
use crate::template::{TemplateContext, TemplateStore};
use crate::RenderedMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trainalert_common::types::{AlertNotification, FailedNotification};
use trainalert_storage::FailedNotificationStore;

/// Error recorded for notifications abandoned because the pipeline stopped.
pub const SHUTDOWN_ERROR: &str = "shutdown before delivery";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed,
    #[default]
    Exponential,
}

/// Delivery pipeline settings (`[notification]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_concurrent_senders")]
    pub max_concurrent_senders: usize,
    /// Retries after the first attempt.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default)]
    pub retry_backoff: BackoffPolicy,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default)]
    pub rate_limit_scope: RateLimitScope,
    /// Per-attempt send timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_failed_retention_days")]
    pub failed_retention_days: u32,
    #[serde(default = "default_enable_deduplication")]
    pub enable_deduplication: bool,
    #[serde(default = "default_deduplication_window_secs")]
    pub deduplication_window_secs: u64,
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_concurrent_senders() -> usize {
    5
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    5
}

fn default_rate_limit_per_minute() -> u32 {
    60
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_failed_retention_days() -> u32 {
    7
}

fn default_enable_deduplication() -> bool {
    true
}

fn default_deduplication_window_secs() -> u64 {
    300
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_concurrent_senders: default_max_concurrent_senders(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            retry_backoff: BackoffPolicy::default(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_scope: RateLimitScope::default(),
            timeout_secs: default_timeout_secs(),
            failed_retention_days: default_failed_retention_days(),
            enable_deduplication: default_enable_deduplication(),
            deduplication_window_secs: default_deduplication_window_secs(),
        }
    }
}

impl DispatcherConfig {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let base = self.retry_backoff_secs;
        let secs = match self.retry_backoff {
            BackoffPolicy::Fixed => base,
            BackoffPolicy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(retry.saturating_sub(1).min(16)))
            }
        };
        Duration::from_secs(secs)
    }
}

/// Called once per notification that reached at least one channel.
#[async_trait]
pub trait DeliveryHook: Send + Sync {
    async fn on_delivered(&self, notification: &AlertNotification, at: DateTime<Utc>);
}

/// Counters exposed on the status surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
    pub deduplicated: u64,
}

/// What happened to one notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub deduplicated: bool,
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
    /// Disabled channels.
    pub skipped: Vec<String>,
}

struct SendFailure {
    error: String,
    attempts: u32,
}

/// Pool of sender workers draining the [`NotificationQueue`].
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: Arc<NotificationQueue>,
    registry: Arc<ChannelRegistry>,
    templates: Arc<dyn TemplateStore>,
    failed_store: Arc<dyn FailedNotificationStore>,
    hook: Option<Arc<dyn DeliveryHook>>,
    limiter: RateLimiter,
    dedup: Option<DedupCache>,
    delivered: AtomicU64,
    failed: AtomicU64,
    deduplicated: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        queue: Arc<NotificationQueue>,
        registry: Arc<ChannelRegistry>,
        templates: Arc<dyn TemplateStore>,
        failed_store: Arc<dyn FailedNotificationStore>,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_per_minute, config.rate_limit_scope);
        let dedup = config
            .enable_deduplication
            .then(|| DedupCache::new(config.deduplication_window_secs));
        Self {
            config,
            queue,
            registry,
            templates,
            failed_store,
            hook: None,
            limiter,
            dedup,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn DeliveryHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            enqueued: self.queue.enqueued_count(),
            dropped: self.queue.dropped_count(),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
        }
    }

    /// Runs the sender pool until `cancel` fires, then closes the queue and
    /// records everything still buffered as failed.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let workers = self.config.max_concurrent_senders.max(1);
        tracing::info!(
            workers,
            queue_capacity = self.queue.capacity(),
            rate_limit_per_minute = self.config.rate_limit_per_minute,
            "Notification dispatcher started"
        );

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let this = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                while let Some(notification) = this.queue.recv(&cancel).await {
                    this.dispatch(&notification, &cancel).await;
                }
                tracing::debug!(worker_id, "Sender worker stopped");
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Sender worker panicked");
            }
        }

        let leftover = self.queue.close().await;
        if !leftover.is_empty() {
            tracing::warn!(count = leftover.len(), "Recording queued notifications as failed on shutdown");
        }
        for notification in &leftover {
            for channel in &notification.rule.notification_channels {
                self.record_failure(notification, channel, SHUTDOWN_ERROR, 0, "")
                    .await;
            }
        }
        tracing::info!("Notification dispatcher stopped");
    }

    /// Delivers one notification to every channel of its rule.
    pub async fn dispatch(
        &self,
        notification: &AlertNotification,
        cancel: &CancellationToken,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let now = Utc::now();

        if let Some(dedup) = &self.dedup {
            // Windowed on creation time, the same clock the throttle reserves on.
            let key = DedupCache::key(&notification.alert.id, notification.action);
            if dedup.check_and_record(&key, notification.created_at) {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    alert_id = %notification.alert.id,
                    action = %notification.action,
                    "Duplicate notification collapsed"
                );
                report.deduplicated = true;
                return report;
            }
        }

        let context = TemplateContext::from_notification(notification, now);
        for name in &notification.rule.notification_channels {
            let Some(channel) = self.registry.get(name) else {
                let err = NotifyError::UnknownChannel(name.clone());
                tracing::warn!(alert_id = %notification.alert.id, error = %err, "Skipping channel");
                self.record_failure(notification, name, &err.to_string(), 0, "")
                    .await;
                report.failed.push(name.clone());
                continue;
            };
            if !channel.enabled {
                tracing::debug!(channel = %name, "Channel disabled, skipping");
                report.skipped.push(name.clone());
                continue;
            }

            if !self.limiter.acquire(name, cancel).await {
                self.record_failure(notification, name, SHUTDOWN_ERROR, 0, "")
                    .await;
                report.failed.push(name.clone());
                continue;
            }

            let message =
                match self
                    .templates
                    .render(&channel.channel_type, notification.action, &context)
                {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(channel = %name, error = %e, "Template rendering failed");
                        self.record_failure(notification, name, &e.to_string(), 0, "")
                            .await;
                        report.failed.push(name.clone());
                        continue;
                    }
                };

            let recipients = channel.recipients_for(notification.alert.severity);
            match self
                .send_with_retry(&channel, &message, recipients, cancel)
                .await
            {
                Ok(attempts) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        alert_id = %notification.alert.id,
                        channel = %name,
                        action = %notification.action,
                        attempts,
                        "Notification delivered"
                    );
                    report.delivered.push(name.clone());
                }
                Err(failure) => {
                    tracing::error!(
                        alert_id = %notification.alert.id,
                        channel = %name,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Notification permanently failed"
                    );
                    self.record_failure(
                        notification,
                        name,
                        &failure.error,
                        failure.attempts,
                        &message.body,
                    )
                    .await;
                    report.failed.push(name.clone());
                }
            }
        }

        if !report.delivered.is_empty() {
            if let Some(hook) = &self.hook {
                hook.on_delivered(notification, Utc::now()).await;
            }
        }
        report
    }

    /// Sends with a per-attempt timeout, retrying with backoff. Later attempts
    /// only target recipients that failed before.
    async fn send_with_retry(
        &self,
        channel: &RegisteredChannel,
        message: &RenderedMessage,
        mut pending: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<u32, SendFailure> {
        let max_attempts = self.config.retry_max_attempts.saturating_add(1);
        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SendFailure { error: SHUTDOWN_ERROR.to_string(), attempts: attempt - 1 });
                }
                r = tokio::time::timeout(timeout, channel.channel.send(message, &pending)) => r,
            };

            match result {
                Ok(Ok(resp)) if resp.is_success() => return Ok(attempt),
                Ok(Ok(resp)) => {
                    last_error = resp
                        .first_error()
                        .unwrap_or_else(|| "delivery failed".to_string());
                    if !pending.is_empty() {
                        pending = resp
                            .failed_recipients()
                            .into_iter()
                            .map(|r| r.recipient.clone())
                            .collect();
                    }
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = NotifyError::Timeout(self.config.timeout_secs).to_string(),
            }

            if attempt < max_attempts {
                let delay = self.config.backoff_delay(attempt);
                tracing::warn!(
                    attempt,
                    channel = %channel.name,
                    error = %last_error,
                    delay_secs = delay.as_secs(),
                    "Notification send failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(SendFailure { error: SHUTDOWN_ERROR.to_string(), attempts: attempt });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(SendFailure {
            error: last_error,
            attempts: max_attempts,
        })
    }

    async fn record_failure(
        &self,
        notification: &AlertNotification,
        channel: &str,
        error: &str,
        attempts: u32,
        payload: &str,
    ) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let failed = FailedNotification {
            id: trainalert_common::id::next_id(),
            notification_id: notification.id.clone(),
            alert_id: notification.alert.id.clone(),
            rule_id: notification.rule.id,
            channel: channel.to_string(),
            action: notification.action,
            error: error.to_string(),
            attempts,
            payload: payload.to_string(),
            failed_at: Utc::now(),
        };
        if let Err(e) = self.failed_store.insert_failed(&failed).await {
            tracing::error!(
                alert_id = %notification.alert.id,
                channel,
                error = %e,
                "Failed to record failed notification"
            );
        }
    }
}
