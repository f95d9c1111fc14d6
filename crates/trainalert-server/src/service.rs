use crate::bridge::Bridge;
use crate::config::{EngineConfig, ServerConfig};
use crate::retention::RetentionCleaner;
use crate::scheduler::{EvaluationScheduler, RuleTable};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trainalert_alert::evaluator::RuleEvaluator;
use trainalert_alert::gate::NotificationGate;
use trainalert_alert::state::AlertStateManager;
use trainalert_common::types::{ActiveAlert, AlertNotification, NotifyAction};
use trainalert_notify::dispatcher::{DeliveryHook, Dispatcher};
use trainalert_notify::error::NotifyError;
use trainalert_notify::plugin::{ChannelConfig, ChannelRegistry, ChannelSummary};
use trainalert_notify::queue::NotificationQueue;
use trainalert_notify::template::{TemplateSet, TemplateStore};
use trainalert_storage::{AlertRecordStore, FailedNotificationStore, MetricStore, RuleStore};

/// The external collaborators the engine reads from and writes to.
#[derive(Clone)]
pub struct Stores {
    pub metrics: Arc<dyn MetricStore>,
    pub rules: Arc<dyn RuleStore>,
    pub alerts: Arc<dyn AlertRecordStore>,
    pub failed: Arc<dyn FailedNotificationStore>,
}

impl Stores {
    /// All four roles served by one store.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: MetricStore + RuleStore + AlertRecordStore + FailedNotificationStore + 'static,
    {
        Self {
            metrics: store.clone(),
            rules: store.clone(),
            alerts: store.clone(),
            failed: store,
        }
    }
}

/// Snapshot backing a health/status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub rule_count: usize,
    pub active_alert_count: usize,
    pub last_evaluation_at: Option<DateTime<Utc>>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
    pub deduplicated: u64,
    /// Rows in the failed-notification trail; `None` if the store could not be read.
    pub failed_total: Option<u64>,
    pub channel_count: usize,
    pub template_count: usize,
}

/// Stamps delivery bookkeeping on the source alert.
struct MarkNotified {
    state: Arc<AlertStateManager>,
}

#[async_trait]
impl DeliveryHook for MarkNotified {
    async fn on_delivered(&self, notification: &AlertNotification, at: DateTime<Utc>) {
        if notification.action != NotifyAction::Firing {
            return;
        }
        if !self.state.mark_notified(&notification.alert.id, at).await {
            tracing::debug!(alert_id = %notification.alert.id, "Delivered alert is no longer active");
        }
    }
}

/// Facade over the evaluation and delivery engine.
pub struct AlertService {
    engine: EngineConfig,
    stores: Stores,
    rules: Arc<RuleTable>,
    state: Arc<AlertStateManager>,
    bridge: Arc<Bridge>,
    scheduler: EvaluationScheduler,
    queue: Arc<NotificationQueue>,
    registry: Arc<ChannelRegistry>,
    templates: Arc<dyn TemplateStore>,
    dispatcher: Arc<Dispatcher>,
}

impl AlertService {
    /// Wires the engine. Channels with a bad configuration are logged and
    /// left unregistered.
    pub fn new(config: &ServerConfig, stores: Stores) -> Self {
        let engine = config.engine.clone();

        let rules = Arc::new(RuleTable::new());
        let state = Arc::new(AlertStateManager::new(
            stores.alerts.clone(),
            stores.rules.clone(),
            engine.enable_grouping,
        ));
        let evaluator = Arc::new(RuleEvaluator::new(
            stores.metrics.clone(),
            std::time::Duration::from_secs(engine.metric_fetch_timeout_secs.max(1)),
            engine.anomaly_detection_enabled,
        ));
        let queue = Arc::new(NotificationQueue::new(config.notification.max_queue_size));
        let bridge = Arc::new(Bridge::new(
            state.clone(),
            NotificationGate::new(engine.enable_suppression),
            queue.clone(),
            rules.clone(),
        ));
        let scheduler = EvaluationScheduler::new(
            rules.clone(),
            stores.rules.clone(),
            evaluator,
            state.clone(),
            bridge.clone(),
            engine.evaluation_interval_secs,
            engine.max_concurrent_rules,
        );

        let registry = Arc::new(ChannelRegistry::default());
        for channel in &config.channels {
            if let Err(e) = registry.register_channel(channel) {
                tracing::error!(channel = %channel.name, error = %e, "Failed to register notification channel");
            }
        }

        let templates: Arc<dyn TemplateStore> =
            Arc::new(TemplateSet::with_overrides(&config.templates));
        let dispatcher = Arc::new(
            Dispatcher::new(
                config.notification.clone(),
                queue.clone(),
                registry.clone(),
                templates.clone(),
                stores.failed.clone(),
            )
            .with_hook(Arc::new(MarkNotified {
                state: state.clone(),
            })),
        );

        Self {
            engine,
            stores,
            rules,
            state,
            bridge,
            scheduler,
            queue,
            registry,
            templates,
            dispatcher,
        }
    }

    /// Loads the rules and spawns every background loop against `cancel`.
    /// The returned handles finish once `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let loaded = self.reload_rules().await?;

        let producers = vec![
            tokio::spawn(
                self.bridge
                    .clone()
                    .run(self.engine.bridge_interval_secs, cancel.clone()),
            ),
            tokio::spawn(self.scheduler.clone().run(cancel.clone())),
        ];

        // The dispatcher stops only after both producers have returned, so
        // nothing is enqueued behind its shutdown drain.
        let dispatch_cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(self.dispatcher.clone().run(dispatch_cancel.clone()));

        let mut handles = Vec::with_capacity(2);
        handles.push(tokio::spawn(async move {
            for producer in producers {
                if let Err(e) = producer.await {
                    tracing::error!(error = %e, "Alert producer task panicked");
                }
            }
            dispatch_cancel.cancel();
            if let Err(e) = dispatcher.await {
                tracing::error!(error = %e, "Notification dispatcher panicked");
            }
        }));

        let cleaner = RetentionCleaner::new(
            self.stores.alerts.clone(),
            self.stores.failed.clone(),
            self.engine.alert_retention_days,
            self.dispatcher.config().failed_retention_days,
        );
        handles.push(tokio::spawn(
            cleaner.run(self.engine.cleanup_interval_secs, cancel),
        ));

        tracing::info!(
            rules = loaded,
            channels = self.registry.channel_count(),
            "Alert service started"
        );
        Ok(handles)
    }

    /// Re-reads the rule store. Rules that fail to convert are skipped.
    pub async fn reload_rules(&self) -> anyhow::Result<usize> {
        let records = self
            .stores
            .rules
            .load_active_rules()
            .await
            .context("Failed to load alert rules")?;

        let mut rules = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        for record in records {
            let name = record.name.clone();
            match record.into_rule(self.engine.default_throttle_minutes) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(rule = %name, error = %e, "Skipping invalid alert rule");
                }
            }
        }

        let count = rules.len();
        self.rules.replace(rules).await;
        tracing::info!(count, skipped, "Alert rules loaded");
        Ok(count)
    }

    /// Runs one evaluation batch at `now` outside the timer.
    pub async fn evaluate_now(&self, now: DateTime<Utc>) -> usize {
        self.scheduler.run_batch(now).await
    }

    /// Runs one bridge pass at `now` outside the timer.
    pub async fn bridge_now(&self, now: DateTime<Utc>) -> usize {
        self.bridge.run_pass(now).await
    }

    pub async fn active_alerts(&self) -> Vec<ActiveAlert> {
        self.state.active_alerts().await
    }

    pub async fn status(&self) -> EngineStatus {
        let stats = self.dispatcher.stats();
        let failed_total = match self.stores.failed.count_failed().await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to count failed notifications");
                None
            }
        };
        EngineStatus {
            rule_count: self.rules.len().await,
            active_alert_count: self.state.active_count().await,
            last_evaluation_at: self.rules.last_evaluation_at().await,
            queue_depth: stats.queue_depth,
            queue_capacity: stats.queue_capacity,
            enqueued: stats.enqueued,
            dropped: stats.dropped,
            delivered: stats.delivered,
            failed: stats.failed,
            deduplicated: stats.deduplicated,
            failed_total,
            channel_count: self.registry.channel_count(),
            template_count: self.templates.template_count(),
        }
    }

    /// Acknowledges a firing alert and emits an `acknowledged` notification.
    /// Returns `None` if no firing alert has that id.
    pub async fn acknowledge_alert(&self, alert_id: &str, by: &str) -> Option<ActiveAlert> {
        let now = Utc::now();
        let alert = self.state.acknowledge(alert_id, by, now).await?;
        match self.rules.get(alert.rule_id).await {
            Some(rule) => {
                self.bridge
                    .offer(&alert, &rule, NotifyAction::Acknowledged, now)
                    .await;
            }
            None => {
                tracing::warn!(alert_id, rule_id = alert.rule_id, "Rule not loaded, acknowledgement not notified");
            }
        }
        Some(alert)
    }

    /// Silences a firing alert for `duration`, or for its rule's silence
    /// duration when `None`.
    pub async fn silence_alert(
        &self,
        alert_id: &str,
        duration: Option<chrono::Duration>,
    ) -> Option<ActiveAlert> {
        let now = Utc::now();
        let alert = self.state.get(alert_id).await?;
        let duration = match duration {
            Some(d) => d,
            None => {
                let secs = self
                    .rules
                    .get(alert.rule_id)
                    .await
                    .map(|r| r.silence_duration_secs)
                    .unwrap_or(0);
                chrono::Duration::seconds(secs as i64)
            }
        };
        self.state.silence(alert_id, now + duration, now).await
    }

    /// Registers (or replaces) a channel while the dispatcher is running.
    pub fn register_channel(&self, config: &ChannelConfig) -> Result<(), NotifyError> {
        self.registry.register_channel(config)
    }

    pub fn list_channels(&self) -> Vec<ChannelSummary> {
        self.registry.list_channels()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
