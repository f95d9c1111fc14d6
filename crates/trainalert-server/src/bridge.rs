use crate::scheduler::RuleTable;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use trainalert_alert::gate::NotificationGate;
use trainalert_alert::state::AlertStateManager;
use trainalert_common::types::{ActiveAlert, AlertNotification, AlertRule, NotifyAction};
use trainalert_notify::queue::{EnqueueOutcome, NotificationQueue};

/// Moves alerts that pass the gate into the notification queue.
///
/// Lifecycle transitions are offered as they happen; the periodic pass
/// re-offers firing alerts so reminders go out once their throttle window
/// has elapsed.
pub struct Bridge {
    state: Arc<AlertStateManager>,
    gate: NotificationGate,
    queue: Arc<NotificationQueue>,
    rules: Arc<RuleTable>,
}

impl Bridge {
    pub fn new(
        state: Arc<AlertStateManager>,
        gate: NotificationGate,
        queue: Arc<NotificationQueue>,
        rules: Arc<RuleTable>,
    ) -> Self {
        Self {
            state,
            gate,
            queue,
            rules,
        }
    }

    /// Offers one alert. Returns whether a notification was enqueued.
    pub async fn offer(
        &self,
        alert: &ActiveAlert,
        rule: &AlertRule,
        action: NotifyAction,
        now: DateTime<Utc>,
    ) -> bool {
        let firing = match action {
            NotifyAction::Firing => self.state.active_alerts().await,
            NotifyAction::Resolved | NotifyAction::Acknowledged => Vec::new(),
        };
        let decision = self.gate.check(alert, rule, action, &firing, now);
        if !decision.is_allowed() {
            tracing::debug!(alert_id = %alert.id, action = %action, decision = ?decision, "Notification gated");
            return false;
        }
        self.enqueue(alert, rule, action, now).await
    }

    /// One pass over the firing set; returns how many reminders were enqueued.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> usize {
        let firing = self.state.active_alerts().await;
        let mut enqueued = 0;
        for alert in &firing {
            let Some(rule) = self.rules.get(alert.rule_id).await else {
                tracing::debug!(alert_id = %alert.id, rule_id = alert.rule_id, "Rule no longer loaded");
                continue;
            };
            let decision = self
                .gate
                .check(alert, &rule, NotifyAction::Firing, &firing, now);
            if !decision.is_allowed() {
                tracing::debug!(alert_id = %alert.id, decision = ?decision, "Notification gated");
                continue;
            }
            if self.enqueue(alert, &rule, NotifyAction::Firing, now).await {
                enqueued += 1;
            }
        }
        enqueued
    }

    async fn enqueue(
        &self,
        alert: &ActiveAlert,
        rule: &AlertRule,
        action: NotifyAction,
        now: DateTime<Utc>,
    ) -> bool {
        if rule.notification_channels.is_empty() {
            tracing::debug!(alert_id = %alert.id, rule_id = rule.id, "Rule has no notification channels");
            return false;
        }

        let notification = AlertNotification {
            id: trainalert_common::id::next_id(),
            alert: alert.clone(),
            rule: rule.clone(),
            action,
            created_at: now,
        };
        match self.queue.offer(notification) {
            EnqueueOutcome::Enqueued => {
                if action == NotifyAction::Firing {
                    self.state.mark_enqueued(&alert.id, now).await;
                }
                true
            }
            EnqueueOutcome::Dropped => false,
        }
    }

    pub async fn run(self: Arc<Self>, interval_secs: u64, cancel: CancellationToken) {
        let interval_secs = interval_secs.max(1);
        tracing::info!(interval_secs, "Alert bridge started");

        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let enqueued = self.run_pass(Utc::now()).await;
                    if enqueued > 0 {
                        tracing::debug!(enqueued, "Bridge pass enqueued reminders");
                    }
                }
            }
        }
        tracing::info!("Alert bridge stopped");
    }
}
