use crate::bridge::Bridge;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use trainalert_alert::evaluator::{EvaluationError, RuleEvaluator};
use trainalert_alert::state::{AlertStateManager, Transition};
use trainalert_common::types::{AlertRule, NotifyAction};
use trainalert_storage::RuleStore;

/// In-memory rule table, replaced wholesale on reload.
#[derive(Default)]
pub struct RuleTable {
    rules: RwLock<BTreeMap<i64, AlertRule>>,
    last_evaluation_at: RwLock<Option<DateTime<Utc>>>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replace(&self, rules: Vec<AlertRule>) {
        let table: BTreeMap<i64, AlertRule> = rules.into_iter().map(|r| (r.id, r)).collect();
        *self.rules.write().await = table;
    }

    pub async fn get(&self, rule_id: i64) -> Option<AlertRule> {
        self.rules.read().await.get(&rule_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<AlertRule> {
        self.rules.read().await.values().cloned().collect()
    }

    /// Enabled rules whose own cadence allows an evaluation at `now`.
    pub async fn due(&self, now: DateTime<Utc>) -> Vec<AlertRule> {
        self.rules
            .read()
            .await
            .values()
            .filter(|r| r.enabled && r.is_due(now))
            .cloned()
            .collect()
    }

    pub async fn mark_evaluated(&self, rule_id: i64, at: DateTime<Utc>) {
        if let Some(rule) = self.rules.write().await.get_mut(&rule_id) {
            rule.last_evaluation_at = Some(at);
        }
        let mut last = self.last_evaluation_at.write().await;
        if last.map_or(true, |prev| prev < at) {
            *last = Some(at);
        }
    }

    /// Time of the most recent rule evaluation.
    pub async fn last_evaluation_at(&self) -> Option<DateTime<Utc>> {
        *self.last_evaluation_at.read().await
    }
}

/// Periodic evaluation loop. Due rules of one tick form a batch that is
/// evaluated with bounded parallelism and awaited fully before the next tick.
#[derive(Clone)]
pub struct EvaluationScheduler {
    rules: Arc<RuleTable>,
    rule_store: Arc<dyn RuleStore>,
    evaluator: Arc<RuleEvaluator>,
    state: Arc<AlertStateManager>,
    bridge: Arc<Bridge>,
    tick_secs: u64,
    max_concurrent: usize,
}

impl EvaluationScheduler {
    pub fn new(
        rules: Arc<RuleTable>,
        rule_store: Arc<dyn RuleStore>,
        evaluator: Arc<RuleEvaluator>,
        state: Arc<AlertStateManager>,
        bridge: Arc<Bridge>,
        tick_secs: u64,
        max_concurrent: usize,
    ) -> Self {
        Self {
            rules,
            rule_store,
            evaluator,
            state,
            bridge,
            tick_secs: tick_secs.max(1),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            tick_secs = self.tick_secs,
            max_concurrent = self.max_concurrent,
            "Evaluation scheduler started"
        );

        let mut tick = interval(Duration::from_secs(self.tick_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.run_batch(Utc::now()).await;
                }
            }
        }
        tracing::info!("Evaluation scheduler stopped");
    }

    /// Evaluates every rule due at `now`; returns how many were evaluated.
    pub async fn run_batch(&self, now: DateTime<Utc>) -> usize {
        let due = self.rules.due(now).await;
        if due.is_empty() {
            return 0;
        }
        tracing::debug!(count = due.len(), "Evaluating due rules");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(due.len());

        for rule in due {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(error = %e, "Evaluation semaphore closed");
                    break;
                }
            };
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                this.evaluate_rule(&rule, now).await;
                drop(permit);
            }));
        }

        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Rule evaluation task panicked");
            }
        }
        count
    }

    async fn evaluate_rule(&self, rule: &AlertRule, now: DateTime<Utc>) {
        match self.evaluator.evaluate(rule, now).await {
            Ok(result) => match self.state.apply(rule, &result).await {
                Some(Transition::Created(alert)) => {
                    self.bridge
                        .offer(&alert, rule, NotifyAction::Firing, now)
                        .await;
                }
                Some(Transition::Resolved(alert)) => {
                    self.bridge
                        .offer(&alert, rule, NotifyAction::Resolved, now)
                        .await;
                }
                Some(Transition::Updated(_)) | None => {}
            },
            Err(EvaluationError::AnomalyDisabled) => {
                tracing::debug!(rule_id = rule.id, "Anomaly detection disabled, rule skipped");
            }
            Err(e) => {
                tracing::warn!(rule_id = rule.id, rule = %rule.name, error = %e, "Rule skipped this cycle");
            }
        }

        self.rules.mark_evaluated(rule.id, now).await;
        if let Err(e) = self.rule_store.update_last_evaluation(rule.id, now).await {
            tracing::error!(rule_id = rule.id, error = %e, "Failed to update last_evaluation_at");
        }
    }
}
