use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use trainalert_storage::{AlertRecordStore, FailedNotificationStore};

/// Rows removed by one cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub alert_records: u64,
    pub failed_notifications: u64,
}

/// Purges alert history and the failed-notification trail past retention.
pub struct RetentionCleaner {
    alerts: Arc<dyn AlertRecordStore>,
    failed: Arc<dyn FailedNotificationStore>,
    alert_retention_days: u32,
    failed_retention_days: u32,
}

impl RetentionCleaner {
    pub fn new(
        alerts: Arc<dyn AlertRecordStore>,
        failed: Arc<dyn FailedNotificationStore>,
        alert_retention_days: u32,
        failed_retention_days: u32,
    ) -> Self {
        Self {
            alerts,
            failed,
            alert_retention_days,
            failed_retention_days,
        }
    }

    /// A failed delete is logged and leaves that count at zero; the other
    /// cleanup still runs.
    pub async fn run_once(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();

        let cutoff = now - chrono::Duration::days(self.alert_retention_days as i64);
        match self.alerts.delete_older_than(cutoff).await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, "Cleaned up expired alert records");
                }
                report.alert_records = removed;
            }
            Err(e) => tracing::error!(error = %e, "Alert record cleanup failed"),
        }

        let cutoff = now - chrono::Duration::days(self.failed_retention_days as i64);
        match self.failed.delete_failed_older_than(cutoff).await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, "Cleaned up expired failed notifications");
                }
                report.failed_notifications = removed;
            }
            Err(e) => tracing::error!(error = %e, "Failed notification cleanup failed"),
        }

        report
    }

    pub async fn run(self, interval_secs: u64, cancel: CancellationToken) {
        let interval_secs = interval_secs.max(1);
        tracing::info!(
            interval_secs,
            alert_retention_days = self.alert_retention_days,
            failed_retention_days = self.failed_retention_days,
            "Retention cleaner started"
        );

        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.run_once(Utc::now()).await;
                }
            }
        }
        tracing::info!("Retention cleaner stopped");
    }
}
