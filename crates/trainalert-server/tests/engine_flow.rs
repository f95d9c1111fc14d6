mod common;

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use common::{build_test_context, cpu_rule, deliver_queued, fast_config, push, RecordingChannel};
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;
use trainalert_common::types::{AlertStatus, NotifyAction};
use trainalert_notify::dispatcher::DispatcherConfig;
use trainalert_server::config::ServerConfig;

#[tokio::test]
async fn cpu_usage_alert_fires_and_resolves() -> Result<()> {
    let ctx = build_test_context(fast_config(), vec![cpu_rule(1, 5)], RecordingChannel::new()).await?;
    let now = Utc::now();

    push(&ctx.store, now - Duration::seconds(5), 95.0)?;
    assert_eq!(ctx.service.evaluate_now(now).await, 1);

    let alerts = ctx.service.active_alerts().await;
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.status, AlertStatus::Firing);
    assert_eq!(alert.occurrence_count, 1);
    assert_eq!(alert.trigger_value, 95.0);
    assert_eq!(alert.threshold_value, 90.0);
    let alert_id = alert.id.clone();

    let reports = deliver_queued(&ctx.service).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].delivered, vec!["ops".to_string()]);

    // critical alerts also reach the critical recipients
    let sent = ctx.channel.sent();
    assert_eq!(sent[0].0, "firing");
    assert_eq!(sent[0].2, vec!["team".to_string(), "oncall".to_string()]);

    let notified = ctx
        .service
        .active_alerts()
        .await
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("alert should still be firing"))?;
    assert!(notified.notification_sent);
    assert_eq!(notified.notification_count, 1);

    push(&ctx.store, now + Duration::seconds(50), 80.0)?;
    assert_eq!(ctx.service.evaluate_now(now + Duration::seconds(60)).await, 1);
    assert!(ctx.service.active_alerts().await.is_empty());

    let record = ctx
        .store
        .alert_record(&alert_id)
        .ok_or_else(|| anyhow!("alert record should be persisted"))?;
    assert_eq!(record.status, AlertStatus::Resolved);
    assert_eq!(ctx.store.rule(1).map(|r| r.trigger_count), Some(1));

    deliver_queued(&ctx.service).await;
    assert_eq!(ctx.channel.actions(), vec!["firing", "resolved"]);

    let status = ctx.service.status().await;
    assert_eq!(status.delivered, 2);
    assert_eq!(status.failed, 0);
    assert_eq!(status.active_alert_count, 0);
    Ok(())
}

#[tokio::test]
async fn throttle_allows_one_notification_per_window() -> Result<()> {
    let mut config = fast_config();
    config.notification.enable_deduplication = false;
    let ctx = build_test_context(config, vec![cpu_rule(1, 5)], RecordingChannel::new()).await?;
    let now = Utc::now();

    push(&ctx.store, now - Duration::seconds(5), 95.0)?;
    ctx.service.evaluate_now(now).await;

    push(&ctx.store, now + Duration::seconds(55), 96.0)?;
    ctx.service.evaluate_now(now + Duration::seconds(60)).await;
    assert_eq!(ctx.service.bridge_now(now + Duration::seconds(60)).await, 0);

    let alerts = ctx.service.active_alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].occurrence_count, 2);

    deliver_queued(&ctx.service).await;
    assert_eq!(ctx.channel.calls(), 1);

    // once the window has passed the bridge sends a reminder
    assert_eq!(ctx.service.bridge_now(now + Duration::minutes(6)).await, 1);
    deliver_queued(&ctx.service).await;
    assert_eq!(ctx.channel.calls(), 2);

    let alert = &ctx.service.active_alerts().await[0];
    assert_eq!(alert.notification_count, 2);
    assert_eq!(alert.escalation_level, 1);
    Ok(())
}

#[tokio::test]
async fn resolution_bypasses_throttle() -> Result<()> {
    let ctx = build_test_context(fast_config(), vec![cpu_rule(1, 30)], RecordingChannel::new()).await?;
    let now = Utc::now();

    push(&ctx.store, now - Duration::seconds(5), 95.0)?;
    ctx.service.evaluate_now(now).await;
    deliver_queued(&ctx.service).await;

    push(&ctx.store, now + Duration::seconds(70), 40.0)?;
    ctx.service.evaluate_now(now + Duration::seconds(120)).await;

    let reports = deliver_queued(&ctx.service).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(ctx.channel.actions(), vec!["firing", "resolved"]);
    Ok(())
}

#[tokio::test]
async fn new_episode_after_resolution_gets_new_identity() -> Result<()> {
    let ctx = build_test_context(fast_config(), vec![cpu_rule(1, 5)], RecordingChannel::new()).await?;
    let now = Utc::now();

    push(&ctx.store, now - Duration::seconds(5), 95.0)?;
    ctx.service.evaluate_now(now).await;
    let first = ctx.service.active_alerts().await[0].id.clone();

    push(&ctx.store, now + Duration::seconds(55), 70.0)?;
    ctx.service.evaluate_now(now + Duration::seconds(60)).await;
    push(&ctx.store, now + Duration::seconds(115), 97.0)?;
    ctx.service.evaluate_now(now + Duration::seconds(120)).await;

    let alerts = ctx.service.active_alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_ne!(alerts[0].id, first);
    assert_eq!(alerts[0].occurrence_count, 1);
    assert_eq!(ctx.store.rule(1).map(|r| r.trigger_count), Some(2));
    Ok(())
}

#[tokio::test]
async fn full_queue_drops_without_blocking_evaluation() -> Result<()> {
    let config = ServerConfig {
        notification: DispatcherConfig {
            max_queue_size: 2,
            ..fast_config().notification
        },
        ..fast_config()
    };
    let rules = (1..=5).map(|id| cpu_rule(id, 5)).collect();
    let ctx = build_test_context(config, rules, RecordingChannel::new()).await?;
    let now = Utc::now();

    push(&ctx.store, now - Duration::seconds(5), 95.0)?;
    assert_eq!(ctx.service.evaluate_now(now).await, 5);
    assert_eq!(ctx.service.active_alerts().await.len(), 5);

    let status = ctx.service.status().await;
    assert_eq!(status.queue_depth, 2);
    assert_eq!(status.enqueued, 2);
    assert_eq!(status.dropped, 3);

    assert_eq!(deliver_queued(&ctx.service).await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_land_in_failed_trail() -> Result<()> {
    let mut config = fast_config();
    config.notification.retry_max_attempts = 1;
    let ctx = build_test_context(config, vec![cpu_rule(1, 5)], RecordingChannel::failing()).await?;
    let now = Utc::now();

    push(&ctx.store, now - Duration::seconds(5), 95.0)?;
    ctx.service.evaluate_now(now).await;

    let reports = deliver_queued(&ctx.service).await;
    assert_eq!(reports[0].failed, vec!["ops".to_string()]);
    assert_eq!(ctx.channel.calls(), 2);

    let trail = ctx.store.failed_notifications();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].channel, "ops");
    assert_eq!(trail[0].action, NotifyAction::Firing);
    assert_eq!(trail[0].attempts, 2);
    assert!(trail[0].error.contains("gateway unavailable"));

    let status = ctx.service.status().await;
    assert_eq!(status.failed, 1);
    assert_eq!(status.failed_total, Some(1));

    // a failed delivery leaves the alert un-notified
    assert!(!ctx.service.active_alerts().await[0].notification_sent);
    Ok(())
}

#[tokio::test]
async fn background_loops_deliver_and_stop_on_cancel() -> Result<()> {
    let ctx = build_test_context(fast_config(), vec![cpu_rule(1, 5)], RecordingChannel::new()).await?;
    push(&ctx.store, Utc::now() - Duration::seconds(5), 95.0)?;

    let cancel = CancellationToken::new();
    let handles = ctx.service.start(cancel.clone()).await?;

    tokio::time::timeout(StdDuration::from_secs(5), async {
        loop {
            let sent = ctx
                .service
                .active_alerts()
                .await
                .first()
                .is_some_and(|a| a.notification_sent);
            if sent {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("alert was not delivered in time"))?;
    assert_eq!(ctx.channel.actions(), vec!["firing"]);

    cancel.cancel();
    for handle in handles {
        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .map_err(|_| anyhow!("background loop did not stop"))??;
    }

    let status = ctx.service.status().await;
    assert!(status.last_evaluation_at.is_some());
    assert_eq!(status.delivered, 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_accounts_for_every_accepted_notification() -> Result<()> {
    let rules = (1..=3).map(|id| cpu_rule(id, 5)).collect();
    let ctx = build_test_context(fast_config(), rules, RecordingChannel::failing()).await?;
    push(&ctx.store, Utc::now() - Duration::seconds(5), 95.0)?;

    let cancel = CancellationToken::new();
    let handles = ctx.service.start(cancel.clone()).await?;
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    cancel.cancel();
    for handle in handles {
        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .map_err(|_| anyhow!("background loop did not stop"))??;
    }

    // every accepted notification ends up either collapsed or in the failed trail
    let status = ctx.service.status().await;
    assert_eq!(status.queue_depth, 0);
    assert_eq!(status.delivered, 0);
    let trail = ctx.store.failed_notifications().len() as u64;
    assert_eq!(trail + status.deduplicated, status.enqueued);

    // the queue is closed once the dispatcher has stopped
    let alert = ctx
        .service
        .active_alerts()
        .await
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("alerts should have fired before shutdown"))?;
    let before = ctx.service.status().await.dropped;
    ctx.service.acknowledge_alert(&alert.id, "oncall").await;
    let status = ctx.service.status().await;
    assert_eq!(status.queue_depth, 0);
    assert_eq!(status.dropped, before + 1);
    Ok(())
}
