use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use trainalert_common::types::AlertNotification;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Queue full (or closed); the notification was dropped.
    Dropped,
}

/// Bounded buffer between the bridge and the sender pool.
///
/// `offer` never blocks: when the buffer is full the notification is dropped,
/// counted and logged. Any number of workers may `recv` concurrently.
pub struct NotificationQueue {
    tx: mpsc::Sender<AlertNotification>,
    rx: Mutex<mpsc::Receiver<AlertNotification>>,
    capacity: usize,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn offer(&self, notification: AlertNotification) -> EnqueueOutcome {
        match self.tx.try_send(notification) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Enqueued
            }
            Err(TrySendError::Full(n)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    alert_id = %n.alert.id,
                    action = %n.action,
                    capacity = self.capacity,
                    dropped_total = dropped,
                    "Notification queue is full, dropping notification"
                );
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Closed(n)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    alert_id = %n.alert.id,
                    action = %n.action,
                    dropped_total = dropped,
                    "Notification queue is closed, dropping notification"
                );
                EnqueueOutcome::Dropped
            }
        }
    }

    /// Waits for the next notification. Returns `None` once `cancel` fires,
    /// even if items are still buffered.
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<AlertNotification> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            n = async { self.rx.lock().await.recv().await } => n,
        }
    }

    /// Takes everything still buffered without waiting.
    pub async fn drain(&self) -> Vec<AlertNotification> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(n) = rx.try_recv() {
            drained.push(n);
        }
        drained
    }

    /// Closes the queue and takes what is still buffered. Later offers are
    /// dropped and counted.
    pub async fn close(&self) -> Vec<AlertNotification> {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut drained = Vec::new();
        while let Ok(n) = rx.try_recv() {
            drained.push(n);
        }
        drained
    }

    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
