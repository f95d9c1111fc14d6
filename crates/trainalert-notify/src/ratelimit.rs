use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const WINDOW: Duration = Duration::from_secs(60);
const GLOBAL_KEY: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Global,
    #[default]
    PerChannel,
}

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed one-minute window limiter, either shared by all channels or kept
/// per channel name. A limit of zero disables limiting.
pub struct RateLimiter {
    per_minute: u32,
    scope: RateLimitScope,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32, scope: RateLimitScope) -> Self {
        Self {
            per_minute,
            scope,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn key<'a>(&self, channel: &'a str) -> &'a str {
        match self.scope {
            RateLimitScope::Global => GLOBAL_KEY,
            RateLimitScope::PerChannel => channel,
        }
    }

    /// Takes a slot without waiting. On refusal returns how long until the
    /// window rolls over.
    pub async fn try_acquire(&self, channel: &str) -> Result<(), Duration> {
        if self.per_minute == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(self.key(channel).to_string())
            .or_insert(Window { started: now, count: 0 });

        if now.duration_since(window.started) >= WINDOW {
            window.started = now;
            window.count = 0;
        }
        if window.count < self.per_minute {
            window.count += 1;
            Ok(())
        } else {
            Err(WINDOW.saturating_sub(now.duration_since(window.started)))
        }
    }

    /// Waits for a slot. Returns `false` if `cancel` fires first.
    pub async fn acquire(&self, channel: &str, cancel: &CancellationToken) -> bool {
        loop {
            let wait = match self.try_acquire(channel).await {
                Ok(()) => return true,
                Err(wait) => wait,
            };
            tracing::debug!(
                channel,
                wait_ms = wait.as_millis() as u64,
                "Rate limit reached, waiting for next window"
            );
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
