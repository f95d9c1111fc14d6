//! Notification delivery pipeline with pluggable channel support.
//!
//! The bridge offers [`AlertNotification`]s to a bounded
//! [`queue::NotificationQueue`]; a [`dispatcher::Dispatcher`] pool drains it,
//! applies deduplication and rate limiting, renders a per-channel template and
//! hands the [`RenderedMessage`] to a [`NotificationChannel`] looked up in the
//! [`plugin::ChannelRegistry`]. Built-in channels are email (SMTP), DingTalk,
//! SMS gateway and generic webhook.
//!
//! [`AlertNotification`]: trainalert_common::types::AlertNotification

pub mod channels;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod plugin;
pub mod queue;
pub mod ratelimit;
pub mod template;
pub mod utils;


use anyhow::Result;
use async_trait::async_trait;
use template::TemplateContext;

/// A template rendered for one channel type, ready to send.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
    /// Values the template was rendered from; channels that build structured
    /// payloads (webhook JSON, DingTalk markdown title) read them directly.
    pub context: TemplateContext,
}

/// Per-recipient delivery outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientResult {
    pub recipient: String,
    /// `"success"` or `"failed"`.
    pub status: String,
    pub error: Option<String>,
}

impl RecipientResult {
    pub fn success(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            status: "success".to_string(),
            error: None,
        }
    }

    pub fn failed(recipient: impl Into<String>, error: impl ToString) -> Self {
        Self {
            recipient: recipient.into(),
            status: "failed".to_string(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// What a channel reports back from one send call.
#[derive(Debug, Clone, Default)]
pub struct SendResponse {
    pub http_status: Option<u16>,
    /// 请求体（截断后）
    pub request_body: Option<String>,
    /// 响应体（截断后）
    pub response_body: Option<String>,
    /// Vendor error code, e.g. DingTalk `errcode`.
    pub api_error_code: Option<String>,
    pub recipient_results: Vec<RecipientResult>,
}

impl SendResponse {
    pub fn failed_recipients(&self) -> Vec<&RecipientResult> {
        self.recipient_results
            .iter()
            .filter(|r| !r.is_success())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.recipient_results.iter().all(RecipientResult::is_success)
    }

    /// First recorded failure, for logs and the failed-notification trail.
    pub fn first_error(&self) -> Option<String> {
        self.recipient_results
            .iter()
            .find(|r| !r.is_success())
            .map(|r| match &r.error {
                Some(e) => format!("{}: {e}", r.recipient),
                None => format!("{}: failed", r.recipient),
            })
    }
}

/// A notification delivery channel that sends a rendered message to an
/// external service (e.g., SMTP, webhook, SMS gateway).
///
/// Implementations are created by the corresponding [`plugin::ChannelPlugin`]
/// and registered by name in the [`plugin::ChannelRegistry`]. A call makes a
/// single attempt per recipient; retries, timeouts and backoff belong to the
/// dispatcher.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Delivers `message` to `recipients`. An empty recipient list means the
    /// channel's configured default destination.
    ///
    /// # Errors
    ///
    /// Returns an error when nothing could be attempted (bad destination,
    /// malformed payload). Per-recipient failures are reported in
    /// [`SendResponse::recipient_results`].
    async fn send(&self, message: &RenderedMessage, recipients: &[String]) -> Result<SendResponse>;

    /// Returns the channel type name (e.g., `"email"`, `"webhook"`).
    fn channel_type(&self) -> &str;

    /// Name of the configured instance this channel was created for.
    fn instance_id(&self) -> &str;
}
