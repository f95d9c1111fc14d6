use crate::plugin::ChannelPlugin;
use crate::utils::{hmac_sha256, truncate_string, MAX_BODY_LENGTH};
use crate::{NotificationChannel, RecipientResult, RenderedMessage, SendResponse};
use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DingTalkMsgType {
    #[default]
    Markdown,
    Text,
}

pub struct DingTalkChannel {
    instance_id: String,
    client: reqwest::Client,
    webhook_url: String,
    secret: Option<String>,
    msg_type: DingTalkMsgType,
    at_mobiles: Vec<String>,
    is_at_all: bool,
}

struct UrlOutcome {
    status_code: Option<u16>,
    response_body: Option<String>,
    error_code: Option<String>,
    error: Option<String>,
}

impl DingTalkChannel {
    pub fn new(instance_id: &str, webhook_url: &str, secret: Option<String>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            client: reqwest::Client::new(),
            webhook_url: webhook_url.to_string(),
            secret,
            msg_type: DingTalkMsgType::default(),
            at_mobiles: Vec::new(),
            is_at_all: false,
        }
    }

    pub fn with_message_type(mut self, msg_type: DingTalkMsgType) -> Self {
        self.msg_type = msg_type;
        self
    }

    pub fn with_at(mut self, at_mobiles: Vec<String>, is_at_all: bool) -> Self {
        self.at_mobiles = at_mobiles;
        self.is_at_all = is_at_all;
        self
    }

    /// Appends `timestamp` and `sign` query parameters when a secret is configured.
    pub fn sign_url(&self, base_url: &str) -> String {
        self.sign_url_at(base_url, chrono::Utc::now().timestamp_millis())
    }

    pub fn sign_url_at(&self, base_url: &str, timestamp: i64) -> String {
        let Some(secret) = &self.secret else {
            return base_url.to_string();
        };

        let string_to_sign = format!("{}\n{}", timestamp, secret);
        let mac = hmac_sha256(secret.as_bytes(), string_to_sign.as_bytes());
        let sign = base64::engine::general_purpose::STANDARD.encode(mac);
        let sign_encoded = urlencoding::encode(&sign);

        let sep = if base_url.contains('?') { '&' } else { '?' };
        format!("{base_url}{sep}timestamp={timestamp}&sign={sign_encoded}")
    }

    pub fn build_payload(&self, message: &RenderedMessage) -> Value {
        let mut text = message.body.clone();
        // DingTalk only highlights @-mentions that also appear in the text.
        if !self.at_mobiles.is_empty() {
            let mentions: Vec<String> = self.at_mobiles.iter().map(|m| format!("@{m}")).collect();
            text = format!("{text}\n\n{}", mentions.join(" "));
        }
        let at = serde_json::json!({
            "atMobiles": self.at_mobiles,
            "isAtAll": self.is_at_all,
        });
        match self.msg_type {
            DingTalkMsgType::Markdown => serde_json::json!({
                "msgtype": "markdown",
                "markdown": { "title": message.subject, "text": text },
                "at": at,
            }),
            DingTalkMsgType::Text => serde_json::json!({
                "msgtype": "text",
                "text": { "content": text },
                "at": at,
            }),
        }
    }

    async fn send_to_url(&self, url: &str, payload: &Value) -> UrlOutcome {
        let resp = match self.client.post(url).json(payload).send().await {
            Ok(resp) => resp,
            Err(e) => {
                return UrlOutcome {
                    status_code: None,
                    response_body: None,
                    error_code: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = super::read_body(resp).await;
            return UrlOutcome {
                status_code: Some(status.as_u16()),
                response_body: Some(body),
                error_code: None,
                error: Some(format!("HTTP {status}")),
            };
        }

        match resp.json::<Value>().await {
            Ok(body) => {
                let body_json = serde_json::to_string(&body).unwrap_or_default();
                let errcode = body.get("errcode").and_then(|v| v.as_i64());
                let error = if errcode == Some(0) {
                    None
                } else {
                    let errmsg = body
                        .get("errmsg")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    Some(format!("DingTalk error: {errmsg}"))
                };
                UrlOutcome {
                    status_code: Some(status.as_u16()),
                    response_body: Some(truncate_string(&body_json, MAX_BODY_LENGTH)),
                    error_code: errcode.filter(|c| *c != 0).map(|c| c.to_string()),
                    error,
                }
            }
            Err(e) => UrlOutcome {
                status_code: Some(status.as_u16()),
                response_body: Some(format!("[Failed to parse response: {e}]")),
                error_code: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl NotificationChannel for DingTalkChannel {
    /// `recipients` are extra robot webhook URLs; with none, the configured
    /// `webhook_url` is used.
    async fn send(&self, message: &RenderedMessage, recipients: &[String]) -> Result<SendResponse> {
        let payload = self.build_payload(message);
        let payload_json = serde_json::to_string(&payload)?;
        let mut response = SendResponse {
            request_body: Some(truncate_string(&payload_json, MAX_BODY_LENGTH)),
            ..Default::default()
        };

        let targets: Vec<&String> = if recipients.is_empty() {
            vec![&self.webhook_url]
        } else {
            recipients.iter().collect()
        };

        for webhook in targets {
            let url = self.sign_url(webhook);
            let outcome = self.send_to_url(&url, &payload).await;
            response.http_status = outcome.status_code;
            response.response_body = outcome.response_body;
            if outcome.error_code.is_some() {
                response.api_error_code = outcome.error_code;
            }
            match outcome.error {
                None => response.recipient_results.push(RecipientResult::success(webhook.clone())),
                Some(e) => {
                    tracing::warn!(channel = %self.instance_id, error = %e, "DingTalk send failed");
                    response.recipient_results.push(RecipientResult::failed(webhook.clone(), e));
                }
            }
        }

        Ok(response)
    }

    fn channel_type(&self) -> &str {
        "dingtalk"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

// Plugin

#[derive(Deserialize)]
struct DingTalkConfig {
    webhook_url: String,
    secret: Option<String>,
    #[serde(default)]
    msg_type: DingTalkMsgType,
    #[serde(default)]
    at_mobiles: Vec<String>,
    #[serde(default)]
    is_at_all: bool,
}

pub struct DingTalkPlugin;

impl ChannelPlugin for DingTalkPlugin {
    fn name(&self) -> &str {
        "dingtalk"
    }

    fn recipient_type(&self) -> &str {
        "webhook_url"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: DingTalkConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid dingtalk config: {e}"))?;
        if !cfg.webhook_url.starts_with("http://") && !cfg.webhook_url.starts_with("https://") {
            anyhow::bail!("Invalid dingtalk config: webhook_url must be an http(s) URL");
        }
        Ok(())
    }

    fn create_channel(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>> {
        let cfg: DingTalkConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid dingtalk config: {e}"))?;
        Ok(Box::new(
            DingTalkChannel::new(instance_id, &cfg.webhook_url, cfg.secret)
                .with_message_type(cfg.msg_type)
                .with_at(cfg.at_mobiles, cfg.is_at_all),
        ))
    }

    fn redact_config(&self, config: &Value) -> Value {
        let mut redacted = config.clone();
        if let Some(obj) = redacted.as_object_mut() {
            if obj.contains_key("secret") {
                obj.insert("secret".to_string(), Value::String("***".to_string()));
            }
            // the robot access token travels in the URL query
            if let Some(url) = obj.get("webhook_url").and_then(|v| v.as_str()) {
                let masked = match url.split_once("access_token=") {
                    Some((base, _)) => format!("{base}access_token=***"),
                    None => url.to_string(),
                };
                obj.insert("webhook_url".to_string(), Value::String(masked));
            }
        }
        redacted
    }
}
