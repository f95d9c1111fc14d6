use crate::plugin::ChannelPlugin;
use crate::utils::{hmac_sha256, truncate_string, MAX_BODY_LENGTH};
use crate::{NotificationChannel, RecipientResult, RenderedMessage, SendResponse};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Settings of a generic HTTP webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Default target when the channel has no recipients.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    /// 签名密钥；设置后对请求体做 HMAC-SHA256 签名
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default = "default_signature_prefix")]
    pub signature_prefix: String,
    #[serde(default)]
    pub body_template: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_signature_header() -> String {
    "X-Webhook-Signature".to_string()
}

fn default_signature_prefix() -> String {
    "sha256=".to_string()
}

pub struct WebhookChannel {
    instance_id: String,
    client: reqwest::Client,
    method: reqwest::Method,
    config: WebhookConfig,
}

impl WebhookChannel {
    pub fn new(instance_id: &str, config: WebhookConfig) -> Result<Self> {
        let method = reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| anyhow::anyhow!("Invalid webhook method: {}", config.method))?;
        Ok(Self {
            instance_id: instance_id.to_string(),
            client: reqwest::Client::new(),
            method,
            config,
        })
    }

    pub fn render_body(&self, message: &RenderedMessage) -> String {
        match &self.config.body_template {
            Some(template) => message
                .context
                .render(template)
                .replace("{{subject}}", &message.subject)
                .replace("{{body}}", &message.body),
            None => serde_json::json!({
                "subject": message.subject,
                "body": message.body,
                "alert": message.context,
            })
            .to_string(),
        }
    }

    /// Header value carrying the body signature, if a secret is configured.
    pub fn signature(&self, body: &str) -> Option<String> {
        self.config.secret.as_ref().map(|secret| {
            let mac = hmac_sha256(secret.as_bytes(), body.as_bytes());
            format!("{}{}", self.config.signature_prefix, hex::encode(mac))
        })
    }

    async fn send_one(&self, url: &str, body: &str) -> (Option<u16>, Option<String>, Option<String>) {
        let mut req = self
            .client
            .request(self.method.clone(), url)
            .header("Content-Type", "application/json")
            .body(body.to_string());
        for (k, v) in &self.config.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(sig) = self.signature(body) {
            req = req.header(self.config.signature_header.as_str(), sig);
        }
        if let Some(auth) = &self.config.basic_auth {
            req = req.basic_auth(&auth.username, Some(&auth.password));
        } else if let Some(token) = &self.config.bearer_token {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                let resp_body = super::read_body(resp).await;
                let error = (!status.is_success()).then(|| format!("HTTP {status}: {resp_body}"));
                (Some(status.as_u16()), Some(resp_body), error)
            }
            Err(e) => (None, None, Some(e.to_string())),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    /// `recipients` are target URLs; with none, the configured `url` is used.
    async fn send(&self, message: &RenderedMessage, recipients: &[String]) -> Result<SendResponse> {
        let body = self.render_body(message);
        let mut response = SendResponse {
            request_body: Some(truncate_string(&body, MAX_BODY_LENGTH)),
            ..Default::default()
        };

        let targets: Vec<&String> = if recipients.is_empty() {
            self.config.url.iter().collect()
        } else {
            recipients.iter().collect()
        };
        if targets.is_empty() {
            anyhow::bail!("webhook channel '{}' has no target URL", self.instance_id);
        }

        for url in targets {
            let (status, resp_body, error) = self.send_one(url, &body).await;
            response.http_status = status;
            response.response_body = resp_body;
            match error {
                None => response.recipient_results.push(RecipientResult::success(url.clone())),
                Some(e) => {
                    tracing::warn!(url = %url, error = %e, "Webhook send failed");
                    response.recipient_results.push(RecipientResult::failed(url.clone(), e));
                }
            }
        }

        Ok(response)
    }

    fn channel_type(&self) -> &str {
        "webhook"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

// Plugin

pub struct WebhookPlugin;

impl ChannelPlugin for WebhookPlugin {
    fn name(&self) -> &str {
        "webhook"
    }

    fn recipient_type(&self) -> &str {
        "webhook_url"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: WebhookConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid webhook config: {e}"))?;
        reqwest::Method::from_bytes(cfg.method.to_uppercase().as_bytes())
            .map_err(|_| anyhow::anyhow!("Invalid webhook config: unknown method {}", cfg.method))?;
        Ok(())
    }

    fn create_channel(
        &self,
        instance_id: &str,
        config: &Value,
    ) -> Result<Box<dyn NotificationChannel>> {
        let cfg: WebhookConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid webhook config: {e}"))?;
        Ok(Box::new(WebhookChannel::new(instance_id, cfg)?))
    }
}
