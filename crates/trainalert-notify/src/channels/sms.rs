use crate::plugin::ChannelPlugin;
use crate::utils::{is_valid_phone, truncate_chars, truncate_string, MAX_BODY_LENGTH};
use crate::{NotificationChannel, RecipientResult, RenderedMessage, SendResponse};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Longest SMS body sent to the gateway, in characters.
pub const MAX_SMS_LENGTH: usize = 500;

pub struct SmsChannel {
    instance_id: String,
    client: reqwest::Client,
    gateway_url: String,
    api_key: String,
    phone_numbers: Vec<String>,
}

impl SmsChannel {
    pub fn new(instance_id: &str, gateway_url: &str, api_key: &str, phone_numbers: Vec<String>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            client: reqwest::Client::new(),
            gateway_url: gateway_url.to_string(),
            api_key: api_key.to_string(),
            phone_numbers,
        }
    }

    async fn send_one(&self, phone: &str, text: &str) -> std::result::Result<u16, String> {
        let payload = serde_json::json!({
            "to": phone,
            "message": text,
        });
        let resp = self
            .client
            .post(&self.gateway_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            let body = super::read_body(resp).await;
            Err(format!("HTTP {status}: {body}"))
        }
    }
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    /// `recipients` are phone numbers; with none, the configured
    /// `phone_numbers` are used. Invalid numbers fail individually.
    async fn send(&self, message: &RenderedMessage, recipients: &[String]) -> Result<SendResponse> {
        let text = truncate_chars(&message.body, MAX_SMS_LENGTH);
        let mut response = SendResponse {
            request_body: Some(truncate_string(text, MAX_BODY_LENGTH)),
            ..Default::default()
        };

        let phones: &[String] = if recipients.is_empty() {
            &self.phone_numbers
        } else {
            recipients
        };
        if phones.is_empty() {
            anyhow::bail!("sms channel '{}' has no phone numbers", self.instance_id);
        }

        for phone in phones {
            if !is_valid_phone(phone) {
                tracing::warn!(phone = %phone, "Skipping invalid phone number");
                response
                    .recipient_results
                    .push(RecipientResult::failed(phone.clone(), "invalid phone number"));
                continue;
            }
            match self.send_one(phone, text).await {
                Ok(status) => {
                    response.http_status = Some(status);
                    response.recipient_results.push(RecipientResult::success(phone.clone()));
                }
                Err(e) => {
                    tracing::warn!(phone = %phone, error = %e, "SMS send failed");
                    response.recipient_results.push(RecipientResult::failed(phone.clone(), e));
                }
            }
        }

        Ok(response)
    }

    fn channel_type(&self) -> &str {
        "sms"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

// Plugin

#[derive(Deserialize)]
struct SmsConfig {
    gateway_url: String,
    api_key: String,
    #[serde(default)]
    phone_numbers: Vec<String>,
}

pub struct SmsPlugin;

impl ChannelPlugin for SmsPlugin {
    fn name(&self) -> &str {
        "sms"
    }

    fn recipient_type(&self) -> &str {
        "phone"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: SmsConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid sms config: {e}"))?;
        if let Some(bad) = cfg.phone_numbers.iter().find(|p| !is_valid_phone(p)) {
            anyhow::bail!("Invalid sms config: bad phone number '{bad}'");
        }
        Ok(())
    }

    fn create_channel(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>> {
        let cfg: SmsConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid sms config: {e}"))?;
        Ok(Box::new(SmsChannel::new(
            instance_id,
            &cfg.gateway_url,
            &cfg.api_key,
            cfg.phone_numbers,
        )))
    }
}
