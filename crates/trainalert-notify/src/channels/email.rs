use crate::plugin::ChannelPlugin;
use crate::utils::{truncate_string, MAX_BODY_LENGTH};
use crate::{NotificationChannel, RecipientResult, RenderedMessage, SendResponse};
use anyhow::Result;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use serde_json::Value;

pub struct EmailChannel {
    instance_id: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    subject_prefix: String,
}

impl EmailChannel {
    pub fn new(
        instance_id: &str,
        smtp_host: &str,
        smtp_port: u16,
        username: Option<&str>,
        password: Option<&str>,
        from: &str,
    ) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)?.port(smtp_port);

        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }

        Ok(Self {
            instance_id: instance_id.to_string(),
            transport: builder.build(),
            from: from.parse()?,
            subject_prefix: String::new(),
        })
    }

    pub fn with_subject_prefix(mut self, prefix: &str) -> Self {
        self.subject_prefix = prefix.to_string();
        self
    }

    fn build_message(&self, recipient: &str, subject: &str, body: &str) -> Result<Message> {
        Ok(Message::builder()
            .from(self.from.clone())
            .to(recipient.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?)
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    async fn send(&self, message: &RenderedMessage, recipients: &[String]) -> Result<SendResponse> {
        let subject = format!("{}{}", self.subject_prefix, message.subject);

        // 记录 request_body（邮件内容）
        let request_body = serde_json::json!({
            "from": self.from.to_string(),
            "subject": subject,
            "body": message.body,
        });
        let mut response = SendResponse {
            request_body: Some(truncate_string(&request_body.to_string(), MAX_BODY_LENGTH)),
            ..Default::default()
        };

        if recipients.is_empty() {
            anyhow::bail!("email channel '{}' has no recipients", self.instance_id);
        }

        for recipient in recipients {
            let email = match self.build_message(recipient, &subject, &message.body) {
                Ok(email) => email,
                Err(e) => {
                    response
                        .recipient_results
                        .push(RecipientResult::failed(recipient.clone(), format!("invalid message: {e}")));
                    continue;
                }
            };
            match self.transport.send(email).await {
                Ok(_) => response.recipient_results.push(RecipientResult::success(recipient.clone())),
                Err(e) => {
                    tracing::warn!(recipient = %recipient, error = %e, "Email send failed");
                    response
                        .recipient_results
                        .push(RecipientResult::failed(recipient.clone(), e));
                }
            }
        }

        Ok(response)
    }

    fn channel_type(&self) -> &str {
        "email"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

// Plugin

#[derive(Deserialize)]
struct EmailConfig {
    smtp_host: String,
    #[serde(default = "default_smtp_port")]
    smtp_port: u16,
    smtp_username: Option<String>,
    smtp_password: Option<String>,
    from: String,
    #[serde(default = "default_subject_prefix")]
    subject_prefix: String,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_subject_prefix() -> String {
    "[trainalert]".to_string()
}

pub struct EmailPlugin;

impl ChannelPlugin for EmailPlugin {
    fn name(&self) -> &str {
        "email"
    }

    fn recipient_type(&self) -> &str {
        "email"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: EmailConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid email config: {e}"))?;
        cfg.from
            .parse::<Mailbox>()
            .map_err(|e| anyhow::anyhow!("Invalid email config: bad from address: {e}"))?;
        Ok(())
    }

    fn create_channel(
        &self,
        instance_id: &str,
        config: &Value,
    ) -> Result<Box<dyn NotificationChannel>> {
        let cfg: EmailConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid email config: {e}"))?;
        let channel = EmailChannel::new(
            instance_id,
            &cfg.smtp_host,
            cfg.smtp_port,
            cfg.smtp_username.as_deref(),
            cfg.smtp_password.as_deref(),
            &cfg.from,
        )?
        .with_subject_prefix(&cfg.subject_prefix);
        Ok(Box::new(channel))
    }

    fn redact_config(&self, config: &Value) -> Value {
        let mut redacted = config.clone();
        if let Some(obj) = redacted.as_object_mut() {
            if obj.contains_key("smtp_password") {
                obj.insert(
                    "smtp_password".to_string(),
                    Value::String("***".to_string()),
                );
            }
        }
        redacted
    }
}
