use crate::error::NotifyError;
use crate::NotificationChannel;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use trainalert_common::types::Severity;

/// Factory for creating [`NotificationChannel`] instances from JSON
/// configuration.
///
/// Each plugin is registered in the [`ChannelRegistry`] by its `name()`.
/// Channel instances are validated and created through the matching plugin.
pub trait ChannelPlugin: Send + Sync {
    /// Returns the plugin type name (e.g., `"email"`, `"dingtalk"`).
    fn name(&self) -> &str;

    /// Describes the kind of recipient this channel accepts
    /// (e.g., `"email"`, `"phone"`, `"webhook_url"`).
    fn recipient_type(&self) -> &str;

    /// Validates a JSON config blob against this plugin's expected schema.
    fn validate_config(&self, config: &Value) -> Result<()>;

    /// Creates a configured channel instance from a validated JSON config.
    /// `instance_id` is the configured channel name.
    fn create_channel(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>>;

    /// Returns a copy of `config` with secrets redacted (e.g., passwords
    /// replaced with `"***"`).
    fn redact_config(&self, config: &Value) -> Value {
        crate::utils::redact_sensitive_json(config)
    }
}

/// One `[[channels]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub channel_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_config")]
    pub config: Value,
    #[serde(default)]
    pub recipients: Vec<String>,
    /// 严重告警（critical/fatal）时额外通知的接收人
    #[serde(default)]
    pub critical_recipients: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_config() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A named, ready-to-use channel instance.
pub struct RegisteredChannel {
    pub name: String,
    pub channel_type: String,
    pub channel: Arc<dyn NotificationChannel>,
    pub enabled: bool,
    pub recipients: Vec<String>,
    pub critical_recipients: Vec<String>,
    redacted_config: Value,
}

impl RegisteredChannel {
    /// Base recipients, plus the critical list for critical and fatal alerts.
    pub fn recipients_for(&self, severity: Severity) -> Vec<String> {
        let mut all = self.recipients.clone();
        if severity.is_critical() {
            for r in &self.critical_recipients {
                if !all.contains(r) {
                    all.push(r.clone());
                }
            }
        }
        all
    }
}

/// Redacted view of a registered channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub name: String,
    pub channel_type: String,
    pub enabled: bool,
    pub recipient_count: usize,
    pub critical_recipient_count: usize,
    pub config: Value,
}

/// Registry of available [`ChannelPlugin`]s plus the channel instances
/// created from them, keyed by channel name.
///
/// Plugins are fixed once the registry is built; instances can be added or
/// replaced at any time through a shared reference, and the dispatcher sees
/// them on its next lookup.
///
/// # Examples
///
/// ```
/// use trainalert_notify::plugin::ChannelRegistry;
///
/// let registry = ChannelRegistry::default();
/// assert!(registry.has_plugin("email"));
/// assert!(registry.has_plugin("webhook"));
/// assert!(registry.has_plugin("dingtalk"));
/// assert!(!registry.has_plugin("nonexistent"));
/// ```
pub struct ChannelRegistry {
    plugins: HashMap<String, Box<dyn ChannelPlugin>>,
    channels: RwLock<HashMap<String, Arc<RegisteredChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, plugin: Box<dyn ChannelPlugin>) {
        let name = plugin.name().to_string();
        self.plugins.insert(name, plugin);
    }

    pub fn create_channel(
        &self,
        type_name: &str,
        instance_id: &str,
        config: &Value,
    ) -> Result<Box<dyn NotificationChannel>> {
        let plugin = self
            .plugins
            .get(type_name)
            .ok_or_else(|| anyhow::anyhow!("Unknown channel plugin type: {type_name}"))?;
        plugin.validate_config(config)?;
        plugin.create_channel(instance_id, config)
    }

    /// Creates the channel described by `cfg` and registers it under
    /// `cfg.name`, replacing any previous instance of that name.
    pub fn register_channel(&self, cfg: &ChannelConfig) -> std::result::Result<(), NotifyError> {
        let plugin = self
            .plugins
            .get(&cfg.channel_type)
            .ok_or_else(|| NotifyError::UnknownChannelType(cfg.channel_type.clone()))?;
        plugin
            .validate_config(&cfg.config)
            .map_err(|e| NotifyError::InvalidConfig(format!("{}: {e}", cfg.name)))?;
        let channel = plugin
            .create_channel(&cfg.name, &cfg.config)
            .map_err(|e| NotifyError::InvalidConfig(format!("{}: {e}", cfg.name)))?;

        self.insert(RegisteredChannel {
            name: cfg.name.clone(),
            channel_type: cfg.channel_type.clone(),
            channel: Arc::from(channel),
            enabled: cfg.enabled,
            recipients: cfg.recipients.clone(),
            critical_recipients: cfg.critical_recipients.clone(),
            redacted_config: plugin.redact_config(&cfg.config),
        });
        tracing::info!(
            channel = %cfg.name,
            channel_type = %cfg.channel_type,
            enabled = cfg.enabled,
            "Notification channel registered"
        );
        Ok(())
    }

    /// Registers an already-built channel, bypassing the plugins.
    pub fn register_instance(
        &self,
        name: &str,
        channel: Arc<dyn NotificationChannel>,
        recipients: Vec<String>,
        critical_recipients: Vec<String>,
    ) {
        let channel_type = channel.channel_type().to_string();
        self.insert(RegisteredChannel {
            name: name.to_string(),
            channel_type,
            channel,
            enabled: true,
            recipients,
            critical_recipients,
            redacted_config: Value::Null,
        });
    }

    fn insert(&self, registered: RegisteredChannel) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels.insert(registered.name.clone(), Arc::new(registered));
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredChannel>> {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.get(name).cloned()
    }

    pub fn channel_count(&self) -> usize {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.len()
    }

    /// Registered channels sorted by name, with secrets redacted.
    pub fn list_channels(&self) -> Vec<ChannelSummary> {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<ChannelSummary> = channels
            .values()
            .map(|c| ChannelSummary {
                name: c.name.clone(),
                channel_type: c.channel_type.clone(),
                enabled: c.enabled,
                recipient_count: c.recipients.len(),
                critical_recipient_count: c.critical_recipients.len(),
                config: c.redacted_config.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn get_plugin(&self, type_name: &str) -> Option<&dyn ChannelPlugin> {
        self.plugins.get(type_name).map(|p| p.as_ref())
    }

    pub fn has_plugin(&self, type_name: &str) -> bool {
        self.plugins.contains_key(type_name)
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(crate::channels::email::EmailPlugin));
        registry.register(Box::new(crate::channels::webhook::WebhookPlugin));
        registry.register(Box::new(crate::channels::sms::SmsPlugin));
        registry.register(Box::new(crate::channels::dingtalk::DingTalkPlugin));
        registry
    }
}
