use crate::error::{NotifyError, Result};
use crate::RenderedMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trainalert_common::types::{AlertNotification, NotifyAction};

/// Name of the last-resort template every lookup falls back to.
pub const SYSTEM_TEMPLATE: &str = "system";

/// Values available to templates as `{{name}}` placeholders.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateContext {
    pub alert_id: String,
    pub rule_id: i64,
    pub rule_name: String,
    pub severity: String,
    pub action: String,
    pub message: String,
    pub summary: String,
    pub value: String,
    pub threshold: String,
    pub resource: String,
    pub triggered_at: String,
    pub timestamp: String,
    pub occurrence_count: u64,
    pub escalation_level: u32,
}

impl TemplateContext {
    pub fn from_notification(notification: &AlertNotification, now: DateTime<Utc>) -> Self {
        let alert = &notification.alert;
        Self {
            alert_id: alert.id.clone(),
            rule_id: alert.rule_id,
            rule_name: alert.rule_name.clone(),
            severity: alert.severity.to_string(),
            action: notification.action.to_string(),
            message: alert.message.clone(),
            summary: alert.summary.clone(),
            value: format!("{:.2}", alert.trigger_value),
            threshold: format!("{:.2}", alert.threshold_value),
            resource: alert.resource.display(),
            triggered_at: alert.first_occurrence.format("%Y-%m-%d %H:%M:%S").to_string(),
            timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            occurrence_count: alert.occurrence_count,
            escalation_level: alert.escalation_level,
        }
    }

    /// Substitutes every known placeholder in `text`; unknown ones are left as is.
    pub fn render(&self, text: &str) -> String {
        text.replace("{{alert_id}}", &self.alert_id)
            .replace("{{rule_id}}", &self.rule_id.to_string())
            .replace("{{rule_name}}", &self.rule_name)
            .replace("{{severity}}", &self.severity)
            .replace("{{action}}", &self.action)
            .replace("{{message}}", &self.message)
            .replace("{{summary}}", &self.summary)
            .replace("{{value}}", &self.value)
            .replace("{{threshold}}", &self.threshold)
            .replace("{{resource}}", &self.resource)
            .replace("{{triggered_at}}", &self.triggered_at)
            .replace("{{timestamp}}", &self.timestamp)
            .replace("{{occurrence_count}}", &self.occurrence_count.to_string())
            .replace("{{escalation_level}}", &self.escalation_level.to_string())
    }
}

/// A template as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub channel_type: String,
    /// `None` makes this the channel type's default for every action.
    #[serde(default)]
    pub action: Option<NotifyAction>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct MessageTemplate {
    pub subject: String,
    pub body: String,
}

/// Source of the subject/body pair for a channel type and action.
pub trait TemplateStore: Send + Sync {
    fn render(
        &self,
        channel_type: &str,
        action: NotifyAction,
        context: &TemplateContext,
    ) -> Result<RenderedMessage>;

    fn template_count(&self) -> usize;
}

/// In-memory templates keyed `{channel_type}_{action}` or `{channel_type}`.
///
/// Lookup order: the action-specific template, then the channel type's
/// default, then [`SYSTEM_TEMPLATE`].
///
/// # Examples
///
/// ```
/// use trainalert_notify::template::TemplateSet;
///
/// let set = TemplateSet::builtin();
/// assert!(set.contains("system"));
/// assert!(set.contains("sms"));
/// ```
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: HashMap<String, MessageTemplate>,
}

impl TemplateSet {
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut set = Self::empty();
        set.insert(
            SYSTEM_TEMPLATE,
            "[{{severity}}][{{action}}] {{rule_name}}",
            "Alert: {{rule_name}}\nAction: {{action}}\nSeverity: {{severity}}\nResource: {{resource}}\nValue: {{value}}\nThreshold: {{threshold}}\nOccurrences: {{occurrence_count}}\nTriggered at: {{triggered_at}}\nMessage: {{message}}\nTime: {{timestamp}}",
        );
        set.insert(
            "system_resolved",
            "[RESOLVED] {{rule_name}}",
            "Alert {{rule_name}} on {{resource}} has resolved after {{occurrence_count}} occurrence(s).\nLast value: {{value}} (threshold {{threshold}})\nTriggered at: {{triggered_at}}\nResolved at: {{timestamp}}",
        );
        set.insert(
            "dingtalk",
            "[{{severity}}] {{rule_name}}",
            "### [{{severity}}][{{action}}] {{rule_name}}\n\n- **Resource**: {{resource}}\n- **Value**: {{value}}\n- **Threshold**: {{threshold}}\n- **Occurrences**: {{occurrence_count}}\n- **Triggered at**: {{triggered_at}}\n- **Time**: {{timestamp}}\n\n> {{message}}",
        );
        set.insert(
            "sms",
            "{{rule_name}}",
            "[trainalert][{{severity}}][{{action}}] {{rule_name}}: {{message}}",
        );
        set
    }

    /// Built-in set with configured templates layered on top.
    pub fn with_overrides(configs: &[TemplateConfig]) -> Self {
        let mut set = Self::builtin();
        for cfg in configs {
            let name = match cfg.action {
                Some(action) => format!("{}_{action}", cfg.channel_type),
                None => cfg.channel_type.clone(),
            };
            set.insert(&name, &cfg.subject, &cfg.body);
        }
        set
    }

    pub fn insert(&mut self, name: &str, subject: &str, body: &str) {
        self.templates.insert(
            name.to_string(),
            MessageTemplate {
                subject: subject.to_string(),
                body: body.to_string(),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn select(&self, channel_type: &str, action: NotifyAction) -> Option<(&str, &MessageTemplate)> {
        let specific = format!("{channel_type}_{action}");
        let system_specific = format!("{SYSTEM_TEMPLATE}_{action}");
        let found = [specific.as_str(), channel_type, system_specific.as_str(), SYSTEM_TEMPLATE]
            .into_iter()
            .find_map(|name| self.templates.get_key_value(name))
            .map(|(name, tpl)| (name.as_str(), tpl));
        found
    }
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateStore for TemplateSet {
    fn render(
        &self,
        channel_type: &str,
        action: NotifyAction,
        context: &TemplateContext,
    ) -> Result<RenderedMessage> {
        let (name, template) = self.select(channel_type, action).ok_or_else(|| {
            NotifyError::TemplateError(format!("no template for {channel_type}/{action}"))
        })?;
        let body = context.render(&template.body);
        if body.trim().is_empty() {
            return Err(NotifyError::TemplateError(format!(
                "template '{name}' rendered an empty body"
            )));
        }
        Ok(RenderedMessage {
            subject: context.render(&template.subject),
            body,
            context: context.clone(),
        })
    }

    fn template_count(&self) -> usize {
        self.templates.len()
    }
}
