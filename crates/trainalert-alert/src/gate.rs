use chrono::{DateTime, Duration, Utc};
use trainalert_common::types::{ActiveAlert, AlertRule, NotifyAction};

/// Outcome of a gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    /// Notified less than the rule's throttle window ago.
    Throttled { remaining_secs: i64 },
    /// A higher-severity alert on the same resource, or an alert of a rule
    /// this one depends on, already covers it.
    Suppressed { by_alert: String },
    Silenced,
    /// Acknowledged alerts get no reminders.
    Acknowledged,
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

/// Decides whether an alert may notify now.
pub struct NotificationGate {
    enable_suppression: bool,
}

impl NotificationGate {
    pub fn new(enable_suppression: bool) -> Self {
        Self { enable_suppression }
    }

    /// `firing` is the current firing set, usually one snapshot shared by a
    /// whole bridge pass.
    pub fn check(
        &self,
        alert: &ActiveAlert,
        rule: &AlertRule,
        action: NotifyAction,
        firing: &[ActiveAlert],
        now: DateTime<Utc>,
    ) -> GateDecision {
        match action {
            NotifyAction::Resolved | NotifyAction::Acknowledged => return GateDecision::Allow,
            NotifyAction::Firing => {}
        }

        if alert.is_silenced(now) {
            return GateDecision::Silenced;
        }
        if alert.acknowledged_at.is_some() {
            return GateDecision::Acknowledged;
        }

        if rule.notification_throttle_minutes > 0 {
            if let Some(last) = alert.last_notification_at {
                let window = Duration::minutes(rule.notification_throttle_minutes as i64);
                let elapsed = now - last;
                if elapsed < window {
                    return GateDecision::Throttled {
                        remaining_secs: (window - elapsed).num_seconds(),
                    };
                }
            }
        }

        if self.enable_suppression {
            if let Some(by) = firing.iter().find(|other| subsumes(other, alert, rule)) {
                return GateDecision::Suppressed {
                    by_alert: by.id.clone(),
                };
            }
        }

        GateDecision::Allow
    }
}

fn subsumes(other: &ActiveAlert, alert: &ActiveAlert, rule: &AlertRule) -> bool {
    if other.id == alert.id {
        return false;
    }
    if rule.depends_on.contains(&other.rule_id) {
        return true;
    }
    !alert.resource.is_empty()
        && other.resource.resource_type == alert.resource.resource_type
        && other.resource.resource_id == alert.resource.resource_id
        && other.severity_score > alert.severity_score
}
