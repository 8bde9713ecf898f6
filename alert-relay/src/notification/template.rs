//! Message templates and `{{key}}` rendering.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::database::models::MessageTemplateDbModel;
use crate::database::repositories::TemplateRepository;
use crate::domain::Notification;
use crate::{Error, Result};

/// Name of the template used for emergency fan-out.
pub const EMERGENCY_TEMPLATE: &str = "emergency-alert";

/// Format used for `triggeredAt` in rendered messages.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub type TemplateVars = BTreeMap<String, String>;

/// Replace every `{{key}}` whose key is present in `vars`.
///
/// Substitution is a single left-to-right pass, so values are never re-expanded.
/// Unknown placeholders are left as written.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let key = after_open[..end].trim();
                match vars.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after_open[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Variables describing one alert for one recipient.
pub fn alert_variables(
    notification: &Notification,
    contact_name: &str,
    user_name: &str,
) -> TemplateVars {
    let position = notification.position;
    let coordinates = format!("{:.6}, {:.6}", position.latitude(), position.longitude());
    let location = notification
        .location
        .clone()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| coordinates.clone());

    [
        ("contactName", contact_name.to_string()),
        ("userName", user_name.to_string()),
        ("emergencyType", notification.kind.to_string()),
        (
            "reason",
            notification
                .reason
                .clone()
                .unwrap_or_else(|| "Not specified".to_string()),
        ),
        ("latitude", format!("{:.6}", position.latitude())),
        ("longitude", format!("{:.6}", position.longitude())),
        ("location", location),
        ("mapsLink", position.maps_link()),
        (
            "triggeredAt",
            notification.triggered_at.format(TIMESTAMP_FORMAT).to_string(),
        ),
        ("message", notification.message.clone()),
        ("notificationId", notification.id.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// A resolved template ready for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTemplate {
    pub name: String,
    pub subject: String,
    pub body: String,
    pub sms_body: Option<String>,
}

/// Output of rendering one template.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
    pub sms_body: String,
}

impl MessageTemplate {
    pub fn render(&self, vars: &TemplateVars) -> RenderedMessage {
        RenderedMessage {
            subject: render(&self.subject, vars),
            body: render(&self.body, vars),
            sms_body: render(self.sms_body.as_deref().unwrap_or(&self.body), vars),
        }
    }

    /// Built-in emergency template used when none is stored.
    pub fn emergency_default() -> Self {
        Self {
            name: EMERGENCY_TEMPLATE.to_string(),
            subject: "EMERGENCY ALERT - {{userName}} needs help".to_string(),
            body: "EMERGENCY ALERT\n\n\
                   Hi {{contactName}},\n\n\
                   {{userName}} has triggered an emergency alert and may need immediate help.\n\n\
                   Type: {{emergencyType}}\n\
                   Reason: {{reason}}\n\
                   Message: {{message}}\n\
                   Location: {{location}}\n\
                   Live map: {{mapsLink}}\n\
                   Coordinates: {{latitude}}, {{longitude}}\n\
                   Time: {{triggeredAt}} UTC\n\n\
                   Please respond immediately or call emergency services if needed.\n\n\
                   Reference: {{notificationId}}"
                .to_string(),
            sms_body: Some(
                "EMERGENCY ALERT: {{userName}} needs help. Reason: {{reason}}. \
                 Location: {{location}} {{mapsLink}} Time: {{triggeredAt}} UTC. \
                 Respond immediately or call emergency services."
                    .to_string(),
            ),
        }
    }
}

impl From<MessageTemplateDbModel> for MessageTemplate {
    fn from(row: MessageTemplateDbModel) -> Self {
        Self {
            name: row.name,
            subject: row.subject,
            body: row.body,
            sms_body: row.sms_body,
        }
    }
}

/// Looks templates up in storage with built-in fallbacks.
pub struct TemplateService {
    repo: Arc<dyn TemplateRepository>,
}

impl TemplateService {
    pub fn new(repo: Arc<dyn TemplateRepository>) -> Self {
        Self { repo }
    }

    /// Seed the built-in templates when no active template exists.
    /// Returns whether anything was written.
    pub async fn ensure_defaults(&self) -> Result<bool> {
        if self.repo.count_active().await? > 0 {
            return Ok(false);
        }
        let default = MessageTemplate::emergency_default();
        self.repo
            .upsert(&MessageTemplateDbModel::new(
                default.name,
                default.subject,
                default.body,
                default.sms_body,
            ))
            .await?;
        info!(template = EMERGENCY_TEMPLATE, "Seeded default message templates");
        Ok(true)
    }

    /// Stored active template first, then the built-in one.
    pub async fn resolve(&self, name: &str) -> Result<MessageTemplate> {
        if let Some(row) = self.repo.find_active(name).await? {
            return Ok(row.into());
        }
        if name == EMERGENCY_TEMPLATE {
            return Ok(MessageTemplate::emergency_default());
        }
        Err(Error::not_found("MessageTemplate", name))
    }
}
