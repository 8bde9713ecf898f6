//! Notification entity: one emergency trigger and its lifecycle.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message_log::Channel;
use super::value_objects::GeoPoint;
use crate::{Error, Result};

/// Fixed notification time-to-live.
pub const NOTIFICATION_TTL_HOURS: i64 = 24;

/// Reason recorded when resolution produced no usable destination.
pub const REASON_NO_CONTACTS: &str = "NO_CONTACTS";

/// Reason recorded when the profile collaborator failed and no fallback applied.
pub const REASON_CONTACT_RESOLUTION_FAILED: &str = "CONTACT_RESOLUTION_FAILED";

/// Reason recorded when every attempted send failed.
pub const REASON_ALL_SENDS_FAILED: &str = "ALL_SENDS_FAILED";

/// How the emergency was raised.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyKind {
    #[default]
    Manual,
    Audio,
    AiDetected,
}

/// Overall lifecycle status of a notification.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Expired,
}

impl NotificationStatus {
    /// Transitions are monotonic, except FAILED may be re-marked DELIVERED
    /// (operator resolve or false-alarm marking).
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Pending, Delivered)
                | (Pending, Expired)
                | (Sent, Delivered)
                | (Sent, Expired)
                | (Failed, Delivered)
                | (Failed, Expired)
        )
    }

    /// EXPIRED notifications are logically inert.
    pub fn is_inert(&self) -> bool {
        matches!(self, Self::Expired)
    }
}

/// Contact's preferred delivery channel.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreferredChannel {
    Email,
    Sms,
    #[default]
    Both,
}

impl PreferredChannel {
    pub fn wants_email(&self) -> bool {
        matches!(self, Self::Email | Self::Both)
    }

    pub fn wants_sms(&self) -> bool {
        matches!(self, Self::Sms | Self::Both)
    }

    /// Parse a free-form preference; absent or unknown values mean "both".
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        raw.map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

/// Per-channel delivery state recorded on a contact plan entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDelivery {
    pub channel: Channel,
    pub status: NotificationStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivery_id: Option<String>,
    pub error_message: Option<String>,
}

/// The planned/attempted delivery to one contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactNotification {
    pub contact_id: Option<String>,
    pub contact_name: String,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub preferred_channel: PreferredChannel,
    #[serde(default)]
    pub deliveries: Vec<ChannelDelivery>,
}

impl ContactNotification {
    /// At least one of email/phone must be present for a contact to be actionable.
    pub fn is_actionable(&self) -> bool {
        non_blank(self.contact_email.as_deref()) || non_blank(self.contact_phone.as_deref())
    }

    /// Email path is attempted only for EMAIL/BOTH with a non-empty address.
    pub fn email_destination(&self) -> Option<&str> {
        self.contact_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty() && self.preferred_channel.wants_email())
    }

    /// SMS path is attempted only for SMS/BOTH with a non-empty number.
    pub fn sms_destination(&self) -> Option<&str> {
        self.contact_phone
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty() && self.preferred_channel.wants_sms())
    }

    /// Aggregate status over attempted channels: SENT if any succeeded.
    pub fn status(&self) -> NotificationStatus {
        if self.deliveries.is_empty() {
            NotificationStatus::Pending
        } else if self
            .deliveries
            .iter()
            .any(|d| d.status == NotificationStatus::Sent)
        {
            NotificationStatus::Sent
        } else {
            NotificationStatus::Failed
        }
    }
}

fn non_blank(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// One emergency trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: EmergencyKind,
    pub message: String,
    pub reason: Option<String>,
    pub position: GeoPoint,
    pub location: Option<String>,
    pub audio_ref: Option<String>,
    pub status: NotificationStatus,
    /// Machine-readable detail for the current status (e.g. `NO_CONTACTS`).
    pub status_reason: Option<String>,
    pub contacts: Vec<ContactNotification>,
    pub contacts_notified: u32,
    pub duplicate: bool,
    pub escalated: bool,
    pub false_alarm: bool,
    pub triggered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Create a PENDING notification; expiry is always trigger time + TTL.
    pub fn new(
        user_id: impl Into<String>,
        kind: EmergencyKind,
        message: impl Into<String>,
        position: GeoPoint,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            kind,
            message: message.into(),
            reason: None,
            position,
            location: None,
            audio_ref: None,
            status: NotificationStatus::Pending,
            status_reason: None,
            contacts: Vec::new(),
            contacts_notified: 0,
            duplicate: false,
            escalated: false,
            false_alarm: false,
            triggered_at,
            expires_at: triggered_at + Duration::hours(NOTIFICATION_TTL_HOURS),
            resolved_at: None,
            updated_at: triggered_at,
        }
    }

    /// Apply a status transition, enforcing monotonicity.
    pub fn transition(&mut self, next: NotificationStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_transition(self.status, next));
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Operator resolution: the emergency has been handled.
    pub fn resolve(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(NotificationStatus::Delivered, at)?;
        self.resolved_at = Some(at);
        Ok(())
    }

    /// Mark as a false alarm. Allowed from any non-expired status, including
    /// an already resolved notification.
    pub fn mark_false_alarm(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status.is_inert() {
            return Err(Error::invalid_transition(
                self.status,
                NotificationStatus::Delivered,
            ));
        }
        if self.status != NotificationStatus::Delivered {
            self.transition(NotificationStatus::Delivered, at)?;
        }
        self.false_alarm = true;
        self.resolved_at.get_or_insert(at);
        self.updated_at = at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at: DateTime<Utc>) -> Notification {
        Notification::new(
            "u1",
            EmergencyKind::Manual,
            "help",
            GeoPoint::new(40.7128, -74.0060).unwrap(),
            at,
        )
    }

    #[test]
    fn test_expiry_is_ttl_after_trigger() {
        let now = Utc::now();
        let n = sample(now);
        assert_eq!(n.expires_at - n.triggered_at, Duration::hours(24));
        assert_eq!(n.status, NotificationStatus::Pending);
        assert!(!n.is_expired_at(now));
        assert!(n.is_expired_at(now + Duration::hours(24)));
    }

    #[test]
    fn test_failed_can_be_resolved_but_expired_cannot() {
        let now = Utc::now();
        let mut n = sample(now);
        n.transition(NotificationStatus::Failed, now).unwrap();
        n.resolve(now).unwrap();
        assert_eq!(n.status, NotificationStatus::Delivered);
        assert!(n.resolved_at.is_some());

        let mut expired = sample(now);
        expired.transition(NotificationStatus::Expired, now).unwrap();
        assert!(expired.resolve(now).is_err());
        assert!(expired.mark_false_alarm(now).is_err());
    }

    #[test]
    fn test_monotonic_transitions() {
        use NotificationStatus::*;
        assert!(!Sent.can_transition_to(Pending));
        assert!(!Delivered.can_transition_to(Failed));
        assert!(!Expired.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Failed));
    }

    #[test]
    fn test_false_alarm_after_resolve() {
        let now = Utc::now();
        let mut n = sample(now);
        n.transition(NotificationStatus::Sent, now).unwrap();
        n.resolve(now).unwrap();
        n.mark_false_alarm(now).unwrap();
        assert!(n.false_alarm);
        assert_eq!(n.status, NotificationStatus::Delivered);
    }

    #[test]
    fn test_preferred_channel_parsing() {
        assert_eq!(PreferredChannel::parse_lenient(Some("sms")), PreferredChannel::Sms);
        assert_eq!(PreferredChannel::parse_lenient(Some("EMAIL")), PreferredChannel::Email);
        assert_eq!(PreferredChannel::parse_lenient(None), PreferredChannel::Both);
        assert_eq!(PreferredChannel::parse_lenient(Some("pigeon")), PreferredChannel::Both);
    }

    #[test]
    fn test_contact_destinations_follow_preference() {
        let contact = ContactNotification {
            contact_id: Some("c1".into()),
            contact_name: "Ann".into(),
            contact_email: Some("a@x.com".into()),
            contact_phone: Some("  ".into()),
            preferred_channel: PreferredChannel::Both,
            deliveries: Vec::new(),
        };
        assert_eq!(contact.email_destination(), Some("a@x.com"));
        assert_eq!(contact.sms_destination(), None);
        assert!(contact.is_actionable());

        let sms_only = ContactNotification {
            preferred_channel: PreferredChannel::Sms,
            ..contact
        };
        assert_eq!(sms_only.email_destination(), None);
        assert!(sms_only.is_actionable());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("AI_DETECTED".parse::<EmergencyKind>().unwrap(), EmergencyKind::AiDetected);
        assert_eq!("audio".parse::<EmergencyKind>().unwrap(), EmergencyKind::Audio);
        assert_eq!(EmergencyKind::AiDetected.to_string(), "AI_DETECTED");
    }
}
