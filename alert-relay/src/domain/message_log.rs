//! Message log entity: one concrete send attempt to one destination on one channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Delivery medium.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
    Realtime,
}

impl Channel {
    /// Email and SMS are the safety-critical channels; realtime is best-effort.
    pub fn is_safety_critical(&self) -> bool {
        matches!(self, Self::Email | Self::Sms)
    }
}

/// Status of a single send attempt.
///
/// ```text
/// PENDING -> SENT -> DELIVERED
///    |        |
///    +--------+--> FAILED -> RETRY -> SENT | FAILED | DELIVERED
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Retry,
}

impl MessageStatus {
    /// Check whether moving from `self` to `next` respects the delivery state machine.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Sent, Delivered)
                | (Sent, Failed)
                | (Failed, Retry)
                | (Failed, Delivered)
                | (Retry, Sent)
                | (Retry, Failed)
                | (Retry, Delivered)
        )
    }

    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    /// Validate a transition, returning `InvalidStateTransition` when disallowed.
    pub fn ensure_transition(&self, next: MessageStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::invalid_transition(self, next))
        }
    }
}

/// One row per actual send attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageLog {
    pub id: String,
    pub notification_id: String,
    pub user_id: String,
    pub contact_id: Option<String>,
    /// Email address or phone number.
    pub destination: String,
    pub channel: Channel,
    pub subject: String,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Provider-assigned delivery identifier.
    pub delivery_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Outcome of one transport call, ready to be written into a log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Sent { delivery_id: String },
    Failed { error: String },
}

impl AttemptOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

impl MessageLog {
    /// Build the log entry for an attempt that has just completed.
    ///
    /// A failed first attempt is immediately eligible for the retry sweep.
    #[allow(clippy::too_many_arguments)]
    pub fn from_attempt(
        notification_id: impl Into<String>,
        user_id: impl Into<String>,
        contact_id: Option<String>,
        destination: impl Into<String>,
        channel: Channel,
        subject: impl Into<String>,
        content: impl Into<String>,
        outcome: AttemptOutcome,
        at: DateTime<Utc>,
    ) -> Self {
        let (status, sent_at, delivery_id, error_message, next_retry_at) = match outcome {
            AttemptOutcome::Sent { delivery_id } => {
                (MessageStatus::Sent, Some(at), Some(delivery_id), None, None)
            }
            AttemptOutcome::Failed { error } => {
                (MessageStatus::Failed, None, None, Some(error), Some(at))
            }
        };

        Self {
            id: Uuid::new_v4().to_string(),
            notification_id: notification_id.into(),
            user_id: user_id.into(),
            contact_id,
            destination: destination.into(),
            channel,
            subject: subject.into(),
            content: content.into(),
            status,
            created_at: at,
            sent_at,
            delivered_at: None,
            delivery_id,
            error_message,
            retry_count: 0,
            next_retry_at,
        }
    }

    /// Whether the retry sweep may pick this entry up at `now`.
    pub fn is_ready_for_retry(&self, now: DateTime<Utc>, max_retries: u32) -> bool {
        matches!(self.status, MessageStatus::Failed | MessageStatus::Retry)
            && self.retry_count < max_retries
            && self.next_retry_at.is_none_or(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_channel_strings() {
        assert_eq!(Channel::Email.to_string(), "EMAIL");
        assert_eq!(Channel::from_str("SMS").unwrap(), Channel::Sms);
        assert!(!Channel::Realtime.is_safety_critical());
    }

    #[test]
    fn test_status_machine() {
        use MessageStatus::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Failed.can_transition_to(Retry));
        assert!(Retry.can_transition_to(Failed));
        assert!(!Delivered.can_transition_to(Failed));
        assert!(!Delivered.can_transition_to(Retry));
        assert!(!Sent.can_transition_to(Retry));
        assert!(Delivered.ensure_transition(Retry).is_err());
    }

    #[test]
    fn test_failed_attempt_is_immediately_retryable() {
        let now = Utc::now();
        let log = MessageLog::from_attempt(
            "n1",
            "u1",
            Some("c1".to_string()),
            "a@x.com",
            Channel::Email,
            "subject",
            "body",
            AttemptOutcome::Failed {
                error: "smtp down".to_string(),
            },
            now,
        );
        assert_eq!(log.status, MessageStatus::Failed);
        assert!(log.sent_at.is_none());
        assert!(log.is_ready_for_retry(now, 3));

        let exhausted = MessageLog {
            retry_count: 3,
            ..log
        };
        assert!(!exhausted.is_ready_for_retry(now, 3));
    }
}
