//! Escalation decision for notifications that may need external intervention.

use crate::domain::{EmergencyKind, Notification};

/// Decides whether a notification requires escalation beyond the user's contacts.
pub trait EscalationPolicy: Send + Sync {
    fn should_escalate(&self, notification: &Notification) -> bool;
}

/// Escalates every AI-detected emergency.
#[derive(Debug, Default, Clone, Copy)]
pub struct AiDetectedEscalation;

impl EscalationPolicy for AiDetectedEscalation {
    fn should_escalate(&self, notification: &Notification) -> bool {
        notification.kind == EmergencyKind::AiDetected
    }
}
