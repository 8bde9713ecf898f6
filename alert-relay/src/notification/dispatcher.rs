//! Emergency trigger orchestration.
//!
//! One call to [`NotificationDispatcher::create_and_dispatch`] validates the
//! request, persists a PENDING notification, resolves the user's contacts and
//! fans out one send per target. Every target is attempted and every attempt
//! leaves a message log row, whatever happened to its siblings.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use super::contacts::{ContactResolver, DeliveryTarget, ProfileDirectory};
use super::delivery::{DEFAULT_SEND_TIMEOUT, DeliveryExecutor};
use super::duplicate::{DEFAULT_DUPLICATE_WINDOW_SECS, DuplicateDetector};
use super::escalation::{AiDetectedEscalation, EscalationPolicy};
use super::template::{EMERGENCY_TEMPLATE, MessageTemplate, TemplateService, alert_variables};
use crate::database::repositories::{MessageLogRepository, NotificationRepository};
use crate::domain::notification::{
    REASON_ALL_SENDS_FAILED, REASON_CONTACT_RESOLUTION_FAILED, REASON_NO_CONTACTS,
};
use crate::domain::{
    AttemptOutcome, Channel, ChannelDelivery, EmergencyKind, GeoPoint, MessageLog, Notification,
    NotificationStatus,
};
use crate::metrics::{AlertCounter, AlertMetrics};
use crate::{Error, Result};

/// Dispatch tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Budget for each individual send.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Look-back window for the duplicate signal.
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,
    /// Template used to render alert messages.
    #[serde(default = "default_template")]
    pub template: String,
}

fn default_send_timeout_secs() -> u64 {
    DEFAULT_SEND_TIMEOUT.as_secs()
}

fn default_duplicate_window_secs() -> u64 {
    DEFAULT_DUPLICATE_WINDOW_SECS
}

fn default_template() -> String {
    EMERGENCY_TEMPLATE.to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: default_send_timeout_secs(),
            duplicate_window_secs: default_duplicate_window_secs(),
            template: default_template(),
        }
    }
}

impl DispatchConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }
}

/// Inbound trigger.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyRequest {
    pub user_id: String,
    pub message: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub kind: EmergencyKind,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub audio_ref: Option<String>,
    /// Advisory only. Resolution always consults the profile service.
    #[serde(default)]
    pub contact_ids: Vec<String>,
}

impl EmergencyRequest {
    /// Reject malformed input before anything is written.
    pub fn validate(&self) -> Result<GeoPoint> {
        if self.user_id.trim().is_empty() {
            return Err(Error::validation("user id must not be empty"));
        }
        if self.message.trim().is_empty() {
            return Err(Error::validation("message must not be empty"));
        }
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Aggregate outcome of one trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResult {
    pub notification_id: String,
    pub status: NotificationStatus,
    pub status_reason: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub contacts_notified: u32,
    /// Safety-critical sends attempted during the fan-out.
    pub attempts: u32,
    pub duplicate: bool,
    pub escalated: bool,
}

impl From<&Notification> for NotificationResult {
    fn from(n: &Notification) -> Self {
        Self {
            notification_id: n.id.clone(),
            status: n.status,
            status_reason: n.status_reason.clone(),
            triggered_at: n.triggered_at,
            contacts_notified: n.contacts_notified,
            attempts: 0,
            duplicate: n.duplicate,
            escalated: n.escalated,
        }
    }
}

/// One planned send.
struct SendJob {
    channel: Channel,
    target: DeliveryTarget,
    subject: String,
    content: String,
    realtime_body: String,
}

/// What happened to one planned send.
struct SendReport {
    channel: Channel,
    target: DeliveryTarget,
    outcome: AttemptOutcome,
    at: DateTime<Utc>,
    /// Whether the attempt has its message log row.
    logged: bool,
}

pub struct NotificationDispatcher {
    notifications: Arc<dyn NotificationRepository>,
    message_logs: Arc<dyn MessageLogRepository>,
    resolver: ContactResolver,
    duplicates: DuplicateDetector,
    escalation: Arc<dyn EscalationPolicy>,
    templates: Arc<TemplateService>,
    delivery: Arc<DeliveryExecutor>,
    metrics: Arc<dyn AlertMetrics>,
    config: DispatchConfig,
}

impl NotificationDispatcher {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        message_logs: Arc<dyn MessageLogRepository>,
        directory: Arc<dyn ProfileDirectory>,
        templates: Arc<TemplateService>,
        delivery: Arc<DeliveryExecutor>,
        metrics: Arc<dyn AlertMetrics>,
        config: DispatchConfig,
    ) -> Self {
        let duplicates = DuplicateDetector::new(
            notifications.clone(),
            metrics.clone(),
            config.duplicate_window(),
        );
        Self {
            notifications,
            message_logs,
            resolver: ContactResolver::new(directory),
            duplicates,
            escalation: Arc::new(AiDetectedEscalation),
            templates,
            delivery,
            metrics,
            config,
        }
    }

    /// Replace the default AI-detected escalation policy.
    pub fn with_escalation_policy(mut self, policy: Arc<dyn EscalationPolicy>) -> Self {
        self.escalation = policy;
        self
    }

    /// Handle one emergency trigger end to end.
    ///
    /// Returns `Ok` whenever the notification was recorded, including when no
    /// contact could be reached. `Err` means invalid input (nothing written)
    /// or an upstream failure during contact resolution.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, kind = %request.kind))]
    pub async fn create_and_dispatch(
        &self,
        request: EmergencyRequest,
    ) -> Result<NotificationResult> {
        let position = request.validate()?;
        let now = Utc::now();
        self.metrics.increment(AlertCounter::Triggered);

        let duplicate = match self.duplicates.is_duplicate(&request.user_id, now).await {
            Ok(duplicate) => duplicate,
            Err(e) => {
                warn!(error = %e, "Duplicate check failed, dispatching as new");
                false
            }
        };

        let mut notification = Notification::new(
            &request.user_id,
            request.kind,
            &request.message,
            position,
            now,
        );
        notification.reason = request.reason;
        notification.location = request.location;
        notification.audio_ref = request.audio_ref;
        notification.duplicate = duplicate;
        self.notifications.create(&notification).await?;
        if !duplicate {
            // Catches a concurrent trigger that was stored after the first count.
            match self.duplicates.recheck_stored(&notification).await {
                Ok(concurrent) => notification.duplicate = concurrent,
                Err(e) => warn!(error = %e, "Duplicate recheck failed"),
            }
        }
        info!(
            notification_id = %notification.id,
            duplicate = notification.duplicate,
            "Emergency notification created"
        );

        if !request.contact_ids.is_empty() {
            info!(
                notification_id = %notification.id,
                requested = request.contact_ids.len(),
                "Explicit contact ids are advisory; resolving from profile service"
            );
        }

        let resolution = match self.resolver.resolve(&notification.user_id).await {
            Ok(resolution) => resolution,
            Err(e) => {
                error!(notification_id = %notification.id, error = %e, "Contact resolution failed");
                self.metrics.increment(AlertCounter::ContactResolutionFailed);
                self.apply_escalation(&mut notification);
                self.finish(
                    &mut notification,
                    NotificationStatus::Failed,
                    Some(REASON_CONTACT_RESOLUTION_FAILED),
                )
                .await?;
                return Err(e);
            }
        };

        notification.contacts = resolution.contacts.clone();

        if resolution.is_empty() {
            warn!(notification_id = %notification.id, "No reachable contacts");
            self.metrics.increment(AlertCounter::NoContacts);
            self.apply_escalation(&mut notification);
            self.finish(
                &mut notification,
                NotificationStatus::Failed,
                Some(REASON_NO_CONTACTS),
            )
            .await?;
            return Ok(NotificationResult::from(&notification));
        }

        let template = self.load_template().await;
        let user_name = resolution
            .user_alias
            .clone()
            .unwrap_or_else(|| notification.user_id.clone());

        let jobs = resolution
            .email_targets
            .into_iter()
            .map(|t| (Channel::Email, t))
            .chain(resolution.sms_targets.into_iter().map(|t| (Channel::Sms, t)))
            .map(|(channel, target)| {
                let vars = alert_variables(&notification, &target.contact_name, &user_name);
                let rendered = template.render(&vars);
                let content = match channel {
                    Channel::Sms => rendered.sms_body.clone(),
                    _ => rendered.body,
                };
                SendJob {
                    channel,
                    target,
                    subject: rendered.subject,
                    content,
                    realtime_body: rendered.sms_body,
                }
            })
            .collect::<Vec<_>>();

        let attempts = jobs.len() as u32;
        let reports = join_all(jobs.into_iter().map(|job| self.run_job(&notification, job))).await;

        // An attempt without a log row cannot be audited or retried.
        let mut notified = 0u32;
        for report in &reports {
            if report.outcome.is_sent() && report.logged {
                notified += 1;
            }
            record_delivery(&mut notification, report);
        }
        notification.contacts_notified = notified;

        self.apply_escalation(&mut notification);

        if notified > 0 {
            self.finish(&mut notification, NotificationStatus::Sent, None)
                .await?;
        } else {
            self.finish(
                &mut notification,
                NotificationStatus::Failed,
                Some(REASON_ALL_SENDS_FAILED),
            )
            .await?;
        }

        info!(
            notification_id = %notification.id,
            status = %notification.status,
            notified,
            attempts,
            "Emergency dispatch finished"
        );

        Ok(NotificationResult {
            attempts,
            ..NotificationResult::from(&notification)
        })
    }

    /// Send, log and optionally follow up on realtime for one target.
    async fn run_job(&self, notification: &Notification, job: SendJob) -> SendReport {
        let outcome = self
            .delivery
            .attempt(job.channel, &job.target.destination, &job.subject, &job.content)
            .await;
        let at = Utc::now();

        let log = MessageLog::from_attempt(
            &notification.id,
            &notification.user_id,
            job.target.contact_id.clone(),
            &job.target.destination,
            job.channel,
            &job.subject,
            &job.content,
            outcome.clone(),
            at,
        );
        let logged = match self.message_logs.create(&log).await {
            Ok(_) => true,
            Err(e) => {
                self.metrics.increment(AlertCounter::LogWriteFailed);
                error!(
                    notification_id = %notification.id,
                    channel = %job.channel,
                    destination = %job.target.destination,
                    sent = outcome.is_sent(),
                    error = %e,
                    "Failed to record message log"
                );
                false
            }
        };

        if outcome.is_sent() && self.delivery.has_channel(Channel::Realtime) {
            let recipient = job
                .target
                .contact_id
                .as_deref()
                .unwrap_or(&job.target.destination);
            let realtime = self
                .delivery
                .attempt(Channel::Realtime, recipient, &job.subject, &job.realtime_body)
                .await;
            if let AttemptOutcome::Failed { error } = realtime {
                warn!(
                    notification_id = %notification.id,
                    recipient,
                    error = %error,
                    "Realtime follow-up failed"
                );
            }
        }

        SendReport {
            channel: job.channel,
            target: job.target,
            outcome,
            at,
            logged,
        }
    }

    async fn load_template(&self) -> MessageTemplate {
        match self.templates.resolve(&self.config.template).await {
            Ok(template) => template,
            Err(e) => {
                warn!(
                    template = %self.config.template,
                    error = %e,
                    "Falling back to built-in template"
                );
                MessageTemplate::emergency_default()
            }
        }
    }

    fn apply_escalation(&self, notification: &mut Notification) {
        if notification.escalated || !self.escalation.should_escalate(notification) {
            return;
        }
        notification.escalated = true;
        self.metrics.increment(AlertCounter::Escalated);
        warn!(
            notification_id = %notification.id,
            user_id = %notification.user_id,
            kind = %notification.kind,
            "Emergency escalated"
        );
    }

    async fn finish(
        &self,
        notification: &mut Notification,
        status: NotificationStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let expected = notification.status;
        notification.transition(status, Utc::now())?;
        notification.status_reason = reason.map(str::to_string);
        self.notifications.update(notification, expected).await
    }
}

/// Attach the outcome of one send to the matching contact in the plan.
fn record_delivery(notification: &mut Notification, report: &SendReport) {
    let destination = report.target.destination.as_str();
    let contact = notification.contacts.iter_mut().find(|c| {
        c.contact_id == report.target.contact_id
            && match report.channel {
                Channel::Sms => c.sms_destination() == Some(destination),
                _ => c
                    .email_destination()
                    .is_some_and(|e| e.eq_ignore_ascii_case(destination)),
            }
    });
    let Some(contact) = contact else {
        return;
    };

    let delivery = match &report.outcome {
        AttemptOutcome::Sent { delivery_id } => ChannelDelivery {
            channel: report.channel,
            status: NotificationStatus::Sent,
            sent_at: Some(report.at),
            delivery_id: Some(delivery_id.clone()),
            error_message: None,
        },
        AttemptOutcome::Failed { error } => ChannelDelivery {
            channel: report.channel,
            status: NotificationStatus::Failed,
            sent_at: None,
            delivery_id: None,
            error_message: Some(error.clone()),
        },
    };
    contact.deliveries.push(delivery);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{
        SqlxMessageLogRepository, SqlxNotificationRepository, SqlxTemplateRepository,
    };
    use crate::database::test_pool;
    use crate::metrics::MetricsCollector;
    use crate::notification::channels::{ChannelSender, ChannelSet};
    use crate::notification::contacts::{EmergencyContact, UserProfile};
    use async_trait::async_trait;

    struct TwoContacts;

    #[async_trait]
    impl ProfileDirectory for TwoContacts {
        async fn get_profile(&self, _user_id: &str) -> Result<Option<UserProfile>> {
            Ok(None)
        }

        async fn get_emergency_contacts(&self, _user_id: &str) -> Result<Vec<EmergencyContact>> {
            Ok(["a@x.com", "b@x.com"]
                .into_iter()
                .enumerate()
                .map(|(i, email)| EmergencyContact {
                    id: Some(format!("c{i}")),
                    name: Some(format!("Contact {i}")),
                    email: Some(email.to_string()),
                    phone: None,
                    preferred_method: Some("EMAIL".to_string()),
                })
                .collect())
        }
    }

    struct EmailOk;

    #[async_trait]
    impl ChannelSender for EmailOk {
        fn channel(&self) -> Channel {
            Channel::Email
        }

        async fn send(&self, destination: &str, _: &str, _: &str) -> Result<String> {
            Ok(format!("id-{destination}"))
        }
    }

    fn request() -> EmergencyRequest {
        EmergencyRequest {
            user_id: "u1".into(),
            message: "help".into(),
            latitude: 40.7128,
            longitude: -74.0060,
            ..Default::default()
        }
    }

    #[test]
    fn test_validation_rejects_bad_input() {
        assert!(request().validate().is_ok());

        let blank_user = EmergencyRequest {
            user_id: "  ".into(),
            ..request()
        };
        assert!(matches!(blank_user.validate(), Err(Error::Validation(_))));

        let blank_message = EmergencyRequest {
            message: String::new(),
            ..request()
        };
        assert!(matches!(blank_message.validate(), Err(Error::Validation(_))));

        let bad_lat = EmergencyRequest {
            latitude: 91.0,
            ..request()
        };
        assert!(matches!(bad_lat.validate(), Err(Error::Validation(_))));

        let bad_lon = EmergencyRequest {
            longitude: f64::NAN,
            ..request()
        };
        assert!(matches!(bad_lon.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let json = r#"{"userId":"u1","message":"help","latitude":1.0,"longitude":2.0,"kind":"AI_DETECTED","audioRef":"a.wav"}"#;
        let req: EmergencyRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.kind, EmergencyKind::AiDetected);
        assert_eq!(req.audio_ref.as_deref(), Some("a.wav"));
        assert!(req.contact_ids.is_empty());
    }

    #[test]
    fn test_config_defaults() {
        let config: DispatchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.send_timeout(), Duration::from_secs(15));
        assert_eq!(config.duplicate_window(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_unlogged_attempt_is_not_counted_as_notified() {
        let pool = test_pool().await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_log BEFORE INSERT ON message_log
            WHEN NEW.destination = 'b@x.com'
            BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let metrics = Arc::new(MetricsCollector::new());
        let message_logs = Arc::new(SqlxMessageLogRepository::new(pool.clone(), 3));
        let dispatcher = NotificationDispatcher::new(
            Arc::new(SqlxNotificationRepository::new(pool.clone())),
            message_logs.clone(),
            Arc::new(TwoContacts),
            Arc::new(TemplateService::new(Arc::new(SqlxTemplateRepository::new(
                pool,
            )))),
            Arc::new(DeliveryExecutor::new(
                ChannelSet::new().with(Arc::new(EmailOk)),
                metrics.clone(),
                Duration::from_secs(5),
            )),
            metrics.clone(),
            DispatchConfig::default(),
        );

        let result = dispatcher.create_and_dispatch(request()).await.unwrap();
        assert_eq!(result.attempts, 2);
        assert_eq!(result.contacts_notified, 1);
        assert_eq!(result.status, NotificationStatus::Sent);

        let logs = message_logs
            .list_by_notification(&result.notification_id)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].destination, "a@x.com");
        assert_eq!(metrics.snapshot().log_write_failures, 1);
    }
}
