//! Email channel over SMTP.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::ChannelSender;
use crate::domain::Channel;
use crate::{Error, Result};

/// How the SMTP connection is secured.
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
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plain connection. Only for local relays.
    None,
    #[default]
    StartTls,
    /// Implicit TLS (usually port 465).
    Tls,
}

/// Email channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub security: SmtpSecurity,
    /// Sender mailbox, e.g. `Alerts <alerts@example.com>`.
    pub from_address: String,
    /// Prepended to every subject line.
    #[serde(default)]
    pub subject_prefix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            security: SmtpSecurity::StartTls,
            from_address: String::new(),
            subject_prefix: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

pub struct EmailSender {
    config: EmailConfig,
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailSender {
    pub fn new(config: EmailConfig) -> Result<Self> {
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|e| Error::config(format!("invalid email from address: {e}")))?;

        let mut builder = match config.security {
            SmtpSecurity::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
            }
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                    .map_err(|e| Error::config(format!("invalid SMTP relay: {e}")))?
            }
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(|e| Error::config(format!("invalid SMTP relay: {e}")))?,
        };
        builder = builder
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));
        if let (Some(user), Some(pass)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            config,
        })
    }

    /// Build the message and the delivery id carried in its Message-ID.
    fn build_message(
        &self,
        destination: &str,
        subject: &str,
        content: &str,
    ) -> Result<(Message, String)> {
        let to: Mailbox = destination.parse().map_err(|e| {
            Error::channel_send(
                Channel::Email,
                format!("invalid address '{destination}': {e}"),
            )
        })?;

        let delivery_id = Uuid::new_v4().to_string();
        let domain = self.from.email.domain().to_string();
        let subject = if self.config.subject_prefix.is_empty() {
            subject.to_string()
        } else {
            format!("{} {}", self.config.subject_prefix, subject)
        };

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .message_id(Some(format!("<{delivery_id}@{domain}>")))
            .header(ContentType::TEXT_PLAIN)
            .body(content.to_string())
            .map_err(|e| Error::channel_send(Channel::Email, e.to_string()))?;

        Ok((message, delivery_id))
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, destination: &str, subject: &str, content: &str) -> Result<String> {
        let (message, delivery_id) = self.build_message(destination, subject, content)?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| Error::channel_send(Channel::Email, e.to_string()))?;

        debug!(
            destination,
            delivery_id = %delivery_id,
            code = %response.code(),
            "Email accepted by SMTP relay"
        );
        Ok(delivery_id)
    }
}
