//! Delivery channels.
//!
//! - Email over SMTP
//! - SMS through an HTTP messaging gateway
//! - Realtime push through an HTTP push gateway (best-effort)

mod email;
mod realtime;
mod sms;

pub use email::{EmailConfig, EmailSender, SmtpSecurity};
pub use realtime::{RealtimeConfig, RealtimeSender};
pub use sms::{SmsConfig, SmsSender};

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::domain::Channel;

/// One delivery medium capable of sending a message to a single destination.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    /// Send `content` to `destination`, returning the provider-assigned delivery id.
    ///
    /// Transport failures are reported as `Error::ChannelSend`.
    async fn send(&self, destination: &str, subject: &str, content: &str) -> Result<String>;
}

/// The configured senders, looked up by channel.
///
/// A channel with no sender is treated as unavailable; attempts on it are
/// recorded as failures rather than skipped.
#[derive(Clone, Default)]
pub struct ChannelSet {
    email: Option<Arc<dyn ChannelSender>>,
    sms: Option<Arc<dyn ChannelSender>>,
    realtime: Option<Arc<dyn ChannelSender>>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sender` under the channel it reports.
    pub fn with(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        match sender.channel() {
            Channel::Email => self.email = Some(sender),
            Channel::Sms => self.sms = Some(sender),
            Channel::Realtime => self.realtime = Some(sender),
        }
        self
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn ChannelSender>> {
        match channel {
            Channel::Email => self.email.as_ref(),
            Channel::Sms => self.sms.as_ref(),
            Channel::Realtime => self.realtime.as_ref(),
        }
    }

    pub fn configured(&self) -> Vec<Channel> {
        [Channel::Email, Channel::Sms, Channel::Realtime]
            .into_iter()
            .filter(|c| self.get(*c).is_some())
            .collect()
    }
}

impl std::fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSet")
            .field("configured", &self.configured())
            .finish()
    }
}
