//! Best-effort realtime push through an HTTP push gateway.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::ChannelSender;
use crate::domain::Channel;
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// Push gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub url: String,
    pub bearer_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    3
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer_token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushReply {
    #[serde(default)]
    id: Option<String>,
}

pub struct RealtimeSender {
    config: RealtimeConfig,
    client: Client,
}

impl RealtimeSender {
    pub fn new(config: RealtimeConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(Error::config("realtime push gateway URL is empty"));
        }
        let client = build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ChannelSender for RealtimeSender {
    fn channel(&self) -> Channel {
        Channel::Realtime
    }

    async fn send(&self, destination: &str, subject: &str, content: &str) -> Result<String> {
        let payload = json!({
            "recipient": destination,
            "title": subject,
            "body": content,
            "sent_at": Utc::now().to_rfc3339(),
        });

        let mut request = self.client.post(&self.config.url).json(&payload);
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::channel_send(Channel::Realtime, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::channel_send(
                Channel::Realtime,
                format!("push gateway returned {status}"),
            ));
        }

        // Gateways that do not assign ids get a local one.
        let id = response
            .json::<PushReply>()
            .await
            .ok()
            .and_then(|reply| reply.id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!(destination, push_id = %id, "Realtime push accepted");
        Ok(id)
    }
}
