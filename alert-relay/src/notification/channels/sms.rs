//! SMS channel through an HTTP messaging gateway.
//!
//! The gateway speaks the common `Accounts/{sid}/Messages.json` form API:
//! basic auth with the account SID and token, form fields `To`, `From` and
//! `Body`, and a JSON reply carrying the message `sid`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ChannelSender;
use crate::domain::Channel;
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// SMS gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub account_sid: String,
    pub auth_token: String,
    /// Sender number in E.164 form.
    pub from_number: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.twilio.com".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl SmsConfig {
    /// Gateway credentials with the default base URL and timeout.
    pub fn new(
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from_number: impl Into<String>,
    ) -> Self {
        Self {
            base_url: default_base_url(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_number: from_number.into(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GatewayMessage {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

pub struct SmsSender {
    config: SmsConfig,
    client: Client,
}

impl SmsSender {
    pub fn new(config: SmsConfig) -> Result<Self> {
        if config.account_sid.is_empty() || config.auth_token.is_empty() {
            return Err(Error::config("SMS gateway requires account SID and auth token"));
        }
        if config.from_number.is_empty() {
            return Err(Error::config("SMS gateway requires a from number"));
        }
        let client = build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, client })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, destination: &str, _subject: &str, content: &str) -> Result<String> {
        let form = [
            ("To", destination),
            ("From", self.config.from_number.as_str()),
            ("Body", content),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::channel_send(Channel::Sms, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = match serde_json::from_str::<GatewayError>(&body) {
                Ok(GatewayError {
                    code,
                    message: Some(message),
                }) => match code {
                    Some(code) => format!("gateway returned {status}: {message} (code {code})"),
                    None => format!("gateway returned {status}: {message}"),
                },
                _ => format!("gateway returned {status}"),
            };
            return Err(Error::channel_send(Channel::Sms, reason));
        }

        let message: GatewayMessage = response.json().await.map_err(|e| {
            Error::channel_send(Channel::Sms, format!("unreadable gateway reply: {e}"))
        })?;

        debug!(destination, sid = %message.sid, "SMS accepted by gateway");
        Ok(message.sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> SmsConfig {
        SmsConfig {
            base_url,
            account_sid: "AC123".to_string(),
            auth_token: "secret".to_string(),
            from_number: "+15550000".to_string(),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_send_returns_gateway_sid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("To=%2B15551234"))
            .and(body_string_contains("Body=help"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"sid": "SM42", "status": "queued"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let sender = SmsSender::new(config(server.uri())).unwrap();
        let sid = sender.send("+15551234", "", "help").await.unwrap();
        assert_eq!(sid, "SM42");
    }

    #[tokio::test]
    async fn test_gateway_error_is_send_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(
                json!({"code": 21211, "message": "Invalid 'To' Phone Number"}),
            ))
            .mount(&server)
            .await;

        let sender = SmsSender::new(config(server.uri())).unwrap();
        let err = sender.send("123", "", "help").await.unwrap_err();
        match err {
            Error::ChannelSend { channel, reason } => {
                assert_eq!(channel, "SMS");
                assert!(reason.contains("Invalid 'To' Phone Number"));
                assert!(reason.contains("21211"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut cfg = config("http://localhost".to_string());
        cfg.auth_token.clear();
        assert!(matches!(
            SmsSender::new(cfg).err(),
            Some(Error::Configuration(_))
        ));
    }
}
