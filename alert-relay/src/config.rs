//! Process configuration loaded from the environment (and an optional `.env`).
//!
//! Every channel is optional: a channel without its required variables is
//! simply not configured, and attempts on it are recorded as failures.
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | `sqlite:alert-relay.db?mode=rwc` |
//! | `LOG_DIR` | `logs` |
//! | `SMTP_HOST`, `SMTP_PORT`, `SMTP_USERNAME`, `SMTP_PASSWORD`, `SMTP_SECURITY`, `SMTP_FROM`, `SMTP_SUBJECT_PREFIX`, `SMTP_TIMEOUT_SECS` | email disabled without `SMTP_HOST` and `SMTP_FROM` |
//! | `SMS_BASE_URL`, `SMS_ACCOUNT_SID`, `SMS_AUTH_TOKEN`, `SMS_FROM_NUMBER`, `SMS_TIMEOUT_SECS` | SMS disabled without SID, token and number |
//! | `REALTIME_URL`, `REALTIME_TOKEN`, `REALTIME_TIMEOUT_SECS` | realtime disabled without URL |
//! | `PROFILE_SERVICE_URL`, `PROFILE_SERVICE_TOKEN`, `PROFILE_SERVICE_TIMEOUT_SECS` | required |
//! | `SEND_TIMEOUT_SECS`, `DUPLICATE_WINDOW_SECS`, `ALERT_TEMPLATE` | 15, 300, `emergency-alert` |
//! | `RETRY_INTERVAL_SECS`, `RETRY_MAX`, `RETRY_DELAY_SECS` | 300, 3, 300 |
//! | `MAINTENANCE_INTERVAL_SECS`, `LOG_RETENTION_DAYS` | 3600, 30 |

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::database::MaintenanceConfig;
use crate::notification::channels::{EmailConfig, RealtimeConfig, SmsConfig, SmtpSecurity};
use crate::notification::{DispatchConfig, ProfileServiceConfig, RetrySchedulerConfig};
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:alert-relay.db?mode=rwc";
pub const DEFAULT_LOG_DIR: &str = "logs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,
    pub email: Option<EmailConfig>,
    pub sms: Option<SmsConfig>,
    pub realtime: Option<RealtimeConfig>,
    pub profile_service: ProfileServiceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry: RetrySchedulerConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl AppConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            return Err(Error::config(format!("failed to load .env: {e}")));
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let email = match (env.string("SMTP_HOST"), env.string("SMTP_FROM")) {
            (Some(smtp_host), Some(from_address)) => {
                let mut email = EmailConfig {
                    smtp_host,
                    from_address,
                    smtp_username: env.string("SMTP_USERNAME"),
                    smtp_password: env.string("SMTP_PASSWORD"),
                    ..EmailConfig::default()
                };
                if let Some(port) = env.parse("SMTP_PORT")? {
                    email.smtp_port = port;
                }
                if let Some(security) = env.parse::<SmtpSecurity>("SMTP_SECURITY")? {
                    email.security = security;
                }
                if let Some(prefix) = env.string("SMTP_SUBJECT_PREFIX") {
                    email.subject_prefix = prefix;
                }
                if let Some(timeout) = env.parse("SMTP_TIMEOUT_SECS")? {
                    email.timeout_secs = timeout;
                }
                Some(email)
            }
            _ => None,
        };

        let sms = match (
            env.string("SMS_ACCOUNT_SID"),
            env.string("SMS_AUTH_TOKEN"),
            env.string("SMS_FROM_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number)) => {
                let mut sms = SmsConfig::new(account_sid, auth_token, from_number);
                if let Some(base_url) = env.string("SMS_BASE_URL") {
                    sms.base_url = base_url;
                }
                if let Some(timeout) = env.parse("SMS_TIMEOUT_SECS")? {
                    sms.timeout_secs = timeout;
                }
                Some(sms)
            }
            _ => None,
        };

        let realtime = match env.string("REALTIME_URL") {
            Some(url) => {
                let mut realtime = RealtimeConfig::new(url);
                realtime.bearer_token = env.string("REALTIME_TOKEN");
                if let Some(timeout) = env.parse("REALTIME_TIMEOUT_SECS")? {
                    realtime.timeout_secs = timeout;
                }
                Some(realtime)
            }
            None => None,
        };

        let mut profile_service = ProfileServiceConfig {
            base_url: env
                .string("PROFILE_SERVICE_URL")
                .ok_or_else(|| Error::config("PROFILE_SERVICE_URL is required"))?,
            bearer_token: env.string("PROFILE_SERVICE_TOKEN"),
            timeout_secs: 5,
        };
        if let Some(timeout) = env.parse("PROFILE_SERVICE_TIMEOUT_SECS")? {
            profile_service.timeout_secs = timeout;
        }

        let mut dispatch = DispatchConfig::default();
        if let Some(timeout) = env.parse("SEND_TIMEOUT_SECS")? {
            dispatch.send_timeout_secs = timeout;
        }
        if let Some(window) = env.parse("DUPLICATE_WINDOW_SECS")? {
            dispatch.duplicate_window_secs = window;
        }
        if let Some(template) = env.string("ALERT_TEMPLATE") {
            dispatch.template = template;
        }

        let mut retry = RetrySchedulerConfig::default();
        if let Some(interval) = env.parse("RETRY_INTERVAL_SECS")? {
            retry.sweep_interval_secs = interval;
        }
        if let Some(max) = env.parse("RETRY_MAX")? {
            retry.policy.max_retries = max;
        }
        if let Some(delay) = env.parse::<u64>("RETRY_DELAY_SECS")? {
            retry.policy.retry_delay_ms = delay.saturating_mul(1000);
        }

        let mut maintenance = MaintenanceConfig::default();
        if let Some(interval) = env.parse("MAINTENANCE_INTERVAL_SECS")? {
            maintenance.interval_secs = interval;
        }
        if let Some(days) = env.parse("LOG_RETENTION_DAYS")? {
            maintenance.log_retention_days = days;
        }

        let config = Self {
            database_url: env
                .string("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            log_dir: env
                .string("LOG_DIR")
                .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
            email,
            sms,
            realtime,
            profile_service,
            dispatch,
            retry,
            maintenance,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.email.is_none() && self.sms.is_none() {
            return Err(Error::config(
                "at least one of email (SMTP_HOST, SMTP_FROM) or SMS (SMS_ACCOUNT_SID, SMS_AUTH_TOKEN, SMS_FROM_NUMBER) must be configured",
            ));
        }
        if self.dispatch.send_timeout_secs == 0 {
            return Err(Error::config("SEND_TIMEOUT_SECS must be positive"));
        }
        if self.retry.sweep_interval_secs == 0 {
            return Err(Error::config("RETRY_INTERVAL_SECS must be positive"));
        }
        if self.retry.policy.max_retries == 0 {
            return Err(Error::config("RETRY_MAX must be at least 1"));
        }
        if self.maintenance.log_retention_days <= 0 {
            return Err(Error::config("LOG_RETENTION_DAYS must be positive"));
        }
        if let Some(email) = &self.email
            && !email.from_address.contains('@')
        {
            return Err(Error::config("SMTP_FROM must contain an email address"));
        }
        Ok(())
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| Error::config(format!("{key}={raw:?} is invalid: {e}")))
            })
            .transpose()
    }
}
