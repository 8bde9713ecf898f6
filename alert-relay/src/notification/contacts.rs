//! Contact resolution: user id to channel-partitioned delivery targets.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{ContactNotification, PreferredChannel};
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// A user's own profile as returned by the profile service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

/// One emergency contact as returned by the profile service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyContact {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub preferred_method: Option<String>,
}

/// The external user-profile collaborator.
///
/// "Not found" is not an error: implementations return `None` / an empty list.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;
    async fn get_emergency_contacts(&self, user_id: &str) -> Result<Vec<EmergencyContact>>;
}

/// Profile service connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileServiceConfig {
    pub base_url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    5
}

/// Profile directory backed by the user-management HTTP API.
pub struct HttpProfileDirectory {
    base_url: Url,
    bearer_token: Option<String>,
    client: Client,
}

impl HttpProfileDirectory {
    pub fn new(config: ProfileServiceConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::config(format!("invalid profile service URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::config("profile service URL cannot be a base URL"));
        }
        Ok(Self {
            base_url,
            bearer_token: config.bearer_token,
            client: build_client(Duration::from_secs(config.timeout_secs))?,
        })
    }

    /// `{base}/api/users/{user_id}/{leaf}` with the user id percent-encoded.
    fn endpoint(&self, user_id: &str, leaf: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::config("profile service URL cannot be a base URL"))?
            .pop_if_empty()
            .extend(["api", "users", user_id, leaf]);
        Ok(url)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<Option<T>> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl ProfileDirectory for HttpProfileDirectory {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.get_json(self.endpoint(user_id, "profile")?).await
    }

    async fn get_emergency_contacts(&self, user_id: &str) -> Result<Vec<EmergencyContact>> {
        Ok(self
            .get_json(self.endpoint(user_id, "emergency-contacts")?)
            .await?
            .unwrap_or_default())
    }
}

/// One destination on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub contact_id: Option<String>,
    pub contact_name: String,
    pub destination: String,
}

/// Where the targets came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionSource {
    Contacts,
    ProfileEmail,
    UserId,
    /// Nothing usable: the dispatcher reports `NO_CONTACTS`.
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContactResolution {
    /// Contact plan recorded on the notification.
    pub contacts: Vec<ContactNotification>,
    pub email_targets: Vec<DeliveryTarget>,
    pub sms_targets: Vec<DeliveryTarget>,
    /// Display name of the triggering user, when the profile provided one.
    pub user_alias: Option<String>,
    pub source: ResolutionSource,
}

impl ContactResolution {
    pub fn is_empty(&self) -> bool {
        self.email_targets.is_empty() && self.sms_targets.is_empty()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// A user id can stand in for an email address when it looks like one.
fn looks_like_email(value: &str) -> bool {
    value.contains('@') && value.contains('.')
}

pub struct ContactResolver {
    directory: Arc<dyn ProfileDirectory>,
}

impl ContactResolver {
    pub fn new(directory: Arc<dyn ProfileDirectory>) -> Self {
        Self { directory }
    }

    /// Resolve `user_id` into email and SMS targets.
    ///
    /// An empty result is not an error. Collaborator failures surface as
    /// `ContactResolution` only when the fallback chain also produced nothing.
    pub async fn resolve(&self, user_id: &str) -> Result<ContactResolution> {
        let (contacts, profile) = tokio::join!(
            self.directory.get_emergency_contacts(user_id),
            self.directory.get_profile(user_id),
        );

        let mut upstream_errors = Vec::new();
        let contacts = contacts.unwrap_or_else(|e| {
            warn!(user_id, error = %e, "Failed to fetch emergency contacts");
            upstream_errors.push(format!("contacts: {e}"));
            Vec::new()
        });
        let profile = profile.unwrap_or_else(|e| {
            debug!(user_id, error = %e, "Failed to fetch user profile");
            upstream_errors.push(format!("profile: {e}"));
            None
        });
        let user_alias = profile.as_ref().and_then(|p| non_blank(p.alias.clone()));

        let mut resolution = Self::from_contacts(contacts);
        resolution.user_alias = user_alias.clone();
        if !resolution.is_empty() {
            return Ok(resolution);
        }

        let display_name = user_alias.clone().unwrap_or_else(|| user_id.to_string());
        let (fallback, source) = match profile.and_then(|p| non_blank(p.email)) {
            Some(email) => (Some(email), ResolutionSource::ProfileEmail),
            None if looks_like_email(user_id) => {
                (Some(user_id.to_string()), ResolutionSource::UserId)
            }
            None => (None, ResolutionSource::None),
        };

        if let Some(email) = fallback {
            debug!(user_id, source = %source, "No usable contacts; falling back to user email");
            return Ok(ContactResolution {
                contacts: vec![ContactNotification {
                    contact_id: None,
                    contact_name: display_name.clone(),
                    contact_email: Some(email.clone()),
                    contact_phone: None,
                    preferred_channel: PreferredChannel::Email,
                    deliveries: Vec::new(),
                }],
                email_targets: vec![DeliveryTarget {
                    contact_id: None,
                    contact_name: display_name,
                    destination: email,
                }],
                sms_targets: Vec::new(),
                user_alias,
                source,
            });
        }

        if !upstream_errors.is_empty() {
            return Err(Error::ContactResolution(upstream_errors.join("; ")));
        }
        Ok(resolution)
    }

    /// Partition contacts by preference, skipping repeated destinations.
    fn from_contacts(contacts: Vec<EmergencyContact>) -> ContactResolution {
        let mut plan = Vec::new();
        let mut email_targets = Vec::new();
        let mut sms_targets = Vec::new();
        let mut seen_emails = HashSet::new();
        let mut seen_phones = HashSet::new();

        for (index, contact) in contacts.into_iter().enumerate() {
            let entry = ContactNotification {
                contact_id: non_blank(contact.id),
                contact_name: non_blank(contact.name)
                    .unwrap_or_else(|| format!("Contact {}", index + 1)),
                contact_email: non_blank(contact.email),
                contact_phone: non_blank(contact.phone),
                preferred_channel: PreferredChannel::parse_lenient(
                    contact.preferred_method.as_deref(),
                ),
                deliveries: Vec::new(),
            };
            if !entry.is_actionable() {
                debug!(contact = %entry.contact_name, "Skipping contact without email or phone");
                continue;
            }

            if let Some(email) = entry.email_destination()
                && seen_emails.insert(email.to_ascii_lowercase())
            {
                email_targets.push(DeliveryTarget {
                    contact_id: entry.contact_id.clone(),
                    contact_name: entry.contact_name.clone(),
                    destination: email.to_string(),
                });
            }
            if let Some(phone) = entry.sms_destination()
                && seen_phones.insert(phone.to_string())
            {
                sms_targets.push(DeliveryTarget {
                    contact_id: entry.contact_id.clone(),
                    contact_name: entry.contact_name.clone(),
                    destination: phone.to_string(),
                });
            }
            plan.push(entry);
        }

        let source = if email_targets.is_empty() && sms_targets.is_empty() {
            ResolutionSource::None
        } else {
            ResolutionSource::Contacts
        };
        ContactResolution {
            contacts: plan,
            email_targets,
            sms_targets,
            user_alias: None,
            source,
        }
    }
}
