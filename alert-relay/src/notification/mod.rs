//! Emergency alert pipeline: contact resolution, fan-out, retries and queries.

pub mod channels;
pub mod contacts;
pub mod delivery;
pub mod dispatcher;
pub mod duplicate;
pub mod escalation;
pub mod retry;
pub mod service;
pub mod template;

pub use channels::{ChannelSender, ChannelSet};
pub use contacts::{
    ContactResolution, ContactResolver, DeliveryTarget, EmergencyContact, HttpProfileDirectory,
    ProfileDirectory, ProfileServiceConfig, ResolutionSource, UserProfile,
};
pub use delivery::DeliveryExecutor;
pub use dispatcher::{DispatchConfig, EmergencyRequest, NotificationDispatcher, NotificationResult};
pub use duplicate::DuplicateDetector;
pub use escalation::{AiDetectedEscalation, EscalationPolicy};
pub use retry::{RetryOutcome, RetryScheduler, RetrySchedulerConfig, SweepReport};
pub use service::{AlertStats, NotificationQueryService};
pub use template::{MessageTemplate, TemplateService, render};
