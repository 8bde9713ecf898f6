//! Domain layer: entities, state machines and value objects.

pub mod message_log;
pub mod notification;
pub mod value_objects;

pub use message_log::{AttemptOutcome, Channel, MessageLog, MessageStatus};
pub use notification::{
    ChannelDelivery, ContactNotification, EmergencyKind, Notification, NotificationStatus,
    PreferredChannel,
};
pub use value_objects::{GeoPoint, RetryPolicy};
