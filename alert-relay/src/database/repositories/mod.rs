//! Repository layer for database access.
//!
//! Each repository is an async trait with an sqlx implementation so services
//! can be exercised against SQLite or in-process fakes.

pub mod message_log;
pub mod notification;
pub mod template;

pub use message_log::*;
pub use notification::*;
pub use template::*;
