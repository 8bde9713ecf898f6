//! Row models mapping SQLite tables to domain entities.

mod message_log;
mod notification;
mod template;

pub use message_log::MessageLogDbModel;
pub use notification::NotificationDbModel;
pub use template::MessageTemplateDbModel;

use std::str::FromStr;

use crate::{Error, Result};

/// Parse a stored enum column, reporting corrupt values as database errors.
pub(crate) fn parse_column<T: FromStr>(column: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Database(format!("invalid {column} value '{raw}'")))
}
