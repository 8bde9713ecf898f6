//! alert-relay library crate.
//!
//! Emergency-alert fan-out: contact resolution, multi-channel dispatch with
//! per-attempt failure isolation, a persistent delivery log and a bounded retry sweep.

pub mod app;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod notification;
pub mod utils;

pub use error::{Error, Result};
