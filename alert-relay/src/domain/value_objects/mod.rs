//! Value objects for the alert domain.

mod geo_point;
mod retry_policy;

pub use geo_point::GeoPoint;
pub use retry_policy::RetryPolicy;
