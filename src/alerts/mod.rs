//! Alerts raised from failing tests: rules, lifecycle, delivery and SLAs.

pub mod generation;
pub mod handlers;
pub mod lifecycle;
pub mod notify;
pub mod rules;
pub mod sla;
pub mod types;

pub use types::{Alert, AlertRule, AlertStatus, Channel};
