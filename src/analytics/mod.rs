//! Read-only aggregates over controls, tests and the risk register.

pub mod controls;
pub mod handlers;
pub mod risks;
