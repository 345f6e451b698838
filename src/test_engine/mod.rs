//! Automated control tests, their schedules, and the runs that execute them.

pub mod definitions;
pub mod handlers;
pub mod runs;
pub mod schedule;
pub mod types;

pub use types::{ControlTest, TestResult, TestRun};
