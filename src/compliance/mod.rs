//! Controls, the framework catalog, control-to-requirement mappings,
//! requirement scoping and coverage.

pub mod catalog;
pub mod controls;
pub mod frameworks;
pub mod handlers;
pub mod mappings;
pub mod scopes;
pub mod types;

pub use types::{Control, ControlCategory, ControlStatus, MappingStrength};
