pub mod error;
pub mod extract;
pub mod health;
pub mod macros;
pub mod metadata;
pub mod pagination;
pub mod response;
pub mod severity;
pub mod state;
