pub mod audit;
pub mod auth;
pub mod cors;
pub mod jwt;
pub mod password;
pub mod request_id;
pub mod session;
pub mod validation;

pub use audit::{AuditEvent, AuditLogEntry};
pub use auth::{auth_middleware, AuthenticatedUser, Role};
pub use request_id::{request_id_middleware, RequestId};
pub use validation::Validator;
