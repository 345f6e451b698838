pub mod alerts;
pub mod analytics;
pub mod api_router;
pub mod auth;
pub mod compliance;
pub mod config;
pub mod core;
pub mod directory;
pub mod risk;
pub mod security;
pub mod store;
pub mod test_engine;
pub mod tests;

pub use api_router::configure_api_routes;
