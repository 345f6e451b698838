//! Registration, login and the refresh-token session model.

pub mod handlers;
pub mod service;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::directory::{Organization, User};
use crate::security::auth::{client_ip, user_agent};
use crate::security::jwt::TokenPair;
use crate::security::request_id::RequestId;

pub use service::AuthService;

/// Request-scoped details of an unauthenticated caller, kept for the audit trail.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub request_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientContext {
    pub fn from_parts(request_id: Option<&RequestId>, headers: &HeaderMap) -> Self {
        Self {
            request_id: request_id
                .map(|r| r.id.clone())
                .unwrap_or_else(|| RequestId::new().id),
            ip_address: client_ip(headers),
            user_agent: user_agent(headers),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub organization_name: String,
    pub organization_slug: Option<String>,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub organization_slug: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub user: User,
    pub organization: Organization,
    pub tokens: TokenPair,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeResponse {
    pub user: User,
    pub organization: Organization,
}
