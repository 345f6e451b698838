use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use tracing::debug;
use uuid::Uuid;

use super::jwt::extract_bearer_token;
use super::request_id::RequestId;
use crate::core::error::ApiError;
use crate::core::macros::string_enum;
use crate::core::state::AppState;
use crate::directory::{OrgStatus, UserStatus};
use crate::store::StoreError;

string_enum! {
    pub enum Role {
        ComplianceManager => "compliance_manager",
        Ciso => "ciso",
        SecurityEngineer => "security_engineer",
        Auditor => "auditor",
        ItAdmin => "it_admin",
        Viewer => "viewer",
    }
}

/// Organization settings and user management.
pub const ORG_ADMINS: &[Role] = &[Role::ComplianceManager, Role::Ciso];

/// Framework activation, controls, mappings, scopes, risk authoring.
pub const COMPLIANCE_EDITORS: &[Role] = &[
    Role::ComplianceManager,
    Role::Ciso,
    Role::SecurityEngineer,
];

/// Accepting and archiving risks.
pub const RISK_APPROVERS: &[Role] = &[Role::Ciso, Role::ComplianceManager];

/// Tests, runs, the execution-engine interface, alerts and alert rules.
pub const OPERATIONS: &[Role] = &[
    Role::ComplianceManager,
    Role::Ciso,
    Role::SecurityEngineer,
    Role::ItAdmin,
];

pub const AUDIT_READERS: &[Role] = &[Role::ComplianceManager, Role::Ciso, Role::Auditor];

/// The caller bound to one request. Every tenant query filters on `org_id`.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub email: String,
    pub role: Role,
    pub request_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuthenticatedUser {
    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        roles.contains(&self.role)
    }

    pub fn require(&self, roles: &[Role]) -> Result<(), ApiError> {
        if self.has_any_role(roles) {
            Ok(())
        } else {
            Err(ApiError::forbidden())
        }
    }

    /// Role check with a per-resource override for the given owner.
    pub fn require_or_owner(&self, roles: &[Role], owner_id: Option<Uuid>) -> Result<(), ApiError> {
        if owner_id == Some(self.user_id) {
            return Ok(());
        }
        self.require(roles)
    }
}

/// Client address as reported by the proxy in front of the service.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.chars().take(512).collect())
}

/// Validates the bearer token and binds the caller to the request.
/// Tokens of users that were deactivated, deleted, or whose organization is
/// inactive are refused even while the token itself is still valid.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;

    let claims = state.jwt.validate_access_token(token).map_err(|e| {
        debug!("rejected access token: {e}");
        ApiError::Unauthorized("Invalid or expired access token".into())
    })?;

    let user_id = claims
        .user_id()
        .map_err(|_| ApiError::Unauthorized("Invalid access token".into()))?;
    let org_id = claims
        .org_id()
        .map_err(|_| ApiError::Unauthorized("Invalid access token".into()))?;

    let current = state
        .blocking(move |state| {
            Ok(state.store.read(|tables| {
                let user = tables.users().find(org_id, user_id)?;
                let org = tables.organizations().get(org_id)?;
                Ok::<_, StoreError>(
                    user.zip(org)
                        .map(|(user, org)| (user.status, user.role, user.email, org.status)),
                )
            })?)
        })
        .await?;

    let (role, email) = match current {
        Some((status, role, email, OrgStatus::Active)) if status != UserStatus::Deactivated => {
            (role, email)
        }
        _ => return Err(ApiError::Unauthorized("Account is not active".into())),
    };

    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.id.clone())
        .unwrap_or_else(|| RequestId::new().id);

    let caller = AuthenticatedUser {
        user_id,
        org_id,
        email,
        role,
        request_id,
        ip_address: client_ip(request.headers()),
        user_agent: user_agent(request.headers()),
    };

    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn caller(role: Role) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            email: "ana@example.com".into(),
            role,
            request_id: "req".into(),
            ip_address: None,
            user_agent: None,
        }
    }

    #[test]
    fn test_role_membership() {
        assert!(caller(Role::Ciso).require(RISK_APPROVERS).is_ok());
        assert!(caller(Role::SecurityEngineer).require(RISK_APPROVERS).is_err());
        assert!(caller(Role::ItAdmin).require(OPERATIONS).is_ok());
        assert!(caller(Role::Viewer).require(COMPLIANCE_EDITORS).is_err());
        assert!(caller(Role::Auditor).require(AUDIT_READERS).is_ok());
    }

    #[test]
    fn test_owner_override() {
        let viewer = caller(Role::Viewer);
        assert!(viewer
            .require_or_owner(COMPLIANCE_EDITORS, Some(viewer.user_id))
            .is_ok());
        assert!(viewer
            .require_or_owner(COMPLIANCE_EDITORS, Some(Uuid::new_v4()))
            .is_err());
        assert!(viewer.require_or_owner(COMPLIANCE_EDITORS, None).is_err());
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(Role::ComplianceManager.as_str(), "compliance_manager");
        assert_eq!("it_admin".parse::<Role>(), Ok(Role::ItAdmin));
        assert_eq!(Role::ALL.len(), 6);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.9.9.9"));
        assert_eq!(client_ip(&headers), Some("10.0.0.1".into()));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.9.9.9"));
        assert_eq!(client_ip(&headers), Some("10.9.9.9".into()));
        assert_eq!(client_ip(&HeaderMap::new()), None);
    }
}
