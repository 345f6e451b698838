use chrono::Utc;
use serde::Deserialize;
use std::cmp::Ordering;
use uuid::Uuid;

use super::{normalize_email, User, UserStatus};
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::pagination::{ListSpec, Page, PageParams, SortOrder};
use crate::security::audit::AuditEvent;
use crate::security::auth::{AuthenticatedUser, Role, ORG_ADMINS};
use crate::security::password::PasswordService;
use crate::security::validation::Validator;
use crate::store::Store;

const USER_LIST: ListSpec = ListSpec {
    default_per_page: 20,
    max_per_page: 100,
    sort_fields: &["email", "created_at", "last_name"],
    default_sort: "created_at",
    default_order: SortOrder::Desc,
};

#[derive(Debug, Default, Deserialize)]
pub struct ListUsersQuery {
    pub role: Option<String>,
    pub status: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub role: Role,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<Role>,
    pub mfa_enabled: Option<bool>,
}

pub fn list_users(
    store: &Store,
    caller: &AuthenticatedUser,
    query: &ListUsersQuery,
) -> Result<Page<User>, ApiError> {
    let role: Option<Role> = parse_filter(&query.role, "role")?;
    let status: Option<UserStatus> = parse_filter(&query.status, "status")?;

    let users: Vec<User> = store
        .read(|tables| tables.users().scan(caller.org_id))?
        .into_iter()
        .filter(|u| role.map_or(true, |r| u.role == r))
        .filter(|u| status.map_or(true, |s| u.status == s))
        .collect();

    Ok(query.page.resolve(&USER_LIST).apply(users, compare_users))
}

fn compare_users(a: &User, b: &User, sort: &str) -> Ordering {
    match sort {
        "email" => a.email.cmp(&b.email),
        "last_name" => a
            .last_name
            .to_lowercase()
            .cmp(&b.last_name.to_lowercase())
            .then_with(|| a.first_name.cmp(&b.first_name)),
        _ => a.created_at.cmp(&b.created_at),
    }
}

pub fn get_user(store: &Store, caller: &AuthenticatedUser, user_id: Uuid) -> Result<User, ApiError> {
    store
        .read(|tables| tables.users().find(caller.org_id, user_id))?
        .ok_or_else(|| ApiError::not_found("User"))
}

/// Admin-created users start out `invited` and become active on first login.
pub fn create_user(
    store: &Store,
    passwords: &PasswordService,
    caller: &AuthenticatedUser,
    req: CreateUserRequest,
) -> Result<User, ApiError> {
    caller.require(ORG_ADMINS)?;

    let email = normalize_email(&req.email);
    Validator::new()
        .email(&email, "email")
        .length(&req.first_name, "first_name", None, Some(100))
        .length(&req.last_name, "last_name", None, Some(100))
        .validate()?;
    passwords.validate(&req.password, "password")?;

    let password_hash = passwords.hash_for_storage(&req.password)?;
    let user = User::new(
        caller.org_id,
        email,
        password_hash,
        req.first_name.trim().to_string(),
        req.last_name.trim().to_string(),
        req.role,
        UserStatus::Invited,
    );

    let user = store
        .transaction(|tables| tables.users().insert(user))
        .map_err(|e| ApiError::conflict_or(e, "A user with this email already exists"))?;

    AuditEvent::new(caller, "user.created", "user", user.id)
        .with_metadata("email", user.email.clone())
        .with_metadata("role", user.role.as_str())
        .record(store);

    Ok(user)
}

pub fn update_user(
    store: &Store,
    caller: &AuthenticatedUser,
    user_id: Uuid,
    req: UpdateUserRequest,
) -> Result<User, ApiError> {
    caller.require(ORG_ADMINS)?;

    Validator::new()
        .optional_length(req.first_name.as_deref(), "first_name", 100)
        .optional_length(req.last_name.as_deref(), "last_name", 100)
        .validate()?;

    let (user, previous_role) = store.transaction(|tables| {
        let mut user = tables
            .users()
            .find(caller.org_id, user_id)?
            .ok_or_else(|| ApiError::not_found("User"))?;
        let previous_role = user.role;

        if let Some(first_name) = req.first_name {
            user.first_name = first_name.trim().to_string();
        }
        if let Some(last_name) = req.last_name {
            user.last_name = last_name.trim().to_string();
        }
        if let Some(role) = req.role {
            user.role = role;
        }
        if let Some(mfa) = req.mfa_enabled {
            user.mfa_enabled = mfa;
        }
        user.updated_at = Utc::now();
        Ok::<_, ApiError>((tables.users().update(user)?, previous_role))
    })?;

    let mut event = AuditEvent::new(caller, "user.updated", "user", user.id);
    if previous_role != user.role {
        event = event
            .with_metadata("previous_role", previous_role.as_str())
            .with_metadata("role", user.role.as_str());
    }
    event.record(store);

    Ok(user)
}

/// Deactivation and the revocation of every refresh token of the user are
/// one transaction.
pub fn deactivate_user(
    store: &Store,
    caller: &AuthenticatedUser,
    user_id: Uuid,
) -> Result<User, ApiError> {
    caller.require(ORG_ADMINS)?;
    if user_id == caller.user_id {
        return Err(ApiError::Unprocessable("You cannot deactivate your own account".into()));
    }

    let (user, revoked) = store.transaction(|tables| {
        let mut user = tables
            .users()
            .find(caller.org_id, user_id)?
            .ok_or_else(|| ApiError::not_found("User"))?;
        if user.is_deactivated() {
            return Err(ApiError::Unprocessable("User is already deactivated".into()));
        }

        let now = Utc::now();
        user.status = UserStatus::Deactivated;
        user.updated_at = now;
        let user = tables.users().update(user)?;
        let revoked = tables.refresh_tokens().revoke_all_for_user(user.id, now)?;
        Ok((user, revoked))
    })?;

    AuditEvent::new(caller, "user.deactivated", "user", user.id)
        .with_metadata("revoked_tokens", revoked)
        .record(store);

    Ok(user)
}

pub fn reactivate_user(
    store: &Store,
    caller: &AuthenticatedUser,
    user_id: Uuid,
) -> Result<User, ApiError> {
    caller.require(ORG_ADMINS)?;

    let user = store.transaction(|tables| {
        let mut user = tables
            .users()
            .find(caller.org_id, user_id)?
            .ok_or_else(|| ApiError::not_found("User"))?;
        if !user.is_deactivated() {
            return Err(ApiError::Unprocessable("Only deactivated users can be reactivated".into()));
        }
        user.status = UserStatus::Active;
        user.updated_at = Utc::now();
        Ok(tables.users().update(user)?)
    })?;

    AuditEvent::new(caller, "user.reactivated", "user", user.id).record(store);
    Ok(user)
}
