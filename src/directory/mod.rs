//! Tenants and the people who belong to them.

pub mod handlers;
pub mod organization;
pub mod users;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::error::ApiError;
use crate::core::macros::string_enum;
use crate::core::metadata::empty_map;
use crate::security::auth::Role;
use crate::store::table::entity;
use crate::store::Tables;

string_enum! {
    pub enum OrgStatus {
        Active => "active",
        Inactive => "inactive",
    }
}

string_enum! {
    pub enum UserStatus {
        Invited => "invited",
        Active => "active",
        Deactivated => "deactivated",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::organizations, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub status: OrgStatus,
    pub settings: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: String, slug: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            slug,
            status: OrgStatus::Active,
            settings: empty_map(),
            created_at: now,
            updated_at: now,
        }
    }
}

entity!(Organization => organizations);

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::users, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct User {
    pub id: Uuid,
    pub org_id: Uuid,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub status: UserStatus,
    pub mfa_enabled: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        org_id: Uuid,
        email: String,
        password_hash: String,
        first_name: String,
        last_name: String,
        role: Role,
        status: UserStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            org_id,
            email,
            password_hash,
            first_name,
            last_name,
            role,
            status,
            mfa_enabled: false,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_deactivated(&self) -> bool {
        self.status == UserStatus::Deactivated
    }
}

entity!(User => users, tenant);

impl<'t> crate::store::Table<'t, User> {
    /// Case-sensitive match on an already normalized address.
    pub fn find_by_email(self, org_id: Uuid, email: &str) -> Result<Option<User>, crate::store::StoreError> {
        use crate::store::schema::users::dsl;

        Ok(dsl::users
            .filter(dsl::org_id.eq(org_id))
            .filter(dsl::email.eq(email))
            .select(User::as_select())
            .first(self.connection())
            .optional()?)
    }

    /// Every membership of `email` across organizations, with the organization.
    pub fn memberships(self, email: &str) -> Result<Vec<(User, Organization)>, crate::store::StoreError> {
        use crate::store::schema::{organizations, users};

        Ok(users::table
            .inner_join(organizations::table)
            .filter(users::email.eq(email))
            .select((User::as_select(), Organization::as_select()))
            .load(self.connection())?)
    }
}

/// Owners and assignees must be users of the same organization who have not
/// been deactivated.
pub fn ensure_active_member(tables: &mut Tables<'_>, org_id: Uuid, user_id: Uuid, field: &str) -> Result<(), ApiError> {
    match tables.users().find(org_id, user_id)? {
        Some(user) if !user.is_deactivated() => Ok(()),
        Some(_) => Err(ApiError::field(field, "user is deactivated")),
        None => Err(ApiError::field(field, "user does not exist in this organization")),
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c
            } else if c.is_whitespace() || c == '-' || c == '_' {
                '-'
            } else {
                '\0'
            }
        })
        .filter(|c| *c != '\0')
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
