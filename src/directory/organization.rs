use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use super::Organization;
use crate::core::error::ApiError;
use crate::core::metadata;
use crate::security::audit::AuditEvent;
use crate::security::auth::{AuthenticatedUser, ORG_ADMINS};
use crate::security::validation::Validator;
use crate::store::Store;

#[derive(Debug, Default, Deserialize)]
pub struct UpdateOrganizationRequest {
    pub name: Option<String>,
    pub settings: Option<Value>,
}

pub fn get_organization(store: &Store, caller: &AuthenticatedUser) -> Result<Organization, ApiError> {
    store
        .read(|tables| tables.organizations().get(caller.org_id))?
        .ok_or_else(|| ApiError::not_found("Organization"))
}

/// Settings are merged key-wise into the stored map, never replaced.
pub fn update_organization(
    store: &Store,
    caller: &AuthenticatedUser,
    req: UpdateOrganizationRequest,
) -> Result<Organization, ApiError> {
    caller.require(ORG_ADMINS)?;

    let mut validator = Validator::new();
    if let Some(name) = &req.name {
        validator = validator
            .required(name, "name")
            .length(name, "name", None, Some(255));
    }
    validator.validate()?;
    if let Some(settings) = &req.settings {
        metadata::check_map(settings, "settings")?;
    }

    let org = store.transaction(|tables| {
        let mut org = tables
            .organizations()
            .get(caller.org_id)?
            .ok_or_else(|| ApiError::not_found("Organization"))?;

        if let Some(name) = req.name {
            org.name = name.trim().to_string();
        }
        if let Some(settings) = req.settings {
            metadata::merge(&mut org.settings, settings);
            metadata::check_map(&org.settings, "settings")?;
        }
        org.updated_at = Utc::now();
        Ok::<_, ApiError>(tables.organizations().update(org)?)
    })?;

    AuditEvent::new(caller, "organization.updated", "organization", org.id)
        .with_metadata("name", org.name.clone())
        .record(store);

    Ok(org)
}
