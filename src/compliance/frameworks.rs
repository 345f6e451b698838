use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::types::{OrgFramework, OrgFrameworkStatus};
use crate::core::error::ApiError;
use crate::security::audit::AuditEvent;
use crate::security::auth::{AuthenticatedUser, COMPLIANCE_EDITORS};
use crate::store::{Store, StoreError, Tables};

#[derive(Debug, Deserialize)]
pub struct ActivateFrameworkRequest {
    pub framework_version_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrgFrameworkView {
    #[serde(flatten)]
    pub org_framework: OrgFramework,
    pub framework_id: Uuid,
    pub framework_code: String,
    pub framework_name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageStats {
    pub framework_version_id: Uuid,
    pub total_requirements: usize,
    pub assessable_requirements: usize,
    pub out_of_scope: usize,
    pub in_scope: usize,
    pub mapped: usize,
    pub unmapped: usize,
    pub coverage_pct: f64,
}

pub(crate) fn view(tables: &mut Tables, org_framework: OrgFramework) -> Result<Option<OrgFrameworkView>, StoreError> {
    let Some(version) = tables.framework_versions().get(org_framework.framework_version_id)? else {
        return Ok(None);
    };
    let Some(framework) = tables.frameworks().get(version.framework_id)? else {
        return Ok(None);
    };
    Ok(Some(OrgFrameworkView {
        org_framework,
        framework_id: framework.id,
        framework_code: framework.code,
        framework_name: framework.name,
        version: version.version,
    }))
}

/// True when the organization has the requirement's framework version active.
pub fn is_version_active(tables: &mut Tables, org_id: Uuid, version_id: Uuid) -> Result<bool, StoreError> {
    Ok(tables
        .org_frameworks()
        .scan(org_id)?
        .into_iter()
        .any(|f| f.framework_version_id == version_id && f.status == OrgFrameworkStatus::Active))
}

/// Coverage of one framework version for one organization.
pub fn compute_coverage(tables: &mut Tables, org_id: Uuid, version_id: Uuid) -> Result<CoverageStats, StoreError> {
    let requirements = tables.requirements().in_version(version_id)?;
    let assessable: Vec<Uuid> = requirements
        .iter()
        .filter(|r| r.is_assessable)
        .map(|r| r.id)
        .collect();

    let excluded: HashSet<Uuid> = tables
        .requirement_scopes()
        .scan(org_id)?
        .into_iter()
        .filter(|s| !s.in_scope)
        .map(|s| s.requirement_id)
        .collect();
    let mapped_requirements: HashSet<Uuid> = tables
        .control_mappings()
        .scan(org_id)?
        .into_iter()
        .map(|m| m.requirement_id)
        .collect();

    let out_of_scope = assessable.iter().filter(|id| excluded.contains(id)).count();
    let in_scope = assessable.len() - out_of_scope;
    let mapped = assessable
        .iter()
        .filter(|id| !excluded.contains(id) && mapped_requirements.contains(id))
        .count();
    let coverage_pct = if in_scope == 0 {
        0.0
    } else {
        (mapped as f64 / in_scope as f64 * 10000.0).round() / 100.0
    };

    Ok(CoverageStats {
        framework_version_id: version_id,
        total_requirements: requirements.len(),
        assessable_requirements: assessable.len(),
        out_of_scope,
        in_scope,
        mapped,
        unmapped: in_scope.saturating_sub(mapped),
        coverage_pct,
    })
}

pub fn list_org_frameworks(store: &Store, caller: &AuthenticatedUser) -> Result<Vec<OrgFrameworkView>, ApiError> {
    let mut views: Vec<OrgFrameworkView> = store.read(|tables| {
        let mut views = Vec::new();
        for row in tables.org_frameworks().scan(caller.org_id)? {
            views.extend(view(tables, row)?);
        }
        Ok::<_, StoreError>(views)
    })?;
    views.sort_by(|a, b| a.framework_name.cmp(&b.framework_name).then(a.version.cmp(&b.version)));
    Ok(views)
}

/// Activates a version for the organization, reviving an inactive row if
/// one exists.
pub fn activate_framework(
    store: &Store,
    caller: &AuthenticatedUser,
    req: ActivateFrameworkRequest,
) -> Result<OrgFrameworkView, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;

    let (activated, reactivated) = store.transaction(|tables| {
        if tables.framework_versions().get(req.framework_version_id)?.is_none() {
            return Err(ApiError::field("framework_version_id", "framework version does not exist"));
        }
        let now = Utc::now();
        let existing = tables
            .org_frameworks()
            .scan(caller.org_id)?
            .into_iter()
            .find(|f| f.framework_version_id == req.framework_version_id);

        let (row, reactivated) = match existing {
            Some(row) if row.status == OrgFrameworkStatus::Active => {
                return Err(ApiError::Conflict("Framework version is already active".into()));
            }
            Some(mut row) => {
                row.status = OrgFrameworkStatus::Active;
                row.activated_by = Some(caller.user_id);
                row.activated_at = now;
                row.deactivated_at = None;
                row.updated_at = now;
                (tables.org_frameworks().update(row)?, true)
            }
            None => {
                let row = OrgFramework {
                    id: Uuid::new_v4(),
                    org_id: caller.org_id,
                    framework_version_id: req.framework_version_id,
                    status: OrgFrameworkStatus::Active,
                    activated_by: Some(caller.user_id),
                    activated_at: now,
                    deactivated_at: None,
                    created_at: now,
                    updated_at: now,
                };
                (tables.org_frameworks().insert(row)?, false)
            }
        };
        let view = view(tables, row)?.ok_or_else(|| ApiError::not_found("Framework version"))?;
        Ok((view, reactivated))
    })?;

    AuditEvent::new(caller, "framework.activated", "org_framework", activated.org_framework.id)
        .with_metadata("framework", activated.framework_code.clone())
        .with_metadata("version", activated.version.clone())
        .with_metadata("reactivated", reactivated)
        .record(store);

    Ok(activated)
}

/// Mappings to the version's requirements are kept.
pub fn deactivate_framework(
    store: &Store,
    caller: &AuthenticatedUser,
    org_framework_id: Uuid,
) -> Result<OrgFrameworkView, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;

    let deactivated = store.transaction(|tables| {
        let mut row = tables
            .org_frameworks()
            .find(caller.org_id, org_framework_id)?
            .ok_or_else(|| ApiError::not_found("Organization framework"))?;
        if row.status == OrgFrameworkStatus::Inactive {
            return Err(ApiError::Unprocessable("Framework is already inactive".into()));
        }
        let now = Utc::now();
        row.status = OrgFrameworkStatus::Inactive;
        row.deactivated_at = Some(now);
        row.updated_at = now;
        let row = tables.org_frameworks().update(row)?;
        view(tables, row)?.ok_or_else(|| ApiError::not_found("Framework version"))
    })?;

    AuditEvent::new(caller, "framework.deactivated", "org_framework", deactivated.org_framework.id)
        .with_metadata("framework", deactivated.framework_code.clone())
        .record(store);

    Ok(deactivated)
}

pub fn framework_coverage(
    store: &Store,
    caller: &AuthenticatedUser,
    org_framework_id: Uuid,
) -> Result<CoverageStats, ApiError> {
    store
        .read(|tables| {
            let Some(row) = tables.org_frameworks().find(caller.org_id, org_framework_id)? else {
                return Ok::<_, StoreError>(None);
            };
            compute_coverage(tables, caller.org_id, row.framework_version_id).map(Some)
        })?
        .ok_or_else(|| ApiError::not_found("Organization framework"))
}
