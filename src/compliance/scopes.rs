use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use uuid::Uuid;

use super::types::RequirementScope;
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::pagination::{ListSpec, Page, PageParams, SortOrder};
use crate::security::audit::AuditEvent;
use crate::security::auth::{AuthenticatedUser, COMPLIANCE_EDITORS};
use crate::security::validation::Validator;
use crate::store::{Store, StoreError};

const SCOPE_LIST: ListSpec = ListSpec {
    default_per_page: 50,
    max_per_page: 200,
    sort_fields: &["updated_at", "created_at"],
    default_sort: "updated_at",
    default_order: SortOrder::Desc,
};

const MAX_JUSTIFICATION: usize = 2000;

#[derive(Debug, Deserialize)]
pub struct SetScopeRequest {
    pub in_scope: bool,
    pub justification: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListScopesQuery {
    pub in_scope: Option<String>,
    pub framework_version_id: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

/// Creates or replaces the organization's scope decision for a requirement.
/// Marking a requirement out of scope needs a justification.
pub fn set_scope(
    store: &Store,
    caller: &AuthenticatedUser,
    requirement_id: Uuid,
    req: SetScopeRequest,
) -> Result<RequirementScope, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;

    let justification = req
        .justification
        .as_deref()
        .map(str::trim)
        .filter(|j| !j.is_empty())
        .map(String::from);
    Validator::new()
        .check(
            req.in_scope || justification.is_some(),
            "justification",
            "is required when marking a requirement out of scope",
        )
        .optional_length(justification.as_deref(), "justification", MAX_JUSTIFICATION)
        .validate()?;

    let scope = store.transaction(|tables| {
        if tables.requirements().get(requirement_id)?.is_none() {
            return Err(ApiError::not_found("Requirement"));
        }
        let now = Utc::now();
        let existing = tables
            .requirement_scopes()
            .scan(caller.org_id)?
            .into_iter()
            .find(|s| s.requirement_id == requirement_id);

        let scope = match existing {
            Some(mut scope) => {
                scope.in_scope = req.in_scope;
                scope.justification = justification;
                scope.set_by = caller.user_id;
                scope.updated_at = now;
                tables.requirement_scopes().update(scope)?
            }
            None => tables.requirement_scopes().insert(RequirementScope {
                id: Uuid::new_v4(),
                org_id: caller.org_id,
                requirement_id,
                in_scope: req.in_scope,
                justification,
                set_by: caller.user_id,
                created_at: now,
                updated_at: now,
            })?,
        };
        Ok(scope)
    })?;

    AuditEvent::new(caller, "requirement_scope.updated", "requirement", requirement_id)
        .with_metadata("in_scope", scope.in_scope)
        .record(store);
    Ok(scope)
}

/// Deletes the override so the requirement is implicitly in scope again.
pub fn reset_scope(store: &Store, caller: &AuthenticatedUser, requirement_id: Uuid) -> Result<RequirementScope, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;

    let removed = store.transaction(|tables| {
        let scope = tables
            .requirement_scopes()
            .scan(caller.org_id)?
            .into_iter()
            .find(|s| s.requirement_id == requirement_id)
            .ok_or_else(|| ApiError::not_found("Requirement scope"))?;
        if !tables.requirement_scopes().remove(scope.id)? {
            return Err(ApiError::not_found("Requirement scope"));
        }
        Ok(scope)
    })?;

    AuditEvent::new(caller, "requirement_scope.reset", "requirement", requirement_id).record(store);
    Ok(removed)
}

pub fn list_scopes(
    store: &Store,
    caller: &AuthenticatedUser,
    query: &ListScopesQuery,
) -> Result<Page<RequirementScope>, ApiError> {
    let in_scope: Option<bool> = parse_filter(&query.in_scope, "in_scope")?;
    let version_id: Option<Uuid> = parse_filter(&query.framework_version_id, "framework_version_id")?;

    let scopes: Vec<RequirementScope> = store.read(|tables| {
        let in_version: Option<HashSet<Uuid>> = match version_id {
            Some(v) => Some(tables.requirements().in_version(v)?.into_iter().map(|r| r.id).collect()),
            None => None,
        };
        Ok::<_, StoreError>(
            tables
                .requirement_scopes()
                .scan(caller.org_id)?
                .into_iter()
                .filter(|s| in_scope.map_or(true, |v| s.in_scope == v))
                .filter(|s| in_version.as_ref().map_or(true, |ids| ids.contains(&s.requirement_id)))
                .collect(),
        )
    })?;

    Ok(query
        .page
        .resolve(&SCOPE_LIST)
        .apply(scopes, |a, b, sort| match sort {
            "created_at" => a.created_at.cmp(&b.created_at),
            _ => a.updated_at.cmp(&b.updated_at),
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::catalog::{FrameworkSeed, SectionSeed};
    use crate::compliance::frameworks::{activate_framework, framework_coverage, ActivateFrameworkRequest};
    use crate::compliance::mappings::{create_mapping, delete_mapping, CreateMappingRequest};
    use crate::compliance::types::{Control, ControlCategory, MappingStrength, Requirement};
    use crate::security::auth::Role;
    use crate::tests::test_util::{installed, Tenant};
    use crate::{assert_err, assert_ok};

    const TEN_FLAT: FrameworkSeed = FrameworkSeed {
        code: "flat10",
        name: "Flat Ten",
        publisher: "Test",
        description: "",
        version: "1",
        effective: (2024, 1, 1),
        sections: &[
            SectionSeed { reference: "R1", title: "One", children: &[] },
            SectionSeed { reference: "R2", title: "Two", children: &[] },
            SectionSeed { reference: "R3", title: "Three", children: &[] },
            SectionSeed { reference: "R4", title: "Four", children: &[] },
            SectionSeed { reference: "R5", title: "Five", children: &[] },
            SectionSeed { reference: "R6", title: "Six", children: &[] },
            SectionSeed { reference: "R7", title: "Seven", children: &[] },
            SectionSeed { reference: "R8", title: "Eight", children: &[] },
            SectionSeed { reference: "R9", title: "Nine", children: &[] },
            SectionSeed { reference: "R10", title: "Ten", children: &[] },
        ],
    };

    fn out_of_scope(reason: &str) -> SetScopeRequest {
        SetScopeRequest {
            in_scope: false,
            justification: Some(reason.into()),
        }
    }

    #[test]
    fn test_out_of_scope_needs_justification() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::Ciso);
        let err = assert_err!(set_scope(
            &tenant.store,
            &editor,
            Uuid::new_v4(),
            SetScopeRequest {
                in_scope: false,
                justification: Some("   ".into()),
            }
        ));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err = assert_err!(set_scope(&tenant.store, &editor, Uuid::new_v4(), out_of_scope(&"x".repeat(2001))));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_coverage_scenario_and_round_trips() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::SecurityEngineer);
        let version = installed(&tenant.store, &TEN_FLAT);
        let active = assert_ok!(activate_framework(
            &tenant.store,
            &editor,
            ActivateFrameworkRequest {
                framework_version_id: version.id
            }
        ));
        let mut requirements: Vec<Requirement> = assert_ok!(tenant.store.read(|t| t.requirements().in_version(version.id)));
        requirements.sort_by_key(|r| r.section_order);

        let before_mapping = assert_ok!(framework_coverage(&tenant.store, &editor, active.org_framework.id));

        let mut mapping_ids = Vec::new();
        for (i, requirement) in requirements.iter().take(4).enumerate() {
            let control = assert_ok!(tenant.store.transaction(|t| t.controls().insert(Control::new(
                tenant.org_id,
                format!("CTRL-{i}"),
                "Control".into(),
                ControlCategory::Technical,
                editor.user_id,
            ))));
            let mapping = assert_ok!(create_mapping(
                &tenant.store,
                &editor,
                CreateMappingRequest {
                    control_id: control.id,
                    requirement_id: requirement.id,
                    strength: MappingStrength::Primary,
                    notes: None,
                }
            ));
            mapping_ids.push(mapping.id);
        }

        let before_scoping = assert_ok!(framework_coverage(&tenant.store, &editor, active.org_framework.id));
        assert_eq!(before_scoping.coverage_pct, 40.0);

        for requirement in &requirements[8..10] {
            assert_ok!(set_scope(&tenant.store, &editor, requirement.id, out_of_scope("Not applicable to our environment")));
        }

        let stats = assert_ok!(framework_coverage(&tenant.store, &editor, active.org_framework.id));
        assert_eq!(stats.assessable_requirements, 10);
        assert_eq!(stats.in_scope, 8);
        assert_eq!(stats.mapped, 4);
        assert_eq!(stats.unmapped, 4);
        assert_eq!(stats.coverage_pct, 50.0);

        for requirement in &requirements[8..10] {
            assert_ok!(reset_scope(&tenant.store, &editor, requirement.id));
        }
        let reset = assert_ok!(framework_coverage(&tenant.store, &editor, active.org_framework.id));
        assert_eq!(reset, before_scoping);

        for id in mapping_ids {
            assert_ok!(delete_mapping(&tenant.store, &editor, id));
        }
        let unmapped = assert_ok!(framework_coverage(&tenant.store, &editor, active.org_framework.id));
        assert_eq!(unmapped, before_mapping);
    }

    #[test]
    fn test_reset_without_override_is_not_found() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::Ciso);
        let err = assert_err!(reset_scope(&tenant.store, &editor, Uuid::new_v4()));
        assert_eq!(err.error_code(), "NOT_FOUND");
    }
}
