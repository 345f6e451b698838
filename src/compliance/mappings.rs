use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::frameworks::is_version_active;
use super::types::{ControlMapping, MappingStrength};
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::pagination::{ListSpec, Page, PageParams, SortOrder};
use crate::security::audit::{record_all, AuditEvent};
use crate::security::auth::{AuthenticatedUser, COMPLIANCE_EDITORS};
use crate::security::validation::Validator;
use crate::store::{Store, StoreError, Tables};

const MAPPING_LIST: ListSpec = ListSpec {
    default_per_page: 50,
    max_per_page: 200,
    sort_fields: &["created_at"],
    default_sort: "created_at",
    default_order: SortOrder::Desc,
};

const MAX_BULK_MAPPINGS: usize = 500;
const MAX_NOTES: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMappingRequest {
    pub control_id: Uuid,
    pub requirement_id: Uuid,
    #[serde(default)]
    pub strength: MappingStrength,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkMappingRequest {
    pub mappings: Vec<CreateMappingRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedMapping {
    pub index: usize,
    pub control_id: Uuid,
    pub requirement_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkMappingResult {
    pub created: Vec<ControlMapping>,
    pub skipped: Vec<SkippedMapping>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateMappingRequest {
    pub strength: Option<MappingStrength>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListMappingsQuery {
    pub control_id: Option<String>,
    pub requirement_id: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

/// Checks every precondition and inserts the mapping into `tables`.
fn insert_mapping(
    tables: &mut Tables,
    caller: &AuthenticatedUser,
    req: &CreateMappingRequest,
) -> Result<ControlMapping, ApiError> {
    tables
        .controls()
        .find(caller.org_id, req.control_id)?
        .ok_or_else(|| ApiError::not_found("Control"))?;
    let requirement = tables
        .requirements()
        .get(req.requirement_id)?
        .ok_or_else(|| ApiError::not_found("Requirement"))?;
    if !requirement.is_assessable {
        return Err(ApiError::Unprocessable("Requirement is not assessable".into()));
    }
    if !is_version_active(tables, caller.org_id, requirement.framework_version_id)? {
        return Err(ApiError::Unprocessable(
            "The requirement's framework is not active for this organization".into(),
        ));
    }

    let now = Utc::now();
    let mapping = ControlMapping {
        id: Uuid::new_v4(),
        org_id: caller.org_id,
        control_id: req.control_id,
        requirement_id: req.requirement_id,
        strength: req.strength,
        notes: req.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()).map(String::from),
        created_by: caller.user_id,
        created_at: now,
        updated_at: now,
    };
    tables
        .control_mappings()
        .insert(mapping)
        .map_err(|e| ApiError::conflict_or(e, "Control is already mapped to this requirement"))
}

fn created_event(caller: &AuthenticatedUser, mapping: &ControlMapping) -> AuditEvent {
    AuditEvent::new(caller, "mapping.created", "control_mapping", mapping.id)
        .with_metadata("control_id", mapping.control_id.to_string())
        .with_metadata("requirement_id", mapping.requirement_id.to_string())
        .with_metadata("strength", mapping.strength.as_str())
}

pub fn create_mapping(
    store: &Store,
    caller: &AuthenticatedUser,
    req: CreateMappingRequest,
) -> Result<ControlMapping, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;
    Validator::new()
        .optional_length(req.notes.as_deref(), "notes", MAX_NOTES)
        .validate()?;

    let mapping = store.transaction(|tables| insert_mapping(tables, caller, &req))?;
    created_event(caller, &mapping).record(store);
    Ok(mapping)
}

/// Entries failing a precondition are skipped and reported; the rest are
/// created together.
pub fn bulk_create_mappings(
    store: &Store,
    caller: &AuthenticatedUser,
    req: BulkMappingRequest,
) -> Result<BulkMappingResult, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;
    let mut validator = Validator::new()
        .check(!req.mappings.is_empty(), "mappings", "must not be empty")
        .check(
            req.mappings.len() <= MAX_BULK_MAPPINGS,
            "mappings",
            "must contain at most 500 entries",
        );
    for item in &req.mappings {
        validator = validator.optional_length(item.notes.as_deref(), "notes", MAX_NOTES);
    }
    validator.validate()?;

    let result = store.transaction(|tables| {
        let mut created = Vec::new();
        let mut skipped = Vec::new();
        for (index, item) in req.mappings.iter().enumerate() {
            match insert_mapping(tables, caller, item) {
                Ok(mapping) => created.push(mapping),
                Err(ApiError::Internal(detail)) => return Err(ApiError::Internal(detail)),
                Err(e) => skipped.push(SkippedMapping {
                    index,
                    control_id: item.control_id,
                    requirement_id: item.requirement_id,
                    reason: e.public_message(),
                }),
            }
        }
        Ok(BulkMappingResult { created, skipped })
    })?;

    record_all(
        store,
        result
            .created
            .iter()
            .map(|m| created_event(caller, m).with_metadata("bulk", true))
            .collect(),
    );
    Ok(result)
}

pub fn update_mapping(
    store: &Store,
    caller: &AuthenticatedUser,
    mapping_id: Uuid,
    req: UpdateMappingRequest,
) -> Result<ControlMapping, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;
    Validator::new()
        .optional_length(req.notes.as_deref(), "notes", MAX_NOTES)
        .validate()?;

    let mapping = store.transaction(|tables| {
        let mut mapping = tables
            .control_mappings()
            .find(caller.org_id, mapping_id)?
            .ok_or_else(|| ApiError::not_found("Mapping"))?;
        if let Some(strength) = req.strength {
            mapping.strength = strength;
        }
        if let Some(notes) = req.notes {
            let notes = notes.trim();
            mapping.notes = (!notes.is_empty()).then(|| notes.to_string());
        }
        mapping.updated_at = Utc::now();
        Ok::<_, ApiError>(tables.control_mappings().update(mapping)?)
    })?;

    AuditEvent::new(caller, "mapping.updated", "control_mapping", mapping.id)
        .with_metadata("strength", mapping.strength.as_str())
        .record(store);
    Ok(mapping)
}

pub fn delete_mapping(store: &Store, caller: &AuthenticatedUser, mapping_id: Uuid) -> Result<ControlMapping, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;

    let removed = store.transaction(|tables| {
        let mapping = tables
            .control_mappings()
            .find(caller.org_id, mapping_id)?
            .ok_or_else(|| ApiError::not_found("Mapping"))?;
        if !tables.control_mappings().remove(mapping_id)? {
            return Err(ApiError::not_found("Mapping"));
        }
        Ok(mapping)
    })?;

    AuditEvent::new(caller, "mapping.deleted", "control_mapping", removed.id)
        .with_metadata("control_id", removed.control_id.to_string())
        .with_metadata("requirement_id", removed.requirement_id.to_string())
        .record(store);
    Ok(removed)
}

pub fn list_mappings(
    store: &Store,
    caller: &AuthenticatedUser,
    query: &ListMappingsQuery,
) -> Result<Page<ControlMapping>, ApiError> {
    let control_id: Option<Uuid> = parse_filter(&query.control_id, "control_id")?;
    let requirement_id: Option<Uuid> = parse_filter(&query.requirement_id, "requirement_id")?;

    let mappings: Vec<ControlMapping> = store.read(|tables| {
        Ok::<_, StoreError>(
            tables
                .control_mappings()
                .scan(caller.org_id)?
                .into_iter()
                .filter(|m| control_id.map_or(true, |c| m.control_id == c))
                .filter(|m| requirement_id.map_or(true, |r| m.requirement_id == r))
                .collect(),
        )
    })?;

    Ok(query
        .page
        .resolve(&MAPPING_LIST)
        .apply(mappings, |a, b, _| a.created_at.cmp(&b.created_at)))
}

pub fn list_control_mappings(
    store: &Store,
    caller: &AuthenticatedUser,
    control_id: Uuid,
    page: PageParams,
) -> Result<Page<ControlMapping>, ApiError> {
    let exists = store.read(|tables| tables.controls().find(caller.org_id, control_id).map(|c| c.is_some()))?;
    if !exists {
        return Err(ApiError::not_found("Control"));
    }
    list_mappings(
        store,
        caller,
        &ListMappingsQuery {
            control_id: Some(control_id.to_string()),
            requirement_id: None,
            page,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::catalog::SOC2_2017;
    use crate::compliance::frameworks::{activate_framework, ActivateFrameworkRequest};
    use crate::compliance::types::{Control, ControlCategory, Requirement};
    use crate::security::auth::Role;
    use crate::tests::test_util::{installed, Tenant};
    use crate::{assert_err, assert_ok};

    struct Setup {
        tenant: Tenant,
        editor: AuthenticatedUser,
        control: Control,
        assessable: Vec<Requirement>,
        structural: Requirement,
    }

    fn setup(activate: bool) -> Setup {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::SecurityEngineer);
        let version = installed(&tenant.store, &SOC2_2017);
        if activate {
            assert_ok!(activate_framework(
                &tenant.store,
                &editor,
                ActivateFrameworkRequest {
                    framework_version_id: version.id
                }
            ));
        }
        let control = assert_ok!(tenant.store.transaction(|t| t.controls().insert(Control::new(
            tenant.org_id,
            "CTRL-1".into(),
            "Access".into(),
            ControlCategory::Technical,
            editor.user_id,
        ))));
        let mut reqs = assert_ok!(tenant.store.read(|t| t.requirements().in_version(version.id)));
        reqs.sort_by_key(|r| (r.depth, r.section_order));
        let structural = reqs.iter().find(|r| !r.is_assessable).cloned();
        let assessable: Vec<Requirement> = reqs.into_iter().filter(|r| r.is_assessable).collect();
        Setup {
            tenant,
            editor,
            control,
            assessable,
            structural: assert_ok!(structural.ok_or("no structural requirement")),
        }
    }

    fn mapping(control: &Control, requirement: &Requirement) -> CreateMappingRequest {
        CreateMappingRequest {
            control_id: control.id,
            requirement_id: requirement.id,
            strength: MappingStrength::Primary,
            notes: None,
        }
    }

    #[test]
    fn test_mapping_requires_active_framework() {
        let s = setup(false);
        let err = assert_err!(create_mapping(&s.tenant.store, &s.editor, mapping(&s.control, &s.assessable[0])));
        assert_eq!(err.error_code(), "UNPROCESSABLE");
    }

    #[test]
    fn test_mapping_requires_assessable_requirement() {
        let s = setup(true);
        let err = assert_err!(create_mapping(&s.tenant.store, &s.editor, mapping(&s.control, &s.structural)));
        assert_eq!(err.error_code(), "UNPROCESSABLE");
    }

    #[test]
    fn test_duplicate_mapping_conflicts() {
        let s = setup(true);
        assert_ok!(create_mapping(&s.tenant.store, &s.editor, mapping(&s.control, &s.assessable[0])));
        let err = assert_err!(create_mapping(&s.tenant.store, &s.editor, mapping(&s.control, &s.assessable[0])));
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[test]
    fn test_bulk_skips_failures() {
        let s = setup(true);
        let req = BulkMappingRequest {
            mappings: vec![
                mapping(&s.control, &s.assessable[0]),
                mapping(&s.control, &s.structural),
                mapping(&s.control, &s.assessable[0]),
                mapping(&s.control, &s.assessable[1]),
            ],
        };
        let result = assert_ok!(bulk_create_mappings(&s.tenant.store, &s.editor, req));
        assert_eq!(result.created.len(), 2);
        let skipped: Vec<usize> = result.skipped.iter().map(|m| m.index).collect();
        assert_eq!(skipped, vec![1, 2]);
    }

    #[test]
    fn test_update_and_delete() {
        let s = setup(true);
        let created = assert_ok!(create_mapping(&s.tenant.store, &s.editor, mapping(&s.control, &s.assessable[0])));
        let updated = assert_ok!(update_mapping(
            &s.tenant.store,
            &s.editor,
            created.id,
            UpdateMappingRequest {
                strength: Some(MappingStrength::Compensating),
                notes: Some("covers legacy systems".into()),
            }
        ));
        assert_eq!(updated.strength, MappingStrength::Compensating);

        let page = assert_ok!(list_control_mappings(&s.tenant.store, &s.editor, s.control.id, PageParams::default()));
        assert_eq!(page.total, 1);

        assert_ok!(delete_mapping(&s.tenant.store, &s.editor, created.id));
        let err = assert_err!(delete_mapping(&s.tenant.store, &s.editor, created.id));
        assert_eq!(err.error_code(), "NOT_FOUND");
    }
}
