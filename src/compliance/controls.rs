use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use uuid::Uuid;

use super::types::{Control, ControlCategory, ControlStatus};
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::metadata;
use crate::core::pagination::{ListSpec, Page, PageParams, SortOrder};
use crate::directory::ensure_active_member;
use crate::security::audit::AuditEvent;
use crate::security::auth::{AuthenticatedUser, COMPLIANCE_EDITORS};
use crate::security::validation::Validator;
use crate::store::{Store, Tables};

const CONTROL_LIST: ListSpec = ListSpec {
    default_per_page: 50,
    max_per_page: 200,
    sort_fields: &["identifier", "title", "status", "created_at", "updated_at"],
    default_sort: "identifier",
    default_order: SortOrder::Asc,
};

const MAX_BULK_CONTROLS: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct ListControlsQuery {
    pub status: Option<String>,
    pub category: Option<String>,
    pub owner_id: Option<String>,
    pub is_custom: Option<String>,
    pub q: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Deserialize)]
pub struct CreateControlRequest {
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: ControlCategory,
    pub owner_id: Option<Uuid>,
    pub secondary_owner_id: Option<Uuid>,
    pub is_custom: Option<bool>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateControlRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<ControlCategory>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ControlStatusRequest {
    pub status: ControlStatus,
}

#[derive(Debug, Deserialize)]
pub struct BulkStatusRequest {
    pub control_ids: Vec<Uuid>,
    pub status: ControlStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkStatusOutcome {
    pub control_id: Uuid,
    pub success: bool,
    pub previous_status: Option<ControlStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkStatusResult {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BulkStatusOutcome>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ControlOwnerRequest {
    pub owner_id: Option<Uuid>,
    pub secondary_owner_id: Option<Uuid>,
    #[serde(default)]
    pub clear_secondary_owner: bool,
}

fn check_owners(owner: Option<Uuid>, secondary: Option<Uuid>) -> Result<(), ApiError> {
    match (owner, secondary) {
        (Some(a), Some(b)) if a == b => Err(ApiError::field(
            "secondary_owner_id",
            "must differ from the primary owner",
        )),
        _ => Ok(()),
    }
}

fn load(tables: &mut Tables, org_id: Uuid, control_id: Uuid) -> Result<Control, ApiError> {
    tables
        .controls()
        .find(org_id, control_id)?
        .ok_or_else(|| ApiError::not_found("Control"))
}

pub fn list_controls(
    store: &Store,
    caller: &AuthenticatedUser,
    query: &ListControlsQuery,
) -> Result<Page<Control>, ApiError> {
    let status: Option<ControlStatus> = parse_filter(&query.status, "status")?;
    let category: Option<ControlCategory> = parse_filter(&query.category, "category")?;
    let owner_id: Option<Uuid> = parse_filter(&query.owner_id, "owner_id")?;
    let is_custom: Option<bool> = parse_filter(&query.is_custom, "is_custom")?;
    let needle = query
        .q
        .as_deref()
        .map(|q| q.trim().to_lowercase())
        .filter(|q| !q.is_empty());

    let controls: Vec<Control> = store
        .read(|tables| tables.controls().scan(caller.org_id))?
        .into_iter()
        .filter(|c| status.map_or(true, |s| c.status == s))
        .filter(|c| category.map_or(true, |cat| c.category == cat))
        .filter(|c| owner_id.map_or(true, |o| c.owner_id == Some(o)))
        .filter(|c| is_custom.map_or(true, |custom| c.is_custom == custom))
        .filter(|c| {
            needle.as_deref().map_or(true, |n| {
                c.identifier.to_lowercase().contains(n) || c.title.to_lowercase().contains(n)
            })
        })
        .collect();

    Ok(query.page.resolve(&CONTROL_LIST).apply(controls, compare_controls))
}

fn compare_controls(a: &Control, b: &Control, sort: &str) -> Ordering {
    match sort {
        "title" => a.title.cmp(&b.title),
        "status" => a.status.as_str().cmp(b.status.as_str()),
        "created_at" => a.created_at.cmp(&b.created_at),
        "updated_at" => a.updated_at.cmp(&b.updated_at),
        _ => a.identifier.cmp(&b.identifier),
    }
}

pub fn get_control(store: &Store, caller: &AuthenticatedUser, control_id: Uuid) -> Result<Control, ApiError> {
    store.read(|tables| load(tables, caller.org_id, control_id))
}

pub fn create_control(
    store: &Store,
    caller: &AuthenticatedUser,
    req: CreateControlRequest,
) -> Result<Control, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;

    let identifier = req.identifier.trim().to_string();
    let title = req.title.trim().to_string();
    Validator::new()
        .identifier(&identifier, "identifier")
        .required(&title, "title")
        .length(&title, "title", None, Some(500))
        .length(&req.description, "description", None, Some(10000))
        .validate()?;
    check_owners(req.owner_id, req.secondary_owner_id)?;
    if let Some(meta) = &req.metadata {
        metadata::check_map(meta, "metadata")?;
    }

    let control = store.transaction(|tables| {
        if let Some(owner) = req.owner_id {
            ensure_active_member(tables, caller.org_id, owner, "owner_id")?;
        }
        if let Some(secondary) = req.secondary_owner_id {
            ensure_active_member(tables, caller.org_id, secondary, "secondary_owner_id")?;
        }

        let mut control = Control::new(caller.org_id, identifier, title, req.category, caller.user_id);
        control.description = req.description.trim().to_string();
        control.owner_id = req.owner_id;
        control.secondary_owner_id = req.secondary_owner_id;
        control.is_custom = req.is_custom.unwrap_or(true);
        if let Some(meta) = req.metadata {
            control.metadata = meta;
        }
        tables
            .controls()
            .insert(control)
            .map_err(|e| ApiError::conflict_or(e, "A control with this identifier already exists"))
    })?;

    AuditEvent::new(caller, "control.created", "control", control.id)
        .with_metadata("identifier", control.identifier.clone())
        .record(store);

    Ok(control)
}

/// The primary owner may update content fields without an editor role.
pub fn update_control(
    store: &Store,
    caller: &AuthenticatedUser,
    control_id: Uuid,
    req: UpdateControlRequest,
) -> Result<Control, ApiError> {
    let mut validator = Validator::new();
    if let Some(title) = &req.title {
        validator = validator
            .required(title, "title")
            .length(title, "title", None, Some(500));
    }
    validator
        .optional_length(req.description.as_deref(), "description", 10000)
        .validate()?;
    if let Some(meta) = &req.metadata {
        metadata::check_map(meta, "metadata")?;
    }

    let control = store.transaction(|tables| {
        let mut control = load(tables, caller.org_id, control_id)?;
        caller.require_or_owner(COMPLIANCE_EDITORS, control.owner_id)?;

        if let Some(title) = req.title {
            control.title = title.trim().to_string();
        }
        if let Some(description) = req.description {
            control.description = description.trim().to_string();
        }
        if let Some(category) = req.category {
            control.category = category;
        }
        if let Some(patch) = req.metadata {
            metadata::merge(&mut control.metadata, patch);
            metadata::check_map(&control.metadata, "metadata")?;
        }
        control.updated_at = Utc::now();
        Ok::<_, ApiError>(tables.controls().update(control)?)
    })?;

    AuditEvent::new(caller, "control.updated", "control", control.id).record(store);
    Ok(control)
}

fn transition(tables: &mut Tables, org_id: Uuid, control_id: Uuid, next: ControlStatus) -> Result<(Control, ControlStatus), ApiError> {
    let mut control = load(tables, org_id, control_id)?;
    let previous = control.status;
    if !previous.can_transition_to(next) {
        return Err(ApiError::invalid_transition("control", previous, next));
    }
    control.status = next;
    control.updated_at = Utc::now();
    Ok((tables.controls().update(control)?, previous))
}

fn status_event(caller: &AuthenticatedUser, control: &Control, previous: ControlStatus) -> AuditEvent {
    let action = if control.status == ControlStatus::Deprecated {
        "control.deprecated"
    } else {
        "control.status_changed"
    };
    AuditEvent::new(caller, action, "control", control.id)
        .with_metadata("from", previous.as_str())
        .with_metadata("to", control.status.as_str())
}

pub fn change_status(
    store: &Store,
    caller: &AuthenticatedUser,
    control_id: Uuid,
    req: ControlStatusRequest,
) -> Result<Control, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;
    let (control, previous) = store.transaction(|tables| transition(tables, caller.org_id, control_id, req.status))?;
    status_event(caller, &control, previous).record(store);
    Ok(control)
}

/// Deprecation keeps the row and its mappings; it is a status change.
pub fn deprecate_control(store: &Store, caller: &AuthenticatedUser, control_id: Uuid) -> Result<Control, ApiError> {
    change_status(
        store,
        caller,
        control_id,
        ControlStatusRequest {
            status: ControlStatus::Deprecated,
        },
    )
}

/// Applies the transition to each control on its own; one failure does not
/// undo the others.
pub fn bulk_change_status(
    store: &Store,
    caller: &AuthenticatedUser,
    req: BulkStatusRequest,
) -> Result<BulkStatusResult, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;
    Validator::new()
        .check(!req.control_ids.is_empty(), "control_ids", "must not be empty")
        .check(
            req.control_ids.len() <= MAX_BULK_CONTROLS,
            "control_ids",
            "must contain at most 100 ids",
        )
        .validate()?;

    let mut results = Vec::with_capacity(req.control_ids.len());
    for control_id in req.control_ids {
        match store.transaction(|tables| transition(tables, caller.org_id, control_id, req.status)) {
            Ok((control, previous)) => {
                status_event(caller, &control, previous)
                    .with_metadata("bulk", true)
                    .record(store);
                results.push(BulkStatusOutcome {
                    control_id,
                    success: true,
                    previous_status: Some(previous),
                    error: None,
                });
            }
            Err(e) => results.push(BulkStatusOutcome {
                control_id,
                success: false,
                previous_status: None,
                error: Some(e.public_message()),
            }),
        }
    }

    let succeeded = results.iter().filter(|r| r.success).count();
    Ok(BulkStatusResult {
        requested: results.len(),
        succeeded,
        failed: results.len() - succeeded,
        results,
    })
}

/// Changing one owner is checked against the current value of the other.
pub fn set_owner(
    store: &Store,
    caller: &AuthenticatedUser,
    control_id: Uuid,
    req: ControlOwnerRequest,
) -> Result<Control, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;
    if req.owner_id.is_none() && req.secondary_owner_id.is_none() && !req.clear_secondary_owner {
        return Err(ApiError::field("owner_id", "owner_id or secondary_owner_id is required"));
    }

    let (control, previous_owner) = store.transaction(|tables| {
        let mut control = load(tables, caller.org_id, control_id)?;
        let previous_owner = control.owner_id;

        if let Some(owner) = req.owner_id {
            ensure_active_member(tables, caller.org_id, owner, "owner_id")?;
            control.owner_id = Some(owner);
        }
        if req.clear_secondary_owner {
            control.secondary_owner_id = None;
        } else if let Some(secondary) = req.secondary_owner_id {
            ensure_active_member(tables, caller.org_id, secondary, "secondary_owner_id")?;
            control.secondary_owner_id = Some(secondary);
        }
        check_owners(control.owner_id, control.secondary_owner_id)?;

        control.updated_at = Utc::now();
        Ok::<_, ApiError>((tables.controls().update(control)?, previous_owner))
    })?;

    let mut event = AuditEvent::new(caller, "control.owner_changed", "control", control.id);
    if let Some(previous) = previous_owner {
        event = event.with_metadata("previous_owner_id", previous.to_string());
    }
    if let Some(owner) = control.owner_id {
        event = event.with_metadata("owner_id", owner.to_string());
    }
    event.record(store);

    Ok(control)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::auth::Role;
    use crate::tests::test_util::{audit_actions, Tenant};
    use crate::{assert_err, assert_ok};
    use serde_json::json;

    fn new_control(identifier: &str) -> CreateControlRequest {
        CreateControlRequest {
            identifier: identifier.into(),
            title: "Quarterly access review".into(),
            description: String::new(),
            category: ControlCategory::Administrative,
            owner_id: None,
            secondary_owner_id: None,
            is_custom: None,
            metadata: None,
        }
    }

    fn status(status: ControlStatus) -> ControlStatusRequest {
        ControlStatusRequest { status }
    }

    #[test]
    fn test_create_starts_in_draft() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::SecurityEngineer);
        let control = assert_ok!(create_control(&tenant.store, &editor, new_control("CTRL-AC-001")));
        assert_eq!(control.status, ControlStatus::Draft);
        assert!(control.is_custom);

        let err = assert_err!(create_control(&tenant.store, &editor, new_control("CTRL-AC-001")));
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[test]
    fn test_identifier_charset() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::Ciso);
        let err = assert_err!(create_control(&tenant.store, &editor, new_control("CTRL AC/1")));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_status_graph_enforced() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::Ciso);
        let control = assert_ok!(create_control(&tenant.store, &editor, new_control("CTRL-1")));

        let err = assert_err!(change_status(&tenant.store, &editor, control.id, status(ControlStatus::UnderReview)));
        assert_eq!(err.error_code(), "UNPROCESSABLE");
        assert!(err.to_string().contains("'draft'"));

        assert_ok!(change_status(&tenant.store, &editor, control.id, status(ControlStatus::Active)));
        let deprecated = assert_ok!(deprecate_control(&tenant.store, &editor, control.id));
        assert_eq!(deprecated.status, ControlStatus::Deprecated);
        let draft = assert_ok!(change_status(&tenant.store, &editor, control.id, status(ControlStatus::Draft)));
        assert_eq!(draft.status, ControlStatus::Draft);

        let actions = audit_actions(&tenant.store, tenant.org_id);
        assert!(actions.contains(&"control.deprecated".to_string()));
    }

    #[test]
    fn test_bulk_reports_each_control() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::ComplianceManager);
        let a = assert_ok!(create_control(&tenant.store, &editor, new_control("CTRL-A")));
        let b = assert_ok!(create_control(&tenant.store, &editor, new_control("CTRL-B")));
        assert_ok!(change_status(&tenant.store, &editor, b.id, status(ControlStatus::Active)));

        let result = assert_ok!(bulk_change_status(
            &tenant.store,
            &editor,
            BulkStatusRequest {
                control_ids: vec![a.id, b.id, Uuid::new_v4()],
                status: ControlStatus::Active,
            }
        ));
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 2);
        assert!(result.results[0].success);
        assert_eq!(
            assert_ok!(get_control(&tenant.store, &editor, a.id)).status,
            ControlStatus::Active
        );
    }

    #[test]
    fn test_owner_must_differ_from_current_secondary() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::Ciso);
        let alice = tenant.caller(Role::SecurityEngineer);
        let bob = tenant.caller(Role::SecurityEngineer);
        let mut req = new_control("CTRL-OWN");
        req.owner_id = Some(alice.user_id);
        req.secondary_owner_id = Some(bob.user_id);
        let control = assert_ok!(create_control(&tenant.store, &editor, req));

        let err = assert_err!(set_owner(
            &tenant.store,
            &editor,
            control.id,
            ControlOwnerRequest {
                owner_id: Some(bob.user_id),
                ..ControlOwnerRequest::default()
            }
        ));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let swapped = assert_ok!(set_owner(
            &tenant.store,
            &editor,
            control.id,
            ControlOwnerRequest {
                owner_id: Some(bob.user_id),
                clear_secondary_owner: true,
                ..ControlOwnerRequest::default()
            }
        ));
        assert_eq!(swapped.owner_id, Some(bob.user_id));
        assert_eq!(swapped.secondary_owner_id, None);
    }

    #[test]
    fn test_owner_may_update_and_metadata_merges() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::Ciso);
        let owner = tenant.caller(Role::Viewer);
        let mut req = new_control("CTRL-META");
        req.owner_id = Some(owner.user_id);
        req.metadata = Some(json!({"system": "okta"}));
        let control = assert_ok!(create_control(&tenant.store, &editor, req));

        let updated = assert_ok!(update_control(
            &tenant.store,
            &owner,
            control.id,
            UpdateControlRequest {
                metadata: Some(json!({"evidence": "quarterly"})),
                ..UpdateControlRequest::default()
            }
        ));
        assert_eq!(updated.metadata, json!({"system": "okta", "evidence": "quarterly"}));

        let stranger = tenant.caller(Role::Viewer);
        let err = assert_err!(update_control(&tenant.store, &stranger, control.id, UpdateControlRequest::default()));
        assert_eq!(err.error_code(), "FORBIDDEN");
    }

    #[test]
    fn test_search_and_filters() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::Ciso);
        assert_ok!(create_control(&tenant.store, &editor, new_control("CTRL-AC-001")));
        let mut other = new_control("CTRL-NET-001");
        other.title = "Firewall rule review".into();
        other.category = ControlCategory::Technical;
        assert_ok!(create_control(&tenant.store, &editor, other));

        let query = ListControlsQuery {
            q: Some("firewall".into()),
            ..ListControlsQuery::default()
        };
        let page = assert_ok!(list_controls(&tenant.store, &editor, &query));
        assert_eq!(page.total, 1);

        let query = ListControlsQuery {
            category: Some("physical".into()),
            ..ListControlsQuery::default()
        };
        assert_eq!(assert_ok!(list_controls(&tenant.store, &editor, &query)).total, 0);
    }
}
