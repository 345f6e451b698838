use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::risks::{apply_status, load as load_risk};
use super::scoring::score;
use super::types::{
    Effectiveness, Impact, Likelihood, Risk, RiskStatus, RiskTreatment, TreatmentStatus, TreatmentType,
};
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::pagination::{cmp_option, ListSpec, Page, PageParams, SortOrder};
use crate::directory::ensure_active_member;
use crate::security::audit::{record_all, AuditEvent};
use crate::security::auth::{AuthenticatedUser, COMPLIANCE_EDITORS};
use crate::security::validation::Validator;
use crate::store::{Store, Tables};

const TREATMENT_LIST: ListSpec = ListSpec {
    default_per_page: 20,
    max_per_page: 100,
    sort_fields: &["created_at", "due_date", "status"],
    default_sort: "created_at",
    default_order: SortOrder::Desc,
};

#[derive(Debug, Deserialize)]
pub struct CreateTreatmentRequest {
    pub treatment_type: TreatmentType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub owner_id: Option<Uuid>,
    pub target_control_id: Option<Uuid>,
    pub due_date: Option<NaiveDate>,
    pub expected_residual_likelihood: Option<Likelihood>,
    pub expected_residual_impact: Option<Impact>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateTreatmentRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub owner_id: Option<Uuid>,
    pub target_control_id: Option<Uuid>,
    pub due_date: Option<NaiveDate>,
    pub expected_residual_likelihood: Option<Likelihood>,
    pub expected_residual_impact: Option<Impact>,
}

#[derive(Debug, Deserialize)]
pub struct TreatmentStatusRequest {
    pub status: TreatmentStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteTreatmentRequest {
    pub effectiveness: Option<Effectiveness>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTreatmentsQuery {
    pub status: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

/// Treatment owners and the risk owner act on treatments without an editor role.
fn authorize(caller: &AuthenticatedUser, risk: &Risk, treatment_owner: Option<Uuid>) -> Result<(), ApiError> {
    if treatment_owner == Some(caller.user_id) {
        return Ok(());
    }
    caller.require_or_owner(COMPLIANCE_EDITORS, risk.owner_id)
}

fn load(tables: &mut Tables, org_id: Uuid, treatment_id: Uuid) -> Result<RiskTreatment, ApiError> {
    tables
        .risk_treatments()
        .find(org_id, treatment_id)?
        .ok_or_else(|| ApiError::not_found("Risk treatment"))
}

fn check_expected(likelihood: Option<Likelihood>, impact: Option<Impact>) -> Result<Option<i32>, ApiError> {
    match (likelihood, impact) {
        (Some(l), Some(i)) => Ok(Some(score(l, i))),
        (None, None) => Ok(None),
        _ => Err(ApiError::field(
            "expected_residual_impact",
            "expected residual likelihood and impact must be given together",
        )),
    }
}

fn check_target(tables: &mut Tables, org_id: Uuid, control_id: Option<Uuid>) -> Result<(), ApiError> {
    match control_id {
        Some(id) if tables.controls().find(org_id, id)?.is_none() => Err(ApiError::field(
            "target_control_id",
            "control does not exist in this organization",
        )),
        _ => Ok(()),
    }
}

/// A treating risk with nothing left in flight moves to monitoring.
/// Returns the status it left, if it moved.
fn settle_risk(tables: &mut Tables, org_id: Uuid, risk_id: Uuid) -> Result<Option<RiskStatus>, ApiError> {
    let mut risk = load_risk(tables, org_id, risk_id)?;
    if risk.status != RiskStatus::Treating {
        return Ok(None);
    }
    let pending = tables
        .risk_treatments()
        .of_risk(risk_id)?
        .into_iter()
        .any(|t| t.status.is_pending());
    if pending {
        return Ok(None);
    }
    let previous = apply_status(&mut risk, RiskStatus::Monitoring)?;
    tables.risks().update(risk)?;
    Ok(Some(previous))
}

fn automatic_event(caller: &AuthenticatedUser, risk_id: Uuid, from: RiskStatus, to: RiskStatus, trigger: &str) -> AuditEvent {
    AuditEvent::new(caller, "risk.status_changed", "risk", risk_id)
        .with_metadata("from", from.as_str())
        .with_metadata("to", to.as_str())
        .with_metadata("trigger", trigger)
}

pub fn list_treatments(
    store: &Store,
    caller: &AuthenticatedUser,
    risk_id: Uuid,
    query: &ListTreatmentsQuery,
) -> Result<Page<RiskTreatment>, ApiError> {
    let status: Option<TreatmentStatus> = parse_filter(&query.status, "status")?;
    let treatments = store.read(|tables| {
        load_risk(tables, caller.org_id, risk_id)?;
        Ok::<_, ApiError>(
            tables
                .risk_treatments()
                .of_risk(risk_id)?
                .into_iter()
                .filter(|t| status.map_or(true, |s| t.status == s))
                .collect::<Vec<_>>(),
        )
    })?;

    Ok(query
        .page
        .resolve(&TREATMENT_LIST)
        .apply(treatments, |a, b, sort| match sort {
            "due_date" => cmp_option(&a.due_date, &b.due_date),
            "status" => a.status.as_str().cmp(b.status.as_str()),
            _ => a.created_at.cmp(&b.created_at),
        }))
}

/// The first treatment of an `identified` or `open` risk moves it to `treating`.
pub fn create_treatment(
    store: &Store,
    caller: &AuthenticatedUser,
    risk_id: Uuid,
    req: CreateTreatmentRequest,
) -> Result<RiskTreatment, ApiError> {
    let title = req.title.trim().to_string();
    Validator::new()
        .required(&title, "title")
        .length(&title, "title", None, Some(500))
        .length(&req.description, "description", None, Some(10000))
        .validate()?;
    let expected_score = check_expected(req.expected_residual_likelihood, req.expected_residual_impact)?;

    let (treatment, moved) = store.transaction(|tables| {
        let mut risk = load_risk(tables, caller.org_id, risk_id)?;
        authorize(caller, &risk, None)?;
        if matches!(risk.status, RiskStatus::Archived | RiskStatus::Closed) {
            return Err(ApiError::Unprocessable(format!(
                "Treatments cannot be added to a {} risk",
                risk.status
            )));
        }
        if let Some(owner) = req.owner_id {
            ensure_active_member(tables, caller.org_id, owner, "owner_id")?;
        }
        check_target(tables, caller.org_id, req.target_control_id)?;

        let now = Utc::now();
        let treatment = tables.risk_treatments().insert(RiskTreatment {
            id: Uuid::new_v4(),
            org_id: caller.org_id,
            risk_id,
            treatment_type: req.treatment_type,
            title,
            description: req.description.trim().to_string(),
            status: TreatmentStatus::Planned,
            owner_id: req.owner_id,
            target_control_id: req.target_control_id,
            due_date: req.due_date,
            expected_residual_likelihood: req.expected_residual_likelihood,
            expected_residual_impact: req.expected_residual_impact,
            expected_residual_score: expected_score,
            effectiveness: None,
            completion_notes: None,
            completed_at: None,
            created_by: caller.user_id,
            created_at: now,
            updated_at: now,
        })?;

        let moved = if matches!(risk.status, RiskStatus::Identified | RiskStatus::Open) {
            let previous = apply_status(&mut risk, RiskStatus::Treating)?;
            tables.risks().update(risk)?;
            Some(previous)
        } else {
            None
        };
        Ok((treatment, moved))
    })?;

    let mut events = vec![AuditEvent::new(caller, "risk_treatment.created", "risk_treatment", treatment.id)
        .with_metadata("risk_id", risk_id.to_string())
        .with_metadata("treatment_type", treatment.treatment_type.as_str())];
    if let Some(previous) = moved {
        events.push(automatic_event(caller, risk_id, previous, RiskStatus::Treating, "treatment_created"));
    }
    record_all(store, events);

    Ok(treatment)
}

pub fn update_treatment(
    store: &Store,
    caller: &AuthenticatedUser,
    treatment_id: Uuid,
    req: UpdateTreatmentRequest,
) -> Result<RiskTreatment, ApiError> {
    let mut validator = Validator::new();
    if let Some(title) = &req.title {
        validator = validator.required(title, "title").length(title, "title", None, Some(500));
    }
    validator
        .optional_length(req.description.as_deref(), "description", 10000)
        .validate()?;

    let treatment = store.transaction(|tables| {
        let mut treatment = load(tables, caller.org_id, treatment_id)?;
        let risk = load_risk(tables, caller.org_id, treatment.risk_id)?;
        authorize(caller, &risk, treatment.owner_id)?;
        if matches!(treatment.status, TreatmentStatus::Verified | TreatmentStatus::Cancelled) {
            return Err(ApiError::Unprocessable(format!(
                "A {} treatment cannot be modified",
                treatment.status
            )));
        }

        if let Some(owner) = req.owner_id {
            ensure_active_member(tables, caller.org_id, owner, "owner_id")?;
            treatment.owner_id = Some(owner);
        }
        if req.target_control_id.is_some() {
            check_target(tables, caller.org_id, req.target_control_id)?;
            treatment.target_control_id = req.target_control_id;
        }
        if let Some(title) = req.title {
            treatment.title = title.trim().to_string();
        }
        if let Some(description) = req.description {
            treatment.description = description.trim().to_string();
        }
        if let Some(due) = req.due_date {
            treatment.due_date = Some(due);
        }
        if req.expected_residual_likelihood.is_some() || req.expected_residual_impact.is_some() {
            treatment.expected_residual_score =
                check_expected(req.expected_residual_likelihood, req.expected_residual_impact)?;
            treatment.expected_residual_likelihood = req.expected_residual_likelihood;
            treatment.expected_residual_impact = req.expected_residual_impact;
        }
        treatment.updated_at = Utc::now();
        Ok(tables.risk_treatments().update(treatment)?)
    })?;

    AuditEvent::new(caller, "risk_treatment.updated", "risk_treatment", treatment.id).record(store);
    Ok(treatment)
}

fn transition(
    tables: &mut Tables,
    caller: &AuthenticatedUser,
    treatment_id: Uuid,
    next: TreatmentStatus,
    completion: Option<CompleteTreatmentRequest>,
) -> Result<(RiskTreatment, TreatmentStatus, Option<RiskStatus>), ApiError> {
    let mut treatment = load(tables, caller.org_id, treatment_id)?;
    let risk = load_risk(tables, caller.org_id, treatment.risk_id)?;
    authorize(caller, &risk, treatment.owner_id)?;

    let previous = treatment.status;
    if !previous.can_transition_to(next) {
        return Err(ApiError::invalid_transition("treatment", previous, next));
    }
    treatment.status = next;
    let now = Utc::now();
    let completed = matches!(next, TreatmentStatus::Implemented | TreatmentStatus::Verified);
    if completed {
        treatment.completed_at = Some(now);
    }
    if let Some(completion) = completion {
        treatment.effectiveness = completion.effectiveness;
        treatment.completion_notes = completion.notes;
    }
    treatment.updated_at = now;
    let treatment = tables.risk_treatments().update(treatment)?;

    // Cancelled or ineffective work leaves the risk untreated.
    let moved = if completed {
        settle_risk(tables, caller.org_id, treatment.risk_id)?
    } else {
        None
    };
    Ok((treatment, previous, moved))
}

fn transition_events(
    caller: &AuthenticatedUser,
    action: &str,
    treatment: &RiskTreatment,
    previous: TreatmentStatus,
    moved: Option<RiskStatus>,
) -> Vec<AuditEvent> {
    let mut events = vec![AuditEvent::new(caller, action, "risk_treatment", treatment.id)
        .with_metadata("risk_id", treatment.risk_id.to_string())
        .with_metadata("from", previous.as_str())
        .with_metadata("to", treatment.status.as_str())];
    if let Some(from) = moved {
        events.push(automatic_event(
            caller,
            treatment.risk_id,
            from,
            RiskStatus::Monitoring,
            "treatment_completed",
        ));
    }
    events
}

pub fn change_treatment_status(
    store: &Store,
    caller: &AuthenticatedUser,
    treatment_id: Uuid,
    req: TreatmentStatusRequest,
) -> Result<RiskTreatment, ApiError> {
    let (treatment, previous, moved) =
        store.transaction(|tables| transition(tables, caller, treatment_id, req.status, None))?;
    record_all(
        store,
        transition_events(caller, "risk_treatment.status_changed", &treatment, previous, moved),
    );
    Ok(treatment)
}

/// Only in-progress treatments complete: `verified` when an effectiveness
/// rating is supplied, `implemented` otherwise.
pub fn complete_treatment(
    store: &Store,
    caller: &AuthenticatedUser,
    treatment_id: Uuid,
    req: CompleteTreatmentRequest,
) -> Result<RiskTreatment, ApiError> {
    Validator::new()
        .optional_length(req.notes.as_deref(), "notes", 5000)
        .validate()?;
    let next = if req.effectiveness.is_some() {
        TreatmentStatus::Verified
    } else {
        TreatmentStatus::Implemented
    };

    let (treatment, previous, moved) = store.transaction(|tables| {
        let current = load(tables, caller.org_id, treatment_id)?;
        if current.status != TreatmentStatus::InProgress {
            return Err(ApiError::Unprocessable(format!(
                "Only in_progress treatments can be completed (current status '{}')",
                current.status
            )));
        }
        transition(tables, caller, treatment_id, next, Some(req))
    })?;

    record_all(
        store,
        transition_events(caller, "risk_treatment.completed", &treatment, previous, moved),
    );
    Ok(treatment)
}
