use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use std::cmp::Ordering;
use uuid::Uuid;

use super::assessments::{record_assessment, CreateAssessmentRequest, ScoreInput};
use super::scoring::RiskView;
use super::types::{AssessmentType, Risk, RiskCategory, RiskStatus, TreatmentStatus};
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::pagination::{cmp_option, ListSpec, Page, PageParams, SortOrder};
use crate::core::severity::Severity;
use crate::directory::ensure_active_member;
use crate::security::audit::{record_all, AuditEvent};
use crate::security::auth::{AuthenticatedUser, COMPLIANCE_EDITORS, RISK_APPROVERS};
use crate::security::validation::Validator;
use crate::store::{Store, Tables};

const RISK_LIST: ListSpec = ListSpec {
    default_per_page: 50,
    max_per_page: 200,
    sort_fields: &["identifier", "title", "status", "inherent_score", "residual_score", "created_at"],
    default_sort: "created_at",
    default_order: SortOrder::Desc,
};

const MAX_TAGS: usize = 20;
const MAX_ASSETS: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct ListRisksQuery {
    pub status: Option<String>,
    pub category: Option<String>,
    pub owner_id: Option<String>,
    pub severity: Option<String>,
    pub appetite_breached: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Default, Deserialize)]
pub struct InitialAssessment {
    pub inherent: Option<ScoreInput>,
    pub residual: Option<ScoreInput>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRiskRequest {
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: RiskCategory,
    pub owner_id: Option<Uuid>,
    pub secondary_owner_id: Option<Uuid>,
    pub appetite_threshold: Option<i32>,
    pub assessment_frequency_days: Option<i32>,
    pub source: Option<String>,
    #[serde(default)]
    pub affected_assets: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_template: bool,
    pub initial_assessment: Option<InitialAssessment>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRiskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<RiskCategory>,
    pub owner_id: Option<Uuid>,
    pub secondary_owner_id: Option<Uuid>,
    pub appetite_threshold: Option<i32>,
    pub assessment_frequency_days: Option<i32>,
    pub source: Option<String>,
    pub affected_assets: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct RiskStatusRequest {
    pub status: RiskStatus,
    pub justification: Option<String>,
    pub acceptance_expiry: Option<NaiveDate>,
}

pub(super) fn load(tables: &mut Tables, org_id: Uuid, risk_id: Uuid) -> Result<Risk, ApiError> {
    tables
        .risks()
        .find(org_id, risk_id)?
        .ok_or_else(|| ApiError::not_found("Risk"))
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

fn check_lists(validator: Validator, assets: Option<&[String]>, tags: Option<&[String]>) -> Validator {
    validator
        .check(
            assets.map_or(true, |a| a.len() <= MAX_ASSETS),
            "affected_assets",
            "must contain at most 50 entries",
        )
        .check(
            tags.map_or(true, |t| t.len() <= MAX_TAGS),
            "tags",
            "must contain at most 20 tags",
        )
}

pub fn list_risks(store: &Store, caller: &AuthenticatedUser, query: &ListRisksQuery) -> Result<Page<RiskView>, ApiError> {
    let status: Option<RiskStatus> = parse_filter(&query.status, "status")?;
    let category: Option<RiskCategory> = parse_filter(&query.category, "category")?;
    let owner_id: Option<Uuid> = parse_filter(&query.owner_id, "owner_id")?;
    let severity: Option<Severity> = parse_filter(&query.severity, "severity")?;
    let breached: Option<bool> = parse_filter(&query.appetite_breached, "appetite_breached")?;

    let risks: Vec<RiskView> = store
        .read(|tables| tables.risks().scan(caller.org_id))?
        .into_iter()
        .filter(|r| status.map_or(true, |s| r.status == s))
        .filter(|r| category.map_or(true, |c| r.category == c))
        .filter(|r| owner_id.map_or(true, |o| r.owner_id == Some(o)))
        .map(RiskView::new)
        .filter(|v| severity.map_or(true, |s| v.effective_severity() == Some(s)))
        .filter(|v| breached.map_or(true, |b| v.appetite_breached == b))
        .collect();

    Ok(query.page.resolve(&RISK_LIST).apply(risks, compare_risks))
}

fn compare_risks(a: &RiskView, b: &RiskView, sort: &str) -> Ordering {
    let (a, b) = (&a.risk, &b.risk);
    match sort {
        "identifier" => a.identifier.cmp(&b.identifier),
        "title" => a.title.cmp(&b.title),
        "status" => a.status.as_str().cmp(b.status.as_str()),
        "inherent_score" => cmp_option(&a.inherent_score, &b.inherent_score),
        "residual_score" => cmp_option(&a.residual_score, &b.residual_score),
        _ => a.created_at.cmp(&b.created_at),
    }
}

pub fn get_risk(store: &Store, caller: &AuthenticatedUser, risk_id: Uuid) -> Result<RiskView, ApiError> {
    store
        .read(|tables| load(tables, caller.org_id, risk_id))
        .map(RiskView::new)
}

pub fn create_risk(store: &Store, caller: &AuthenticatedUser, req: CreateRiskRequest) -> Result<RiskView, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;

    let identifier = req.identifier.trim().to_string();
    let title = req.title.trim().to_string();
    let validator = Validator::new()
        .identifier(&identifier, "identifier")
        .required(&title, "title")
        .length(&title, "title", None, Some(500))
        .length(&req.description, "description", None, Some(10000))
        .optional_range(req.appetite_threshold, "appetite_threshold", 1, 25)
        .optional_range(req.assessment_frequency_days, "assessment_frequency_days", 1, 3650)
        .optional_length(req.source.as_deref(), "source", 255);
    check_lists(validator, Some(&req.affected_assets), Some(&req.tags)).validate()?;
    check_owners(req.owner_id, req.secondary_owner_id)?;

    let initial = req.initial_assessment.unwrap_or_default();
    let (risk, assessments) = store.transaction(|tables| {
        if let Some(owner) = req.owner_id {
            ensure_active_member(tables, caller.org_id, owner, "owner_id")?;
        }
        if let Some(secondary) = req.secondary_owner_id {
            ensure_active_member(tables, caller.org_id, secondary, "secondary_owner_id")?;
        }

        let mut risk = Risk::new(caller.org_id, identifier, title, req.category, caller.user_id);
        risk.description = req.description.trim().to_string();
        risk.owner_id = req.owner_id;
        risk.secondary_owner_id = req.secondary_owner_id;
        risk.appetite_threshold = req.appetite_threshold;
        risk.assessment_frequency_days = req.assessment_frequency_days;
        risk.source = req.source;
        risk.affected_assets = req.affected_assets;
        risk.tags = req.tags;
        risk.is_template = req.is_template;
        tables
            .risks()
            .insert(risk.clone())
            .map_err(|e| ApiError::conflict_or(e, "A risk with this identifier already exists"))?;

        let mut assessments = Vec::new();
        for (kind, input) in [
            (AssessmentType::Inherent, initial.inherent),
            (AssessmentType::Residual, initial.residual),
        ] {
            if let Some(input) = input {
                let req = CreateAssessmentRequest::initial(kind, input);
                assessments.push(record_assessment(tables, &mut risk, caller.user_id, req)?);
            }
        }
        let risk = tables.risks().update(risk)?;
        Ok::<_, ApiError>((risk, assessments))
    })?;

    let mut events = vec![AuditEvent::new(caller, "risk.created", "risk", risk.id)
        .with_metadata("identifier", risk.identifier.clone())];
    events.extend(assessments.iter().map(|a| {
        AuditEvent::new(caller, "risk_assessment.created", "risk", risk.id)
            .with_metadata("assessment_id", a.id.to_string())
            .with_metadata("assessment_type", a.assessment_type.as_str())
            .with_metadata("score", a.score)
    }));
    record_all(store, events);

    Ok(RiskView::new(risk))
}

/// The primary owner may update their own risk without an editor role.
pub fn update_risk(
    store: &Store,
    caller: &AuthenticatedUser,
    risk_id: Uuid,
    req: UpdateRiskRequest,
) -> Result<RiskView, ApiError> {
    let mut validator = Validator::new();
    if let Some(title) = &req.title {
        validator = validator.required(title, "title").length(title, "title", None, Some(500));
    }
    let validator = validator
        .optional_length(req.description.as_deref(), "description", 10000)
        .optional_range(req.appetite_threshold, "appetite_threshold", 1, 25)
        .optional_range(req.assessment_frequency_days, "assessment_frequency_days", 1, 3650)
        .optional_length(req.source.as_deref(), "source", 255);
    check_lists(validator, req.affected_assets.as_deref(), req.tags.as_deref()).validate()?;

    let risk = store.transaction(|tables| {
        let mut risk = load(tables, caller.org_id, risk_id)?;
        caller.require_or_owner(COMPLIANCE_EDITORS, risk.owner_id)?;
        if risk.status == RiskStatus::Archived {
            return Err(ApiError::Unprocessable("Archived risks cannot be modified".into()));
        }

        if let Some(owner) = req.owner_id {
            ensure_active_member(tables, caller.org_id, owner, "owner_id")?;
            risk.owner_id = Some(owner);
        }
        if let Some(secondary) = req.secondary_owner_id {
            ensure_active_member(tables, caller.org_id, secondary, "secondary_owner_id")?;
            risk.secondary_owner_id = Some(secondary);
        }
        check_owners(risk.owner_id, risk.secondary_owner_id)?;

        if let Some(title) = req.title {
            risk.title = title.trim().to_string();
        }
        if let Some(description) = req.description {
            risk.description = description.trim().to_string();
        }
        if let Some(category) = req.category {
            risk.category = category;
        }
        if let Some(threshold) = req.appetite_threshold {
            risk.appetite_threshold = Some(threshold);
        }
        if let Some(days) = req.assessment_frequency_days {
            risk.assessment_frequency_days = Some(days);
        }
        if let Some(source) = req.source {
            risk.source = Some(source);
        }
        if let Some(assets) = req.affected_assets {
            risk.affected_assets = assets;
        }
        if let Some(tags) = req.tags {
            risk.tags = tags;
        }
        risk.updated_at = Utc::now();
        Ok(tables.risks().update(risk)?)
    })?;

    AuditEvent::new(caller, "risk.updated", "risk", risk.id).record(store);
    Ok(RiskView::new(risk))
}

/// Moves a risk along the status graph inside a transaction. Acceptance
/// fields are cleared whenever the risk leaves `accepted`.
pub(super) fn apply_status(risk: &mut Risk, next: RiskStatus) -> Result<RiskStatus, ApiError> {
    let previous = risk.status;
    if !previous.can_transition_to(next) {
        return Err(ApiError::invalid_transition("risk", previous, next));
    }
    if previous == RiskStatus::Accepted {
        risk.clear_acceptance();
    }
    risk.status = next;
    risk.updated_at = Utc::now();
    Ok(previous)
}

pub fn change_status(
    store: &Store,
    caller: &AuthenticatedUser,
    risk_id: Uuid,
    req: RiskStatusRequest,
) -> Result<RiskView, ApiError> {
    let next = req.status;
    let justification = req
        .justification
        .as_deref()
        .map(str::trim)
        .filter(|j| !j.is_empty())
        .map(String::from);

    if matches!(next, RiskStatus::Accepted | RiskStatus::Archived) {
        caller.require(RISK_APPROVERS)?;
    }
    if next == RiskStatus::Accepted {
        let today = Utc::now().date_naive();
        Validator::new()
            .check(justification.is_some(), "justification", "is required to accept a risk")
            .optional_length(justification.as_deref(), "justification", 5000)
            .check(
                req.acceptance_expiry.is_some(),
                "acceptance_expiry",
                "is required to accept a risk",
            )
            .check(
                req.acceptance_expiry.map_or(true, |d| d > today),
                "acceptance_expiry",
                "must be after today",
            )
            .validate()?;
    }

    let (risk, previous, cancelled) = store.transaction(|tables| {
        let mut risk = load(tables, caller.org_id, risk_id)?;
        caller.require_or_owner(COMPLIANCE_EDITORS, risk.owner_id)?;
        let previous = apply_status(&mut risk, next)?;

        if next == RiskStatus::Accepted {
            risk.accepted_at = Some(Utc::now());
            risk.accepted_by = Some(caller.user_id);
            risk.acceptance_justification = justification;
            risk.acceptance_expiry = req.acceptance_expiry;
        }

        let mut cancelled = 0;
        if next == RiskStatus::Archived {
            let open: Vec<_> = tables
                .risk_treatments()
                .of_risk(risk.id)?
                .into_iter()
                .filter(|t| matches!(t.status, TreatmentStatus::Planned | TreatmentStatus::InProgress))
                .collect();
            for mut treatment in open {
                treatment.status = TreatmentStatus::Cancelled;
                treatment.updated_at = Utc::now();
                tables.risk_treatments().update(treatment)?;
                cancelled += 1;
            }
        }

        let risk = tables.risks().update(risk)?;
        Ok::<_, ApiError>((risk, previous, cancelled))
    })?;

    let mut event = AuditEvent::new(caller, "risk.status_changed", "risk", risk.id)
        .with_metadata("from", previous.as_str())
        .with_metadata("to", risk.status.as_str())
        .with_metadata("trigger", "manual");
    if cancelled > 0 {
        event = event.with_metadata("cancelled_treatments", cancelled);
    }
    event.record(store);

    Ok(RiskView::new(risk))
}

pub fn archive_risk(store: &Store, caller: &AuthenticatedUser, risk_id: Uuid) -> Result<RiskView, ApiError> {
    change_status(
        store,
        caller,
        risk_id,
        RiskStatusRequest {
            status: RiskStatus::Archived,
            justification: None,
            acceptance_expiry: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::types::{Impact, Likelihood};
    use crate::security::auth::Role;
    use crate::tests::test_util::{audit_actions, Tenant};
    use crate::{assert_err, assert_ok};
    use chrono::Days;

    fn new_risk(identifier: &str) -> CreateRiskRequest {
        CreateRiskRequest {
            identifier: identifier.into(),
            title: "Ransomware on file servers".into(),
            description: String::new(),
            category: RiskCategory::Security,
            owner_id: None,
            secondary_owner_id: None,
            appetite_threshold: None,
            assessment_frequency_days: None,
            source: None,
            affected_assets: Vec::new(),
            tags: Vec::new(),
            is_template: false,
            initial_assessment: None,
        }
    }

    fn accept(expiry: Option<NaiveDate>, justification: Option<&str>) -> RiskStatusRequest {
        RiskStatusRequest {
            status: RiskStatus::Accepted,
            justification: justification.map(String::from),
            acceptance_expiry: expiry,
        }
    }

    fn next_month() -> Option<NaiveDate> {
        Utc::now().date_naive().checked_add_days(Days::new(30))
    }

    #[test]
    fn test_create_with_initial_inherent_assessment() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::SecurityEngineer);
        let mut req = new_risk("RSK-001");
        req.initial_assessment = Some(InitialAssessment {
            inherent: Some(ScoreInput {
                likelihood: Likelihood::High,
                impact: Impact::Major,
            }),
            residual: None,
        });
        let view = assert_ok!(create_risk(&tenant.store, &editor, req));
        let inherent = view.inherent.expect("inherent summary");
        assert_eq!(inherent.score, 16);
        assert_eq!(inherent.severity, Severity::High);
        assert_eq!(view.risk.status, RiskStatus::Identified);

        let json = serde_json::to_value(&view).expect("serialize");
        assert_eq!(json["inherent"]["score"], 16);
        assert_eq!(json["inherent"]["severity"], "high");
        assert_eq!(json["identifier"], "RSK-001");
        assert_eq!(
            audit_actions(&tenant.store, tenant.org_id),
            vec!["risk.created", "risk_assessment.created"]
        );
    }

    #[test]
    fn test_duplicate_identifier_conflicts() {
        let tenant = Tenant::new();
        let editor = tenant.caller(Role::Ciso);
        assert_ok!(create_risk(&tenant.store, &editor, new_risk("RSK-1")));
        let err = assert_err!(create_risk(&tenant.store, &editor, new_risk("RSK-1")));
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[test]
    fn test_accept_then_leave_clears_acceptance() {
        let tenant = Tenant::new();
        let ciso = tenant.caller(Role::Ciso);
        let risk = assert_ok!(create_risk(&tenant.store, &ciso, new_risk("RSK-2"))).risk;

        let accepted = assert_ok!(change_status(
            &tenant.store,
            &ciso,
            risk.id,
            accept(next_month(), Some("Compensated by insurance"))
        ));
        assert_eq!(accepted.risk.accepted_by, Some(ciso.user_id));
        assert!(accepted.risk.accepted_at.is_some());
        assert_eq!(accepted.risk.acceptance_expiry, next_month());

        let reopened = assert_ok!(change_status(
            &tenant.store,
            &ciso,
            risk.id,
            RiskStatusRequest {
                status: RiskStatus::Open,
                justification: None,
                acceptance_expiry: None,
            }
        ));
        assert!(reopened.risk.accepted_at.is_none());
        assert!(reopened.risk.accepted_by.is_none());
        assert!(reopened.risk.acceptance_justification.is_none());
        assert!(reopened.risk.acceptance_expiry.is_none());
    }

    #[test]
    fn test_accept_requires_approver_and_future_expiry() {
        let tenant = Tenant::new();
        let engineer = tenant.caller(Role::SecurityEngineer);
        let risk = assert_ok!(create_risk(&tenant.store, &engineer, new_risk("RSK-3"))).risk;

        let err = assert_err!(change_status(&tenant.store, &engineer, risk.id, accept(next_month(), Some("ok"))));
        assert_eq!(err.error_code(), "FORBIDDEN");

        let manager = tenant.caller(Role::ComplianceManager);
        let today = Some(Utc::now().date_naive());
        let err = assert_err!(change_status(&tenant.store, &manager, risk.id, accept(today, Some("ok"))));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        let err = assert_err!(change_status(&tenant.store, &manager, risk.id, accept(next_month(), None)));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_invalid_transition_and_archive_is_terminal() {
        let tenant = Tenant::new();
        let ciso = tenant.caller(Role::Ciso);
        let risk = assert_ok!(create_risk(&tenant.store, &ciso, new_risk("RSK-4"))).risk;

        let err = assert_err!(change_status(
            &tenant.store,
            &ciso,
            risk.id,
            RiskStatusRequest {
                status: RiskStatus::Closed,
                justification: None,
                acceptance_expiry: None,
            }
        ));
        assert_eq!(err.error_code(), "UNPROCESSABLE");

        let archived = assert_ok!(archive_risk(&tenant.store, &ciso, risk.id));
        assert_eq!(archived.risk.status, RiskStatus::Archived);
        let err = assert_err!(archive_risk(&tenant.store, &ciso, risk.id));
        assert_eq!(err.error_code(), "UNPROCESSABLE");
    }

    #[test]
    fn test_owner_may_update_without_editor_role() {
        let tenant = Tenant::new();
        let ciso = tenant.caller(Role::Ciso);
        let owner = tenant.caller(Role::Viewer);
        let mut req = new_risk("RSK-5");
        req.owner_id = Some(owner.user_id);
        let risk = assert_ok!(create_risk(&tenant.store, &ciso, req)).risk;

        let updated = assert_ok!(update_risk(
            &tenant.store,
            &owner,
            risk.id,
            UpdateRiskRequest {
                title: Some("Ransomware on NAS".into()),
                ..UpdateRiskRequest::default()
            }
        ));
        assert_eq!(updated.risk.title, "Ransomware on NAS");

        let stranger = tenant.caller(Role::Viewer);
        let err = assert_err!(update_risk(&tenant.store, &stranger, risk.id, UpdateRiskRequest::default()));
        assert_eq!(err.error_code(), "FORBIDDEN");
    }

    #[test]
    fn test_list_filters_by_severity_and_breach() {
        let tenant = Tenant::new();
        let ciso = tenant.caller(Role::Ciso);
        let mut high = new_risk("RSK-H");
        high.appetite_threshold = Some(10);
        high.initial_assessment = Some(InitialAssessment {
            inherent: None,
            residual: Some(ScoreInput {
                likelihood: Likelihood::High,
                impact: Impact::Moderate,
            }),
        });
        assert_ok!(create_risk(&tenant.store, &ciso, high));
        assert_ok!(create_risk(&tenant.store, &ciso, new_risk("RSK-L")));

        let query = ListRisksQuery {
            severity: Some("high".into()),
            ..ListRisksQuery::default()
        };
        let page = assert_ok!(list_risks(&tenant.store, &ciso, &query));
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].risk.identifier, "RSK-H");

        let query = ListRisksQuery {
            appetite_breached: Some("true".into()),
            ..ListRisksQuery::default()
        };
        assert_eq!(assert_ok!(list_risks(&tenant.store, &ciso, &query)).total, 1);
    }
}
