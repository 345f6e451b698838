use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::scoring::{score, severity_for, RiskView};
use super::types::{AssessmentType, Impact, Likelihood, Risk, RiskAssessment, RiskStatus};
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::pagination::{ListSpec, Page, PageParams, SortOrder};
use crate::security::audit::AuditEvent;
use crate::security::auth::{AuthenticatedUser, COMPLIANCE_EDITORS};
use crate::security::validation::Validator;
use crate::store::{Store, Tables};

const ASSESSMENT_LIST: ListSpec = ListSpec {
    default_per_page: 20,
    max_per_page: 100,
    sort_fields: &["assessed_on", "created_at", "score"],
    default_sort: "created_at",
    default_order: SortOrder::Desc,
};

const MAX_DATA_SOURCES: usize = 20;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScoreInput {
    pub likelihood: Likelihood,
    pub impact: Impact,
}

#[derive(Debug, Deserialize)]
pub struct CreateAssessmentRequest {
    pub assessment_type: AssessmentType,
    pub likelihood: Likelihood,
    pub impact: Impact,
    pub assessed_on: Option<NaiveDate>,
    pub justification: String,
    pub assumptions: Option<String>,
    #[serde(default)]
    pub data_sources: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListAssessmentsQuery {
    pub assessment_type: Option<String>,
    pub is_current: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssessmentOutcome {
    pub assessment: RiskAssessment,
    pub risk: RiskView,
}

impl CreateAssessmentRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        let today = Utc::now().date_naive();
        Validator::new()
            .required(&self.justification, "justification")
            .length(&self.justification, "justification", None, Some(5000))
            .optional_length(self.assumptions.as_deref(), "assumptions", 5000)
            .check(
                self.data_sources.len() <= MAX_DATA_SOURCES,
                "data_sources",
                "must contain at most 20 entries",
            )
            .check(
                self.assessed_on.map_or(true, |d| d <= today),
                "assessed_on",
                "must not be in the future",
            )
            .validate()
    }

    pub fn initial(assessment_type: AssessmentType, input: ScoreInput) -> Self {
        Self {
            assessment_type,
            likelihood: input.likelihood,
            impact: input.impact,
            assessed_on: None,
            justification: "Initial assessment".into(),
            assumptions: None,
            data_sources: Vec::new(),
        }
    }
}

/// Records a new current assessment, superseding the previous current one
/// of the same type, and copies its scores onto `risk`. The caller writes
/// `risk` back.
pub(super) fn record_assessment(
    tables: &mut Tables,
    risk: &mut Risk,
    assessor_id: Uuid,
    req: CreateAssessmentRequest,
) -> Result<RiskAssessment, ApiError> {
    let previous = tables
        .risk_assessments()
        .of_risk(risk.id)?
        .into_iter()
        .find(|a| a.assessment_type == req.assessment_type && a.is_current);
    if let Some(previous) = &previous {
        let mut retired = previous.clone();
        retired.is_current = false;
        tables.risk_assessments().update(retired)?;
    }

    let assessed_on = req.assessed_on.unwrap_or_else(|| Utc::now().date_naive());
    let value = score(req.likelihood, req.impact);
    let assessment = tables.risk_assessments().insert(RiskAssessment {
        id: Uuid::new_v4(),
        org_id: risk.org_id,
        risk_id: risk.id,
        assessment_type: req.assessment_type,
        likelihood: req.likelihood,
        impact: req.impact,
        score: value,
        severity: severity_for(value),
        is_current: true,
        supersedes_id: previous.as_ref().map(|p| p.id),
        superseded_by_id: None,
        assessed_on,
        justification: req.justification.trim().to_string(),
        assumptions: req.assumptions,
        data_sources: req.data_sources,
        assessor_id,
        created_at: Utc::now(),
    })?;

    if let Some(mut previous) = previous {
        previous.is_current = false;
        previous.superseded_by_id = Some(assessment.id);
        tables.risk_assessments().update(previous)?;
    }

    match assessment.assessment_type {
        AssessmentType::Inherent => {
            risk.inherent_likelihood = Some(assessment.likelihood);
            risk.inherent_impact = Some(assessment.impact);
            risk.inherent_score = Some(assessment.score);
        }
        AssessmentType::Residual => {
            risk.residual_likelihood = Some(assessment.likelihood);
            risk.residual_impact = Some(assessment.impact);
            risk.residual_score = Some(assessment.score);
        }
    }
    risk.last_assessed_at = Some(assessed_on);
    risk.next_assessment_at = risk
        .assessment_frequency_days
        .and_then(|days| assessed_on.checked_add_days(Days::new(days.max(0) as u64)));
    risk.updated_at = Utc::now();

    Ok(assessment)
}

pub fn list_assessments(
    store: &Store,
    caller: &AuthenticatedUser,
    risk_id: Uuid,
    query: &ListAssessmentsQuery,
) -> Result<Page<RiskAssessment>, ApiError> {
    let assessment_type: Option<AssessmentType> = parse_filter(&query.assessment_type, "assessment_type")?;
    let is_current: Option<bool> = parse_filter(&query.is_current, "is_current")?;

    let assessments = store.read(|tables| {
        tables
            .risks()
            .find(caller.org_id, risk_id)?
            .ok_or_else(|| ApiError::not_found("Risk"))?;
        Ok::<_, ApiError>(
            tables
                .risk_assessments()
                .of_risk(risk_id)?
                .into_iter()
                .filter(|a| assessment_type.map_or(true, |t| a.assessment_type == t))
                .filter(|a| is_current.map_or(true, |c| a.is_current == c))
                .collect::<Vec<_>>(),
        )
    })?;

    Ok(query
        .page
        .resolve(&ASSESSMENT_LIST)
        .apply(assessments, |a, b, sort| match sort {
            "assessed_on" => a.assessed_on.cmp(&b.assessed_on),
            "score" => a.score.cmp(&b.score),
            _ => a.created_at.cmp(&b.created_at),
        }))
}

pub fn create_assessment(
    store: &Store,
    caller: &AuthenticatedUser,
    risk_id: Uuid,
    req: CreateAssessmentRequest,
) -> Result<AssessmentOutcome, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;
    req.validate()?;

    let (assessment, risk) = store.transaction(|tables| {
        let mut risk = tables
            .risks()
            .find(caller.org_id, risk_id)?
            .ok_or_else(|| ApiError::not_found("Risk"))?;
        if risk.status == RiskStatus::Archived {
            return Err(ApiError::Unprocessable("Archived risks cannot be assessed".into()));
        }
        let assessment = record_assessment(tables, &mut risk, caller.user_id, req)?;
        let risk = tables.risks().update(risk)?;
        Ok((assessment, risk))
    })?;

    let mut event = AuditEvent::new(caller, "risk_assessment.created", "risk", risk.id)
        .with_metadata("assessment_id", assessment.id.to_string())
        .with_metadata("assessment_type", assessment.assessment_type.as_str())
        .with_metadata("score", assessment.score);
    if let Some(previous) = assessment.supersedes_id {
        event = event.with_metadata("supersedes_id", previous.to_string());
    }
    event.record(store);

    Ok(AssessmentOutcome {
        assessment,
        risk: RiskView::new(risk),
    })
}
