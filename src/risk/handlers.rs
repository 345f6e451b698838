use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use uuid::Uuid;

use super::assessments::{self, AssessmentOutcome, CreateAssessmentRequest, ListAssessmentsQuery};
use super::links::{self, LinkControlRequest, RiskControlView, UpdateLinkRequest};
use super::risks::{self, CreateRiskRequest, ListRisksQuery, RiskStatusRequest, UpdateRiskRequest};
use super::scoring::RiskView;
use super::treatments::{
    self, CompleteTreatmentRequest, CreateTreatmentRequest, ListTreatmentsQuery, TreatmentStatusRequest,
    UpdateTreatmentRequest,
};
use super::types::{RiskAssessment, RiskControl, RiskTreatment};
use crate::core::error::ApiError;
use crate::core::extract::{ApiJson, OptionalJson};
use crate::core::pagination::PageParams;
use crate::core::response::{self, ApiResponse, ListResponse};
use crate::core::state::AppState;
use crate::security::auth::AuthenticatedUser;

type Reply<T> = Result<Json<ApiResponse<T>>, ApiError>;
type CreatedReply<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;
type ListReply<T> = Result<Json<ListResponse<T>>, ApiError>;

pub async fn handle_list_risks(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Query(query): Query<ListRisksQuery>,
) -> ListReply<RiskView> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| risks::list_risks(&state.store, &caller, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_get_risk(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(risk_id): Path<Uuid>,
) -> Reply<RiskView> {
    let request_id = caller.request_id.clone();
    let risk = state
        .blocking(move |state| risks::get_risk(&state.store, &caller, risk_id))
        .await?;
    Ok(response::ok(request_id, risk))
}

pub async fn handle_create_risk(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    ApiJson(req): ApiJson<CreateRiskRequest>,
) -> CreatedReply<RiskView> {
    let request_id = caller.request_id.clone();
    let risk = state
        .blocking(move |state| risks::create_risk(&state.store, &caller, req))
        .await?;
    Ok(response::created(request_id, risk))
}

pub async fn handle_update_risk(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(risk_id): Path<Uuid>,
    ApiJson(req): ApiJson<UpdateRiskRequest>,
) -> Reply<RiskView> {
    let request_id = caller.request_id.clone();
    let risk = state
        .blocking(move |state| risks::update_risk(&state.store, &caller, risk_id, req))
        .await?;
    Ok(response::ok(request_id, risk))
}

pub async fn handle_change_risk_status(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(risk_id): Path<Uuid>,
    ApiJson(req): ApiJson<RiskStatusRequest>,
) -> Reply<RiskView> {
    let request_id = caller.request_id.clone();
    let risk = state
        .blocking(move |state| risks::change_status(&state.store, &caller, risk_id, req))
        .await?;
    Ok(response::ok(request_id, risk))
}

pub async fn handle_archive_risk(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(risk_id): Path<Uuid>,
) -> Reply<RiskView> {
    let request_id = caller.request_id.clone();
    let risk = state
        .blocking(move |state| risks::archive_risk(&state.store, &caller, risk_id))
        .await?;
    Ok(response::ok(request_id, risk))
}

pub async fn handle_list_assessments(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(risk_id): Path<Uuid>,
    Query(query): Query<ListAssessmentsQuery>,
) -> ListReply<RiskAssessment> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| assessments::list_assessments(&state.store, &caller, risk_id, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_create_assessment(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(risk_id): Path<Uuid>,
    ApiJson(req): ApiJson<CreateAssessmentRequest>,
) -> CreatedReply<AssessmentOutcome> {
    let request_id = caller.request_id.clone();
    let outcome = state
        .blocking(move |state| assessments::create_assessment(&state.store, &caller, risk_id, req))
        .await?;
    Ok(response::created(request_id, outcome))
}

pub async fn handle_list_treatments(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(risk_id): Path<Uuid>,
    Query(query): Query<ListTreatmentsQuery>,
) -> ListReply<RiskTreatment> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| treatments::list_treatments(&state.store, &caller, risk_id, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_create_treatment(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(risk_id): Path<Uuid>,
    ApiJson(req): ApiJson<CreateTreatmentRequest>,
) -> CreatedReply<RiskTreatment> {
    let request_id = caller.request_id.clone();
    let treatment = state
        .blocking(move |state| treatments::create_treatment(&state.store, &caller, risk_id, req))
        .await?;
    Ok(response::created(request_id, treatment))
}

pub async fn handle_update_treatment(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(treatment_id): Path<Uuid>,
    ApiJson(req): ApiJson<UpdateTreatmentRequest>,
) -> Reply<RiskTreatment> {
    let request_id = caller.request_id.clone();
    let treatment = state
        .blocking(move |state| treatments::update_treatment(&state.store, &caller, treatment_id, req))
        .await?;
    Ok(response::ok(request_id, treatment))
}

pub async fn handle_change_treatment_status(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(treatment_id): Path<Uuid>,
    ApiJson(req): ApiJson<TreatmentStatusRequest>,
) -> Reply<RiskTreatment> {
    let request_id = caller.request_id.clone();
    let treatment = state
        .blocking(move |state| treatments::change_treatment_status(&state.store, &caller, treatment_id, req))
        .await?;
    Ok(response::ok(request_id, treatment))
}

pub async fn handle_complete_treatment(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(treatment_id): Path<Uuid>,
    OptionalJson(req): OptionalJson<CompleteTreatmentRequest>,
) -> Reply<RiskTreatment> {
    let request_id = caller.request_id.clone();
    let treatment = state
        .blocking(move |state| treatments::complete_treatment(&state.store, &caller, treatment_id, req))
        .await?;
    Ok(response::ok(request_id, treatment))
}

pub async fn handle_list_risk_controls(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(risk_id): Path<Uuid>,
    Query(page): Query<PageParams>,
) -> ListReply<RiskControlView> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| links::list_risk_controls(&state.store, &caller, risk_id, &page))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_link_control(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(risk_id): Path<Uuid>,
    ApiJson(req): ApiJson<LinkControlRequest>,
) -> CreatedReply<RiskControlView> {
    let request_id = caller.request_id.clone();
    let link = state
        .blocking(move |state| links::link_control(&state.store, &caller, risk_id, req))
        .await?;
    Ok(response::created(request_id, link))
}

pub async fn handle_update_risk_control(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(link_id): Path<Uuid>,
    ApiJson(req): ApiJson<UpdateLinkRequest>,
) -> Reply<RiskControlView> {
    let request_id = caller.request_id.clone();
    let link = state
        .blocking(move |state| links::update_link(&state.store, &caller, link_id, req))
        .await?;
    Ok(response::ok(request_id, link))
}

pub async fn handle_unlink_control(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(link_id): Path<Uuid>,
) -> Reply<RiskControl> {
    let request_id = caller.request_id.clone();
    let link = state
        .blocking(move |state| links::unlink_control(&state.store, &caller, link_id))
        .await?;
    Ok(response::ok(request_id, link))
}
