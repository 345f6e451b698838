use axum::{
    extract::{Query, State},
    Extension, Json,
};

use super::controls::{self, ControlHealthReport, PostureReport, RequirementGap};
use super::risks::{self, HeatmapQuery, RiskGapReport, RiskHeatmap};
use crate::core::error::ApiError;
use crate::core::response::{self, ApiResponse};
use crate::core::state::AppState;
use crate::security::auth::AuthenticatedUser;

type Reply<T> = Result<Json<ApiResponse<T>>, ApiError>;

pub async fn handle_control_health(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
) -> Reply<ControlHealthReport> {
    let request_id = caller.request_id.clone();
    let report = state
        .blocking(move |state| controls::control_health(&state.store, &caller))
        .await?;
    Ok(response::ok(request_id, report))
}

pub async fn handle_compliance_posture(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
) -> Reply<PostureReport> {
    let request_id = caller.request_id.clone();
    let report = state
        .blocking(move |state| controls::compliance_posture(&state.store, &caller))
        .await?;
    Ok(response::ok(request_id, report))
}

pub async fn handle_requirement_gaps(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
) -> Reply<Vec<RequirementGap>> {
    let request_id = caller.request_id.clone();
    let gaps = state
        .blocking(move |state| controls::requirement_gaps(&state.store, &caller))
        .await?;
    Ok(response::ok(request_id, gaps))
}

pub async fn handle_risk_heatmap(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Query(query): Query<HeatmapQuery>,
) -> Reply<RiskHeatmap> {
    let request_id = caller.request_id.clone();
    let heatmap = state
        .blocking(move |state| risks::risk_heatmap(&state.store, &caller, &query))
        .await?;
    Ok(response::ok(request_id, heatmap))
}

pub async fn handle_risk_gaps(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
) -> Reply<RiskGapReport> {
    let request_id = caller.request_id.clone();
    let report = state
        .blocking(move |state| risks::risk_gaps(&state.store, &caller))
        .await?;
    Ok(response::ok(request_id, report))
}
