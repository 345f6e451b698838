use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use uuid::Uuid;

use super::catalog::{self, FrameworkSummary, RequirementListing, RequirementQuery};
use super::controls::{
    self, BulkStatusRequest, BulkStatusResult, ControlOwnerRequest, ControlStatusRequest,
    CreateControlRequest, ListControlsQuery, UpdateControlRequest,
};
use super::frameworks::{self, ActivateFrameworkRequest, CoverageStats, OrgFrameworkView};
use super::mappings::{
    self, BulkMappingRequest, BulkMappingResult, CreateMappingRequest, ListMappingsQuery,
    UpdateMappingRequest,
};
use super::scopes::{self, ListScopesQuery, SetScopeRequest};
use super::types::{Control, ControlMapping, RequirementScope};
use crate::core::error::ApiError;
use crate::core::extract::ApiJson;
use crate::core::pagination::PageParams;
use crate::core::response::{self, ApiResponse, ListResponse};
use crate::core::state::AppState;
use crate::security::auth::AuthenticatedUser;

type Reply<T> = Result<Json<ApiResponse<T>>, ApiError>;
type CreatedReply<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;
type ListReply<T> = Result<Json<ListResponse<T>>, ApiError>;

pub async fn handle_list_frameworks(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
) -> Reply<Vec<FrameworkSummary>> {
    let frameworks = state
        .blocking(move |state| catalog::list_frameworks(&state.store))
        .await?;
    Ok(response::ok(caller.request_id, frameworks))
}

pub async fn handle_get_framework(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(framework_id): Path<Uuid>,
) -> Reply<FrameworkSummary> {
    let framework = state
        .blocking(move |state| catalog::get_framework(&state.store, framework_id))
        .await?;
    Ok(response::ok(caller.request_id, framework))
}

/// Flat views use the list envelope; tree views return the nested forest.
pub async fn handle_list_requirements(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(version_id): Path<Uuid>,
    Query(query): Query<RequirementQuery>,
) -> Result<Response, ApiError> {
    let listing = state
        .blocking(move |state| catalog::list_requirements(&state.store, version_id, &query))
        .await?;
    Ok(match listing {
        RequirementListing::Flat(page) => response::list(caller.request_id, page).into_response(),
        RequirementListing::Tree(roots) => response::ok(caller.request_id, roots).into_response(),
    })
}

pub async fn handle_list_org_frameworks(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
) -> Reply<Vec<OrgFrameworkView>> {
    let request_id = caller.request_id.clone();
    let views = state
        .blocking(move |state| frameworks::list_org_frameworks(&state.store, &caller))
        .await?;
    Ok(response::ok(request_id, views))
}

pub async fn handle_activate_framework(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    ApiJson(req): ApiJson<ActivateFrameworkRequest>,
) -> CreatedReply<OrgFrameworkView> {
    let request_id = caller.request_id.clone();
    let view = state
        .blocking(move |state| frameworks::activate_framework(&state.store, &caller, req))
        .await?;
    Ok(response::created(request_id, view))
}

pub async fn handle_deactivate_framework(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(org_framework_id): Path<Uuid>,
) -> Reply<OrgFrameworkView> {
    let request_id = caller.request_id.clone();
    let view = state
        .blocking(move |state| frameworks::deactivate_framework(&state.store, &caller, org_framework_id))
        .await?;
    Ok(response::ok(request_id, view))
}

pub async fn handle_framework_coverage(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(org_framework_id): Path<Uuid>,
) -> Reply<CoverageStats> {
    let request_id = caller.request_id.clone();
    let stats = state
        .blocking(move |state| frameworks::framework_coverage(&state.store, &caller, org_framework_id))
        .await?;
    Ok(response::ok(request_id, stats))
}

pub async fn handle_list_controls(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Query(query): Query<ListControlsQuery>,
) -> ListReply<Control> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| controls::list_controls(&state.store, &caller, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_get_control(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(control_id): Path<Uuid>,
) -> Reply<Control> {
    let request_id = caller.request_id.clone();
    let control = state
        .blocking(move |state| controls::get_control(&state.store, &caller, control_id))
        .await?;
    Ok(response::ok(request_id, control))
}

pub async fn handle_create_control(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    ApiJson(req): ApiJson<CreateControlRequest>,
) -> CreatedReply<Control> {
    let request_id = caller.request_id.clone();
    let control = state
        .blocking(move |state| controls::create_control(&state.store, &caller, req))
        .await?;
    Ok(response::created(request_id, control))
}

pub async fn handle_update_control(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(control_id): Path<Uuid>,
    ApiJson(req): ApiJson<UpdateControlRequest>,
) -> Reply<Control> {
    let request_id = caller.request_id.clone();
    let control = state
        .blocking(move |state| controls::update_control(&state.store, &caller, control_id, req))
        .await?;
    Ok(response::ok(request_id, control))
}

pub async fn handle_change_control_status(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(control_id): Path<Uuid>,
    ApiJson(req): ApiJson<ControlStatusRequest>,
) -> Reply<Control> {
    let request_id = caller.request_id.clone();
    let control = state
        .blocking(move |state| controls::change_status(&state.store, &caller, control_id, req))
        .await?;
    Ok(response::ok(request_id, control))
}

pub async fn handle_bulk_control_status(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    ApiJson(req): ApiJson<BulkStatusRequest>,
) -> Reply<BulkStatusResult> {
    let request_id = caller.request_id.clone();
    let result = state
        .blocking(move |state| controls::bulk_change_status(&state.store, &caller, req))
        .await?;
    Ok(response::ok(request_id, result))
}

pub async fn handle_set_control_owner(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(control_id): Path<Uuid>,
    ApiJson(req): ApiJson<ControlOwnerRequest>,
) -> Reply<Control> {
    let request_id = caller.request_id.clone();
    let control = state
        .blocking(move |state| controls::set_owner(&state.store, &caller, control_id, req))
        .await?;
    Ok(response::ok(request_id, control))
}

pub async fn handle_deprecate_control(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(control_id): Path<Uuid>,
) -> Reply<Control> {
    let request_id = caller.request_id.clone();
    let control = state
        .blocking(move |state| controls::deprecate_control(&state.store, &caller, control_id))
        .await?;
    Ok(response::ok(request_id, control))
}

pub async fn handle_list_control_mappings(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(control_id): Path<Uuid>,
    Query(page): Query<PageParams>,
) -> ListReply<ControlMapping> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| mappings::list_control_mappings(&state.store, &caller, control_id, page))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_list_mappings(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Query(query): Query<ListMappingsQuery>,
) -> ListReply<ControlMapping> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| mappings::list_mappings(&state.store, &caller, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_create_mapping(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    ApiJson(req): ApiJson<CreateMappingRequest>,
) -> CreatedReply<ControlMapping> {
    let request_id = caller.request_id.clone();
    let mapping = state
        .blocking(move |state| mappings::create_mapping(&state.store, &caller, req))
        .await?;
    Ok(response::created(request_id, mapping))
}

pub async fn handle_bulk_create_mappings(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    ApiJson(req): ApiJson<BulkMappingRequest>,
) -> Reply<BulkMappingResult> {
    let request_id = caller.request_id.clone();
    let result = state
        .blocking(move |state| mappings::bulk_create_mappings(&state.store, &caller, req))
        .await?;
    Ok(response::ok(request_id, result))
}

pub async fn handle_update_mapping(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(mapping_id): Path<Uuid>,
    ApiJson(req): ApiJson<UpdateMappingRequest>,
) -> Reply<ControlMapping> {
    let request_id = caller.request_id.clone();
    let mapping = state
        .blocking(move |state| mappings::update_mapping(&state.store, &caller, mapping_id, req))
        .await?;
    Ok(response::ok(request_id, mapping))
}

pub async fn handle_delete_mapping(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(mapping_id): Path<Uuid>,
) -> Reply<ControlMapping> {
    let request_id = caller.request_id.clone();
    let mapping = state
        .blocking(move |state| mappings::delete_mapping(&state.store, &caller, mapping_id))
        .await?;
    Ok(response::ok(request_id, mapping))
}

pub async fn handle_list_scopes(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Query(query): Query<ListScopesQuery>,
) -> ListReply<RequirementScope> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| scopes::list_scopes(&state.store, &caller, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_set_scope(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(requirement_id): Path<Uuid>,
    ApiJson(req): ApiJson<SetScopeRequest>,
) -> Reply<RequirementScope> {
    let request_id = caller.request_id.clone();
    let scope = state
        .blocking(move |state| scopes::set_scope(&state.store, &caller, requirement_id, req))
        .await?;
    Ok(response::ok(request_id, scope))
}

pub async fn handle_reset_scope(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(requirement_id): Path<Uuid>,
) -> Reply<RequirementScope> {
    let request_id = caller.request_id.clone();
    let scope = state
        .blocking(move |state| scopes::reset_scope(&state.store, &caller, requirement_id))
        .await?;
    Ok(response::ok(request_id, scope))
}
