use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use uuid::Uuid;

use super::organization::{self, UpdateOrganizationRequest};
use super::users::{self, CreateUserRequest, ListUsersQuery, UpdateUserRequest};
use super::{Organization, User};
use crate::core::error::ApiError;
use crate::core::extract::ApiJson;
use crate::core::response::{self, ApiResponse, ListResponse};
use crate::core::state::AppState;
use crate::security::auth::AuthenticatedUser;

pub async fn handle_get_organization(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
) -> Result<Json<ApiResponse<Organization>>, ApiError> {
    let request_id = caller.request_id.clone();
    let org = state
        .blocking(move |state| organization::get_organization(&state.store, &caller))
        .await?;
    Ok(response::ok(request_id, org))
}

pub async fn handle_update_organization(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    ApiJson(req): ApiJson<UpdateOrganizationRequest>,
) -> Result<Json<ApiResponse<Organization>>, ApiError> {
    let request_id = caller.request_id.clone();
    let org = state
        .blocking(move |state| organization::update_organization(&state.store, &caller, req))
        .await?;
    Ok(response::ok(request_id, org))
}

pub async fn handle_list_users(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<ListResponse<User>>, ApiError> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| users::list_users(&state.store, &caller, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_get_user(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<User>>, ApiError> {
    let request_id = caller.request_id.clone();
    let user = state
        .blocking(move |state| users::get_user(&state.store, &caller, user_id))
        .await?;
    Ok(response::ok(request_id, user))
}

pub async fn handle_create_user(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    ApiJson(req): ApiJson<CreateUserRequest>,
) -> Result<(StatusCode, Json<ApiResponse<User>>), ApiError> {
    let request_id = caller.request_id.clone();
    let user = state
        .blocking(move |state| users::create_user(&state.store, &state.passwords, &caller, req))
        .await?;
    Ok(response::created(request_id, user))
}

pub async fn handle_update_user(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(user_id): Path<Uuid>,
    ApiJson(req): ApiJson<UpdateUserRequest>,
) -> Result<Json<ApiResponse<User>>, ApiError> {
    let request_id = caller.request_id.clone();
    let user = state
        .blocking(move |state| users::update_user(&state.store, &caller, user_id, req))
        .await?;
    Ok(response::ok(request_id, user))
}

pub async fn handle_deactivate_user(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<User>>, ApiError> {
    let request_id = caller.request_id.clone();
    let user = state
        .blocking(move |state| users::deactivate_user(&state.store, &caller, user_id))
        .await?;
    Ok(response::ok(request_id, user))
}

pub async fn handle_reactivate_user(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<User>>, ApiError> {
    let request_id = caller.request_id.clone();
    let user = state
        .blocking(move |state| users::reactivate_user(&state.store, &caller, user_id))
        .await?;
    Ok(response::ok(request_id, user))
}
