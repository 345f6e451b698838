use axum::{extract::State, http::HeaderMap, http::StatusCode, Extension, Json};
use serde_json::{json, Value};

use super::{
    AuthResponse, AuthService, ChangePasswordRequest, ClientContext, LoginRequest, MeResponse,
    RefreshRequest, RegisterRequest,
};
use crate::core::error::ApiError;
use crate::core::extract::ApiJson;
use crate::core::response::{self, ApiResponse};
use crate::core::state::AppState;
use crate::security::auth::AuthenticatedUser;
use crate::security::request_id::RequestId;

pub async fn handle_register(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<(StatusCode, Json<ApiResponse<AuthResponse>>), ApiError> {
    let client = ClientContext::from_parts(request_id.as_deref(), &headers);
    let request_id = client.request_id.clone();
    let resp = state
        .blocking(move |state| AuthService::from_state(&state).register(&client, req))
        .await?;
    Ok(response::created(request_id, resp))
}

pub async fn handle_login(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<Json<ApiResponse<AuthResponse>>, ApiError> {
    let client = ClientContext::from_parts(request_id.as_deref(), &headers);
    let request_id = client.request_id.clone();
    let resp = state
        .blocking(move |state| AuthService::from_state(&state).login(&client, req))
        .await?;
    Ok(response::ok(request_id, resp))
}

pub async fn handle_refresh(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<RefreshRequest>,
) -> Result<Json<ApiResponse<AuthResponse>>, ApiError> {
    let client = ClientContext::from_parts(request_id.as_deref(), &headers);
    let request_id = client.request_id.clone();
    let resp = state
        .blocking(move |state| AuthService::from_state(&state).refresh(&client, req))
        .await?;
    Ok(response::ok(request_id, resp))
}

pub async fn handle_logout(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<RefreshRequest>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let client = ClientContext::from_parts(request_id.as_deref(), &headers);
    let request_id = client.request_id.clone();
    state
        .blocking(move |state| AuthService::from_state(&state).logout(&client, req))
        .await?;
    Ok(response::ok(request_id, json!({ "logged_out": true })))
}

pub async fn handle_me(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
) -> Result<Json<ApiResponse<MeResponse>>, ApiError> {
    let request_id = caller.request_id.clone();
    let me = state
        .blocking(move |state| AuthService::from_state(&state).me(&caller))
        .await?;
    Ok(response::ok(request_id, me))
}

pub async fn handle_change_password(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    ApiJson(req): ApiJson<ChangePasswordRequest>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let request_id = caller.request_id.clone();
    state
        .blocking(move |state| AuthService::from_state(&state).change_password(&caller, req))
        .await?;
    Ok(response::ok(request_id, json!({ "password_changed": true })))
}
