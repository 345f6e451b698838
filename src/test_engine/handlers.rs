use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use uuid::Uuid;

use super::definitions::{self, CreateTestRequest, ListResultsQuery, ListTestsQuery, TestStatusRequest, UpdateTestRequest};
use super::runs::{self, CreateRunRequest, FinishRunRequest, ListRunsQuery, RecordResultRequest, RecordedResult, StartRunRequest};
use super::types::{ControlTest, TestResult, TestRun};
use crate::core::error::ApiError;
use crate::core::extract::{ApiJson, OptionalJson};
use crate::core::response::{self, ApiResponse, ListResponse};
use crate::core::state::AppState;
use crate::security::auth::AuthenticatedUser;

type Reply<T> = Result<Json<ApiResponse<T>>, ApiError>;
type CreatedReply<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;
type ListReply<T> = Result<Json<ListResponse<T>>, ApiError>;

pub async fn handle_list_tests(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Query(query): Query<ListTestsQuery>,
) -> ListReply<ControlTest> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| definitions::list_tests(&state.store, &caller, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_get_test(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(test_id): Path<Uuid>,
) -> Reply<ControlTest> {
    let request_id = caller.request_id.clone();
    let test = state
        .blocking(move |state| definitions::get_test(&state.store, &caller, test_id))
        .await?;
    Ok(response::ok(request_id, test))
}

pub async fn handle_create_test(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    ApiJson(req): ApiJson<CreateTestRequest>,
) -> CreatedReply<ControlTest> {
    let request_id = caller.request_id.clone();
    let test = state
        .blocking(move |state| definitions::create_test(&state.store, &caller, req))
        .await?;
    Ok(response::created(request_id, test))
}

pub async fn handle_update_test(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(test_id): Path<Uuid>,
    ApiJson(req): ApiJson<UpdateTestRequest>,
) -> Reply<ControlTest> {
    let request_id = caller.request_id.clone();
    let test = state
        .blocking(move |state| definitions::update_test(&state.store, &caller, test_id, req))
        .await?;
    Ok(response::ok(request_id, test))
}

pub async fn handle_change_test_status(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(test_id): Path<Uuid>,
    ApiJson(req): ApiJson<TestStatusRequest>,
) -> Reply<ControlTest> {
    let request_id = caller.request_id.clone();
    let test = state
        .blocking(move |state| definitions::change_status(&state.store, &caller, test_id, req))
        .await?;
    Ok(response::ok(request_id, test))
}

pub async fn handle_deprecate_test(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(test_id): Path<Uuid>,
) -> Reply<ControlTest> {
    let request_id = caller.request_id.clone();
    let test = state
        .blocking(move |state| definitions::deprecate_test(&state.store, &caller, test_id))
        .await?;
    Ok(response::ok(request_id, test))
}

pub async fn handle_list_test_results(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(test_id): Path<Uuid>,
    Query(query): Query<ListResultsQuery>,
) -> ListReply<TestResult> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| definitions::list_test_results(&state.store, &caller, test_id, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_list_runs(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Query(query): Query<ListRunsQuery>,
) -> ListReply<TestRun> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| runs::list_runs(&state.store, &caller, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_get_run(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(run_id): Path<Uuid>,
) -> Reply<TestRun> {
    let request_id = caller.request_id.clone();
    let run = state
        .blocking(move |state| runs::get_run(&state.store, &caller, run_id))
        .await?;
    Ok(response::ok(request_id, run))
}

pub async fn handle_create_run(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    OptionalJson(req): OptionalJson<CreateRunRequest>,
) -> CreatedReply<TestRun> {
    let request_id = caller.request_id.clone();
    let run = state
        .blocking(move |state| runs::create_run(&state.store, &caller, req))
        .await?;
    Ok(response::created(request_id, run))
}

pub async fn handle_cancel_run(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(run_id): Path<Uuid>,
) -> Reply<TestRun> {
    let request_id = caller.request_id.clone();
    let run = state
        .blocking(move |state| runs::cancel_run(&state.store, &caller, run_id))
        .await?;
    Ok(response::ok(request_id, run))
}

pub async fn handle_list_run_results(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<ListResultsQuery>,
) -> ListReply<TestResult> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| runs::list_run_results(&state.store, &caller, run_id, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_start_run(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(run_id): Path<Uuid>,
    ApiJson(req): ApiJson<StartRunRequest>,
) -> Reply<TestRun> {
    let request_id = caller.request_id.clone();
    let run = state
        .blocking(move |state| runs::start_run(&state.store, &caller, run_id, req))
        .await?;
    Ok(response::ok(request_id, run))
}

/// A generated alert is delivered in the background after the result commits.
pub async fn handle_record_result(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(run_id): Path<Uuid>,
    ApiJson(req): ApiJson<RecordResultRequest>,
) -> CreatedReply<RecordedResult> {
    let request_id = caller.request_id.clone();
    let recorded = state
        .blocking(move |state| runs::record_result(&state.store, &caller, run_id, req))
        .await?;
    if let Some(alert) = &recorded.alert {
        state.notifier.dispatch(state.store.clone(), alert);
    }
    Ok(response::created(request_id, recorded))
}

pub async fn handle_finish_run(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(run_id): Path<Uuid>,
    ApiJson(req): ApiJson<FinishRunRequest>,
) -> Reply<TestRun> {
    let request_id = caller.request_id.clone();
    let run = state
        .blocking(move |state| runs::finish_run(&state.store, &caller, run_id, req))
        .await?;
    Ok(response::ok(request_id, run))
}
