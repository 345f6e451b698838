use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Serialize;
use uuid::Uuid;

use super::lifecycle::{self, AlertStatusRequest, AssignRequest, ListAlertsQuery, RedeliverRequest, ResolveRequest, SuppressRequest};
use super::notify::ChannelOutcome;
use super::rules::{self, CreateRuleRequest, ListRulesQuery, UpdateRuleRequest};
use super::types::{Alert, AlertRule, Channel};
use crate::core::error::ApiError;
use crate::core::extract::ApiJson;
use crate::core::response::{self, ApiResponse, ListResponse};
use crate::core::state::AppState;
use crate::security::auth::AuthenticatedUser;

type Reply<T> = Result<Json<ApiResponse<T>>, ApiError>;
type CreatedReply<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;
type ListReply<T> = Result<Json<ListResponse<T>>, ApiError>;

#[derive(Debug, Serialize)]
pub struct RedeliveryReport {
    pub alert_id: Uuid,
    pub results: Vec<ChannelOutcome>,
}

#[derive(Debug, Serialize)]
pub struct TestDeliveryReport {
    pub rule_id: Uuid,
    pub delivered: Vec<Channel>,
}

pub async fn handle_list_alerts(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Query(query): Query<ListAlertsQuery>,
) -> ListReply<Alert> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| lifecycle::list_alerts(&state.store, &caller, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_get_alert(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(alert_id): Path<Uuid>,
) -> Reply<Alert> {
    let request_id = caller.request_id.clone();
    let alert = state
        .blocking(move |state| lifecycle::get_alert(&state.store, &caller, alert_id))
        .await?;
    Ok(response::ok(request_id, alert))
}

pub async fn handle_change_alert_status(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(alert_id): Path<Uuid>,
    ApiJson(req): ApiJson<AlertStatusRequest>,
) -> Reply<Alert> {
    let request_id = caller.request_id.clone();
    let alert = state
        .blocking(move |state| lifecycle::change_status(&state.store, &caller, alert_id, req))
        .await?;
    Ok(response::ok(request_id, alert))
}

pub async fn handle_assign_alert(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(alert_id): Path<Uuid>,
    ApiJson(req): ApiJson<AssignRequest>,
) -> Reply<Alert> {
    let request_id = caller.request_id.clone();
    let alert = state
        .blocking(move |state| lifecycle::assign(&state.store, &caller, alert_id, req))
        .await?;
    Ok(response::ok(request_id, alert))
}

pub async fn handle_resolve_alert(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(alert_id): Path<Uuid>,
    ApiJson(req): ApiJson<ResolveRequest>,
) -> Reply<Alert> {
    let request_id = caller.request_id.clone();
    let alert = state
        .blocking(move |state| lifecycle::resolve(&state.store, &caller, alert_id, req))
        .await?;
    Ok(response::ok(request_id, alert))
}

pub async fn handle_suppress_alert(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(alert_id): Path<Uuid>,
    ApiJson(req): ApiJson<SuppressRequest>,
) -> Reply<Alert> {
    let request_id = caller.request_id.clone();
    let alert = state
        .blocking(move |state| lifecycle::suppress(&state.store, &caller, alert_id, req))
        .await?;
    Ok(response::ok(request_id, alert))
}

/// Delivery failures come back in the report; they do not fail the request.
pub async fn handle_redeliver_alert(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(alert_id): Path<Uuid>,
    ApiJson(req): ApiJson<RedeliverRequest>,
) -> Reply<RedeliveryReport> {
    let request_id = caller.request_id.clone();
    let plan = state
        .blocking(move |state| lifecycle::plan_redelivery(&state.store, &caller, alert_id, req))
        .await?;
    let results = state
        .notifier
        .deliver(&state.store, plan.org_id, plan.alert_id, &plan.channels)
        .await?;
    Ok(response::ok(
        request_id,
        RedeliveryReport {
            alert_id: plan.alert_id,
            results,
        },
    ))
}

pub async fn handle_list_rules(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Query(query): Query<ListRulesQuery>,
) -> ListReply<AlertRule> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| rules::list_rules(&state.store, &caller, &query))
        .await?;
    Ok(response::list(request_id, page))
}

pub async fn handle_get_rule(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(rule_id): Path<Uuid>,
) -> Reply<AlertRule> {
    let request_id = caller.request_id.clone();
    let rule = state
        .blocking(move |state| rules::get_rule(&state.store, &caller, rule_id))
        .await?;
    Ok(response::ok(request_id, rule))
}

pub async fn handle_create_rule(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    ApiJson(req): ApiJson<CreateRuleRequest>,
) -> CreatedReply<AlertRule> {
    let request_id = caller.request_id.clone();
    let rule = state
        .blocking(move |state| rules::create_rule(&state.store, &caller, req))
        .await?;
    Ok(response::created(request_id, rule))
}

pub async fn handle_update_rule(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(rule_id): Path<Uuid>,
    ApiJson(req): ApiJson<UpdateRuleRequest>,
) -> Reply<AlertRule> {
    let request_id = caller.request_id.clone();
    let rule = state
        .blocking(move |state| rules::update_rule(&state.store, &caller, rule_id, req))
        .await?;
    Ok(response::ok(request_id, rule))
}

pub async fn handle_delete_rule(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(rule_id): Path<Uuid>,
) -> Reply<AlertRule> {
    let request_id = caller.request_id.clone();
    let rule = state
        .blocking(move |state| rules::delete_rule(&state.store, &caller, rule_id))
        .await?;
    Ok(response::ok(request_id, rule))
}

/// A failed or timed-out delivery is reported as UNPROCESSABLE.
pub async fn handle_test_delivery(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(rule_id): Path<Uuid>,
) -> Reply<TestDeliveryReport> {
    let request_id = caller.request_id.clone();
    let rule = state
        .blocking(move |state| rules::prepare_test_delivery(&state.store, &caller, rule_id))
        .await?;
    let delivered = state
        .notifier
        .test_delivery(&rule)
        .await
        .map_err(|e| ApiError::Unprocessable(format!("Test delivery failed: {e}")))?;
    Ok(response::ok(
        request_id,
        TestDeliveryReport {
            rule_id: rule.id,
            delivered,
        },
    ))
}
