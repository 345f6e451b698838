//! Combines the endpoints of every feature area into one router.
//!
//! Health checks and the unauthenticated auth flows are public; everything
//! else runs behind the bearer-token middleware.

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::alerts::handlers as alerts;
use crate::analytics::handlers as analytics;
use crate::auth::handlers as auth;
use crate::compliance::handlers as compliance;
use crate::core::health::{health_check_simple, readiness_check};
use crate::core::state::AppState;
use crate::directory::handlers as directory;
use crate::risk::handlers as risk;
use crate::security::audit::handle_list_audit_logs;
use crate::security::cors::create_cors_layer;
use crate::security::{auth_middleware, request_id_middleware};
use crate::test_engine::handlers as tests;

pub fn configure_api_routes(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health_check_simple))
        .route("/health/ready", get(readiness_check))
        .route("/auth/register", post(auth::handle_register))
        .route("/auth/login", post(auth::handle_login))
        .route("/auth/refresh", post(auth::handle_refresh))
        .route("/auth/logout", post(auth::handle_logout));

    let protected = Router::new()
        // ===== Identity & organization =====
        .route("/auth/me", get(auth::handle_me))
        .route("/auth/password", put(auth::handle_change_password))
        .route(
            "/organization",
            get(directory::handle_get_organization).put(directory::handle_update_organization),
        )
        .route("/users", get(directory::handle_list_users).post(directory::handle_create_user))
        .route("/users/:id", get(directory::handle_get_user).put(directory::handle_update_user))
        .route("/users/:id/deactivate", post(directory::handle_deactivate_user))
        .route("/users/:id/reactivate", post(directory::handle_reactivate_user))
        // ===== Framework catalog =====
        .route("/frameworks", get(compliance::handle_list_frameworks))
        .route("/frameworks/:id", get(compliance::handle_get_framework))
        .route("/framework-versions/:id/requirements", get(compliance::handle_list_requirements))
        .route(
            "/org-frameworks",
            get(compliance::handle_list_org_frameworks).post(compliance::handle_activate_framework),
        )
        .route("/org-frameworks/:id/deactivate", post(compliance::handle_deactivate_framework))
        .route("/org-frameworks/:id/coverage", get(compliance::handle_framework_coverage))
        // ===== Controls, mappings & scoping =====
        .route(
            "/controls",
            get(compliance::handle_list_controls).post(compliance::handle_create_control),
        )
        .route("/controls/bulk-status", post(compliance::handle_bulk_control_status))
        .route(
            "/controls/:id",
            get(compliance::handle_get_control)
                .put(compliance::handle_update_control)
                .delete(compliance::handle_deprecate_control),
        )
        .route("/controls/:id/status", put(compliance::handle_change_control_status))
        .route("/controls/:id/owner", put(compliance::handle_set_control_owner))
        .route("/controls/:id/mappings", get(compliance::handle_list_control_mappings))
        .route(
            "/mappings",
            get(compliance::handle_list_mappings).post(compliance::handle_create_mapping),
        )
        .route("/mappings/bulk", post(compliance::handle_bulk_create_mappings))
        .route(
            "/mappings/:id",
            put(compliance::handle_update_mapping).delete(compliance::handle_delete_mapping),
        )
        .route("/requirement-scopes", get(compliance::handle_list_scopes))
        .route(
            "/requirement-scopes/:requirement_id",
            put(compliance::handle_set_scope).delete(compliance::handle_reset_scope),
        )
        // ===== Risk register =====
        .route("/risks", get(risk::handle_list_risks).post(risk::handle_create_risk))
        .route(
            "/risks/:id",
            get(risk::handle_get_risk)
                .put(risk::handle_update_risk)
                .delete(risk::handle_archive_risk),
        )
        .route("/risks/:id/status", put(risk::handle_change_risk_status))
        .route(
            "/risks/:id/assessments",
            get(risk::handle_list_assessments).post(risk::handle_create_assessment),
        )
        .route(
            "/risks/:id/treatments",
            get(risk::handle_list_treatments).post(risk::handle_create_treatment),
        )
        .route("/risk-treatments/:id", put(risk::handle_update_treatment))
        .route("/risk-treatments/:id/status", put(risk::handle_change_treatment_status))
        .route("/risk-treatments/:id/complete", post(risk::handle_complete_treatment))
        .route(
            "/risks/:id/controls",
            get(risk::handle_list_risk_controls).post(risk::handle_link_control),
        )
        .route(
            "/risk-controls/:id",
            put(risk::handle_update_risk_control).delete(risk::handle_unlink_control),
        )
        // ===== Tests & runs =====
        .route("/tests", get(tests::handle_list_tests).post(tests::handle_create_test))
        .route(
            "/tests/:id",
            get(tests::handle_get_test)
                .put(tests::handle_update_test)
                .delete(tests::handle_deprecate_test),
        )
        .route("/tests/:id/status", put(tests::handle_change_test_status))
        .route("/tests/:id/results", get(tests::handle_list_test_results))
        .route("/test-runs", get(tests::handle_list_runs).post(tests::handle_create_run))
        .route("/test-runs/:id", get(tests::handle_get_run))
        .route("/test-runs/:id/cancel", post(tests::handle_cancel_run))
        .route("/test-runs/:id/start", post(tests::handle_start_run))
        .route(
            "/test-runs/:id/results",
            get(tests::handle_list_run_results).post(tests::handle_record_result),
        )
        .route("/test-runs/:id/finish", post(tests::handle_finish_run))
        // ===== Alerts =====
        .route("/alerts", get(alerts::handle_list_alerts))
        .route("/alerts/:id", get(alerts::handle_get_alert))
        .route("/alerts/:id/status", put(alerts::handle_change_alert_status))
        .route("/alerts/:id/assign", post(alerts::handle_assign_alert))
        .route("/alerts/:id/resolve", post(alerts::handle_resolve_alert))
        .route("/alerts/:id/suppress", post(alerts::handle_suppress_alert))
        .route("/alerts/:id/redeliver", post(alerts::handle_redeliver_alert))
        .route("/alert-rules", get(alerts::handle_list_rules).post(alerts::handle_create_rule))
        .route(
            "/alert-rules/:id",
            get(alerts::handle_get_rule)
                .put(alerts::handle_update_rule)
                .delete(alerts::handle_delete_rule),
        )
        .route("/alert-rules/:id/test-delivery", post(alerts::handle_test_delivery))
        // ===== Analytics =====
        .route("/analytics/control-health", get(analytics::handle_control_health))
        .route("/analytics/compliance-posture", get(analytics::handle_compliance_posture))
        .route("/analytics/risk-heatmap", get(analytics::handle_risk_heatmap))
        .route("/analytics/risk-gaps", get(analytics::handle_risk_gaps))
        .route("/analytics/requirement-gaps", get(analytics::handle_requirement_gaps))
        // ===== Audit log =====
        .route("/audit-logs", get(handle_list_audit_logs))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let cors = create_cors_layer(&state.config.server.cors_origins);

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
