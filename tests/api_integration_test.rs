#[cfg(test)]
mod api_integration_tests {
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use grcserver::config::AppConfig;
    use grcserver::configure_api_routes;
    use grcserver::core::state::AppState;
    use grcserver::tests::test_util::{test_store, unique_slug};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const PASSWORD: &str = "Correct-Horse-9";

    fn app() -> Router {
        let mut config = AppConfig::default();
        config.auth.jwt_secret = "integration-secret-that-is-long-enough".into();
        config.auth.password_hash_cost = 1;
        config.auth.password_memory_kib = 8;
        config.auth.password_parallelism = 1;
        let state = AppState::with_store(config, test_store()).expect("state");
        configure_api_routes(state)
    }

    async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    /// Registers a fresh organization and returns its access and refresh tokens.
    async fn register(app: &Router, prefix: &str) -> (String, String) {
        let slug = unique_slug(prefix);
        let (status, body) = call(
            app,
            Method::POST,
            "/auth/register",
            None,
            Some(json!({
                "organization_name": "Acme Corp",
                "organization_slug": slug,
                "email": format!("owner@{slug}.example.com"),
                "password": PASSWORD,
                "first_name": "Ada",
                "last_name": "Lovelace",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let tokens = &body["data"]["tokens"];
        (
            tokens["access_token"].as_str().expect("access").to_string(),
            tokens["refresh_token"].as_str().expect("refresh").to_string(),
        )
    }

    /// Creates an active control with one active test and returns the test id.
    async fn seed_active_test(app: &Router, token: &str) -> String {
        let (status, control) = call(
            app,
            Method::POST,
            "/controls",
            Some(token),
            Some(json!({
                "identifier": "CTRL-AC-001",
                "title": "MFA enforced for administrators",
                "category": "technical",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{control}");
        let control_id = control["data"]["id"].as_str().expect("control id").to_string();
        let (status, _) = call(
            app,
            Method::PUT,
            &format!("/controls/{control_id}/status"),
            Some(token),
            Some(json!({ "status": "active" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, test) = call(
            app,
            Method::POST,
            "/tests",
            Some(token),
            Some(json!({
                "identifier": "TST-AC-001",
                "title": "Admin MFA",
                "type": "configuration",
                "severity": "high",
                "control_id": control_id,
                "interval_minutes": 60,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{test}");
        let test_id = test["data"]["id"].as_str().expect("test id").to_string();
        let (status, _) = call(
            app,
            Method::PUT,
            &format!("/tests/{test_id}/status"),
            Some(token),
            Some(json!({ "status": "active" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        test_id
    }

    #[tokio::test]
    async fn test_health_is_public_and_echoes_request_id() {
        let app = app();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-request-id", "probe-123")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
            Some("probe-123")
        );

        let (status, body) = call(&app, Method::GET, "/health/ready", None, None).await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    #[tokio::test]
    async fn test_protected_routes_require_bearer_token() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/controls", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let (status, _) = call(&app, Method::GET, "/controls", Some("not-a-token"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_refresh_reuse_revokes_every_session() {
        let app = app();
        let (_, first_refresh) = register(&app, "reuse").await;

        let (status, rotated) = call(
            &app,
            Method::POST,
            "/auth/refresh",
            None,
            Some(json!({ "refresh_token": first_refresh })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{rotated}");
        let second_refresh = rotated["data"]["tokens"]["refresh_token"].as_str().expect("refresh").to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            "/auth/refresh",
            None,
            Some(json!({ "refresh_token": first_refresh })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let (status, _) = call(
            &app,
            Method::POST,
            "/auth/refresh",
            None,
            Some(json!({ "refresh_token": second_refresh })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_risk_scores_from_initial_and_residual_assessments() {
        let app = app();
        let (token, _) = register(&app, "scoring").await;

        let (status, risk) = call(
            &app,
            Method::POST,
            "/risks",
            Some(&token),
            Some(json!({
                "identifier": "RSK-001",
                "title": "Credential stuffing against the customer portal",
                "category": "security",
                "initial_assessment": { "inherent": { "likelihood": "high", "impact": "major" } },
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{risk}");
        assert_eq!(risk["data"]["inherent"]["score"], 16);
        assert_eq!(risk["data"]["inherent"]["severity"], "high");
        let risk_id = risk["data"]["id"].as_str().expect("risk id").to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/risks/{risk_id}/assessments"),
            Some(&token),
            Some(json!({
                "assessment_type": "residual",
                "likelihood": "low",
                "impact": "moderate",
                "justification": "Rate limiting and MFA are in place",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");

        let (status, risk) = call(&app, Method::GET, &format!("/risks/{risk_id}"), Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(risk["data"]["inherent"]["score"], 16);
        assert_eq!(risk["data"]["residual"]["score"], 6);
        assert_eq!(risk["data"]["residual"]["severity"], "medium");
    }

    #[tokio::test]
    async fn test_second_run_conflicts_while_first_is_pending() {
        let app = app();
        let (token, _) = register(&app, "runs").await;
        seed_active_test(&app, &token).await;

        let (status, run) = call(&app, Method::POST, "/test-runs", Some(&token), None).await;
        assert_eq!(status, StatusCode::CREATED, "{run}");
        assert_eq!(run["data"]["status"], "pending");
        assert_eq!(run["data"]["total_tests"], 1);
        let run_id = run["data"]["id"].as_str().expect("run id").to_string();

        let (status, body) = call(&app, Method::POST, "/test-runs", Some(&token), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CONFLICT");

        let (_, run) = call(&app, Method::GET, &format!("/test-runs/{run_id}"), Some(&token), None).await;
        assert_eq!(run["data"]["total_tests"], 1);

        let (status, list) = call(&app, Method::GET, "/test-runs", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["meta"]["total"], 1);
    }

    #[tokio::test]
    async fn test_failed_result_raises_alert_that_cannot_jump_to_resolved() {
        let app = app();
        let (token, _) = register(&app, "alerts").await;
        let test_id = seed_active_test(&app, &token).await;

        let (status, rule) = call(
            &app,
            Method::POST,
            "/alert-rules",
            Some(&token),
            Some(json!({
                "name": "Any failing control test",
                "alert_severity": "high",
                "match_result_statuses": ["fail"],
                "sla_hours": 24,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{rule}");

        let (_, run) = call(&app, Method::POST, "/test-runs", Some(&token), None).await;
        let run_id = run["data"]["id"].as_str().expect("run id").to_string();
        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/test-runs/{run_id}/start"),
            Some(&token),
            Some(json!({ "worker_id": "engine-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, recorded) = call(
            &app,
            Method::POST,
            &format!("/test-runs/{run_id}/results"),
            Some(&token),
            Some(json!({ "test_id": test_id, "status": "fail", "message": "2 admins without MFA" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{recorded}");
        assert_eq!(recorded["data"]["result"]["alert_generated"], true);
        let alert = &recorded["data"]["alert"];
        assert_eq!(alert["status"], "open");
        assert_eq!(alert["severity"], "high");
        assert_eq!(alert["alert_number"], 1);
        let alert_id = alert["id"].as_str().expect("alert id").to_string();

        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/alerts/{alert_id}/status"),
            Some(&token),
            Some(json!({ "status": "resolved", "note": "fixed" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "UNPROCESSABLE");
        let message = body["error"]["message"].as_str().unwrap_or_default();
        assert!(message.contains("open") && message.contains("resolved"), "{message}");

        let (status, health) = call(&app, Method::GET, "/analytics/control-health", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["data"]["controls"][0]["health"], "failing");
        assert_eq!(health["data"]["controls"][0]["open_alerts"], 1);

        let (status, audit) = call(&app, Method::GET, "/audit-logs?action=alert.created", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(audit["meta"]["total"], 1);
    }

    #[tokio::test]
    async fn test_tenants_cannot_see_each_other() {
        let app = app();
        let (first, _) = register(&app, "tenant-one").await;
        let (second, _) = register(&app, "tenant-two").await;
        let test_id = seed_active_test(&app, &first).await;

        let (status, body) = call(&app, Method::GET, &format!("/tests/{test_id}"), Some(&second), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (_, list) = call(&app, Method::GET, "/tests", Some(&second), None).await;
        assert_eq!(list["meta"]["total"], 0);
    }
}
