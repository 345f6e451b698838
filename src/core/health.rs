use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::error;

use super::state::AppState;

const READINESS_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn health_check_simple() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "grcserver",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Pings every backing dependency with a bounded wait and reports each one.
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let started = Instant::now();
    let store = state.store.clone();
    let ping = tokio::task::spawn_blocking(move || store.ping());

    let (store_ok, detail) = match timeout(READINESS_TIMEOUT, ping).await {
        Ok(Ok(Ok(()))) => (true, None),
        Ok(Ok(Err(e))) => (false, Some(e.to_string())),
        Ok(Err(e)) => (false, Some(format!("ping task failed: {e}"))),
        Err(_) => (false, Some("timed out".to_string())),
    };

    if let Some(detail) = &detail {
        error!("readiness: store unavailable: {detail}");
    }

    let code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": if store_ok { "ready" } else { "degraded" },
            "checks": {
                "store": {
                    "status": if store_ok { "up" } else { "down" },
                    "latency_ms": started.elapsed().as_millis() as u64,
                    "error": detail,
                }
            }
        })),
    )
}
