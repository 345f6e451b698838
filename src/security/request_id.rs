use axum::{
    body::Body,
    http::{header::HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info_span, Instrument};
use uuid::Uuid;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Debug, Clone)]
pub struct RequestId {
    pub id: String,
    pub correlation_id: Option<String>,
    pub sequence: u64,
}

impl RequestId {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            correlation_id: None,
            sequence: REQUEST_COUNTER.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn as_header_value(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.id).ok()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Accepts an inbound `x-request-id` when it is well formed, otherwise mints
/// one. Every request runs inside a span carrying the id, and the id is echoed
/// back on the response.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    let request_id = request
        .headers()
        .get(&header_name)
        .and_then(|v| v.to_str().ok())
        .filter(|id| is_valid_request_id(id))
        .map(RequestId::with_id)
        .unwrap_or_default();

    let request_id = match request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| is_valid_request_id(id))
    {
        Some(corr_id) => request_id.with_correlation(corr_id),
        None => request_id,
    };

    request.extensions_mut().insert(request_id.clone());

    let span = info_span!(
        "request",
        request_id = %request_id.id,
        correlation_id = ?request_id.correlation_id,
        seq = request_id.sequence
    );

    let mut response = next.run(request).instrument(span).await;

    if let Some(value) = request_id.as_header_value() {
        response.headers_mut().insert(header_name, value);
    }
    if let Some(value) = request_id
        .correlation_id
        .as_deref()
        .and_then(|c| HeaderValue::from_str(c).ok())
    {
        response
            .headers_mut()
            .insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
    }

    response
}

fn is_valid_request_id(id: &str) -> bool {
    if id.is_empty() || id.len() > 128 {
        return false;
    }

    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Extension, Router};
    use tower::ServiceExt;

    #[test]
    fn test_request_id_new() {
        let id = RequestId::new();
        assert!(Uuid::parse_str(&id.id).is_ok());
        assert!(id.correlation_id.is_none());
    }

    #[test]
    fn test_sequence_increments() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert!(id2.sequence > id1.sequence);
    }

    #[test]
    fn test_is_valid_request_id() {
        assert!(is_valid_request_id("abc-123"));
        assert!(is_valid_request_id("test_id.v1"));

        assert!(!is_valid_request_id(""));
        assert!(!is_valid_request_id("id with space"));
        assert!(!is_valid_request_id("id<script>"));
        assert!(!is_valid_request_id(&"a".repeat(200)));
    }

    fn app() -> Router {
        Router::new()
            .route(
                "/",
                get(|Extension(id): Extension<RequestId>| async move { id.id }),
            )
            .layer(axum::middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn test_inbound_id_is_kept_and_echoed() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "upstream-42")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()),
            Some("upstream-42")
        );
    }

    #[tokio::test]
    async fn test_malformed_id_is_replaced() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "bad id!")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        let echoed = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_default();
        assert!(Uuid::parse_str(&echoed).is_ok());
    }
}
