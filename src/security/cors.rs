use axum::http::{header, HeaderValue, Method};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<Method>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self::api()
    }
}

impl CorsConfig {
    /// Bearer tokens travel in headers, so credentials are never allowed.
    pub fn api() -> Self {
        Self {
            allowed_origins: vec![],
            allowed_methods: vec![Method::GET, Method::POST, Method::PUT, Method::DELETE],
            allowed_headers: vec![
                "Content-Type".to_string(),
                "Authorization".to_string(),
                "X-Request-ID".to_string(),
                "X-Correlation-ID".to_string(),
            ],
            exposed_headers: vec!["X-Request-ID".to_string(), "X-Correlation-ID".to_string()],
            max_age_secs: 7200,
        }
    }

    pub fn with_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins
            .into_iter()
            .map(|o| o.trim().trim_end_matches('/').to_string())
            .filter(|o| !o.is_empty())
            .collect();
        self
    }

    pub fn build(self) -> CorsLayer {
        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter(|o| is_valid_origin_format(o))
            .filter_map(|o| o.parse().ok())
            .collect();
        if origins.len() < self.allowed_origins.len() {
            warn!(
                "Ignored {} malformed CORS origin(s)",
                self.allowed_origins.len() - origins.len()
            );
        }

        let headers: Vec<header::HeaderName> = self
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        let exposed: Vec<header::HeaderName> = self
            .exposed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();

        let mut cors = CorsLayer::new()
            .allow_methods(self.allowed_methods)
            .allow_headers(headers)
            .expose_headers(exposed)
            .max_age(Duration::from_secs(self.max_age_secs));
        if origins.is_empty() {
            info!("No CORS origins configured; cross-origin requests are refused");
        } else {
            info!("CORS configured with {} allowed origins", origins.len());
            cors = cors.allow_origin(AllowOrigin::list(origins));
        }
        cors
    }
}

fn is_valid_origin_format(origin: &str) -> bool {
    let rest = match origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
    {
        Some(rest) => rest,
        None => return false,
    };
    if rest.is_empty() || rest.contains('/') || rest.contains("..") {
        return false;
    }

    let lower = origin.to_lowercase();
    !["<script", "javascript:", "data:", "%3c", "%3e", "\\x", "\\u"]
        .iter()
        .any(|pattern| lower.contains(pattern))
}

pub fn create_cors_layer(origins: &[String]) -> CorsLayer {
    CorsConfig::api().with_origins(origins.to_vec()).build()
}
