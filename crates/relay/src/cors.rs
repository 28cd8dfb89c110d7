// Cross-origin policy for the HTTP and WebSocket surface.

use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://localhost:8080",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(3600);

/// Parsed form of `CORS_ORIGINS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsPolicy {
    /// `*`: any origin, no credentials.
    Any,
    /// `mirror`: echo the caller's origin back, with credentials.
    Mirror,
    /// Explicit allow-list, with credentials.
    Origins(Vec<HeaderValue>),
}

impl CorsPolicy {
    pub fn from_setting(setting: Option<&str>) -> Self {
        match setting.map(str::trim) {
            Some("*") => Self::Any,
            Some(value) if value.eq_ignore_ascii_case("mirror") => Self::Mirror,
            Some(value) if !value.is_empty() => Self::Origins(parse_origins(value)),
            _ => Self::Origins(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
        }
    }

    pub fn into_layer(self) -> CorsLayer {
        let base = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers(AllowHeaders::mirror_request())
            .expose_headers([HeaderName::from_static("x-request-id")])
            .max_age(PREFLIGHT_MAX_AGE);

        match self {
            Self::Any => base.allow_origin(AllowOrigin::any()),
            Self::Mirror => base.allow_origin(AllowOrigin::mirror_request()).allow_credentials(true),
            Self::Origins(origins) => {
                base.allow_origin(AllowOrigin::list(origins)).allow_credentials(true)
            }
        }
    }
}

pub fn cors_layer(origins: Option<String>) -> CorsLayer {
    CorsPolicy::from_setting(origins.as_deref()).into_layer()
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin.trim_end_matches('/')).ok())
        .collect()
}
