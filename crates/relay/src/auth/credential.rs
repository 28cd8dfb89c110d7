// Token extraction and validation shared by the system API and the
// WebSocket upgrade.

use axum::http::{header::AUTHORIZATION, HeaderMap, Uri};

use super::jwt::JwtTokenService;

/// Where a surface reads its credential from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// `Authorization: Bearer <token>`, scheme matched case-insensitively.
    BearerHeader,
    /// `?token=<token>` on the request URI.
    QueryParam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Invalid,
}

/// The validated caller, attached to the request by the API middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedCaller {
    pub subject: String,
}

impl TokenSource {
    pub fn extract(self, headers: &HeaderMap, uri: &Uri) -> Option<String> {
        let token = match self {
            Self::BearerHeader => headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(bearer_token)
                .map(ToOwned::to_owned),
            Self::QueryParam => uri.query().and_then(query_token),
        }?;
        let token = token.trim();
        (!token.is_empty()).then(|| token.to_owned())
    }
}

/// Pull the token from `source` and validate it.
pub fn authenticate(
    jwt_service: &JwtTokenService,
    source: TokenSource,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<AuthenticatedCaller, AuthFailure> {
    let token = source.extract(headers, uri).ok_or(AuthFailure::Missing)?;
    let subject = jwt_service.validate(&token).map_err(|_| AuthFailure::Invalid)?;
    Ok(AuthenticatedCaller { subject: subject.subject })
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("Bearer").then_some(token)
}

// First `token` pair wins; values are percent-decoded.
fn query_token(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}
