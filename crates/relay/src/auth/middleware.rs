use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::{
    auth::{
        credential::{authenticate, AuthFailure, TokenSource},
        jwt::JwtTokenService,
    },
    error::{ErrorCode, RelayError},
};

/// Gate for the system API: a valid bearer token, or a 401 envelope.
///
/// The validated [`AuthenticatedCaller`](crate::auth::credential::AuthenticatedCaller)
/// rides along in the request extensions.
pub async fn require_bearer_auth(
    State(jwt_service): State<Arc<JwtTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let caller = match authenticate(
        &jwt_service,
        TokenSource::BearerHeader,
        request.headers(),
        request.uri(),
    ) {
        Ok(caller) => caller,
        Err(failure) => {
            debug!(path = %request.uri().path(), ?failure, "system api request rejected");
            let message = match failure {
                AuthFailure::Missing => "missing bearer token",
                AuthFailure::Invalid => "invalid bearer token",
            };
            return RelayError::new(ErrorCode::AuthInvalidToken, message).into_response();
        }
    };

    request.extensions_mut().insert(caller);
    next.run(request).await
}
