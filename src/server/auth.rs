//! Bearer-token authentication middleware
//!
//! Validates `Authorization: Bearer <token>` against the broker's store and
//! threads a typed [`AuthenticatedPrincipal`] through request extensions, so
//! every protected handler states the dependency in its signature via
//! `Extension<AuthenticatedPrincipal>`.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::router::AppState;
use crate::Error;
use crate::oauth::IssuedCredential;

/// The authenticated caller of a protected endpoint.
#[derive(Debug, Clone)]
pub struct AuthenticatedPrincipal {
    /// The broker credential the caller presented
    pub credential: IssuedCredential,
}

/// Authentication middleware for protected routes.
///
/// Missing, malformed, expired, or unknown tokens yield 401 with a
/// `WWW-Authenticate` challenge naming the broker's realm, which is what
/// triggers the MCP client's OAuth flow.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });

    let Some(token) = token else {
        warn!(path = %request.uri().path(), "Missing authorization header");
        return unauthorized_response(&state.base_url, "Missing authorization header");
    };

    match state.store.get_by_access_token(token).await {
        Ok(credential) => {
            debug!(client_id = %credential.client_id, "authenticated request");
            request
                .extensions_mut()
                .insert(AuthenticatedPrincipal { credential });
            next.run(request).await
        }
        Err(Error::TokenExpired) => unauthorized_response(&state.base_url, "Token expired"),
        Err(_) => unauthorized_response(&state.base_url, "Invalid token"),
    }
}

/// Create a 401 Unauthorized response with the bearer challenge.
fn unauthorized_response(base_url: &str, message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            "WWW-Authenticate",
            format!("Bearer realm=\"{base_url}\""),
        )],
        Json(json!({
            "error": "unauthorized",
            "error_description": message
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_response_carries_realm_and_body() {
        let response = unauthorized_response("http://localhost:8081", "Token expired");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let challenge = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert_eq!(challenge, "Bearer realm=\"http://localhost:8081\"");
    }
}
