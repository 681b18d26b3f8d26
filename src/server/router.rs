//! HTTP router and shared application state

use std::sync::Arc;

use axum::{
    Extension, Json, Router, middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
};

use super::auth::{AuthenticatedPrincipal, require_auth};
use super::handlers::{authorize_handler, callback_handler, token_handler};
use super::metadata::{
    authorization_server_metadata_handler, protected_resource_metadata_handler,
};
use super::registration::registration_handler;
use crate::config::TokenConfig;
use crate::oauth::{TokenStore, UpstreamProvider};
use crate::ratelimit::{IpRateLimiter, rate_limit_middleware};

/// Shared application state
///
/// Everything the handlers depend on is injected here by the broker's
/// constructor — there are no ambient singletons.
pub struct AppState {
    /// Credential/state/client store
    pub store: Arc<dyn TokenStore>,
    /// Upstream identity provider adapter
    pub provider: Arc<dyn UpstreamProvider>,
    /// Per-IP rate limiter for the public endpoints
    pub limiter: Arc<IpRateLimiter>,
    /// Externally visible base URL (issuer, bearer realm)
    pub base_url: String,
    /// Broker token lifetimes
    pub tokens: TokenConfig,
    /// Scopes advertised in the discovery documents
    pub scopes: Vec<String>,
    /// Request body cap (bytes)
    pub max_body_size: usize,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/session", get(session_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata_handler),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata_handler),
        )
        .route("/authorize", get(authorize_handler))
        .route("/oauth/callback", get(callback_handler))
        .route("/token", post(token_handler))
        .route("/register", post(registration_handler))
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiter),
            rate_limit_middleware,
        ))
        .layer(RequestBodyLimitLayer::new(state.max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /health` — liveness endpoint, no auth required.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /session` — report the authenticated caller's session.
///
/// This is the broker's "am I authenticated?" probe for downstream
/// consumers; the bearer middleware has already rejected anonymous callers
/// with 401 before this handler runs.
async fn session_handler(
    Extension(principal): Extension<AuthenticatedPrincipal>,
) -> impl IntoResponse {
    Json(json!({
        "authenticated": true,
        "client_id": principal.credential.client_id,
        "expires_at": principal.credential.expires_at.to_rfc3339(),
    }))
}
