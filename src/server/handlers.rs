//! Authorization state machine
//!
//! The HTTP-facing orchestrator for the broker's three OAuth endpoints:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/authorize` | Validate the client request, redirect to Google consent |
//! | `GET` | `/oauth/callback` | Receive Google's code, mint a broker code, redirect back |
//! | `POST` | `/token` | Exchange a broker code (PKCE-verified) or refresh token |
//!
//! Client-facing failures are JSON `{"error", "error_description"}` bodies
//! with HTTP 400; method mismatches get 405 from the router.

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{TimeDelta, Utc};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use url::Url;

use super::router::AppState;
use crate::oauth::{FlowState, IssuedCredential, TOKEN_BYTES, generate_token};

/// Production redirect targets, matched on exact host **and** path.
///
/// Host equality (not prefix matching) is what defeats `claude.ai.evil.com`,
/// `evil.claude.ai`, and `localhost.evil.com` style spoofs.
const ALLOWED_REDIRECTS: &[(&str, &str)] = &[
    ("claude.ai", "/api/mcp/auth_callback"),
    ("claude.com", "/api/mcp/auth_callback"),
    ("chatgpt.com", "/connector_platform_oauth_redirect"),
    ("platform.openai.com", "/apps-manage/oauth"),
];

/// `GET /authorize` query parameters
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthorizeParams {
    response_type: String,
    client_id: String,
    redirect_uri: String,
    state: String,
    code_challenge: String,
    code_challenge_method: String,
    resource: Option<String>,
}

/// `POST /token` form body
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TokenParams {
    grant_type: String,
    code: String,
    code_verifier: String,
    refresh_token: String,
}

/// `GET /oauth/callback` query parameters
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CallbackParams {
    code: String,
    state: String,
    error: String,
    error_description: String,
}

/// `GET /authorize` — validate the caller's request and redirect the user
/// agent to the upstream consent page.
pub async fn authorize_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    if params.response_type != "code" {
        return oauth_error(
            "unsupported_response_type",
            "Only 'code' response type is supported",
        );
    }

    if params.state.is_empty() {
        return oauth_error("invalid_request", "State parameter is required");
    }

    // Redirect URI policy: a registered client is held to exactly its
    // registered list; everyone else gets the default allow-list.
    if params.client_id.is_empty() {
        if !is_valid_redirect_uri(&params.redirect_uri) {
            return oauth_error("invalid_request", "Invalid redirect_uri");
        }
    } else if let Ok(client) = state.store.get_client(&params.client_id).await {
        if !client.redirect_uris.iter().any(|u| u == &params.redirect_uri) {
            return oauth_error(
                "invalid_request",
                "redirect_uri does not match registered URIs",
            );
        }
    } else if !is_valid_redirect_uri(&params.redirect_uri) {
        return oauth_error("invalid_request", "Invalid redirect_uri");
    }

    // PKCE is required, S256 only
    if params.code_challenge.is_empty() || params.code_challenge_method != "S256" {
        return oauth_error("invalid_request", "PKCE with S256 is required");
    }

    // Our own state for the upstream round-trip
    let internal_state = match generate_token(TOKEN_BYTES) {
        Ok(token) => token,
        Err(e) => {
            error!(error = %e, "failed to generate state");
            return oauth_error("server_error", "Internal server error");
        }
    };

    let now = Utc::now();
    let flow = FlowState {
        state: internal_state.clone(),
        caller_state: params.state.clone(),
        code_challenge: params.code_challenge,
        redirect_uri: params.redirect_uri.clone(),
        client_id: params.client_id.clone(),
        resource: params.resource,
        created_at: now,
        expires_at: now + ttl(state.tokens.consent_state_ttl_secs),
    };

    if let Err(e) = state.store.store_flow_state(flow).await {
        error!(error = %e, "failed to store state");
        return oauth_error("server_error", "Internal server error");
    }

    // The upstream state carries both halves so the callback can recover
    // the internal key and echo the caller's own state.
    let combined_state = format!("{internal_state}|{}", params.state);
    let consent_url = state.provider.auth_code_url(&combined_state);

    info!(
        client_id = %params.client_id,
        redirect_uri = %params.redirect_uri,
        "redirecting to upstream consent page"
    );

    found(&consent_url)
}

/// `GET /oauth/callback` — receive the upstream authorization code, exchange
/// it, and hand the caller a broker-issued code instead.
pub async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    // Upstream consent errors surface directly
    if !params.error.is_empty() {
        error!(error = %params.error, description = %params.error_description, "upstream OAuth error");
        return oauth_error(&params.error, &params.error_description);
    }

    if params.code.is_empty() || params.state.is_empty() {
        return oauth_error("invalid_request", "Missing code or state");
    }

    // Combined state is `internal|caller`; everything after the first `|`
    // belongs to the caller and is ignored in favor of the stored value.
    let Some((internal_state, _)) = params.state.split_once('|') else {
        return oauth_error("invalid_request", "Invalid state format");
    };

    // Single-use: the consent state is gone after this, whatever happens next
    let flow = match state.store.consume_flow_state(internal_state).await {
        Ok(flow) => flow,
        Err(e) => {
            warn!(error = %e, "failed to consume consent state");
            return oauth_error("invalid_request", "Invalid or expired state");
        }
    };

    let upstream = match state.provider.exchange(&params.code).await {
        Ok(token) => token,
        Err(e) => {
            error!(error = %e, "failed to exchange code with upstream");
            return oauth_error("server_error", "Failed to exchange authorization code");
        }
    };

    // Broker-issued authorization code for the caller
    let broker_code = match generate_token(TOKEN_BYTES) {
        Ok(token) => token,
        Err(e) => {
            error!(error = %e, "failed to generate code");
            return oauth_error("server_error", "Internal server error");
        }
    };

    let now = Utc::now();
    let code_ttl = ttl(state.tokens.auth_code_ttl_secs);

    // Re-keyed flow state so PKCE can be verified at /token
    let code_flow = FlowState {
        state: broker_code.clone(),
        caller_state: flow.caller_state.clone(),
        code_challenge: flow.code_challenge,
        redirect_uri: flow.redirect_uri.clone(),
        client_id: flow.client_id.clone(),
        resource: flow.resource,
        created_at: now,
        expires_at: now + code_ttl,
    };

    // Short-lived credential parking the upstream token until the exchange
    let pending = IssuedCredential {
        access_token: broker_code.clone(),
        refresh_token: None,
        expires_at: now + code_ttl,
        refresh_expires_at: None,
        upstream,
        client_id: flow.client_id.clone(),
        created_at: now,
    };

    if let Err(e) = state.store.store_flow_state(code_flow).await {
        error!(error = %e, "failed to store code state");
        return oauth_error("server_error", "Internal server error");
    }
    if let Err(e) = state.store.store_credential(pending).await {
        error!(error = %e, "failed to store pending credential");
        return oauth_error("server_error", "Internal server error");
    }

    let Ok(mut redirect_url) = Url::parse(&flow.redirect_uri) else {
        return oauth_error("invalid_request", "Invalid redirect_uri");
    };
    redirect_url
        .query_pairs_mut()
        .append_pair("code", &broker_code)
        .append_pair("state", &flow.caller_state);

    info!(redirect_uri = %flow.redirect_uri, "OAuth callback successful, redirecting to caller");

    found(redirect_url.as_str())
}

/// `POST /token` — dispatch on `grant_type`.
pub async fn token_handler(
    State(state): State<Arc<AppState>>,
    Form(params): Form<TokenParams>,
) -> Response {
    match params.grant_type.as_str() {
        "authorization_code" => authorization_code_grant(&state, &params).await,
        "refresh_token" => refresh_token_grant(&state, &params).await,
        _ => oauth_error("unsupported_grant_type", "Unsupported grant type"),
    }
}

async fn authorization_code_grant(state: &Arc<AppState>, params: &TokenParams) -> Response {
    if params.code.is_empty() {
        return oauth_error("invalid_request", "Missing code");
    }

    // Peek first so a verifier mistake can be retried against a still-live
    // code; the consume below is the single-use gate.
    let flow = match state.store.get_flow_state(&params.code).await {
        Ok(flow) => flow,
        Err(e) => {
            warn!(error = %e, "failed to get code state");
            return oauth_error("invalid_grant", "Invalid or expired code");
        }
    };

    // An absent verifier is a failed proof, not a missing parameter
    if params.code_verifier.is_empty() || !verify_pkce(&params.code_verifier, &flow.code_challenge)
    {
        // The verifier itself is never logged
        error!(
            client_id = %flow.client_id,
            expected_challenge = %flow.code_challenge,
            "PKCE verification failed"
        );
        return oauth_error("invalid_grant", "PKCE verification failed");
    }

    // Atomic consume: of two concurrent exchanges of the same code, exactly
    // one gets past this point.
    if let Err(e) = state.store.consume_flow_state(&params.code).await {
        warn!(error = %e, "authorization code already consumed");
        return oauth_error("invalid_grant", "Invalid or expired code");
    }

    let pending = match state.store.get_by_access_token(&params.code).await {
        Ok(cred) => cred,
        Err(e) => {
            warn!(error = %e, "failed to get pending credential");
            return oauth_error("invalid_grant", "Invalid or expired code");
        }
    };
    let _ = state.store.delete_credential(&params.code).await;

    let (access_token, refresh_token) =
        match (generate_token(TOKEN_BYTES), generate_token(TOKEN_BYTES)) {
            (Ok(access), Ok(refresh)) => (access, refresh),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to generate tokens");
                return oauth_error("server_error", "Internal server error");
            }
        };

    let now = Utc::now();
    let access_ttl = ttl(state.tokens.access_token_ttl_secs);
    let credential = IssuedCredential {
        access_token: access_token.clone(),
        refresh_token: Some(refresh_token.clone()),
        expires_at: now + access_ttl,
        refresh_expires_at: None,
        upstream: pending.upstream,
        client_id: flow.client_id.clone(),
        created_at: now,
    };

    if let Err(e) = state.store.store_credential(credential).await {
        error!(error = %e, "failed to store token");
        return oauth_error("server_error", "Internal server error");
    }

    info!(client_id = %flow.client_id, "issued access token");

    token_response(&access_token, &refresh_token, access_ttl.num_seconds())
}

async fn refresh_token_grant(state: &Arc<AppState>, params: &TokenParams) -> Response {
    if params.refresh_token.is_empty() {
        return oauth_error("invalid_request", "Missing refresh_token");
    }

    let mut credential = match state.store.get_by_refresh_token(&params.refresh_token).await {
        Ok(cred) => cred,
        Err(e) => {
            warn!(error = %e, "failed to get token by refresh");
            return oauth_error("invalid_grant", "Invalid refresh token");
        }
    };

    // Renew the upstream session first if it has lapsed
    if credential.upstream.is_expired() {
        let Some(upstream_refresh) = credential.upstream.refresh_token.clone() else {
            warn!("upstream session has no refresh token");
            return oauth_error("invalid_grant", "Failed to refresh upstream token");
        };
        match state.provider.refresh(&upstream_refresh).await {
            Ok(upstream) => credential.upstream = upstream,
            Err(e) => {
                error!(error = %e, "failed to refresh upstream token");
                return oauth_error("invalid_grant", "Failed to refresh upstream token");
            }
        }
    }

    let new_access_token = match generate_token(TOKEN_BYTES) {
        Ok(token) => token,
        Err(e) => {
            error!(error = %e, "failed to generate access token");
            return oauth_error("server_error", "Internal server error");
        }
    };

    // Rotation: new access token, same refresh token, one logical session.
    // The new record is stored before the old one is deleted, so a request
    // dropped between the two writes never strands the session.
    let now = Utc::now();
    let access_ttl = ttl(state.tokens.access_token_ttl_secs);
    let rotated = IssuedCredential {
        access_token: new_access_token.clone(),
        refresh_token: Some(params.refresh_token.clone()),
        expires_at: now + access_ttl,
        refresh_expires_at: credential.refresh_expires_at,
        upstream: credential.upstream,
        client_id: credential.client_id.clone(),
        created_at: now,
    };

    if let Err(e) = state.store.store_credential(rotated).await {
        error!(error = %e, "failed to store new token");
        return oauth_error("server_error", "Internal server error");
    }

    let _ = state.store.delete_credential(&credential.access_token).await;

    info!(client_id = %credential.client_id, "refreshed access token");

    token_response(&new_access_token, &params.refresh_token, access_ttl.num_seconds())
}

/// Verify `SHA256(code_verifier)` against the stored challenge
/// (base64url, no padding). Constant-time comparison; length mismatches
/// compare unequal.
fn verify_pkce(code_verifier: &str, code_challenge: &str) -> bool {
    let digest = Sha256::digest(code_verifier.as_bytes());
    let computed = URL_SAFE_NO_PAD.encode(digest);
    computed.as_bytes().ct_eq(code_challenge.as_bytes()).into()
}

/// Check a redirect URI against the default policy: exact allow-listed
/// production callbacks over HTTPS, or loopback hosts over HTTP/HTTPS for
/// local development.
fn is_valid_redirect_uri(uri: &str) -> bool {
    let Ok(parsed) = Url::parse(uri) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };

    if host == "localhost" || host == "127.0.0.1" {
        return matches!(parsed.scheme(), "http" | "https");
    }

    if parsed.scheme() != "https" {
        return false;
    }

    ALLOWED_REDIRECTS
        .iter()
        .any(|(allowed_host, allowed_path)| *allowed_host == host && *allowed_path == parsed.path())
}

/// Successful token response with the caching headers RFC 6749 requires.
fn token_response(access_token: &str, refresh_token: &str, expires_in: i64) -> Response {
    (
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        Json(json!({
            "access_token": access_token,
            "token_type": "Bearer",
            "expires_in": expires_in,
            "refresh_token": refresh_token,
        })),
    )
        .into_response()
}

/// OAuth error response: JSON body, HTTP 400.
fn oauth_error(error: &str, description: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": error,
            "error_description": description,
        })),
    )
        .into_response()
}

/// 302 redirect (the status upstream consent pages and OAuth clients expect).
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Configured lifetime as a `TimeDelta`; out-of-range values fall back to
/// one hour rather than panicking inside a handler.
fn ttl(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or_else(|| TimeDelta::seconds(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Redirect URI policy
    // =========================================================================

    #[test]
    fn accepts_known_production_callbacks() {
        assert!(is_valid_redirect_uri("https://claude.ai/api/mcp/auth_callback"));
        assert!(is_valid_redirect_uri("https://claude.ai/api/mcp/auth_callback?foo=bar"));
        assert!(is_valid_redirect_uri("https://claude.com/api/mcp/auth_callback"));
        assert!(is_valid_redirect_uri("https://chatgpt.com/connector_platform_oauth_redirect"));
        assert!(is_valid_redirect_uri("https://platform.openai.com/apps-manage/oauth"));
    }

    #[test]
    fn accepts_loopback_for_development() {
        assert!(is_valid_redirect_uri("http://localhost:8080/callback"));
        assert!(is_valid_redirect_uri("https://localhost:8080/callback"));
        assert!(is_valid_redirect_uri("http://127.0.0.1:8080/callback"));
        assert!(is_valid_redirect_uri("https://127.0.0.1/anything"));
    }

    #[test]
    fn rejects_domain_spoofing() {
        // Suffix/prefix attacks must fail on exact host matching
        assert!(!is_valid_redirect_uri("https://claude.ai.evil.com/api/mcp/auth_callback"));
        assert!(!is_valid_redirect_uri("https://evil.claude.ai/api/mcp/auth_callback"));
        assert!(!is_valid_redirect_uri("http://localhost.evil.com/callback"));
    }

    #[test]
    fn rejects_wrong_path_or_scheme() {
        assert!(!is_valid_redirect_uri("https://claude.ai/wrong/path"));
        assert!(!is_valid_redirect_uri("http://claude.ai/api/mcp/auth_callback"));
        assert!(!is_valid_redirect_uri("https://chatgpt.com/wrong/path"));
        assert!(!is_valid_redirect_uri("https://platform.openai.com/wrong"));
    }

    #[test]
    fn rejects_unknown_and_malformed_uris() {
        assert!(!is_valid_redirect_uri("https://evil.com/callback"));
        assert!(!is_valid_redirect_uri(""));
        assert!(!is_valid_redirect_uri("not-a-url"));
        assert!(!is_valid_redirect_uri("//claude.ai/api/mcp/auth_callback"));
        assert!(!is_valid_redirect_uri("https:///callback"));
        assert!(!is_valid_redirect_uri("data:text/html,<script>alert('xss')</script>"));
        assert!(!is_valid_redirect_uri("javascript:alert('xss')"));
    }

    // =========================================================================
    // PKCE verification
    // =========================================================================

    #[test]
    fn pkce_accepts_matching_verifier() {
        let verifier = "test-verifier-123";
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        assert!(verify_pkce(verifier, &challenge));
    }

    #[test]
    fn pkce_rejects_wrong_verifier() {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(b"test-verifier-123"));
        assert!(!verify_pkce("other-verifier", &challenge));
    }

    #[test]
    fn pkce_rejects_empty_verifier() {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(b"test-verifier-123"));
        assert!(!verify_pkce("", &challenge));
    }

    #[test]
    fn pkce_rejects_garbage_challenge() {
        assert!(!verify_pkce("test-verifier-123", "wrong-challenge"));
        assert!(!verify_pkce("test-verifier-123", ""));
    }
}
