//! Dynamic Client Registration (RFC 7591)
//!
//! Self-service endpoint letting a new MCP client obtain a `client_id`
//! without manual provisioning. MCP clients are public (non-confidential),
//! so no client secret is issued and the token endpoint auth method is
//! always `"none"`.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use url::Url;

use super::router::AppState;
use crate::oauth::{CLIENT_ID_BYTES, RegisteredClient, generate_token};

/// Client registration request (RFC 7591)
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClientRegistrationRequest {
    /// Redirect URIs for the authorization code flow
    pub redirect_uris: Vec<String>,
    /// Optional display name
    pub client_name: String,
    /// Optional client information URI
    pub client_uri: String,
    /// Grant types the client asks for (the broker grants its fixed set)
    pub grant_types: Vec<String>,
    /// Response types the client asks for
    pub response_types: Vec<String>,
    /// Requested token endpoint auth method
    pub token_endpoint_auth_method: String,
}

/// Client registration response (RFC 7591)
#[derive(Debug, Serialize)]
pub struct ClientRegistrationResponse {
    /// Issued client id
    pub client_id: String,
    /// `0` — the registration does not expire
    pub client_secret_expires_at: i64,
    /// Registered redirect URIs, echoed back
    pub redirect_uris: Vec<String>,
    /// Display name, when given
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_name: String,
    /// Grant types this client may use
    pub grant_types: Vec<String>,
    /// Response types this client may use
    pub response_types: Vec<String>,
    /// Always `"none"` — public clients get no secret
    pub token_endpoint_auth_method: String,
}

/// `POST /register` — register a new OAuth client.
pub async fn registration_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ClientRegistrationRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return registration_error("invalid_request", "Invalid JSON");
    };

    if request.redirect_uris.is_empty() {
        return registration_error("invalid_redirect_uri", "At least one redirect_uri required");
    }

    for uri in &request.redirect_uris {
        if !is_valid_dcr_redirect_uri(uri) {
            return registration_error(
                "invalid_redirect_uri",
                &format!("Invalid redirect_uri: {uri}"),
            );
        }
    }

    let client_id = match generate_token(CLIENT_ID_BYTES) {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "failed to generate client_id");
            return registration_error("server_error", "Internal server error");
        }
    };

    let grant_types = vec![
        "authorization_code".to_string(),
        "refresh_token".to_string(),
    ];
    let response_types = vec!["code".to_string()];

    let client = RegisteredClient {
        client_id: client_id.clone(),
        redirect_uris: request.redirect_uris.clone(),
        client_name: request.client_name.clone(),
        grant_types: grant_types.clone(),
        response_types: response_types.clone(),
        token_endpoint_auth_method: "none".to_string(),
        created_at: Utc::now(),
    };

    if let Err(e) = state.store.store_client(client).await {
        error!(error = %e, "failed to store registered client");
        return registration_error("server_error", "Internal server error");
    }

    info!(client_id = %client_id, client_name = %request.client_name, "client registered");

    let response = ClientRegistrationResponse {
        client_id,
        client_secret_expires_at: 0,
        redirect_uris: request.redirect_uris,
        client_name: request.client_name,
        grant_types,
        response_types,
        token_endpoint_auth_method: "none".to_string(),
    };

    (StatusCode::CREATED, Json(response)).into_response()
}

fn registration_error(error: &str, description: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": error,
            "error_description": description,
        })),
    )
        .into_response()
}

/// Validate a redirect URI for Dynamic Client Registration.
///
/// More permissive than the default `/authorize` allow-list: any HTTPS URI
/// is acceptable, plus loopback hosts over plain HTTP for development.
fn is_valid_dcr_redirect_uri(uri: &str) -> bool {
    let Ok(parsed) = Url::parse(uri) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    if host.is_empty() {
        return false;
    }

    if host == "localhost" || host == "127.0.0.1" {
        return matches!(parsed.scheme(), "http" | "https");
    }

    parsed.scheme() == "https"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dcr_accepts_any_https_uri() {
        assert!(is_valid_dcr_redirect_uri("https://example.com/callback"));
        assert!(is_valid_dcr_redirect_uri("https://my-app.dev/oauth/done?x=1"));
    }

    #[test]
    fn dcr_accepts_loopback_http() {
        assert!(is_valid_dcr_redirect_uri("http://localhost:3000/cb"));
        assert!(is_valid_dcr_redirect_uri("http://127.0.0.1/cb"));
        assert!(is_valid_dcr_redirect_uri("https://localhost/cb"));
    }

    #[test]
    fn dcr_rejects_plain_http_elsewhere() {
        assert!(!is_valid_dcr_redirect_uri("http://example.com/callback"));
        assert!(!is_valid_dcr_redirect_uri("http://localhost.evil.com/cb"));
    }

    #[test]
    fn dcr_rejects_malformed_uris() {
        assert!(!is_valid_dcr_redirect_uri(""));
        assert!(!is_valid_dcr_redirect_uri("not-a-url"));
        assert!(!is_valid_dcr_redirect_uri("ftp://example.com/cb"));
        assert!(!is_valid_dcr_redirect_uri("javascript:alert(1)"));
    }

    #[test]
    fn registration_response_shape() {
        let response = ClientRegistrationResponse {
            client_id: "abc".to_string(),
            client_secret_expires_at: 0,
            redirect_uris: vec!["https://example.com/cb".to_string()],
            client_name: String::new(),
            grant_types: vec!["authorization_code".to_string()],
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: "none".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["token_endpoint_auth_method"], "none");
        assert_eq!(json["client_secret_expires_at"], 0);
        // No secret for public clients, empty name omitted
        assert!(json.get("client_secret").is_none());
        assert!(json.get("client_name").is_none());
    }
}
