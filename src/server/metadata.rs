//! OAuth discovery metadata
//!
//! Implements RFC 8414 (OAuth Authorization Server Metadata) and
//! RFC 9728 (OAuth Protected Resource Metadata). Both documents are served
//! unauthenticated with permissive CORS so browser-based MCP clients can
//! discover the broker.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use super::router::AppState;

/// OAuth Authorization Server Metadata (RFC 8414)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Dynamic client registration endpoint (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    /// Supported scopes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,

    /// Supported response types
    #[serde(default)]
    pub response_types_supported: Vec<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,

    /// Supported token endpoint auth methods
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl AuthorizationServerMetadata {
    /// Build the metadata document for the given base URL.
    #[must_use]
    pub fn new(base_url: &str, scopes: Vec<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            issuer: base.to_string(),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            registration_endpoint: Some(format!("{base}/register")),
            scopes_supported: scopes,
            response_types_supported: vec!["code".to_string()],
            grant_types_supported: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            token_endpoint_auth_methods_supported: vec![
                "client_secret_post".to_string(),
                "none".to_string(),
            ],
            code_challenge_methods_supported: vec!["S256".to_string()],
        }
    }
}

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Supported scopes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,

    /// Supported bearer token methods
    #[serde(default)]
    pub bearer_methods_supported: Vec<String>,
}

impl ProtectedResourceMetadata {
    /// Build the metadata document for the given base URL.
    #[must_use]
    pub fn new(base_url: &str, scopes: Vec<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            resource: base.to_string(),
            authorization_servers: vec![base.to_string()],
            scopes_supported: scopes,
            bearer_methods_supported: vec!["header".to_string()],
        }
    }
}

fn metadata_response<T: Serialize>(document: T) -> Response {
    (
        [
            (header::CACHE_CONTROL, "public, max-age=3600"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Json(document),
    )
        .into_response()
}

/// `GET /.well-known/oauth-authorization-server`
pub async fn authorization_server_metadata_handler(
    State(state): State<Arc<AppState>>,
) -> Response {
    metadata_response(AuthorizationServerMetadata::new(
        &state.base_url,
        state.scopes.clone(),
    ))
}

/// `GET /.well-known/oauth-protected-resource`
pub async fn protected_resource_metadata_handler(State(state): State<Arc<AppState>>) -> Response {
    metadata_response(ProtectedResourceMetadata::new(
        &state.base_url,
        state.scopes.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_server_metadata_endpoints() {
        let meta = AuthorizationServerMetadata::new(
            "http://localhost:8081/",
            vec!["scope-a".to_string()],
        );
        assert_eq!(meta.issuer, "http://localhost:8081");
        assert_eq!(meta.authorization_endpoint, "http://localhost:8081/authorize");
        assert_eq!(meta.token_endpoint, "http://localhost:8081/token");
        assert_eq!(
            meta.registration_endpoint.as_deref(),
            Some("http://localhost:8081/register")
        );
        assert_eq!(meta.code_challenge_methods_supported, vec!["S256"]);
        assert_eq!(meta.response_types_supported, vec!["code"]);
    }

    #[test]
    fn protected_resource_metadata_points_back_at_broker() {
        let meta = ProtectedResourceMetadata::new("https://broker.example.com", Vec::new());
        assert_eq!(meta.resource, "https://broker.example.com");
        assert_eq!(
            meta.authorization_servers,
            vec!["https://broker.example.com"]
        );
        assert_eq!(meta.bearer_methods_supported, vec!["header"]);
    }

    #[test]
    fn empty_scopes_omitted_from_json() {
        let meta = ProtectedResourceMetadata::new("https://b.example.com", Vec::new());
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("scopes_supported"));
    }

    #[test]
    fn metadata_round_trips_through_serde() {
        let meta = AuthorizationServerMetadata::new(
            "https://broker.example.com",
            vec!["s1".to_string(), "s2".to_string()],
        );
        let json = serde_json::to_string(&meta).unwrap();
        let parsed: AuthorizationServerMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.issuer, meta.issuer);
        assert_eq!(parsed.scopes_supported, vec!["s1", "s2"]);
    }
}
