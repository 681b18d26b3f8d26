//! Upstream OAuth provider adapter
//!
//! Wraps the upstream (Google) OAuth configuration: builds the consent URL,
//! exchanges authorization codes, and refreshes upstream tokens. Upstream
//! failures pass through as opaque [`Error::Provider`] values; retry policy
//! belongs to the calling business logic, not this layer.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::GoogleConfig;
use crate::{Error, Result};

/// Clock-skew margin applied when deciding whether an upstream token is
/// still usable (seconds)
const EXPIRY_SKEW_SECS: i64 = 60;

/// An access/refresh token pair issued by the upstream identity provider.
///
/// Never exposed to the calling MCP client; the broker holds it and proxies
/// API access on the caller's behalf.
#[derive(Debug, Clone)]
pub struct UpstreamToken {
    /// Upstream access token
    pub access_token: String,
    /// Upstream refresh token, when offline access was granted
    pub refresh_token: Option<String>,
    /// Access token expiry; `None` means the token does not expire
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes granted by the user
    pub scopes: Vec<String>,
}

impl UpstreamToken {
    /// Check whether the token is expired, with a clock-skew margin: a token
    /// within [`EXPIRY_SKEW_SECS`] of expiry counts as expired so an API call
    /// made with it does not race the deadline.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| {
            Utc::now() + TimeDelta::seconds(EXPIRY_SKEW_SECS) >= expires_at
        })
    }
}

/// Upstream provider operations used by the authorization state machine and
/// the refreshing credential source.
#[async_trait]
pub trait UpstreamProvider: Send + Sync + 'static {
    /// Build the consent page URL the user agent is redirected to.
    fn auth_code_url(&self, state: &str) -> String;

    /// Exchange an upstream authorization code for tokens.
    async fn exchange(&self, code: &str) -> Result<UpstreamToken>;

    /// Obtain a fresh access token from a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamToken>;
}

/// Google OAuth provider
pub struct GoogleProvider {
    http_client: Client,
    config: GoogleConfig,
    auth_url: Url,
    redirect_uri: String,
}

/// Upstream token endpoint response
#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenEndpointResponse {
    fn into_token(self, fallback_refresh: Option<&str>) -> UpstreamToken {
        let expires_at = self
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));

        UpstreamToken {
            access_token: self.access_token,
            // Google omits the refresh token on refresh responses; keep the
            // one the session already holds.
            refresh_token: self
                .refresh_token
                .or_else(|| fallback_refresh.map(ToString::to_string)),
            expires_at,
            scopes: self
                .scope
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
        }
    }
}

impl GoogleProvider {
    /// Create a new Google provider.
    ///
    /// `redirect_uri` is the broker's own callback
    /// (`<base URL>/oauth/callback`), registered with Google.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configured consent URL is not a
    /// valid URL.
    pub fn new(http_client: Client, config: GoogleConfig, redirect_uri: String) -> Result<Self> {
        let auth_url = Url::parse(&config.auth_url)
            .map_err(|e| Error::Config(format!("invalid google.auth_url: {e}")))?;

        Ok(Self {
            http_client,
            config,
            auth_url,
            redirect_uri,
        })
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenEndpointResponse> {
        let response = self
            .http_client
            .post(&self.config.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "token endpoint returned HTTP {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("invalid token response: {e}")))
    }
}

#[async_trait]
impl UpstreamProvider for GoogleProvider {
    /// Build the Google consent URL.
    ///
    /// Always requests offline access and forces the consent screen, so a
    /// refresh token is obtained on every authorization rather than only the
    /// first one for a given user.
    fn auth_code_url(&self, state: &str) -> String {
        let mut url = self.auth_url.clone();

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.config.client_id);
            params.append_pair("redirect_uri", &self.redirect_uri);
            params.append_pair("state", state);
            params.append_pair("scope", &self.config.scopes.join(" "));
            params.append_pair("access_type", "offline");
            params.append_pair("prompt", "consent");
        }

        url.to_string()
    }

    async fn exchange(&self, code: &str) -> Result<UpstreamToken> {
        let response = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
                ("redirect_uri", &self.redirect_uri),
            ])
            .await?;

        debug!("exchanged upstream authorization code");
        Ok(response.into_token(None))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamToken> {
        let response = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
            ])
            .await?;

        debug!("refreshed upstream access token");
        Ok(response.into_token(Some(refresh_token)))
    }
}
