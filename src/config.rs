//! Configuration management

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Scopes requested from Google for Tag Manager API access
pub const GOOGLE_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/tagmanager.delete.containers",
    "https://www.googleapis.com/auth/tagmanager.edit.containers",
    "https://www.googleapis.com/auth/tagmanager.edit.containerversions",
    "https://www.googleapis.com/auth/tagmanager.publish",
];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Google OAuth configuration
    pub google: GoogleConfig,
    /// Broker token lifetimes
    pub tokens: TokenConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible base URL (issuer, redirect target, bearer realm)
    pub base_url: String,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            base_url: "http://localhost:8081".to_string(),
            max_body_size: 64 * 1024,
        }
    }
}

/// Google OAuth configuration
///
/// The endpoint URLs default to Google's and exist as fields so tests can
/// point the provider at a local stand-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    /// OAuth client id issued by the Google Cloud console
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Consent page URL
    pub auth_url: String,
    /// Token exchange/refresh endpoint
    pub token_url: String,
    /// Scopes to request
    pub scopes: Vec<String>,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            auth_url: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes: GOOGLE_SCOPES.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Broker token lifetimes (seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Lifetime of issued access tokens
    pub access_token_ttl_secs: u64,
    /// Lifetime of the state bound to the upstream consent round-trip
    pub consent_state_ttl_secs: u64,
    /// Lifetime of broker-issued authorization codes
    pub auth_code_ttl_secs: u64,
    /// Period of the expired-entry sweep
    pub sweep_interval_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_token_ttl_secs: 3600,
            consent_state_ttl_secs: 600,
            auth_code_ttl_secs: 300,
            sweep_interval_secs: 300,
        }
    }
}

/// Rate limiting configuration for the public endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Requests per second per client IP
    pub requests_per_second: u32,
    /// Burst size per client IP
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10,
            burst_size: 20,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (BROKER_ prefix)
        figment = figment.merge(Env::prefixed("BROKER_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }

    /// Check that the upstream OAuth credentials are configured.
    ///
    /// The broker is the authentication subsystem; without Google
    /// credentials there is nothing it can broker.
    pub fn validate(&self) -> Result<()> {
        if self.google.client_id.is_empty() {
            return Err(Error::Config(
                "google.client_id is required (BROKER_GOOGLE__CLIENT_ID)".to_string(),
            ));
        }
        if self.google.client_secret.is_empty() {
            return Err(Error::Config(
                "google.client_secret is required (BROKER_GOOGLE__CLIENT_SECRET)".to_string(),
            ));
        }
        Ok(())
    }
}
