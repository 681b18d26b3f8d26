//! MCP Auth Broker Library
//!
//! OAuth 2.1 authorization proxy and token broker that lets MCP clients
//! (AI assistants) obtain delegated access to a user's Google account
//! without ever seeing the user's Google credentials or refresh token.
//!
//! # Features
//!
//! - **Authorization Code + PKCE**: full RFC 7636 flow, S256 only
//! - **Opaque Broker Tokens**: random access/refresh tokens bound to the
//!   upstream Google tokens, looked up in a concurrency-safe store
//! - **Dynamic Client Registration**: RFC 7591 self-service registration
//! - **Transparent Refresh**: expired upstream tokens are refreshed lazily,
//!   coalescing concurrent refreshes into one upstream call
//! - **Rate Limiting**: per-IP token buckets on all public endpoints
//! - **Discovery**: RFC 8414 and RFC 9728 metadata documents

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod oauth;
pub mod ratelimit;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
