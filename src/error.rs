//! Error types for the auth broker

use std::io;

use thiserror::Error;

/// Result type alias for the auth broker
pub type Result<T> = std::result::Result<T, Error>;

/// Auth broker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token not found in the store
    #[error("token not found")]
    TokenNotFound,

    /// Token exists but is past its expiry
    #[error("token expired")]
    TokenExpired,

    /// Flow state unknown, already consumed, or expired
    #[error("invalid state")]
    InvalidState,

    /// No registered client with the given id
    #[error("client not found")]
    ClientNotFound,

    /// Upstream identity provider failure (network or OAuth error)
    #[error("upstream provider error: {0}")]
    Provider(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
