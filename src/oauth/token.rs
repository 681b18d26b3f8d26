//! Secure token generation
//!
//! All broker-issued identifiers (state values, authorization codes, access
//! and refresh tokens, client ids) come from the operating system's CSPRNG.
//! A failing random source is a surfaced error, never a silent fallback to
//! a weaker generator.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::TryRng;
use rand::rngs::SysRng;

use crate::{Error, Result};

/// Byte length used for state values, authorization codes, and tokens
pub const TOKEN_BYTES: usize = 32;

/// Byte length used for generated client ids
pub const CLIENT_ID_BYTES: usize = 16;

/// Generate a cryptographically secure random URL-safe token.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the system random source fails.
pub fn generate_token(byte_len: usize) -> Result<String> {
    let mut bytes = vec![0u8; byte_len];
    SysRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Internal(format!("system random source failed: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}
