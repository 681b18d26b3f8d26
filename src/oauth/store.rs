//! Token/State/Client store
//!
//! The single source of truth for broker-issued credentials, in-flight flow
//! state, and dynamically registered clients. The [`TokenStore`] trait
//! abstracts over storage; the only current implementation is
//! [`MemoryTokenStore`], which keeps every map behind one `RwLock` so that
//! multi-map operations (consume, secondary-index maintenance) execute as a
//! single critical section.
//!
//! # Expiry
//!
//! Expiry is checked on every read; the periodic sweep exists only to bound
//! memory, not for correctness. The sweep computes the expired-key set under
//! the same write lock it deletes under, so a key concurrently reused
//! between scan and delete cannot be lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::provider::UpstreamToken;
use crate::{Error, Result};

/// Maximum number of dynamically registered clients kept in memory
const MAX_CLIENTS: usize = 1000;

/// Extra time an access-expired credential is kept before the sweep removes
/// it, so a refresh-token grant arriving with a skewed clock still finds it
const CREDENTIAL_SWEEP_GRACE_SECS: i64 = 3600;

/// A broker-minted credential bound to an upstream token.
///
/// Keyed by `access_token`; `refresh_token` is maintained as a secondary
/// index. A refresh rotation replaces the access token but preserves the
/// refresh token, so one logical session keeps a single refresh credential.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    /// Broker access token (primary key)
    pub access_token: String,
    /// Broker refresh token, absent on short-lived code-stage credentials
    pub refresh_token: Option<String>,
    /// Access token expiry
    pub expires_at: DateTime<Utc>,
    /// Refresh token expiry, if the refresh token itself expires
    pub refresh_expires_at: Option<DateTime<Utc>>,
    /// The upstream (Google) token this credential wraps
    pub upstream: UpstreamToken,
    /// Client the credential was issued to
    pub client_id: String,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// Transient state for an in-flight authorization flow.
///
/// The same shape serves two stages with different lifetimes: bound to the
/// upstream consent round-trip (~10 min), then re-created keyed by the
/// broker's own authorization code (~5 min). Single-use: consuming it
/// deletes it atomically.
#[derive(Debug, Clone)]
pub struct FlowState {
    /// Random state value or broker authorization code (primary key)
    pub state: String,
    /// The caller's own `state`, echoed back on the final redirect
    pub caller_state: String,
    /// PKCE code challenge (S256, base64url without padding)
    pub code_challenge: String,
    /// Caller redirect URI, re-used at the code stage
    pub redirect_uri: String,
    /// Client id presented at `/authorize` (may be empty for unregistered
    /// clients)
    pub client_id: String,
    /// RFC 8707 resource parameter for audience binding, when supplied
    pub resource: Option<String>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Stage-dependent expiry set by the creator
    pub expires_at: DateTime<Utc>,
}

impl FlowState {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// A client registered through RFC 7591 Dynamic Client Registration.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    /// Client id (primary key)
    pub client_id: String,
    /// Redirect URIs the client may use, validated exactly at `/authorize`
    pub redirect_uris: Vec<String>,
    /// Display name
    pub client_name: String,
    /// Grant types the client may use
    pub grant_types: Vec<String>,
    /// Response types the client may use
    pub response_types: Vec<String>,
    /// Token endpoint auth method (`"none"` for public clients)
    pub token_endpoint_auth_method: String,
    /// Registration instant (drives oldest-first eviction)
    pub created_at: DateTime<Utc>,
}

/// Storage operations for broker credentials, flow state, and registered
/// clients. All operations are safe for unbounded concurrent callers.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Store an issued credential, indexing its refresh token.
    async fn store_credential(&self, cred: IssuedCredential) -> Result<()>;

    /// Look up a credential by access token.
    ///
    /// Returns [`Error::TokenNotFound`] for unknown tokens and
    /// [`Error::TokenExpired`] when the access expiry has passed.
    async fn get_by_access_token(&self, access_token: &str) -> Result<IssuedCredential>;

    /// Look up a credential through the refresh-token index.
    ///
    /// Returns [`Error::TokenExpired`] only when the refresh token itself
    /// has expired; an expired access token is fine here.
    async fn get_by_refresh_token(&self, refresh_token: &str) -> Result<IssuedCredential>;

    /// Delete a credential and its refresh-index entry.
    async fn delete_credential(&self, access_token: &str) -> Result<()>;

    /// Replace the upstream token held by a credential.
    async fn update_upstream_token(
        &self,
        access_token: &str,
        upstream: UpstreamToken,
    ) -> Result<()>;

    /// Store in-flight flow state.
    async fn store_flow_state(&self, state: FlowState) -> Result<()>;

    /// Look up flow state without consuming it.
    async fn get_flow_state(&self, state: &str) -> Result<FlowState>;

    /// Atomically fetch and delete flow state.
    ///
    /// Exactly one of any number of concurrent consumers of the same key
    /// succeeds; the rest get [`Error::InvalidState`]. An expired entry is
    /// deleted and reported invalid.
    async fn consume_flow_state(&self, state: &str) -> Result<FlowState>;

    /// Delete flow state.
    async fn delete_flow_state(&self, state: &str) -> Result<()>;

    /// Store a registered client.
    async fn store_client(&self, client: RegisteredClient) -> Result<()>;

    /// Look up a registered client by id.
    async fn get_client(&self, client_id: &str) -> Result<RegisteredClient>;

    /// Delete a registered client.
    async fn delete_client(&self, client_id: &str) -> Result<()>;

    /// Remove expired entries and trim the client registry. Returns the
    /// number of entries removed. Called by the background sweeper.
    async fn sweep_expired(&self) -> usize;
}

#[derive(Default)]
struct StoreInner {
    /// Credentials keyed by access token
    credentials: HashMap<String, IssuedCredential>,
    /// Flow states keyed by state value / broker code
    flow_states: HashMap<String, FlowState>,
    /// Registered clients keyed by client id
    clients: HashMap<String, RegisteredClient>,
    /// Secondary index: refresh token -> access token
    refresh_index: HashMap<String, String>,
}

impl StoreInner {
    fn remove_credential(&mut self, access_token: &str) {
        if let Some(cred) = self.credentials.remove(access_token) {
            if let Some(refresh_token) = cred.refresh_token {
                // A rotation stores the successor under the same refresh
                // token before the old record is deleted; only drop the
                // index entry if it still points at this record.
                if self
                    .refresh_index
                    .get(&refresh_token)
                    .is_some_and(|indexed| indexed == access_token)
                {
                    self.refresh_index.remove(&refresh_token);
                }
            }
        }
    }
}

/// In-memory [`TokenStore`] implementation.
pub struct MemoryTokenStore {
    inner: RwLock<StoreInner>,
}

impl MemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn store_credential(&self, cred: IssuedCredential) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(ref refresh_token) = cred.refresh_token {
            inner
                .refresh_index
                .insert(refresh_token.clone(), cred.access_token.clone());
        }
        inner.credentials.insert(cred.access_token.clone(), cred);
        Ok(())
    }

    async fn get_by_access_token(&self, access_token: &str) -> Result<IssuedCredential> {
        let inner = self.inner.read();
        let cred = inner
            .credentials
            .get(access_token)
            .ok_or(Error::TokenNotFound)?;

        if Utc::now() >= cred.expires_at {
            return Err(Error::TokenExpired);
        }

        Ok(cred.clone())
    }

    async fn get_by_refresh_token(&self, refresh_token: &str) -> Result<IssuedCredential> {
        let inner = self.inner.read();
        let access_token = inner
            .refresh_index
            .get(refresh_token)
            .ok_or(Error::TokenNotFound)?;
        let cred = inner
            .credentials
            .get(access_token)
            .ok_or(Error::TokenNotFound)?;

        if cred
            .refresh_expires_at
            .is_some_and(|expiry| Utc::now() >= expiry)
        {
            return Err(Error::TokenExpired);
        }

        Ok(cred.clone())
    }

    async fn delete_credential(&self, access_token: &str) -> Result<()> {
        self.inner.write().remove_credential(access_token);
        Ok(())
    }

    async fn update_upstream_token(
        &self,
        access_token: &str,
        upstream: UpstreamToken,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let cred = inner
            .credentials
            .get_mut(access_token)
            .ok_or(Error::TokenNotFound)?;
        cred.upstream = upstream;
        Ok(())
    }

    async fn store_flow_state(&self, state: FlowState) -> Result<()> {
        self.inner
            .write()
            .flow_states
            .insert(state.state.clone(), state);
        Ok(())
    }

    async fn get_flow_state(&self, state: &str) -> Result<FlowState> {
        let inner = self.inner.read();
        let flow = inner.flow_states.get(state).ok_or(Error::InvalidState)?;

        if flow.is_expired() {
            return Err(Error::InvalidState);
        }

        Ok(flow.clone())
    }

    async fn consume_flow_state(&self, state: &str) -> Result<FlowState> {
        let mut inner = self.inner.write();
        let flow = inner.flow_states.remove(state).ok_or(Error::InvalidState)?;

        // Removed before the expiry check: an expired consume is still
        // single-use.
        if flow.is_expired() {
            return Err(Error::InvalidState);
        }

        Ok(flow)
    }

    async fn delete_flow_state(&self, state: &str) -> Result<()> {
        self.inner.write().flow_states.remove(state);
        Ok(())
    }

    async fn store_client(&self, client: RegisteredClient) -> Result<()> {
        self.inner
            .write()
            .clients
            .insert(client.client_id.clone(), client);
        Ok(())
    }

    async fn get_client(&self, client_id: &str) -> Result<RegisteredClient> {
        self.inner
            .read()
            .clients
            .get(client_id)
            .cloned()
            .ok_or(Error::ClientNotFound)
    }

    async fn delete_client(&self, client_id: &str) -> Result<()> {
        self.inner.write().clients.remove(client_id);
        Ok(())
    }

    async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        let mut inner = self.inner.write();

        let expired_access: Vec<String> = inner
            .credentials
            .values()
            .filter(|cred| {
                let access_long_gone =
                    now >= cred.expires_at + TimeDelta::seconds(CREDENTIAL_SWEEP_GRACE_SECS);
                let refresh_gone = cred
                    .refresh_expires_at
                    .is_some_and(|expiry| now >= expiry);
                access_long_gone || refresh_gone
            })
            .map(|cred| cred.access_token.clone())
            .collect();

        for access_token in expired_access {
            inner.remove_credential(&access_token);
            removed += 1;
        }

        let before = inner.flow_states.len();
        inner.flow_states.retain(|_, flow| now < flow.expires_at);
        removed += before - inner.flow_states.len();

        // Oldest-first eviction keeps the registry bounded against
        // registration floods.
        while inner.clients.len() > MAX_CLIENTS {
            let Some(oldest) = inner
                .clients
                .values()
                .min_by_key(|client| client.created_at)
                .map(|client| client.client_id.clone())
            else {
                break;
            };
            inner.clients.remove(&oldest);
            removed += 1;
        }

        removed
    }
}

/// Spawn a background task that sweeps the store every `interval`.
///
/// The task exits when the `shutdown` receiver fires, so embedding and test
/// scenarios do not leak it.
pub fn spawn_sweeper(
    store: Arc<dyn TokenStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = store.sweep_expired().await;
                    if removed > 0 {
                        debug!(count = removed, "Swept expired store entries");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Store sweeper shutting down");
                    break;
                }
            }
        }
    });
}
