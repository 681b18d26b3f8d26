//! Auto-refreshing credential source
//!
//! Downstream business logic (the Tag Manager tools) asks this type for a
//! currently-valid upstream token whenever it makes an upstream API call.
//! The source refreshes lazily on expiry and propagates the refreshed token
//! back to the store best-effort.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::provider::{UpstreamProvider, UpstreamToken};
use super::store::{IssuedCredential, TokenStore};
use crate::{Error, Result};

/// Wraps one issued credential's upstream token with lazy refresh.
///
/// The mutex makes "check validity, refresh, replace" one atomic unit: N
/// concurrent callers on the same source trigger exactly one upstream
/// refresh call. A cancelled refresh leaves the previously-held token in
/// place.
pub struct RefreshingTokenSource {
    store: Arc<dyn TokenStore>,
    provider: Arc<dyn UpstreamProvider>,
    /// Broker access token identifying the credential in the store
    access_token: String,
    current: Mutex<UpstreamToken>,
}

impl RefreshingTokenSource {
    /// Create a source for the given issued credential.
    #[must_use]
    pub fn new(
        store: Arc<dyn TokenStore>,
        provider: Arc<dyn UpstreamProvider>,
        credential: &IssuedCredential,
    ) -> Self {
        Self {
            store,
            provider,
            access_token: credential.access_token.clone(),
            current: Mutex::new(credential.upstream.clone()),
        }
    }

    /// Return a currently-valid upstream token, refreshing it first if the
    /// held one is expired.
    ///
    /// A store write failure while persisting the refreshed token is logged
    /// and swallowed: the in-memory token is still usable for the current
    /// request.
    pub async fn token(&self) -> Result<UpstreamToken> {
        let mut current = self.current.lock().await;

        if !current.is_expired() {
            return Ok(current.clone());
        }

        info!("upstream token expired, refreshing");

        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| Error::Provider("upstream session has no refresh token".to_string()))?;

        let new_token = self.provider.refresh(&refresh_token).await?;
        *current = new_token.clone();

        if let Err(e) = self
            .store
            .update_upstream_token(&self.access_token, new_token.clone())
            .await
        {
            warn!(error = %e, "failed to persist refreshed upstream token to store");
        }

        Ok(new_token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeDelta, Utc};

    use super::*;
    use crate::oauth::store::MemoryTokenStore;

    /// Provider stub that counts refresh calls and holds the lock long
    /// enough for races to show up.
    struct CountingProvider {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamProvider for CountingProvider {
        fn auth_code_url(&self, _state: &str) -> String {
            "https://idp.invalid/consent".to_string()
        }

        async fn exchange(&self, _code: &str) -> Result<UpstreamToken> {
            unimplemented!("not used by the source")
        }

        async fn refresh(&self, refresh_token: &str) -> Result<UpstreamToken> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(25)).await;
            Ok(UpstreamToken {
                access_token: "refreshed-access".to_string(),
                refresh_token: Some(refresh_token.to_string()),
                expires_at: Some(Utc::now() + TimeDelta::seconds(3600)),
                scopes: Vec::new(),
            })
        }
    }

    /// Provider stub whose refresh always fails.
    struct FailingProvider;

    #[async_trait]
    impl UpstreamProvider for FailingProvider {
        fn auth_code_url(&self, _state: &str) -> String {
            String::new()
        }

        async fn exchange(&self, _code: &str) -> Result<UpstreamToken> {
            Err(Error::Provider("exchange failed".to_string()))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<UpstreamToken> {
            Err(Error::Provider("refresh failed".to_string()))
        }
    }

    fn make_credential(upstream_expires_offset_secs: i64) -> IssuedCredential {
        IssuedCredential {
            access_token: "broker-access".to_string(),
            refresh_token: Some("broker-refresh".to_string()),
            expires_at: Utc::now() + TimeDelta::seconds(3600),
            refresh_expires_at: None,
            upstream: UpstreamToken {
                access_token: "upstream-access".to_string(),
                refresh_token: Some("upstream-refresh".to_string()),
                expires_at: Some(Utc::now() + TimeDelta::seconds(upstream_expires_offset_secs)),
                scopes: Vec::new(),
            },
            client_id: "client-1".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn valid_token_returned_without_refresh() {
        let store = Arc::new(MemoryTokenStore::new());
        let provider = Arc::new(CountingProvider {
            refreshes: AtomicUsize::new(0),
        });
        let cred = make_credential(3600);
        let source = RefreshingTokenSource::new(store, provider.clone(), &cred);

        let token = source.token().await.unwrap();
        assert_eq!(token.access_token, "upstream-access");
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_triggers_refresh_and_store_update() {
        let store = Arc::new(MemoryTokenStore::new());
        let cred = make_credential(-10);
        store.store_credential(cred.clone()).await.unwrap();

        let provider = Arc::new(CountingProvider {
            refreshes: AtomicUsize::new(0),
        });
        let source =
            RefreshingTokenSource::new(store.clone(), provider.clone(), &cred);

        let token = source.token().await.unwrap();
        assert_eq!(token.access_token, "refreshed-access");
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);

        // Refreshed token propagated to the store
        let stored = store.get_by_access_token("broker-access").await.unwrap();
        assert_eq!(stored.upstream.access_token, "refreshed-access");
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce_into_one_refresh() {
        let store = Arc::new(MemoryTokenStore::new());
        let cred = make_credential(-10);
        store.store_credential(cred.clone()).await.unwrap();

        let provider = Arc::new(CountingProvider {
            refreshes: AtomicUsize::new(0),
        });
        let source = Arc::new(RefreshingTokenSource::new(
            store.clone(),
            provider.clone(),
            &cred,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let source = Arc::clone(&source);
            handles.push(tokio::spawn(async move { source.token().await }));
        }
        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.access_token, "refreshed-access");
        }

        assert_eq!(
            provider.refreshes.load(Ordering::SeqCst),
            1,
            "N concurrent callers must trigger exactly one upstream refresh"
        );
    }

    #[tokio::test]
    async fn store_write_failure_does_not_fail_the_caller() {
        // Credential never stored, so the propagation write fails with
        // TokenNotFound; the caller must still get the refreshed token.
        let store = Arc::new(MemoryTokenStore::new());
        let cred = make_credential(-10);
        let provider = Arc::new(CountingProvider {
            refreshes: AtomicUsize::new(0),
        });
        let source = RefreshingTokenSource::new(store, provider.clone(), &cred);

        let token = source.token().await.unwrap();
        assert_eq!(token.access_token, "refreshed-access");
    }

    #[tokio::test]
    async fn provider_failure_propagates_and_keeps_old_token() {
        let store = Arc::new(MemoryTokenStore::new());
        let cred = make_credential(-10);
        store.store_credential(cred.clone()).await.unwrap();

        let source = RefreshingTokenSource::new(
            store.clone(),
            Arc::new(FailingProvider),
            &cred,
        );

        assert!(source.token().await.is_err());

        // The stored credential is untouched: a failed refresh must not
        // delete or corrupt the previously-valid record.
        let stored = store.get_by_access_token("broker-access").await.unwrap();
        assert_eq!(stored.upstream.access_token, "upstream-access");
    }

    #[tokio::test]
    async fn missing_upstream_refresh_token_is_an_error() {
        let store = Arc::new(MemoryTokenStore::new());
        let mut cred = make_credential(-10);
        cred.upstream.refresh_token = None;
        let provider = Arc::new(CountingProvider {
            refreshes: AtomicUsize::new(0),
        });
        let source = RefreshingTokenSource::new(store, provider.clone(), &cred);

        assert!(source.token().await.is_err());
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 0);
    }
}
