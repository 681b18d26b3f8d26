//! Broker server
//!
//! Wires the store, provider adapter, and rate limiter into the HTTP app,
//! runs it with graceful shutdown, and owns the background sweepers'
//! lifetimes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::oauth::{GoogleProvider, MemoryTokenStore, TokenStore, UpstreamProvider, store};
use crate::ratelimit::{self, IpRateLimiter};
use crate::{Error, Result};

/// The authorization proxy / token broker server
pub struct Broker {
    config: Config,
    store: Arc<dyn TokenStore>,
    provider: Arc<dyn UpstreamProvider>,
    limiter: Arc<IpRateLimiter>,
}

impl Broker {
    /// Create a broker from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Google credentials are missing or the
    /// configured consent URL is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let redirect_uri = format!(
            "{}/oauth/callback",
            config.server.base_url.trim_end_matches('/')
        );
        let provider = GoogleProvider::new(
            reqwest::Client::new(),
            config.google.clone(),
            redirect_uri,
        )?;

        Ok(Self {
            store: Arc::new(MemoryTokenStore::new()),
            provider: Arc::new(provider),
            limiter: Arc::new(IpRateLimiter::new(&config.rate_limit)),
            config,
        })
    }

    /// Build the HTTP app and start the background sweepers.
    ///
    /// Returns the router together with the shutdown sender that stops the
    /// sweepers; embedding and test scenarios hold on to the sender and
    /// drop a `()` into it when tearing down.
    #[must_use]
    pub fn into_app(self) -> (Router, broadcast::Sender<()>) {
        let (shutdown_tx, _) = broadcast::channel(1);

        store::spawn_sweeper(
            Arc::clone(&self.store),
            Duration::from_secs(self.config.tokens.sweep_interval_secs),
            shutdown_tx.subscribe(),
        );
        ratelimit::spawn_sweeper(Arc::clone(&self.limiter), shutdown_tx.subscribe());

        let state = Arc::new(AppState {
            store: self.store,
            provider: self.provider,
            limiter: self.limiter,
            base_url: self.config.server.base_url.clone(),
            tokens: self.config.tokens.clone(),
            scopes: self.config.google.scopes.clone(),
            max_body_size: self.config.server.max_body_size,
        });

        (create_router(state), shutdown_tx)
    }

    /// Run the broker until shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let base_url = self.config.server.base_url.clone();
        let rate_limiting = self.config.rate_limit.enabled;

        let (app, shutdown_tx) = self.into_app();

        let listener = TcpListener::bind(addr).await?;

        info!(addr = %addr, base_url = %base_url, "Listening");
        info!(
            authorize = %format!("{base_url}/authorize"),
            token = %format!("{base_url}/token"),
            callback = %format!("{base_url}/oauth/callback"),
            register = %format!("{base_url}/register"),
            "OAuth endpoints ready"
        );
        if !rate_limiting {
            warn!("Rate limiting disabled - public endpoints are unprotected");
        }

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
