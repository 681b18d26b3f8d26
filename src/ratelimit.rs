//! Per-IP rate limiting
//!
//! Protects the public OAuth endpoints from abuse, independent of the auth
//! logic. Each client IP gets its own token bucket; the visitor table is
//! hard-capped, and once full, unknown IPs are rejected outright rather
//! than admitted — spoofed source addresses must not grow memory without
//! bound.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Hard cap on tracked client IPs
const MAX_VISITORS: usize = 10_000;

/// Visitors unseen for this long are evicted by the sweep
const VISITOR_IDLE: Duration = Duration::from_secs(180);

/// Sweep period for the visitor table
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Type alias for a single visitor's token bucket
type VisitorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct Visitor {
    limiter: VisitorLimiter,
    last_seen: Mutex<Instant>,
}

/// Per-IP token-bucket rate limiter
pub struct IpRateLimiter {
    enabled: bool,
    quota: Quota,
    visitors: DashMap<String, Visitor>,
}

impl IpRateLimiter {
    /// Create a limiter from configuration.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);

        Self {
            enabled: config.enabled,
            quota: Quota::per_second(rps).allow_burst(burst),
            visitors: DashMap::new(),
        }
    }

    /// Try to admit a request from `ip`. Returns `false` when the visitor's
    /// bucket is empty, or when the table is full and the IP is unknown
    /// (fail-closed).
    pub fn allow(&self, ip: &str) -> bool {
        if !self.enabled {
            return true;
        }

        if let Some(visitor) = self.visitors.get(ip) {
            *visitor.last_seen.lock() = Instant::now();
            return visitor.limiter.check().is_ok();
        }

        if self.visitors.len() >= MAX_VISITORS {
            return false;
        }

        let visitor = self.visitors.entry(ip.to_string()).or_insert_with(|| Visitor {
            limiter: RateLimiter::direct(self.quota),
            last_seen: Mutex::new(Instant::now()),
        });
        visitor.limiter.check().is_ok()
    }

    /// Evict visitors idle longer than [`VISITOR_IDLE`]. Returns the number
    /// evicted.
    pub fn sweep_idle(&self) -> usize {
        let before = self.visitors.len();
        self.visitors
            .retain(|_, visitor| visitor.last_seen.lock().elapsed() <= VISITOR_IDLE);
        before - self.visitors.len()
    }
}

/// Spawn a background task that sweeps idle visitors every minute.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_sweeper(
    limiter: Arc<IpRateLimiter>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = limiter.sweep_idle();
                    if evicted > 0 {
                        debug!(count = evicted, "Evicted idle rate-limit visitors");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Rate limiter sweeper shutting down");
                    break;
                }
            }
        }
    });
}

/// Extract the client IP: left-most `X-Forwarded-For` entry (set by the
/// reverse proxy), falling back to the peer address.
fn client_ip(request: &Request<Body>) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string())
}

/// Rate limiting middleware for the public endpoints.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<IpRateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip(&request);

    if !limiter.allow(&ip) {
        warn!(ip = %ip, path = %request.uri().path(), "rate limit exceeded");
        return rate_limited_response();
    }

    next.run(request).await
}

/// Create the 429 response with a fixed retry hint.
fn rate_limited_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", "1")],
        Json(json!({
            "error": "rate_limit_exceeded",
            "error_description": "Too many requests. Please retry later."
        })),
    )
        .into_response()
}
