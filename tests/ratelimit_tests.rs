//! Rate limiter and body-cap tests over real HTTP
//!
//! The broker sits behind a reverse proxy in production, so client identity
//! arrives via `X-Forwarded-For`; these tests drive the public endpoints
//! with forged forwarding headers to exercise per-IP isolation.

use std::net::SocketAddr;

use reqwest::StatusCode;
use serde_json::Value;

use mcp_auth_broker::config::Config;
use mcp_auth_broker::server::Broker;

struct TestApp {
    base_url: String,
    http: reqwest::Client,
}

async fn spawn_app(mutate: impl FnOnce(&mut Config)) -> TestApp {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = Config::default();
    config.server.base_url = format!("http://{addr}");
    config.google.client_id = "test-client-id".to_string();
    config.google.client_secret = "test-client-secret".to_string();
    mutate(&mut config);

    let broker = Broker::new(config).unwrap();
    let (app, _shutdown) = broker.into_app();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        http: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn burst_exhaustion_yields_429_with_retry_hint() {
    let app = spawn_app(|config| {
        config.rate_limit.requests_per_second = 1;
        config.rate_limit.burst_size = 2;
    })
    .await;
    let health = format!("{}/health", app.base_url);

    // First two requests within the burst succeed
    for _ in 0..2 {
        let response = app
            .http
            .get(&health)
            .header("X-Forwarded-For", "203.0.113.5")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // The third is rejected with the fixed retry hint
    let response = app
        .http
        .get(&health)
        .header("X-Forwarded-For", "203.0.113.5")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(
        body["error_description"],
        "Too many requests. Please retry later."
    );

    // A distinct IP still gets through
    let response = app
        .http
        .get(&health)
        .header("X-Forwarded-For", "203.0.113.6")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn leftmost_forwarded_entry_identifies_the_client() {
    let app = spawn_app(|config| {
        config.rate_limit.requests_per_second = 1;
        config.rate_limit.burst_size = 1;
    })
    .await;
    let health = format!("{}/health", app.base_url);

    let response = app
        .http
        .get(&health)
        .header("X-Forwarded-For", "198.51.100.7, 10.0.0.1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Same left-most client behind a different proxy hop is still the same
    // bucket
    let response = app
        .http
        .get(&health)
        .header("X-Forwarded-For", "198.51.100.7, 10.0.0.2")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn disabled_limiter_admits_everything() {
    let app = spawn_app(|config| {
        config.rate_limit.enabled = false;
        config.rate_limit.requests_per_second = 1;
        config.rate_limit.burst_size = 1;
    })
    .await;
    let health = format!("{}/health", app.base_url);

    for _ in 0..10 {
        let response = app
            .http
            .get(&health)
            .header("X-Forwarded-For", "203.0.113.9")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let app = spawn_app(|config| {
        config.server.max_body_size = 1024;
    })
    .await;

    let oversized = "x".repeat(4096);
    let response = app
        .http
        .post(format!("{}/register", app.base_url))
        .header("content-type", "application/json")
        .body(oversized)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
