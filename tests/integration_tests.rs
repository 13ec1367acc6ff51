//! End-to-end tests against a real server on an ephemeral port.
//!
//! Each test starts its own server with connect info enabled, so IP admission
//! sees the loopback peer address exactly as in production.
//!
//! Run with: `cargo test --test integration_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use gatekeeper::config::{AuditConfig, Config, RateLimitConfig};
use gatekeeper::middleware::audit::{AuditOutput, MASKED};
use gatekeeper::middleware::signature::{NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use gatekeeper::{AppState, build_router};

/// Test fixture that owns a running app server
struct TestFixture {
    state: AppState,
    base_url: String,
    client: Client,
}

impl TestFixture {
    /// Start a server with audit logging disabled
    async fn new() -> Self {
        Self::with_config(Config {
            audit: AuditConfig {
                enabled: false,
                ..AuditConfig::default()
            },
            ..Config::default()
        })
        .await
    }

    async fn with_config(config: Config) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to ephemeral port");
        let addr = listener.local_addr().expect("Failed to get local address");

        let state = AppState::new(config).expect("Failed to build state");
        let app = build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("Server failed");
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            state,
            base_url: format!("http://{addr}"),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn token(&self, role: &str) -> String {
        self.state
            .tokens
            .issue("42", "alice", role, Duration::from_secs(300))
            .expect("Failed to issue token")
            .token
    }
}

fn temp_audit_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("gatekeeper-it-{}", uuid::Uuid::new_v4()))
        .join("audit.log")
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .expect("Health request failed");

    assert!(response.status().is_success());
    assert!(response.headers().contains_key("x-request-id"));

    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["status"], "healthy");
    assert!(body.get("version").is_some());
    assert!(body.get("timestamp").is_some());
}

#[tokio::test]
async fn test_client_request_id_is_echoed() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .get(fixture.url("/ping"))
        .header("x-request-id", "trace-abc-123")
        .send()
        .await
        .expect("Ping request failed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "trace-abc-123");
}

// ============================================================================
// Token Authentication
// ============================================================================

#[tokio::test]
async fn test_identity_requires_valid_token() {
    let fixture = TestFixture::new().await;

    let missing = fixture
        .client
        .get(fixture.url("/api/v1/me"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["code"], 401);
    assert!(body.get("message").is_some());

    let forged = fixture
        .client
        .get(fixture.url("/api/v1/me"))
        .bearer_auth("not.a.token")
        .send()
        .await
        .unwrap();
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);

    let ok = fixture
        .client
        .get(fixture.url("/api/v1/me"))
        .bearer_auth(fixture.token("user"))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    let body: Value = ok.json().await.unwrap();
    assert_eq!(body["user_id"], "42");
    assert_eq!(body["username"], "alice");
}

#[tokio::test]
async fn test_token_refresh_issues_usable_token() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .post(fixture.url("/api/v1/token/refresh"))
        .bearer_auth(fixture.token("user"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["token_type"], "Bearer");
    let refreshed = body["token"].as_str().unwrap();

    let me = fixture
        .client
        .get(fixture.url("/api/v1/me"))
        .bearer_auth(refreshed)
        .send()
        .await
        .unwrap();
    assert_eq!(me.status(), StatusCode::OK);
}

// ============================================================================
// IP Admission
// ============================================================================

#[tokio::test]
async fn test_admin_deny_rule_blocks_client() {
    let fixture = TestFixture::new().await;

    let user = fixture
        .client
        .post(fixture.url("/api/v1/admin/ip-rules"))
        .bearer_auth(fixture.token("user"))
        .json(&json!({"list": "deny", "rule": "127.0.0.1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(user.status(), StatusCode::FORBIDDEN);

    let admin = fixture
        .client
        .post(fixture.url("/api/v1/admin/ip-rules"))
        .bearer_auth(fixture.token("admin"))
        .json(&json!({"list": "deny", "rule": "127.0.0.0/8"}))
        .send()
        .await
        .unwrap();
    assert_eq!(admin.status(), StatusCode::CREATED);

    let blocked = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), StatusCode::FORBIDDEN);

    // Rules are mutable at runtime in both directions
    fixture.state.ip_filter.remove_deny("127.0.0.0/8").unwrap();
    let admitted = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(admitted.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_denied_range_wins_over_valid_token() {
    let fixture = TestFixture::new().await;
    fixture.state.ip_filter.add_deny("127.0.0.0/8").unwrap();

    let me = fixture
        .client
        .get(fixture.url("/api/v1/me"))
        .bearer_auth(fixture.token("user"))
        .send()
        .await
        .unwrap();
    assert_eq!(me.status(), StatusCode::FORBIDDEN);

    let admin = fixture
        .client
        .get(fixture.url("/api/v1/admin/ip-rules"))
        .bearer_auth(fixture.token("admin"))
        .send()
        .await
        .unwrap();
    assert_eq!(admin.status(), StatusCode::FORBIDDEN);
    let body: Value = admin.json().await.unwrap();
    assert_eq!(body["message"], "IP address not allowed");
}

// ============================================================================
// Rate Limiting
// ============================================================================

#[tokio::test]
async fn test_rate_limit_rejects_excess_requests() {
    let fixture = TestFixture::with_config(Config {
        rate_limit: RateLimitConfig {
            max_requests: 3,
            ..RateLimitConfig::default()
        },
        audit: AuditConfig {
            enabled: false,
            ..AuditConfig::default()
        },
        ..Config::default()
    })
    .await;

    for _ in 0..3 {
        let response = fixture
            .client
            .get(fixture.url("/ping"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let limited = fixture
        .client
        .get(fixture.url("/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key("retry-after"));
    assert_eq!(limited.headers()["x-ratelimit-remaining"], "0");
}

// ============================================================================
// Request Signing
// ============================================================================

#[tokio::test]
async fn test_signed_request_round_trip() {
    let fixture = TestFixture::new().await;
    let body = r#"{"order":"A-1","qty":2}"#;
    let signed = fixture
        .state
        .signature
        .sign(
            "POST",
            "/api/v1/signed/echo",
            &[("channel", "web")],
            body.as_bytes(),
        )
        .unwrap();

    let send = || {
        fixture
            .client
            .post(fixture.url("/api/v1/signed/echo?channel=web"))
            .header(SIGNATURE_HEADER, &signed.signature)
            .header(TIMESTAMP_HEADER, signed.timestamp.to_string())
            .header(NONCE_HEADER, &signed.nonce)
            .body(body)
            .send()
    };

    let accepted = send().await.unwrap();
    assert_eq!(accepted.status(), StatusCode::OK);
    let echoed: Value = accepted.json().await.unwrap();
    assert_eq!(echoed["verified"], true);
    assert_eq!(echoed["body"], body);

    let replayed = send().await.unwrap();
    assert_eq!(replayed.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_tampered_body_fails_signature() {
    let fixture = TestFixture::new().await;
    let signed = fixture
        .state
        .signature
        .sign("POST", "/api/v1/signed/echo", &[], b"amount=10")
        .unwrap();

    let response = fixture
        .client
        .post(fixture.url("/api/v1/signed/echo"))
        .header(SIGNATURE_HEADER, &signed.signature)
        .header(TIMESTAMP_HEADER, signed.timestamp.to_string())
        .header(NONCE_HEADER, &signed.nonce)
        .body("amount=10000")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let unsigned = fixture
        .client
        .post(fixture.url("/api/v1/signed/echo"))
        .body("amount=10")
        .send()
        .await
        .unwrap();
    assert_eq!(unsigned.status(), StatusCode::BAD_REQUEST);
}

// ============================================================================
// Audit Logging
// ============================================================================

#[tokio::test]
async fn test_audit_trail_is_written_and_redacted() {
    let path = temp_audit_path();
    let fixture = TestFixture::with_config(Config {
        audit: AuditConfig {
            output: AuditOutput::File,
            file_path: path.clone(),
            ..AuditConfig::default()
        },
        ..Config::default()
    })
    .await;

    let response = fixture
        .client
        .get(fixture.url("/api/v1/me"))
        .bearer_auth(fixture.token("user"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = r#"{"user":"alice","password":"hunter2"}"#;
    let signed = fixture
        .state
        .signature
        .sign("POST", "/api/v1/signed/echo", &[], body.as_bytes())
        .unwrap();
    let response = fixture
        .client
        .post(fixture.url("/api/v1/signed/echo"))
        .header(SIGNATURE_HEADER, &signed.signature)
        .header(TIMESTAMP_HEADER, signed.timestamp.to_string())
        .header(NONCE_HEADER, &signed.nonce)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Excluded path
    fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();

    fixture.state.shutdown().await;

    let contents = std::fs::read_to_string(&path).expect("audit file missing");
    let records: Vec<Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r["path"] != "/health"));

    let me = records.iter().find(|r| r["path"] == "/api/v1/me").unwrap();
    assert_eq!(me["user_id"], "42");
    assert_eq!(me["status_code"], 200);
    let authorization = me["headers"]["Authorization"].as_str().unwrap();
    assert!(authorization.starts_with("Bear***"));

    let echo = records
        .iter()
        .find(|r| r["path"] == "/api/v1/signed/echo")
        .unwrap();
    let logged = echo["request_body"].as_str().unwrap();
    assert!(!logged.contains("hunter2"));
    assert!(logged.contains(MASKED));

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
