//! Demo host routing with the security pipeline applied.
//!
//! # Route Groups
//!
//! | Route                              | Guards                      |
//! |------------------------------------|-----------------------------|
//! | `GET /health`, `GET /ping`         | global only (not audited)   |
//! | `GET /api/v1/me`                   | bearer token                |
//! | `POST /api/v1/token/refresh`       | bearer token                |
//! | `GET/POST/DELETE /api/v1/admin/ip-rules` | bearer token + role `admin` |
//! | `POST /api/v1/signed/echo`         | request signature           |
//!
//! Global guards (request id, IP admission, rate limiting, audit) wrap every
//! route, see [`crate::pipeline`] for their order.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::pipeline::SecurityPipeline;
use crate::state::AppState;

/// Role allowed to manage IP rules.
pub const ADMIN_ROLE: &str = "admin";

/// Build the application router with all routes and guards configured.
pub fn build_router(state: AppState) -> Router {
    let pipeline = SecurityPipeline::new(state.clone());

    let public = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ping", get(handlers::ping));

    let authenticated = pipeline.require_token(
        Router::new()
            .route("/me", get(handlers::me))
            .route("/token/refresh", post(handlers::refresh_token)),
    );

    let admin = pipeline.require_roles(
        Router::new().route(
            "/admin/ip-rules",
            get(handlers::list_ip_rules)
                .post(handlers::add_ip_rule)
                .delete(handlers::remove_ip_rule),
        ),
        &[ADMIN_ROLE],
    );

    let signed = pipeline.require_signature(
        Router::new().route("/signed/echo", post(handlers::signed_echo)),
    );

    let api = Router::new().merge(authenticated).merge(admin).merge(signed);

    // Applied bottom to top: tracing sits inside the global guards so the
    // request id is known when the span is created
    info!(
        max_size_kb = state.config.max_request_body_size / 1024,
        "Request body size limit configured"
    );
    let router = Router::new()
        .merge(public)
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(state.config.max_request_body_size))
        .layer(TraceLayer::new_for_http());

    pipeline.wrap_global(router).with_state(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{AuditConfig, Config, RateLimitConfig};
    use crate::middleware::request_id::REQUEST_ID_HEADER;
    use crate::middleware::signature::{NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::header::AUTHORIZATION;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            audit: AuditConfig {
                enabled: false,
                ..AuditConfig::default()
            },
            ..Config::default()
        }
    }

    fn request(method: Method, uri: &str, body: Body) -> Request<Body> {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 7], 40000))));
        req
    }

    fn with_token(mut req: Request<Body>, token: &str) -> Request<Body> {
        req.headers_mut()
            .insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        req
    }

    fn token_for(state: &AppState, role: &str) -> String {
        state
            .tokens
            .issue("u-1", "alice", role, Duration::from_secs(60))
            .unwrap()
            .token
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public_and_carries_request_id() {
        let state = AppState::new(test_config()).unwrap();
        let app = build_router(state.clone());

        let response = app
            .oneshot(request(Method::GET, "/health", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(json_body(response).await["status"], "healthy");
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_me_requires_token() {
        let state = AppState::new(test_config()).unwrap();
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/v1/me", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let token = token_for(&state, "user");
        let response = app
            .oneshot(with_token(
                request(Method::GET, "/api/v1/me", Body::empty()),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["user_id"], "u-1");
        assert_eq!(body["role"], "user");
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_admin_routes_check_role() {
        let state = AppState::new(test_config()).unwrap();
        let app = build_router(state.clone());
        let rule = r#"{"list":"deny","rule":"198.51.100.0/24"}"#;

        let user = token_for(&state, "user");
        let response = app
            .clone()
            .oneshot(with_token(
                request(Method::POST, "/api/v1/admin/ip-rules", Body::from(rule)),
                &user,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let admin = token_for(&state, ADMIN_ROLE);
        let response = app
            .oneshot(with_token(
                request(Method::POST, "/api/v1/admin/ip-rules", Body::from(rule)),
                &admin,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(!state.ip_filter.is_allowed("198.51.100.20"));
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_signed_echo_accepts_once() {
        let state = AppState::new(test_config()).unwrap();
        let app = build_router(state.clone());
        let body = r#"{"amount":10}"#;
        let signed = state
            .signature
            .sign("POST", "/api/v1/signed/echo", &[], body.as_bytes())
            .unwrap();

        let signed_request = || {
            let mut req = request(Method::POST, "/api/v1/signed/echo", Body::from(body));
            let headers = req.headers_mut();
            headers.insert(SIGNATURE_HEADER, signed.signature.parse().unwrap());
            headers.insert(TIMESTAMP_HEADER, signed.timestamp.to_string().parse().unwrap());
            headers.insert(NONCE_HEADER, signed.nonce.parse().unwrap());
            req
        };

        let response = app.clone().oneshot(signed_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let echoed = json_body(response).await;
        assert_eq!(echoed["verified"], true);
        assert_eq!(echoed["body"], body);

        let replay = app.oneshot(signed_request()).await.unwrap();
        assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_global_rate_limit_applies_to_public_routes() {
        let state = AppState::new(Config {
            rate_limit: RateLimitConfig {
                max_requests: 2,
                ..RateLimitConfig::default()
            },
            ..test_config()
        })
        .unwrap();
        let app = build_router(state.clone());

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request(Method::GET, "/ping", Body::empty()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(request(Method::GET, "/ping", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_requests_are_audited_with_reason() {
        use crate::middleware::audit::AuditOutput;

        let path = std::env::temp_dir()
            .join(format!("gatekeeper-routes-{}", uuid::Uuid::new_v4()))
            .join("audit.log");
        let state = AppState::new(Config {
            audit: AuditConfig {
                output: AuditOutput::File,
                file_path: path.clone(),
                async_delivery: false,
                ..AuditConfig::default()
            },
            ..Config::default()
        })
        .unwrap();
        let app = build_router(state.clone());

        let anonymous = app
            .clone()
            .oneshot(request(Method::GET, "/api/v1/me", Body::empty()))
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
        json_body(anonymous).await;

        let user = token_for(&state, "user");
        let denied = app
            .oneshot(with_token(
                request(Method::GET, "/api/v1/admin/ip-rules", Body::empty()),
                &user,
            ))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        json_body(denied).await;

        state.shutdown().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let records: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);

        let unauthorized = records
            .iter()
            .find(|r| r["path"] == "/api/v1/me")
            .unwrap();
        assert_eq!(unauthorized["status_code"], 401);
        assert!(unauthorized.get("user_id").is_none());
        assert!(
            unauthorized["error"]
                .as_str()
                .unwrap()
                .starts_with("Unauthorized:")
        );

        // The role guard runs after authentication, so the identity is known
        let forbidden = records
            .iter()
            .find(|r| r["path"] == "/api/v1/admin/ip-rules")
            .unwrap();
        assert_eq!(forbidden["status_code"], 403);
        assert_eq!(forbidden["user_id"], "u-1");
        assert_eq!(forbidden["username"], "alice");
        assert!(
            forbidden["error"]
                .as_str()
                .unwrap()
                .starts_with("Forbidden:")
        );

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
