//! Composition of the security guards into a fixed-order interceptor chain.
//!
//! # Stage Order
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← X-Request-ID on every response
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  IP Admission    │ ← 403 if blocked or unresolvable
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if exceeded
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Audit Wrap     │ ← records everything below, rejected or not
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Token/Signature  │ ← 400/401/403 (route layer, protected routes only)
//! └────────┬─────────┘
//!          ▼
//!       Handler
//! ```
//!
//! Every stage either continues or short-circuits with an [`AppError`]. A
//! short-circuit below the audit wrapper still produces a complete audit
//! record carrying the realized status code.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, info};

use crate::context::RequestContext;
use crate::error::AppError;
use crate::metrics;
use crate::middleware::audit::AuditLayer;
use crate::middleware::ip_filter::IpAdmission;
use crate::middleware::rate_limit::RateLimitGuard;
use crate::middleware::request_id::RequestIdLayer;
use crate::middleware::signature::SignatureGuard;
use crate::middleware::token::{BearerAuth, RequireRole};
use crate::state::AppState;

/// Outcome of a single guard.
#[derive(Debug)]
pub enum Verdict {
    /// Hand the request to the next stage.
    Continue,
    /// Stop the chain and answer with this error.
    Reject(AppError),
}

impl From<Result<(), AppError>> for Verdict {
    fn from(result: Result<(), AppError>) -> Self {
        match result {
            Ok(()) => Verdict::Continue,
            Err(err) => Verdict::Reject(err),
        }
    }
}

/// A request-scoped security check.
///
/// Guards run synchronously against an already-built [`RequestContext`].
/// They may only hold locks for the duration of `inspect`; anything that
/// needs to await (reading the body) is done by [`GuardService`] before the
/// guard is called.
pub trait Guard: Send + Sync + 'static {
    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Whether the body must be buffered before `inspect` runs.
    fn reads_body(&self) -> bool {
        false
    }

    fn inspect(&self, ctx: &mut RequestContext) -> Verdict;
}

/// Tower layer that runs a [`Guard`] in front of the inner service.
pub struct GuardLayer<G> {
    guard: Arc<G>,
    body_limit: usize,
}

impl<G> Clone for GuardLayer<G> {
    fn clone(&self) -> Self {
        Self {
            guard: Arc::clone(&self.guard),
            body_limit: self.body_limit,
        }
    }
}

impl<G: Guard> GuardLayer<G> {
    /// Wrap a guard. `body_limit` caps the body read for guards that
    /// inspect it.
    pub fn new(guard: G, body_limit: usize) -> Self {
        Self::from_arc(Arc::new(guard), body_limit)
    }

    pub fn from_arc(guard: Arc<G>, body_limit: usize) -> Self {
        Self { guard, body_limit }
    }
}

impl<S, G> Layer<S> for GuardLayer<G> {
    type Service = GuardService<S, G>;

    fn layer(&self, inner: S) -> Self::Service {
        GuardService {
            inner,
            guard: Arc::clone(&self.guard),
            body_limit: self.body_limit,
        }
    }
}

/// Service produced by [`GuardLayer`].
pub struct GuardService<S, G> {
    inner: S,
    guard: Arc<G>,
    body_limit: usize,
}

impl<S: Clone, G> Clone for GuardService<S, G> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            guard: Arc::clone(&self.guard),
            body_limit: self.body_limit,
        }
    }
}

impl<S, G> Service<Request<Body>> for GuardService<S, G>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    G: Guard,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let guard = Arc::clone(&self.guard);
        let body_limit = self.body_limit;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut ctx = RequestContext::from_request(req);

            if guard.reads_body()
                && let Err(err) = ctx.buffer_body(body_limit).await
            {
                return Ok(reject(guard.name(), err, &mut ctx));
            }

            match guard.inspect(&mut ctx) {
                Verdict::Continue => {
                    debug!(guard = guard.name(), "Guard passed");
                    let staged = ctx.take_response_headers();
                    let mut response = inner.call(ctx.into_request()).await?;
                    response.headers_mut().extend(staged);
                    Ok(response)
                }
                Verdict::Reject(err) => Ok(reject(guard.name(), err, &mut ctx)),
            }
        })
    }
}

fn reject(guard: &'static str, err: AppError, ctx: &mut RequestContext) -> Response<Body> {
    metrics::record_rejection(guard, err.status_code().as_u16());
    let staged = ctx.take_response_headers();
    let mut response = err.into_response();
    for (name, value) in staged.iter() {
        // Error-specific headers (Retry-After, zeroed counters) win
        if !response.headers().contains_key(name) {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
    response
}

// =============================================================================
// Security Pipeline
// =============================================================================

/// Fixed-order composition of the security components held by [`AppState`].
#[derive(Clone)]
pub struct SecurityPipeline {
    state: AppState,
}

impl SecurityPipeline {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    fn body_limit(&self) -> usize {
        self.state.config.max_request_body_size
    }

    /// Wrap every route with request id, admission, rate limiting and audit.
    ///
    /// Layers are applied bottom to top: the last `.layer` call runs first.
    pub fn wrap_global<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut router = router;

        if let Some(audit) = &self.state.audit {
            info!(
                output = %self.state.config.audit.output,
                excluded = self.state.config.audit.exclude_paths.len(),
                "Audit logging enabled"
            );
            router = router.layer(AuditLayer::new(audit.clone(), self.body_limit()));
        } else {
            info!("Audit logging disabled (AUDIT_ENABLED=false)");
        }

        info!(
            algorithm = %self.state.config.rate_limit.algorithm,
            window_secs = self.state.config.rate_limit.window.as_secs(),
            max_requests = self.state.config.rate_limit.max_requests,
            "Rate limiting enabled"
        );
        router = router.layer(GuardLayer::new(
            RateLimitGuard::new(
                Arc::clone(&self.state.rate_limiter),
                self.state.config.rate_limit.key,
                Arc::clone(&self.state.ip_resolver),
            ),
            self.body_limit(),
        ));

        info!(
            mode = %self.state.config.ip_filter.mode,
            trust_proxy = self.state.config.ip_filter.trust_proxy,
            "IP admission filter enabled"
        );
        router = router.layer(GuardLayer::new(
            IpAdmission::new(
                Arc::clone(&self.state.ip_filter),
                Arc::clone(&self.state.ip_resolver),
            ),
            self.body_limit(),
        ));

        router.layer(RequestIdLayer::new())
    }

    /// Require a valid bearer token on every route of `router`.
    ///
    /// When a per-identity quota is configured it is enforced right after
    /// authentication, where the identity is known.
    pub fn require_token<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut router = router;
        if let Some(limiter) = &self.state.user_rate_limiter {
            router = router.route_layer(GuardLayer::new(
                RateLimitGuard::new(
                    Arc::clone(limiter),
                    crate::middleware::rate_limit::RateKey::IdentityOrIp,
                    Arc::clone(&self.state.ip_resolver),
                ),
                self.body_limit(),
            ));
        }
        router.route_layer(self.bearer_layer(false))
    }

    /// Attach the identity when a valid bearer token is present, never reject.
    pub fn optional_token<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.route_layer(self.bearer_layer(true))
    }

    /// Require a valid token whose role is one of `roles`.
    pub fn require_roles<S>(&self, router: Router<S>, roles: &[&str]) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let router = router.route_layer(GuardLayer::new(
            RequireRole::new(roles.iter().map(|r| (*r).to_string()).collect()),
            self.body_limit(),
        ));
        self.require_token(router)
    }

    /// Require a valid request signature on every route of `router`.
    pub fn require_signature<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.route_layer(GuardLayer::new(
            SignatureGuard::new(Arc::clone(&self.state.signature)),
            self.body_limit(),
        ))
    }

    fn bearer_layer(&self, optional: bool) -> GuardLayer<BearerAuth> {
        let auth = BearerAuth::new(
            Arc::clone(&self.state.tokens),
            self.state.auth_failures.clone(),
            Arc::clone(&self.state.ip_resolver),
        );
        let auth = if optional { auth.optional() } else { auth };
        GuardLayer::new(auth, self.body_limit())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};
    use axum::routing::get;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct Counting {
        seen: AtomicUsize,
        allow: bool,
    }

    impl Guard for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn inspect(&self, ctx: &mut RequestContext) -> Verdict {
            self.seen.fetch_add(1, Ordering::SeqCst);
            ctx.response_headers
                .insert("x-guard", HeaderValue::from_static("seen"));
            if self.allow {
                Verdict::Continue
            } else {
                Verdict::Reject(AppError::Forbidden("nope".into()))
            }
        }
    }

    struct BodyEcho;

    impl Guard for BodyEcho {
        fn name(&self) -> &'static str {
            "body"
        }

        fn reads_body(&self) -> bool {
            true
        }

        fn inspect(&self, ctx: &mut RequestContext) -> Verdict {
            match ctx.body_bytes() {
                Some(bytes) if !bytes.is_empty() => Verdict::Continue,
                _ => Verdict::Reject(AppError::BadRequest("empty".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_guard_continue_appends_staged_headers() {
        let guard = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            allow: true,
        });
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(GuardLayer::from_arc(Arc::clone(&guard), 1024));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-guard"], "seen");
        assert_eq!(guard.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_reject_short_circuits_handler() {
        let handled = Arc::new(AtomicUsize::new(0));
        let handled_in = Arc::clone(&handled);
        let app = Router::new()
            .route(
                "/",
                get(move || async move {
                    handled_in.fetch_add(1, Ordering::SeqCst);
                    "ok"
                }),
            )
            .layer(GuardLayer::new(
                Counting {
                    seen: AtomicUsize::new(0),
                    allow: false,
                },
                1024,
            ));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()["x-guard"], "seen");
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_body_reading_guard_leaves_body_for_handler() {
        let app = Router::new()
            .route("/", axum::routing::post(|body: String| async move { body }))
            .layer(GuardLayer::new(BodyEcho, 1024));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_body_reading_guard_rejects_oversized_body() {
        let app = Router::new()
            .route("/", axum::routing::post(|| async { "ok" }))
            .layer(GuardLayer::new(BodyEcho, 4));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from("far too long"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_optional_token_attaches_identity_without_rejecting() {
        use crate::config::{AuditConfig, Config};
        use crate::middleware::token::Claims;
        use axum::Extension;
        use axum::http::header::AUTHORIZATION;
        use std::time::Duration;

        let state = AppState::new(Config {
            audit: AuditConfig {
                enabled: false,
                ..AuditConfig::default()
            },
            ..Config::default()
        })
        .unwrap();
        let pipeline = SecurityPipeline::new(state.clone());
        let app: Router = pipeline.optional_token(Router::new().route(
            "/",
            get(|identity: Option<Extension<Claims>>| async move {
                identity.map_or_else(|| "anonymous".to_string(), |Extension(c)| c.sub)
            }),
        ));
        let token = state
            .tokens
            .issue("u-7", "bob", "user", Duration::from_secs(60))
            .unwrap()
            .token;

        for (header, expected) in [
            (None, "anonymous"),
            (Some("Bearer not.a.token".to_string()), "anonymous"),
            (Some(format!("Bearer {token}")), "u-7"),
        ] {
            let mut req = Request::builder().uri("/");
            if let Some(value) = header {
                req = req.header(AUTHORIZATION, value);
            }
            let response = app
                .clone()
                .oneshot(req.body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            let body = axum::body::to_bytes(response.into_body(), 1024)
                .await
                .unwrap();
            assert_eq!(&body[..], expected.as_bytes());
        }
        state.shutdown().await;
    }
}
