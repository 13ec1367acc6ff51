//! Request ID middleware for correlating log lines and audit records.
//!
//! # Behavior
//!
//! - Propagates a well-formed client `X-Request-Id` header
//! - Generates a UUIDv4 when the header is missing or unusable
//! - Stores the id as a typed [`RequestId`] request extension
//! - Echoes `X-Request-Id` on every response, including rejections
//!
//! Client-supplied ids end up in audit records and log fields, so they are
//! only accepted when short and made of printable token characters.
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:3000/api/v1/me
//! ```

use std::fmt;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied id that is propagated as-is.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation id of one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request ID layer for Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Request ID service wrapper.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = extract_or_generate_request_id(&req);
        // Only accepted ids and UUIDs get here, both are valid header values
        let header = HeaderValue::from_str(request_id.as_str()).ok();

        if let Some(value) = &header {
            req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        }
        req.extensions_mut().insert(request_id.clone());

        Span::current().record("request_id", request_id.as_str());
        debug!(request_id = %request_id, "Processing request");

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            if let Some(value) = header {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            Ok(response)
        })
    }
}

/// Whether a client-supplied id is propagated.
pub fn is_acceptable_request_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

/// Extract a usable request ID from the headers or generate a new one.
fn extract_or_generate_request_id<B>(req: &Request<B>) -> RequestId {
    if let Some(header_value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && is_acceptable_request_id(value)
    {
        return RequestId::new(value);
    }

    RequestId::generate()
}
