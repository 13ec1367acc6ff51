//! Per-request state shared by the security guards.
//!
//! A [`RequestContext`] is built from an inbound `Request<Body>` at the top of
//! every guard, handed to the guard by mutable reference and turned back into
//! a request for the next layer. Annotations written by one stage (client IP,
//! request id, authenticated identity) travel to the next stage as typed
//! request extensions, so nothing downstream has to fish values out of an
//! untyped bag.
//!
//! # Body Replay
//!
//! The body is streamed by default. A stage that needs the bytes calls
//! [`RequestContext::buffer_body`], which reads the stream exactly once and
//! records the bytes in a [`BufferedBody`] extension. Later stages and the
//! handler see the same bytes without touching the network again.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, OriginalUri};
use axum::http::header::CONTENT_LENGTH;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Request};
use http_body_util::LengthLimitError;

use crate::error::{AppError, AppResult};
use crate::middleware::request_id::RequestId;
use crate::middleware::token::Claims;

/// Request bytes already read by an earlier stage.
#[derive(Debug, Clone)]
pub struct BufferedBody(pub Bytes);

/// Client address resolved by the admission stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Write-once slot the audit wrapper installs before authentication runs.
///
/// Authentication happens inside the audit wrapper, after the request has
/// been handed down the stack, so the wrapper cannot read the identity off
/// the request itself. It keeps a handle to this slot instead and reads the
/// identity back once the handler has completed.
#[derive(Debug, Clone, Default)]
pub struct IdentitySlot(Arc<OnceLock<Claims>>);

impl IdentitySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the identity. Only the first call has an effect.
    pub fn publish(&self, claims: &Claims) {
        let _ = self.0.set(claims.clone());
    }

    pub fn get(&self) -> Option<&Claims> {
        self.0.get()
    }
}

enum BodyState {
    Streaming(Body),
    Buffered(Bytes),
}

/// Whether a body read failed because it crossed the length limit.
fn is_length_limit(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// An in-flight request as seen by a guard.
pub struct RequestContext {
    parts: Parts,
    body: BodyState,
    /// Authenticated identity, set by the token guard.
    pub identity: Option<Claims>,
    /// Correlation id, set by the request id layer.
    pub request_id: Option<RequestId>,
    /// Resolved client address, set by the admission stage.
    pub client_ip: Option<IpAddr>,
    /// Headers a guard wants appended to the downstream response.
    pub response_headers: HeaderMap,
}

impl RequestContext {
    /// Build a context from an inbound request, lifting typed annotations
    /// out of the request extensions.
    pub fn from_request(req: Request<Body>) -> Self {
        let (parts, body) = req.into_parts();

        let body = match parts.extensions.get::<BufferedBody>() {
            Some(buffered) => BodyState::Buffered(buffered.0.clone()),
            None => BodyState::Streaming(body),
        };
        let identity = parts.extensions.get::<Claims>().cloned();
        let request_id = parts.extensions.get::<RequestId>().cloned();
        let client_ip = parts.extensions.get::<ClientIp>().map(|ip| ip.0);

        Self {
            parts,
            body,
            identity,
            request_id,
            client_ip,
            response_headers: HeaderMap::new(),
        }
    }

    /// Rebuild the request for the next layer, writing annotations back as
    /// extensions.
    pub fn into_request(self) -> Request<Body> {
        let Self {
            mut parts,
            body,
            identity,
            request_id,
            client_ip,
            ..
        } = self;

        if let Some(claims) = identity {
            if let Some(slot) = parts.extensions.get::<IdentitySlot>() {
                slot.publish(&claims);
            }
            parts.extensions.insert(claims);
        }
        if let Some(id) = request_id {
            parts.extensions.insert(id);
        }
        if let Some(ip) = client_ip {
            parts.extensions.insert(ClientIp(ip));
        }

        let body = match body {
            BodyState::Streaming(body) => body,
            BodyState::Buffered(bytes) => {
                parts.extensions.insert(BufferedBody(bytes.clone()));
                Body::from(bytes)
            }
        };

        Request::from_parts(parts, body)
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    /// Request path as the client sent it, before any nesting prefix was
    /// stripped.
    pub fn path(&self) -> &str {
        match self.parts.extensions.get::<OriginalUri>() {
            Some(original) => original.0.path(),
            None => self.parts.uri.path(),
        }
    }

    /// Raw query string without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.parts.uri.query()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Header value as UTF-8, `None` when absent or not valid text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Transport-level peer address, when the server was started with
    /// connect info.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0)
    }

    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.parts.extensions.get::<T>()
    }

    pub fn insert_extension<T: Clone + Send + Sync + 'static>(&mut self, value: T) {
        self.parts.extensions.insert(value);
    }

    /// The buffered body, if a stage has already read it.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            BodyState::Buffered(bytes) => Some(bytes),
            BodyState::Streaming(_) => None,
        }
    }

    /// Read the body into memory once, up to `limit` bytes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PayloadTooLarge` if the body exceeds `limit`, and
    /// `AppError::BadRequest` if the stream fails mid-read.
    pub async fn buffer_body(&mut self, limit: usize) -> AppResult<&Bytes> {
        if let BodyState::Streaming(body) = &mut self.body {
            if let Some(declared) = self
                .parts
                .headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<usize>().ok())
                && declared > limit
            {
                return Err(AppError::PayloadTooLarge(format!(
                    "request body exceeds {limit} bytes"
                )));
            }

            let stream = std::mem::take(body);
            let bytes = axum::body::to_bytes(stream, limit).await.map_err(|e| {
                if is_length_limit(&e) {
                    AppError::PayloadTooLarge(format!("request body exceeds {limit} bytes"))
                } else {
                    AppError::BadRequest(format!("failed to read request body: {e}"))
                }
            })?;
            self.parts
                .extensions
                .insert(BufferedBody(bytes.clone()));
            self.body = BodyState::Buffered(bytes);
        }

        match &self.body {
            BodyState::Buffered(bytes) => Ok(bytes),
            BodyState::Streaming(_) => Err(AppError::Internal(
                "request body was not buffered".to_string(),
            )),
        }
    }

    /// Drain the staged response headers.
    pub fn take_response_headers(&mut self) -> HeaderMap {
        std::mem::take(&mut self.response_headers)
    }
}
