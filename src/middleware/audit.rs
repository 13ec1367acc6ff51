//! Audit trail of every request passing through the pipeline.
//!
//! # Record Flow
//!
//! ```text
//! AuditLayer ──try_send──► bounded queue ──► writer thread ──► console / file / hook
//!      │                        │
//!      │                        └─ full or closed: written on the request task
//!      └─ synchronous mode: written on the request task
//! ```
//!
//! The record is completed when the response body finishes streaming (or is
//! dropped early), so responses reach the client frame by frame. At most
//! `max(AUDIT_MAX_RESPONSE_BODY, MAX_REQUEST_BODY_SIZE)` bytes of a response
//! are copied for the record; a larger body is counted but not logged.
//!
//! A record is never silently dropped: when the queue cannot take it the
//! caller writes it inline. Sink failures are logged and counted but never
//! surface to the client.
//!
//! # Redaction
//!
//! JSON bodies are parsed and every value whose key names a sensitive field
//! is replaced with `***MASKED***`, at any depth. Redaction runs on the full
//! body before it is truncated, so a secret straddling the cap cannot leak
//! half-masked. Non-JSON bodies are logged verbatim (truncated).

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes, HttpBody};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, REFERER, USER_AGENT};
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use http_body::{Frame, SizeHint};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tower::{Layer, Service};
use tracing::{debug, error, info, warn};

use crate::config::AuditConfig;
use crate::context::{ClientIp, IdentitySlot, RequestContext};
use crate::error::{AppError, AppResult, RejectionReason};
use crate::metrics::{self, AuditDelivery};
use crate::middleware::ip::UNKNOWN_IP;
use crate::middleware::signature::APP_KEY_HEADER;

/// Replacement for sensitive values.
pub const MASKED: &str = "***MASKED***";

/// Suffix appended to truncated bodies.
pub const TRUNCATED_SUFFIX: &str = "...(truncated)";

/// Custom sink invoked for every record.
pub type AuditHook = Arc<dyn Fn(&AuditRecord) -> anyhow::Result<()> + Send + Sync>;

/// Where audit records are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditOutput {
    Console,
    File,
    #[default]
    Both,
}

impl AuditOutput {
    fn to_console(self) -> bool {
        matches!(self, Self::Console | Self::Both)
    }

    fn to_file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }
}

impl FromStr for AuditOutput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "stdout" => Ok(Self::Console),
            "file" => Ok(Self::File),
            "both" => Ok(Self::Both),
            other => Err(format!(
                "unknown audit output '{other}' (expected console, file or both)"
            )),
        }
    }
}

impl fmt::Display for AuditOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Console => f.write_str("console"),
            Self::File => f.write_str("file"),
            Self::Both => f.write_str("both"),
        }
    }
}

/// One audited request, serialized as a single JSON line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub response_size: u64,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub suspicious: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

// =============================================================================
// Redaction Helpers
// =============================================================================

/// Mask a credential, keeping four characters on each end.
pub fn mask_string(value: &str) -> String {
    let count = value.chars().count();
    if count <= 8 {
        return "***".to_string();
    }
    let head: String = value.chars().take(4).collect();
    let tail: String = value.chars().skip(count - 4).collect();
    format!("{head}***{tail}")
}

/// Render a body for the audit log with sensitive fields masked.
pub fn redact_body(body: &[u8], sensitive_fields: &[String]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(mut value) => {
            mask_value(&mut value, sensitive_fields);
            value.to_string()
        }
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

fn mask_value(value: &mut Value, sensitive_fields: &[String]) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map.iter_mut() {
                if sensitive_fields.iter().any(|f| f.eq_ignore_ascii_case(key)) {
                    *nested = Value::String(MASKED.to_string());
                } else {
                    mask_value(nested, sensitive_fields);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                mask_value(item, sensitive_fields);
            }
        }
        _ => {}
    }
}

/// Cut `text` to at most `max` bytes on a character boundary.
pub fn truncate(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(TRUNCATED_SUFFIX);
    text
}

const SQL_PATTERNS: &[&str] = &[
    "'--",
    "' OR ",
    "' AND ",
    "UNION SELECT",
    "DROP TABLE",
    "INSERT INTO",
    "DELETE FROM",
    "UPDATE SET",
    "1=1",
    "1'='1",
];

const XSS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "onerror=",
    "onload=",
    "onclick=",
    "<iframe",
    "<object",
    "<embed",
    "expression(",
];

const TRAVERSAL_PATTERNS: &[&str] = &["../", "..\\", "%2e%2e", "%252e%252e"];

/// Attack-pattern heuristics over the path and query.
///
/// Purely advisory: the result is attached to the audit record, the request
/// is never rejected because of it. The query is checked both raw and
/// percent-decoded.
pub fn detect_suspicious(path: &str, query: Option<&str>) -> Vec<String> {
    let mut reasons = Vec::new();

    if let Some(raw) = query {
        let decoded: Vec<String> = url::form_urlencoded::parse(raw.as_bytes())
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let candidates = [raw.to_string(), decoded.join("&")];

        let upper: Vec<String> = candidates.iter().map(|c| c.to_uppercase()).collect();
        if SQL_PATTERNS
            .iter()
            .any(|p| upper.iter().any(|c| c.contains(p)))
        {
            reasons.push("possible SQL injection".to_string());
        }

        let lower: Vec<String> = candidates.iter().map(|c| c.to_lowercase()).collect();
        if XSS_PATTERNS
            .iter()
            .any(|p| lower.iter().any(|c| c.contains(p)))
        {
            reasons.push("possible XSS".to_string());
        }
    }

    let path = path.to_lowercase();
    if TRAVERSAL_PATTERNS.iter().any(|p| path.contains(p)) {
        reasons.push("possible path traversal".to_string());
    }

    reasons
}

// =============================================================================
// Writer
// =============================================================================

struct AuditWriter {
    output: AuditOutput,
    file: Mutex<Option<File>>,
    hook: Option<AuditHook>,
}

impl AuditWriter {
    fn write(&self, record: &AuditRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, request_id = %record.request_id, "Failed to serialize audit record");
                metrics::record_audit_failure("serialize");
                return;
            }
        };

        if self.output.to_console() {
            info!(target: "audit", "{line}");
        }

        if self.output.to_file() {
            let mut file = self.file.lock();
            if let Some(file) = file.as_mut() {
                let mut buf = line.into_bytes();
                buf.push(b'\n');
                if let Err(e) = file.write_all(&buf) {
                    error!(error = %e, "Failed to append audit record");
                    metrics::record_audit_failure("file");
                }
            }
        }

        if let Some(hook) = &self.hook
            && let Err(e) = hook(record)
        {
            warn!(error = %e, request_id = %record.request_id, "Audit hook failed");
            metrics::record_audit_failure("hook");
        }
    }

    fn close(&self) {
        if let Some(mut file) = self.file.lock().take()
            && let Err(e) = file.flush().and_then(|()| file.sync_all())
        {
            error!(error = %e, "Failed to flush audit file");
            metrics::record_audit_failure("file");
        }
    }
}

// =============================================================================
// Logger
// =============================================================================

/// Delivers audit records to the configured sinks.
pub struct AuditLogger {
    config: AuditConfig,
    writer: Arc<AuditWriter>,
    sender: Mutex<Option<mpsc::Sender<AuditRecord>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogger")
            .field("output", &self.config.output)
            .field("async", &self.sender.lock().is_some())
            .finish()
    }
}

impl AuditLogger {
    /// Open the sinks and start the background writer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the audit file cannot be opened.
    pub fn new(config: &AuditConfig) -> AppResult<Self> {
        Self::with_hook(config, None)
    }

    /// Like [`AuditLogger::new`] with a custom sink called for every record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the audit file cannot be opened.
    pub fn with_hook(config: &AuditConfig, hook: Option<AuditHook>) -> AppResult<Self> {
        let file = if config.output.to_file() {
            Some(open_audit_file(config)?)
        } else {
            None
        };

        let writer = Arc::new(AuditWriter {
            output: config.output,
            file: Mutex::new(file),
            hook,
        });

        let (sender, consumer) = match tokio::runtime::Handle::try_current() {
            Ok(handle) if config.async_delivery => {
                let (tx, mut rx) = mpsc::channel::<AuditRecord>(config.queue_capacity.max(1));
                let writer = Arc::clone(&writer);
                let consumer = handle.spawn_blocking(move || {
                    while let Some(record) = rx.blocking_recv() {
                        writer.write(&record);
                    }
                    debug!("Audit queue drained");
                });
                (Some(tx), Some(consumer))
            }
            Err(_) if config.async_delivery => {
                warn!("No async runtime available, audit records are written synchronously");
                (None, None)
            }
            _ => (None, None),
        };

        info!(
            output = %config.output,
            file = %config.file_path.display(),
            queued = sender.is_some(),
            "Audit logger started"
        );

        Ok(Self {
            config: config.clone(),
            writer,
            sender: Mutex::new(sender),
            consumer: Mutex::new(consumer),
        })
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.config.exclude_paths.iter().any(|p| p == path)
    }

    /// Hand a record to the sinks. Never blocks on the queue.
    pub fn log(&self, record: AuditRecord) {
        let rejected = {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(tx) => match tx.try_send(record) {
                    Ok(()) => {
                        metrics::record_audit_record(AuditDelivery::Queued);
                        return;
                    }
                    Err(TrySendError::Full(record)) => {
                        debug!("Audit queue full, writing inline");
                        (record, AuditDelivery::Fallback)
                    }
                    Err(TrySendError::Closed(record)) => (record, AuditDelivery::Fallback),
                },
                None => (record, AuditDelivery::Inline),
            }
        };

        let (record, delivery) = rejected;
        self.writer.write(&record);
        metrics::record_audit_record(delivery);
    }

    /// Close the queue, wait for queued records to be written, then close
    /// the file. Later records still reach the console and hook sinks.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());

        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer
            && let Err(e) = consumer.await
        {
            error!(error = %e, "Audit writer task failed");
        }

        self.writer.close();
        info!("Audit logger stopped");
    }

    fn render_body(&self, body: &[u8], max: usize) -> Option<String> {
        if body.is_empty() {
            return None;
        }
        Some(truncate(redact_body(body, &self.config.sensitive_fields), max))
    }
}

fn open_audit_file(config: &AuditConfig) -> AppResult<File> {
    if let Some(dir) = config.file_path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir).map_err(|e| {
            AppError::ConfigError(format!(
                "cannot create audit directory {}: {e}",
                dir.display()
            ))
        })?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.file_path)
        .map_err(|e| {
            AppError::ConfigError(format!(
                "cannot open audit file {}: {e}",
                config.file_path.display()
            ))
        })
}

// =============================================================================
// Layer
// =============================================================================

/// Request facts captured before the request is handed down the stack.
struct PendingRecord {
    started: Instant,
    timestamp: DateTime<Utc>,
    request_id: String,
    client_ip: String,
    method: String,
    path: String,
    query: Option<String>,
    headers: BTreeMap<String, String>,
    user_agent: Option<String>,
    referer: Option<String>,
    reasons: Vec<String>,
    request_body: Option<String>,
}

impl PendingRecord {
    fn capture(ctx: &RequestContext) -> Self {
        let query = ctx.query().filter(|q| !q.is_empty()).map(str::to_string);
        let reasons = detect_suspicious(ctx.path(), query.as_deref());

        let mut headers = BTreeMap::new();
        if let Some(value) = ctx.header(CONTENT_TYPE.as_str()) {
            headers.insert("Content-Type".to_string(), value.to_string());
        }
        if let Some(value) = ctx.header(AUTHORIZATION.as_str()) {
            headers.insert("Authorization".to_string(), mask_string(value));
        }
        if let Some(value) = ctx.header(APP_KEY_HEADER) {
            headers.insert("X-App-Key".to_string(), value.to_string());
        }

        let client_ip = ctx
            .client_ip
            .or_else(|| ctx.extension::<ClientIp>().map(|ip| ip.0))
            .or_else(|| ctx.peer_addr().map(|addr| addr.ip()))
            .map_or_else(|| UNKNOWN_IP.to_string(), |ip| ip.to_string());

        Self {
            started: Instant::now(),
            timestamp: Utc::now(),
            request_id: ctx
                .request_id
                .as_ref()
                .map_or_else(String::new, |id| id.as_str().to_string()),
            client_ip,
            method: ctx.method().to_string(),
            path: ctx.path().to_string(),
            query,
            headers,
            user_agent: ctx.header(USER_AGENT.as_str()).map(str::to_string),
            referer: ctx.header(REFERER.as_str()).map(str::to_string),
            reasons,
            request_body: None,
        }
    }

    fn finish(
        self,
        slot: &IdentitySlot,
        status: u16,
        response_body: Option<String>,
        response_size: u64,
        error: Option<String>,
    ) -> AuditRecord {
        let elapsed = self.started.elapsed();
        metrics::record_request_duration(&self.method, status, elapsed.as_secs_f64());

        let identity = slot.get();
        AuditRecord {
            request_id: self.request_id,
            timestamp: self.timestamp,
            client_ip: self.client_ip,
            user_id: identity.map(|c| c.sub.clone()),
            username: identity.map(|c| c.name.clone()),
            method: self.method,
            path: self.path,
            query: self.query,
            headers: self.headers,
            request_body: self.request_body,
            status_code: status,
            response_body,
            response_size,
            latency_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            error,
            user_agent: self.user_agent,
            referer: self.referer,
            suspicious: !self.reasons.is_empty(),
            reasons: self.reasons,
        }
    }
}

/// Tower layer that records an [`AuditRecord`] for every non-excluded request.
#[derive(Clone)]
pub struct AuditLayer {
    logger: Arc<AuditLogger>,
    body_limit: usize,
}

impl AuditLayer {
    pub fn new(logger: Arc<AuditLogger>, body_limit: usize) -> Self {
        Self { logger, body_limit }
    }
}

impl<S> Layer<S> for AuditLayer {
    type Service = AuditService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuditService {
            inner,
            logger: Arc::clone(&self.logger),
            body_limit: self.body_limit,
        }
    }
}

/// Service produced by [`AuditLayer`].
#[derive(Clone)]
pub struct AuditService<S> {
    inner: S,
    logger: Arc<AuditLogger>,
    body_limit: usize,
}

impl<S> Service<Request<Body>> for AuditService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let logger = Arc::clone(&self.logger);
        let body_limit = self.body_limit;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if logger.is_excluded(req.uri().path()) {
                return inner.call(req).await;
            }

            let slot = IdentitySlot::new();
            let mut ctx = RequestContext::from_request(req);
            ctx.insert_extension(slot.clone());
            let mut pending = PendingRecord::capture(&ctx);

            if !pending.reasons.is_empty() {
                warn!(
                    client_ip = %pending.client_ip,
                    path = %pending.path,
                    reasons = ?pending.reasons,
                    "Suspicious request pattern"
                );
                metrics::record_suspicious_request();
            }

            if logger.config.log_request_body {
                match ctx.buffer_body(body_limit).await {
                    Ok(bytes) => {
                        pending.request_body =
                            logger.render_body(bytes, logger.config.max_request_body);
                    }
                    Err(err) => {
                        let status = err.status_code().as_u16();
                        let reason = err.to_string();
                        metrics::record_rejection("audit", status);
                        let response = err.into_response();
                        logger.log(pending.finish(&slot, status, None, 0, Some(reason)));
                        return Ok(response);
                    }
                }
            }

            let response = inner.call(ctx.into_request()).await?;
            let status = response.status().as_u16();
            let error = response
                .extensions()
                .get::<RejectionReason>()
                .map(|r| r.0.clone());

            // The record is written when the body finishes streaming
            let copied = logger.config.log_response_body.then(Vec::new);
            let copy_limit = logger.config.max_response_body.max(body_limit);
            let (parts, body) = response.into_parts();
            let body = AuditBody {
                inner: body,
                capture: Some(ResponseCapture {
                    logger,
                    slot,
                    pending,
                    status,
                    error,
                    copied,
                    copy_limit,
                    size: 0,
                }),
            };
            Ok(Response::from_parts(parts, Body::new(body)))
        })
    }
}

/// Everything needed to finish a record once the response body is done.
struct ResponseCapture {
    logger: Arc<AuditLogger>,
    slot: IdentitySlot,
    pending: PendingRecord,
    status: u16,
    error: Option<String>,
    /// Copy of the body so far, `None` when bodies are not logged or the
    /// copy limit was exceeded.
    copied: Option<Vec<u8>>,
    copy_limit: usize,
    size: u64,
}

impl ResponseCapture {
    fn observe(&mut self, data: &Bytes) {
        self.size = self.size.saturating_add(data.len() as u64);
        if let Some(copied) = &mut self.copied {
            if copied.len().saturating_add(data.len()) > self.copy_limit {
                // A cut-off JSON document cannot be redacted, so log none of it
                debug!(limit = self.copy_limit, "Response body too large to audit");
                self.copied = None;
            } else {
                copied.extend_from_slice(data);
            }
        }
    }

    fn finish(self, stream_error: Option<String>) {
        let Self {
            logger,
            slot,
            pending,
            status,
            error,
            copied,
            size,
            ..
        } = self;
        let response_body = copied
            .as_deref()
            .and_then(|bytes| logger.render_body(bytes, logger.config.max_response_body));
        let error = stream_error.or(error);
        logger.log(pending.finish(&slot, status, response_body, size, error));
    }
}

/// Response body that passes every frame straight through and writes the
/// audit record when the stream ends or the body is dropped.
struct AuditBody {
    inner: Body,
    capture: Option<ResponseCapture>,
}

impl AuditBody {
    fn complete(&mut self, stream_error: Option<String>) {
        if let Some(capture) = self.capture.take() {
            capture.finish(stream_error);
        }
    }
}

impl HttpBody for AuditBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(capture)) = (frame.data_ref(), this.capture.as_mut()) {
                    capture.observe(data);
                }
                if this.inner.is_end_stream() {
                    this.complete(None);
                }
            }
            Poll::Ready(Some(Err(e))) => this.complete(Some(format!("response body failed: {e}"))),
            Poll::Ready(None) => this.complete(None),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for AuditBody {
    fn drop(&mut self) {
        let aborted = (!self.inner.is_end_stream())
            .then(|| "response stream ended before completion".to_string());
        self.complete(aborted);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fields() -> Vec<String> {
        AuditConfig::default().sensitive_fields
    }

    fn temp_audit_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("gatekeeper-audit-{}", uuid::Uuid::new_v4()))
            .join("audit.log")
    }

    fn record(id: &str) -> AuditRecord {
        AuditRecord {
            request_id: id.to_string(),
            timestamp: Utc::now(),
            client_ip: "203.0.113.7".to_string(),
            user_id: None,
            username: None,
            method: "GET".to_string(),
            path: "/".to_string(),
            query: None,
            headers: BTreeMap::new(),
            request_body: None,
            status_code: 200,
            response_body: None,
            response_size: 0,
            latency_ms: 1,
            error: None,
            user_agent: None,
            referer: None,
            suspicious: false,
            reasons: Vec::new(),
        }
    }

    #[test]
    fn test_redact_nested_objects_and_arrays() {
        let body = br#"{"user":"bob","Password":"hunter2","profile":{"token":"t"},"items":[{"secret":"s","ok":1}]}"#;
        let redacted: Value = serde_json::from_str(&redact_body(body, &fields())).unwrap();

        assert_eq!(redacted["user"], "bob");
        assert_eq!(redacted["Password"], MASKED);
        assert_eq!(redacted["profile"]["token"], MASKED);
        assert_eq!(redacted["items"][0]["secret"], MASKED);
        assert_eq!(redacted["items"][0]["ok"], 1);
    }

    #[test]
    fn test_non_json_body_verbatim() {
        assert_eq!(redact_body(b"password=hunter2", &fields()), "password=hunter2");
    }

    #[test]
    fn test_redact_then_truncate() {
        let body = format!(r#"{{"password":"{}"}}"#, "x".repeat(100));
        let rendered = truncate(redact_body(body.as_bytes(), &fields()), 20);

        assert!(rendered.ends_with(TRUNCATED_SUFFIX));
        assert!(!rendered.contains("xxxx"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "héllo wörld".to_string();
        let cut = truncate(text, 2);
        assert_eq!(cut, format!("h{TRUNCATED_SUFFIX}"));
        assert_eq!(truncate("short".to_string(), 10), "short");
    }

    #[test]
    fn test_mask_string() {
        assert_eq!(mask_string("Bearer abc.def.ghi"), "Bear***.ghi");
        assert_eq!(mask_string("short"), "***");
        assert_eq!(mask_string("12345678"), "***");
    }

    #[test]
    fn test_detect_suspicious() {
        assert_eq!(
            detect_suspicious("/users", Some("id=1%27%20OR%20%271%27%3D%271")),
            vec!["possible SQL injection".to_string()]
        );
        assert_eq!(
            detect_suspicious("/search", Some("q=<script>alert(1)</script>")),
            vec!["possible XSS".to_string()]
        );
        assert_eq!(
            detect_suspicious("/files/../etc/passwd", None),
            vec!["possible path traversal".to_string()]
        );
        assert!(detect_suspicious("/orders", Some("page=2&sort=desc")).is_empty());
    }

    #[test]
    fn test_output_parsing() {
        assert_eq!("FILE".parse::<AuditOutput>().unwrap(), AuditOutput::File);
        assert_eq!("both".parse::<AuditOutput>().unwrap(), AuditOutput::Both);
        assert!("syslog".parse::<AuditOutput>().is_err());
    }

    #[test]
    fn test_record_serialization_skips_empty_fields() {
        let json = serde_json::to_value(record("r-1")).unwrap();
        assert_eq!(json["request_id"], "r-1");
        assert_eq!(json["status_code"], 200);
        assert!(json.get("user_id").is_none());
        assert!(json.get("suspicious").is_none());
    }

    #[tokio::test]
    async fn test_queued_records_reach_file_after_shutdown() {
        let path = temp_audit_path();
        let logger = AuditLogger::new(&AuditConfig {
            output: AuditOutput::File,
            file_path: path.clone(),
            queue_capacity: 4,
            ..AuditConfig::default()
        })
        .unwrap();

        // More records than the queue holds: overflow is written inline
        for i in 0..20 {
            logger.log(record(&format!("r-{i}")));
        }
        logger.shutdown().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let ids: Vec<String> = contents
            .lines()
            .map(|line| {
                let v: Value = serde_json::from_str(line).unwrap();
                v["request_id"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(ids.len(), 20);
        for i in 0..20 {
            assert!(ids.contains(&format!("r-{i}")));
        }

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_hook_sees_every_record_and_failures_are_contained() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        let hook: AuditHook = Arc::new(move |record: &AuditRecord| -> anyhow::Result<()> {
            seen_in.lock().push(record.request_id.clone());
            anyhow::bail!("downstream unavailable")
        });

        let logger = AuditLogger::with_hook(
            &AuditConfig {
                output: AuditOutput::Console,
                async_delivery: false,
                ..AuditConfig::default()
            },
            Some(hook),
        )
        .unwrap();

        logger.log(record("a"));
        logger.log(record("b"));
        logger.shutdown().await;
        // After shutdown records still reach the hook
        logger.log(record("c"));

        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_synchronous_without_runtime() {
        let seen = Arc::new(Mutex::new(0usize));
        let seen_in = Arc::clone(&seen);
        let hook: AuditHook = Arc::new(move |_: &AuditRecord| -> anyhow::Result<()> {
            *seen_in.lock() += 1;
            Ok(())
        });

        let logger = AuditLogger::with_hook(
            &AuditConfig {
                output: AuditOutput::Console,
                ..AuditConfig::default()
            },
            Some(hook),
        )
        .unwrap();
        logger.log(record("no-runtime"));

        assert_eq!(*seen.lock(), 1);
    }

    type Recorded = Arc<Mutex<Vec<AuditRecord>>>;

    fn recording_logger(log_response_body: bool) -> (Arc<AuditLogger>, Recorded) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        let hook: AuditHook = Arc::new(move |record: &AuditRecord| -> anyhow::Result<()> {
            seen_in.lock().push(record.clone());
            Ok(())
        });
        let logger = AuditLogger::with_hook(
            &AuditConfig {
                output: AuditOutput::Console,
                async_delivery: false,
                log_response_body,
                ..AuditConfig::default()
            },
            Some(hook),
        )
        .unwrap();
        (Arc::new(logger), seen)
    }

    /// Yields one chunk, then never finishes.
    struct OneChunkThenPending {
        sent: bool,
    }

    impl HttpBody for OneChunkThenPending {
        type Data = Bytes;
        type Error = axum::Error;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
            if self.sent {
                Poll::Pending
            } else {
                self.sent = true;
                Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"first")))))
            }
        }
    }

    #[tokio::test]
    async fn test_streaming_response_is_not_held_back() {
        use axum::Router;
        use axum::routing::get;
        use http_body_util::BodyExt;
        use std::time::Duration;
        use tower::ServiceExt;

        let (logger, seen) = recording_logger(true);
        let app = Router::new()
            .route(
                "/events",
                get(|| async { Body::new(OneChunkThenPending { sent: false }) }),
            )
            .layer(AuditLayer::new(logger, 1024));

        let response = tokio::time::timeout(
            Duration::from_secs(2),
            app.oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap()),
        )
        .await
        .expect("response headers were held back")
        .unwrap();
        assert_eq!(response.status(), 200);

        let mut body = response.into_body();
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("first chunk was held back")
            .unwrap()
            .unwrap();
        assert_eq!(&frame.into_data().unwrap()[..], b"first");
        assert!(seen.lock().is_empty(), "record written before the stream ended");

        // Client goes away mid-stream
        drop(body);

        let records = seen.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, 200);
        assert_eq!(records[0].response_size, 5);
        assert_eq!(records[0].response_body.as_deref(), Some("first"));
        assert!(records[0].error.as_deref().unwrap().contains("before completion"));
    }

    #[tokio::test]
    async fn test_completed_response_is_redacted_and_sized() {
        use axum::Router;
        use axum::routing::get;
        use tower::ServiceExt;

        let (logger, seen) = recording_logger(true);
        let app = Router::new()
            .route(
                "/login",
                get(|| async { r#"{"user":"bob","token":"abc.def"}"# }),
            )
            .layer(AuditLayer::new(logger, 1024));

        let response = app
            .oneshot(Request::builder().uri("/login").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(&bytes[..], br#"{"user":"bob","token":"abc.def"}"#);

        let records = seen.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].response_size, bytes.len() as u64);
        assert!(records[0].error.is_none());
        let logged: Value =
            serde_json::from_str(records[0].response_body.as_deref().unwrap()).unwrap();
        assert_eq!(logged["token"], MASKED);
        assert_eq!(logged["user"], "bob");
    }

    #[tokio::test]
    async fn test_oversized_response_body_is_not_logged() {
        use axum::Router;
        use axum::routing::get;
        use tower::ServiceExt;

        let (logger, seen) = recording_logger(true);
        let large = "x".repeat(64 * 1024);
        let app = Router::new()
            .route("/dump", get(move || async move { large }))
            .layer(AuditLayer::new(logger, 1024));

        let response = app
            .oneshot(Request::builder().uri("/dump").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes.len(), 64 * 1024);

        let records = seen.lock();
        assert_eq!(records[0].response_size, 64 * 1024);
        assert!(records[0].response_body.is_none());
    }

    #[test]
    fn test_excluded_paths() {
        let logger = AuditLogger::new(&AuditConfig {
            output: AuditOutput::Console,
            ..AuditConfig::default()
        })
        .unwrap();
        assert!(logger.is_excluded("/health"));
        assert!(logger.is_excluded("/ping"));
        assert!(!logger.is_excluded("/api/v1/me"));
    }
}
