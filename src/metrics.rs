//! Prometheus metrics for the security pipeline.
//!
//! Metrics are exposed via a dedicated HTTP listener (`METRICS_PORT`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gatekeeper_requests_rejected_total` - Short-circuited requests (labels: guard, status)
//! - `gatekeeper_audit_records_total` - Audit records written (label: delivery)
//! - `gatekeeper_audit_write_failures_total` - Audit sink failures (label: sink)
//! - `gatekeeper_suspicious_requests_total` - Requests flagged by the attack heuristics
//!
//! ## Histograms
//! - `gatekeeper_request_duration_seconds` - Audited request duration (labels: method, status)
//!
//! ## Gauges
//! - `gatekeeper_rate_limit_keys` - Keys tracked by a rate limiter (label: limiter)
//! - `gatekeeper_nonce_ledger_entries` - Nonces currently remembered
//!
//! # Usage
//!
//! ```rust,ignore
//! use gatekeeper::metrics::{init_metrics, record_rejection};
//!
//! init_metrics("0.0.0.0:9090".parse()?)?;
//! record_rejection("rate_limit", 429);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_REJECTED_TOTAL: &str = "gatekeeper_requests_rejected_total";
    pub const AUDIT_RECORDS_TOTAL: &str = "gatekeeper_audit_records_total";
    pub const AUDIT_WRITE_FAILURES_TOTAL: &str = "gatekeeper_audit_write_failures_total";
    pub const SUSPICIOUS_REQUESTS_TOTAL: &str = "gatekeeper_suspicious_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gatekeeper_request_duration_seconds";
    pub const RATE_LIMIT_KEYS: &str = "gatekeeper_rate_limit_keys";
    pub const NONCE_LEDGER_ENTRIES: &str = "gatekeeper_nonce_ledger_entries";
}

/// How an audit record reached its sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditDelivery {
    /// Handed to the background writer.
    Queued,
    /// Written on the request task because delivery is synchronous.
    Inline,
    /// Written on the request task because the queue was full or closed.
    Fallback,
}

impl AuditDelivery {
    fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Inline => "inline",
            Self::Fallback => "fallback",
        }
    }
}

/// Install the Prometheus exporter and describe all metrics.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (port in use, or a
/// recorder is already installed).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REQUESTS_REJECTED_TOTAL,
        "Requests short-circuited by a security guard"
    );
    describe_counter!(
        names::AUDIT_RECORDS_TOTAL,
        "Audit records written, by delivery path"
    );
    describe_counter!(
        names::AUDIT_WRITE_FAILURES_TOTAL,
        "Audit sink write failures"
    );
    describe_counter!(
        names::SUSPICIOUS_REQUESTS_TOTAL,
        "Requests matching an attack-pattern heuristic"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Duration of audited requests in seconds"
    );

    describe_gauge!(
        names::RATE_LIMIT_KEYS,
        "Client keys currently tracked by a rate limiter"
    );
    describe_gauge!(
        names::NONCE_LEDGER_ENTRIES,
        "Nonces currently remembered for replay protection"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Record a request rejected by `guard` with `status`.
pub fn record_rejection(guard: &'static str, status: u16) {
    counter!(names::REQUESTS_REJECTED_TOTAL, "guard" => guard, "status" => status.to_string())
        .increment(1);
}

pub fn record_audit_record(delivery: AuditDelivery) {
    counter!(names::AUDIT_RECORDS_TOTAL, "delivery" => delivery.as_str()).increment(1);
}

pub fn record_audit_failure(sink: &'static str) {
    counter!(names::AUDIT_WRITE_FAILURES_TOTAL, "sink" => sink).increment(1);
}

pub fn record_suspicious_request() {
    counter!(names::SUSPICIOUS_REQUESTS_TOTAL).increment(1);
}

// =============================================================================
// Histograms
// =============================================================================

/// Record the duration of an audited request.
pub fn record_request_duration(method: &str, status: u16, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

// =============================================================================
// Gauges
// =============================================================================

/// Update the tracked key count of the limiter named `limiter`.
pub fn set_rate_limit_keys(limiter: &'static str, keys: usize) {
    gauge!(names::RATE_LIMIT_KEYS, "limiter" => limiter).set(keys as f64);
}

pub fn set_nonce_ledger_entries(entries: usize) {
    gauge!(names::NONCE_LEDGER_ENTRIES).set(entries as f64);
}
