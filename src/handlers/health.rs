//! Liveness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with version and uptime
//! - `GET /ping` - Plain-text liveness check
//!
//! Both are public and excluded from the audit trail by default. They still
//! pass IP admission and rate limiting.

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 42,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

pub async fn ping() -> &'static str {
    "pong"
}
