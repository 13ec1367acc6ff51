use axum::http::header::{HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::middleware::ip_filter::RuleParseError;
use crate::middleware::signature::SignatureError;
use crate::middleware::token::AuthError;

/// Header carrying the configured request quota.
pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";

/// Header carrying the requests left in the current window.
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Application-wide error types with appropriate HTTP status codes.
///
/// Every guard in the pipeline short-circuits with one of these. The
/// client-facing variants map onto the error taxonomy of the interceptor
/// chain:
///
/// - `BadRequest` - malformed signing parameters or timestamps (400)
/// - `Unauthorized` - missing/invalid/expired token, signature mismatch (401)
/// - `Forbidden` - IP blocked or role denied (403)
/// - `RateLimited` - quota exhausted (429)
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64, limit: u32 },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AppError {
    /// HTTP status this error is rendered with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::SerializationError(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body for short-circuited requests.
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    message: String,
}

/// Response extension carrying the rejection text.
///
/// The audit wrapper copies it into the `error` field of the record so that
/// a rejected request is logged with the reason it was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionReason(pub String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Log the full error details server-side for debugging
        // but only expose sanitized messages to clients
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::warn!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let message = match &self {
            AppError::BadRequest(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::PayloadTooLarge(msg) => msg.clone(),
            AppError::RateLimited { .. } => "Rate limit exceeded. Please retry later.".to_string(),
            AppError::SerializationError(e) => sanitize_serde_error(e),
            // Internal errors - never expose internal details to clients
            AppError::Internal(_) => {
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string()
            }
            AppError::ConfigError(_) => {
                "Service configuration error. Please contact support.".to_string()
            }
        };

        let body = ErrorResponse {
            code: status.as_u16(),
            message,
        };
        let mut response = (status, axum::Json(body)).into_response();

        if let AppError::RateLimited {
            retry_after_secs,
            limit,
        } = &self
        {
            let headers = response.headers_mut();
            headers.insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(*limit));
            headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(0u32));
        }

        response
            .extensions_mut()
            .insert(RejectionReason(self.to_string()));
        response
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Signing(msg) => AppError::Internal(msg),
            other => AppError::Unauthorized(other.to_string()),
        }
    }
}

impl From<SignatureError> for AppError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::Mismatch => AppError::Unauthorized(err.to_string()),
            SignatureError::MissingParams
            | SignatureError::InvalidTimestamp
            | SignatureError::Expired
            | SignatureError::ReplayedNonce => AppError::BadRequest(err.to_string()),
            SignatureError::Crypto(_) | SignatureError::BodyNotBuffered => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

impl From<RuleParseError> for AppError {
    fn from(err: RuleParseError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
///
/// Serde errors can contain internal struct/field names which shouldn't be
/// exposed to external clients. This function extracts the useful parts.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if msg.contains("missing field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("Missing required field: {field}");
    }

    if msg.contains("unknown variant") {
        return "Unsupported value in request body".to_string();
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
