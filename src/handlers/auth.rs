//! Endpoints for bearer-authenticated callers.
//!
//! # Endpoints
//!
//! - `GET /api/v1/me` - The identity carried by the token
//! - `POST /api/v1/token/refresh` - Re-issue the presented token
//!
//! Refresh does not revoke the presented token; both stay valid until they
//! expire.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::{Extension, Json};
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::middleware::token::{Claims, bearer_from_headers};
use crate::models::{IdentityResponse, TokenResponse};
use crate::state::AppState;

/// Return the authenticated identity.
///
/// # Errors
///
/// 401 if no identity was attached (route mounted without the bearer guard).
#[instrument(skip_all)]
pub async fn me(identity: Option<Extension<Claims>>) -> AppResult<Json<IdentityResponse>> {
    let Extension(claims) =
        identity.ok_or_else(|| AppError::Unauthorized("authentication required".to_string()))?;
    Ok(Json(IdentityResponse::from(&claims)))
}

/// Re-issue the presented token with a fresh lifetime.
///
/// # Errors
///
/// 401 if the token is missing or no longer valid.
#[instrument(skip_all)]
pub async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<TokenResponse>> {
    let token = bearer_from_headers(&headers)?;
    let issued = state.tokens.refresh(token)?;
    info!(expires_at = %issued.expires_at, "Token refreshed");
    Ok(Json(TokenResponse::from(issued)))
}
