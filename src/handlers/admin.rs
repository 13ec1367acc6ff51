//! Runtime management of the IP admission rules.
//!
//! # Endpoints
//!
//! - `GET /api/v1/admin/ip-rules` - Current mode and rules
//! - `POST /api/v1/admin/ip-rules` - Add a rule
//! - `DELETE /api/v1/admin/ip-rules` - Remove a rule
//!
//! Mutations take effect for the next request; lookups in flight are not
//! blocked for longer than the write itself.
//!
//! # Request Body
//!
//! ```json
//! { "list": "deny", "rule": "203.0.113.0/24" }
//! ```

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use tracing::instrument;

use crate::error::{AppError, AppResult};
use crate::middleware::ip_filter::RuleSnapshot;
use crate::models::{IpRuleChange, IpRuleRequest};
use crate::state::AppState;

#[instrument(skip(state))]
pub async fn list_ip_rules(State(state): State<AppState>) -> Json<RuleSnapshot> {
    Json(state.ip_filter.snapshot())
}

/// Add an allow or deny rule.
///
/// Returns 201 when the rule was new, 200 when it was already present.
///
/// # Errors
///
/// 400 if the body is not a valid request or the rule does not parse.
#[instrument(skip(state, body))]
pub async fn add_ip_rule(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<IpRuleChange>)> {
    let request: IpRuleRequest = serde_json::from_slice(&body)?;
    let changed = state.ip_filter.add(request.list, &request.rule)?;

    let status = if changed {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(IpRuleChange {
            list: request.list,
            rule: request.rule,
            changed,
        }),
    ))
}

/// Remove an allow or deny rule.
///
/// # Errors
///
/// 400 if the body is invalid, 404 if the rule was not present.
#[instrument(skip(state, body))]
pub async fn remove_ip_rule(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<IpRuleChange>> {
    let request: IpRuleRequest = serde_json::from_slice(&body)?;
    if !state.ip_filter.remove(request.list, &request.rule)? {
        return Err(AppError::NotFound(format!(
            "no {} rule '{}'",
            request.list, request.rule
        )));
    }

    Ok(Json(IpRuleChange {
        list: request.list,
        rule: request.rule,
        changed: true,
    }))
}
