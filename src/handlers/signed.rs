//! Signed request demo endpoint.

use axum::Json;
use axum::body::Bytes;
use tracing::instrument;

use crate::models::EchoResponse;

/// Echo the body of a request that passed signature verification.
///
/// The body was already read once by the signature guard; this handler
/// receives the same bytes.
#[instrument(skip_all, fields(size = body.len()))]
pub async fn signed_echo(body: Bytes) -> Json<EchoResponse> {
    Json(EchoResponse {
        verified: true,
        size: body.len(),
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}
