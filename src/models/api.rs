use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::middleware::ip_filter::RuleList;
use crate::middleware::token::{Claims, IssuedToken};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "healthy" while the process serves requests
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// The authenticated identity as seen by a handler.
#[derive(Debug, Serialize)]
pub struct IdentityResponse {
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&Claims> for IdentityResponse {
    fn from(claims: &Claims) -> Self {
        Self {
            user_id: claims.sub.clone(),
            username: claims.name.clone(),
            role: claims.role.clone(),
            expires_at: claims.expires_at(),
        }
    }
}

/// A re-issued token.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
}

impl From<IssuedToken> for TokenResponse {
    fn from(issued: IssuedToken) -> Self {
        Self {
            token: issued.token,
            token_type: "Bearer",
            expires_at: issued.expires_at,
        }
    }
}

/// Request to add or remove one IP rule.
#[derive(Debug, Deserialize)]
pub struct IpRuleRequest {
    /// `allow` or `deny`
    pub list: RuleList,
    /// Exact address or CIDR block
    pub rule: String,
}

/// Outcome of an IP rule mutation.
#[derive(Debug, Serialize)]
pub struct IpRuleChange {
    pub list: RuleList,
    pub rule: String,
    /// Whether the rule set actually changed
    pub changed: bool,
}

/// Echo of a signed request.
#[derive(Debug, Serialize)]
pub struct EchoResponse {
    pub verified: bool,
    pub size: usize,
    /// The body as received, lossily decoded
    pub body: String,
}
