//! Signed identity tokens and the guards that consume them.
//!
//! Tokens are HS256 JWTs carrying the full identity, so verification needs
//! no session store. Refresh re-issues a token from currently valid claims.
//! There is **no revocation**: a leaked token stays valid until it expires.
//!
//! # Usage
//!
//! ```bash
//! curl -H "Authorization: Bearer <token>" http://localhost:3000/api/v1/me
//! ```
//!
//! # Brute Force Protection
//!
//! Failed authentication attempts are counted per client IP. Once an IP has
//! used up its failure budget, further failed attempts are answered with 429
//! instead of 401 until the budget refills. Successful requests cost nothing.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use chrono::{DateTime, TimeZone, Utc};
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::ip::{ClientIpResolver, UNKNOWN_IP};
use crate::config::TokenConfig;
use crate::context::RequestContext;
use crate::error::AppError;
use crate::pipeline::{Guard, Verdict};

/// Authorization scheme accepted by the bearer guard.
const BEARER_PREFIX: &str = "Bearer ";

/// Identity embedded in a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user) id
    pub sub: String,
    /// Display name
    pub name: String,
    pub role: String,
    /// Issued at, seconds since epoch
    pub iat: i64,
    /// Not valid before, seconds since epoch
    pub nbf: i64,
    /// Expires at, seconds since epoch
    pub exp: i64,
    pub iss: String,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }
}

/// A freshly issued token.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Token verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing authorization token")]
    Missing,
    #[error("authorization header must use the Bearer scheme")]
    BadScheme,
    #[error("token has expired")]
    Expired,
    #[error("token is not valid yet")]
    NotYetValid,
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token issuer is not accepted")]
    InvalidIssuer,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::ImmatureSignature => AuthError::NotYetValid,
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
            _ => AuthError::Malformed,
        }
    }
}

/// Issues and verifies HS256 identity tokens.
pub struct TokenAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    default_ttl: Duration,
}

impl TokenAuthenticator {
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            default_ttl: config.ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Issue a token valid for `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Signing` if the token cannot be encoded.
    pub fn issue(
        &self,
        subject: &str,
        name: &str,
        role: &str,
        ttl: Duration,
    ) -> Result<IssuedToken, AuthError> {
        self.issue_at(subject, name, role, ttl, Utc::now().timestamp())
    }

    /// Issue a token as if the current time were `now` (seconds since epoch).
    pub fn issue_at(
        &self,
        subject: &str,
        name: &str,
        role: &str,
        ttl: Duration,
        now: i64,
    ) -> Result<IssuedToken, AuthError> {
        let ttl_secs = i64::try_from(ttl.as_secs())
            .map_err(|_| AuthError::Signing("token lifetime out of range".to_string()))?;
        let claims = Claims {
            sub: subject.to_string(),
            name: name.to_string(),
            role: role.to_string(),
            iat: now,
            nbf: now,
            exp: now.saturating_add(ttl_secs),
            iss: self.issuer.clone(),
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        let expires_at = claims
            .expires_at()
            .ok_or_else(|| AuthError::Signing("token expiry out of range".to_string()))?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Verify integrity, issuer and validity period of a token.
    ///
    /// # Errors
    ///
    /// `Expired` after `exp`, `NotYetValid` before `nbf`, `InvalidSignature`
    /// when the integrity check fails, `Malformed` when it cannot be decoded.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss"]);
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }

    /// Re-issue a token for the identity in a currently valid one.
    ///
    /// The old token is not invalidated.
    pub fn refresh(&self, token: &str) -> Result<IssuedToken, AuthError> {
        let claims = self.verify(token)?;
        self.issue(&claims.sub, &claims.name, &claims.role, self.default_ttl)
    }
}

/// Pull the token out of an `Authorization: Bearer` header.
pub fn extract_bearer(ctx: &RequestContext) -> Result<&str, AuthError> {
    bearer_from_headers(ctx.headers())
}

/// [`extract_bearer`] over a plain header map, for handlers.
pub fn bearer_from_headers(headers: &HeaderMap) -> Result<&str, AuthError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::Missing)?;
    let token = header
        .strip_prefix(BEARER_PREFIX)
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or(AuthError::BadScheme)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::Missing);
    }
    Ok(token)
}

// =============================================================================
// Bearer Guard
// =============================================================================

/// Type alias for the per-IP authentication failure limiter.
type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Per-IP budget of failed authentication attempts.
pub struct FailureThrottle {
    limiter: AuthFailureLimiter,
    per_minute: u32,
}

impl FailureThrottle {
    /// Allow `per_minute` failures per IP, half of them in a burst.
    /// Returns `None` when `per_minute` is zero (throttling disabled).
    pub fn new(per_minute: u32) -> Option<Self> {
        let limit = NonZeroU32::new(per_minute)?;
        let burst = NonZeroU32::new((per_minute / 2).max(1)).unwrap_or(limit);
        let quota = Quota::per_minute(limit).allow_burst(burst);
        Some(Self {
            limiter: RateLimiter::keyed(quota),
            per_minute,
        })
    }

    /// Charge one failure to `client_ip`. Returns the retry delay in seconds
    /// once the budget is exhausted.
    pub fn record_failure(&self, client_ip: &str) -> Option<u64> {
        match self.limiter.check_key(&client_ip.to_string()) {
            Ok(()) => None,
            Err(not_until) => {
                let wait_time = not_until.wait_time_from(DefaultClock::default().now());
                Some(wait_time.as_secs().max(1))
            }
        }
    }

    pub fn per_minute(&self) -> u32 {
        self.per_minute
    }

    /// Forget clients whose budget has fully replenished.
    pub fn sweep(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    pub fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }
}

/// Authenticates `Authorization: Bearer` tokens and annotates the identity.
pub struct BearerAuth {
    authenticator: Arc<TokenAuthenticator>,
    throttle: Option<Arc<FailureThrottle>>,
    resolver: Arc<ClientIpResolver>,
    optional: bool,
}

impl BearerAuth {
    pub fn new(
        authenticator: Arc<TokenAuthenticator>,
        throttle: Option<Arc<FailureThrottle>>,
        resolver: Arc<ClientIpResolver>,
    ) -> Self {
        Self {
            authenticator,
            throttle,
            resolver,
            optional: false,
        }
    }

    /// Attach the identity when a valid token is present and let every
    /// request through otherwise.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

impl Guard for BearerAuth {
    fn name(&self) -> &'static str {
        "token"
    }

    fn inspect(&self, ctx: &mut RequestContext) -> Verdict {
        let result = extract_bearer(ctx).and_then(|token| self.authenticator.verify(token));

        if self.optional {
            if let Ok(claims) = result {
                ctx.identity = Some(claims);
            }
            return Verdict::Continue;
        }

        let err = match result {
            Ok(claims) => {
                debug!(sub = %claims.sub, role = %claims.role, "Token authentication successful");
                ctx.identity = Some(claims);
                return Verdict::Continue;
            }
            Err(err) => err,
        };

        let client_ip = self
            .resolver
            .client_ip(ctx)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_IP.to_string());

        if let Some(throttle) = &self.throttle
            && let Some(retry_after) = throttle.record_failure(&client_ip)
        {
            error!(
                client_ip = %client_ip,
                retry_after_secs = retry_after,
                "IP blocked due to excessive auth failures"
            );
            return Verdict::Reject(AppError::RateLimited {
                retry_after_secs: retry_after,
                limit: throttle.per_minute(),
            });
        }

        warn!(
            path = %ctx.path(),
            client_ip = %client_ip,
            reason = %err,
            "Token authentication failed"
        );
        Verdict::Reject(err.into())
    }
}

// =============================================================================
// Role Guard
// =============================================================================

/// Pure set-membership role check. Fails closed without an identity.
pub fn require_role(identity: Option<&Claims>, allowed: &[String]) -> Result<(), AppError> {
    let Some(claims) = identity else {
        return Err(AppError::Forbidden("authentication required".to_string()));
    };
    if allowed.iter().any(|role| role == &claims.role) {
        Ok(())
    } else {
        Err(AppError::Forbidden("insufficient role".to_string()))
    }
}

/// Guard form of [`require_role`]; must run after [`BearerAuth`].
pub struct RequireRole {
    allowed: Vec<String>,
}

impl RequireRole {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }
}

impl Guard for RequireRole {
    fn name(&self) -> &'static str {
        "role"
    }

    fn inspect(&self, ctx: &mut RequestContext) -> Verdict {
        let verdict = require_role(ctx.identity.as_ref(), &self.allowed);
        if verdict.is_err() {
            warn!(
                path = %ctx.path(),
                role = ctx.identity.as_ref().map(|c| c.role.as_str()),
                allowed = ?self.allowed,
                "Role check failed"
            );
        }
        verdict.into()
    }
}
