//! Request signature verification with replay protection.
//!
//! # Signing Parameters
//!
//! Each parameter is read from its header first, then from the query string:
//!
//! | Header        | Query       |
//! |---------------|-------------|
//! | `X-Signature` | `sign`      |
//! | `X-Timestamp` | `timestamp` |
//! | `X-Nonce`     | `nonce`     |
//! | `X-App-Key`   | `app_key`   |
//!
//! # Canonical String
//!
//! Parts joined with `&`, in this order:
//!
//! ```text
//! METHOD & /path & k1=v1 & k2=v2 ... & timestamp [& nonce] [& app_key] [& body]
//! ```
//!
//! Query pairs exclude the signing parameters and are sorted by key, then by
//! value. Nonce and app key are only present when supplied; the body only
//! when body validation is enabled and the body is non-empty.
//!
//! # Replay Protection
//!
//! A request is accepted while its timestamp is at most `expiry` in the past
//! and at most `tolerance` in the future. Nonces are remembered for
//! `expiry + tolerance`, the longest time any request carrying them can stay
//! acceptable, and each may be used once. The ledger is in-memory and
//! per-process: restarts forget it and separate instances do not share it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SignatureConfig;
use crate::context::RequestContext;
use crate::pipeline::{Guard, Verdict};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const NONCE_HEADER: &str = "x-nonce";
pub const APP_KEY_HEADER: &str = "x-app-key";

/// Digest used to sign requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureAlgorithm {
    /// Hex HMAC-SHA256 of the canonical string, keyed with the secret.
    #[default]
    HmacSha256,
    /// Legacy: hex MD5 of the canonical string followed by the secret.
    Md5,
}

impl FromStr for SignatureAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hmac-sha256" | "hmac_sha256" | "sha256" => Ok(Self::HmacSha256),
            "md5" => Ok(Self::Md5),
            other => Err(format!(
                "unknown signature algorithm '{other}' (expected hmac-sha256 or md5)"
            )),
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HmacSha256 => f.write_str("hmac-sha256"),
            Self::Md5 => f.write_str("md5"),
        }
    }
}

/// Signature verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signature or timestamp")]
    MissingParams,
    #[error("timestamp is not a valid unix time")]
    InvalidTimestamp,
    #[error("request timestamp is outside the accepted window")]
    Expired,
    #[error("nonce has already been used")]
    ReplayedNonce,
    #[error("signature does not match")]
    Mismatch,
    #[error("signing key rejected: {0}")]
    Crypto(String),
    #[error("request body must be buffered before signature verification")]
    BodyNotBuffered,
}

/// Query parameter names of the signing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamNames {
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
    pub app_key: String,
}

impl Default for ParamNames {
    fn default() -> Self {
        Self {
            signature: "sign".to_string(),
            timestamp: "timestamp".to_string(),
            nonce: "nonce".to_string(),
            app_key: "app_key".to_string(),
        }
    }
}

impl ParamNames {
    fn is_signing_param(&self, name: &str) -> bool {
        name == self.signature || name == self.timestamp || name == self.nonce || name == self.app_key
    }
}

/// Everything that goes into the canonical string.
#[derive(Debug, Clone, Default)]
pub struct SigningInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Business query parameters, decoded, in any order.
    pub params: Vec<(String, String)>,
    pub timestamp: &'a str,
    pub nonce: Option<&'a str>,
    pub app_key: Option<&'a str>,
    /// Raw body, `None` when body validation is off.
    pub body: Option<&'a [u8]>,
}

/// Build the canonical signing string.
pub fn canonical_string(input: &SigningInput<'_>) -> Vec<u8> {
    let mut params: Vec<&(String, String)> = input.params.iter().collect();
    params.sort();

    let mut parts: Vec<&[u8]> = Vec::with_capacity(params.len() + 6);
    let pairs: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();

    parts.push(input.method.as_bytes());
    parts.push(input.path.as_bytes());
    parts.extend(pairs.iter().map(|p| p.as_bytes()));
    parts.push(input.timestamp.as_bytes());
    if let Some(nonce) = input.nonce.filter(|n| !n.is_empty()) {
        parts.push(nonce.as_bytes());
    }
    if let Some(app_key) = input.app_key.filter(|k| !k.is_empty()) {
        parts.push(app_key.as_bytes());
    }
    if let Some(body) = input.body.filter(|b| !b.is_empty()) {
        parts.push(body);
    }

    parts.join(&b'&')
}

/// Hex digest of the canonical string under `algorithm`.
///
/// # Errors
///
/// Returns `SignatureError::Crypto` if the secret is rejected as a key.
pub fn compute_signature(
    algorithm: SignatureAlgorithm,
    canonical: &[u8],
    secret: &[u8],
) -> Result<String, SignatureError> {
    match algorithm {
        SignatureAlgorithm::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(secret)
                .map_err(|e| SignatureError::Crypto(e.to_string()))?;
            mac.update(canonical);
            Ok(hex::encode(mac.finalize().into_bytes()))
        }
        SignatureAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            hasher.update(canonical);
            hasher.update(secret);
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

/// Signing parameters for a client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedRequest {
    pub signature: String,
    pub timestamp: i64,
    pub nonce: String,
}

/// 16 hex characters of randomness.
pub fn generate_nonce() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Sign a request with HMAC-SHA256, including the body.
///
/// Produces the signature, timestamp and nonce the client sends along with
/// the request (as headers or query parameters).
///
/// # Errors
///
/// Returns `SignatureError::Crypto` if the secret is rejected as a key.
pub fn sign(
    method: &str,
    path: &str,
    params: &[(&str, &str)],
    body: &[u8],
    secret: &str,
) -> Result<SignedRequest, SignatureError> {
    sign_request(
        SignatureAlgorithm::HmacSha256,
        secret.as_bytes(),
        method,
        path,
        params,
        Some(body),
    )
}

/// Sign an explicit [`SigningInput`], returning the hex signature.
///
/// # Errors
///
/// Returns `SignatureError::Crypto` if the secret is rejected as a key.
pub fn sign_with(
    input: &SigningInput<'_>,
    secret: &[u8],
    algorithm: SignatureAlgorithm,
) -> Result<String, SignatureError> {
    compute_signature(algorithm, &canonical_string(input), secret)
}

fn sign_request(
    algorithm: SignatureAlgorithm,
    secret: &[u8],
    method: &str,
    path: &str,
    params: &[(&str, &str)],
    body: Option<&[u8]>,
) -> Result<SignedRequest, SignatureError> {
    let timestamp = Utc::now().timestamp();
    let timestamp_str = timestamp.to_string();
    let nonce = generate_nonce();

    let input = SigningInput {
        method,
        path,
        params: params
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
        timestamp: &timestamp_str,
        nonce: Some(&nonce),
        app_key: None,
        body,
    };
    let signature = sign_with(&input, secret, algorithm)?;

    Ok(SignedRequest {
        signature,
        timestamp,
        nonce,
    })
}

// =============================================================================
// Nonce Ledger
// =============================================================================

/// First-seen times of consumed nonces.
#[derive(Debug)]
pub struct NonceLedger {
    retention_secs: i64,
    seen: Mutex<HashMap<String, i64>>,
}

impl NonceLedger {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention_secs: i64::try_from(retention.as_secs()).unwrap_or(i64::MAX),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `nonce` as used at `now`. Returns `false` if it was already
    /// used within the retention period.
    ///
    /// Check and insert happen under one lock acquisition, so two concurrent
    /// requests with the same nonce cannot both succeed.
    pub fn check_and_record(&self, nonce: &str, now: i64) -> bool {
        let mut seen = self.seen.lock();
        match seen.get_mut(nonce) {
            Some(first_seen) if now.saturating_sub(*first_seen) <= self.retention_secs => false,
            Some(first_seen) => {
                *first_seen = now;
                true
            }
            None => {
                seen.insert(nonce.to_string(), now);
                true
            }
        }
    }

    /// Forget nonces older than the retention period. Returns how many.
    pub fn purge(&self, now: i64) -> usize {
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, first_seen| now.saturating_sub(*first_seen) <= self.retention_secs);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Validator
// =============================================================================

struct ExtractedParams {
    signature: String,
    timestamp: String,
    nonce: Option<String>,
    app_key: Option<String>,
    business: Vec<(String, String)>,
}

/// Verifies signed requests against a shared secret.
pub struct SignatureValidator {
    secret: Vec<u8>,
    algorithm: SignatureAlgorithm,
    expiry: Duration,
    tolerance: Duration,
    validate_body: bool,
    names: ParamNames,
    ledger: NonceLedger,
}

impl SignatureValidator {
    pub fn new(config: &SignatureConfig) -> Self {
        Self {
            secret: config.secret.as_bytes().to_vec(),
            algorithm: config.algorithm,
            expiry: config.expiry,
            tolerance: config.tolerance,
            validate_body: config.validate_body,
            names: ParamNames::default(),
            ledger: NonceLedger::new(config.expiry + config.tolerance),
        }
    }

    pub fn validate_body(&self) -> bool {
        self.validate_body
    }

    pub fn ledger(&self) -> &NonceLedger {
        &self.ledger
    }

    /// How often the nonce ledger should be purged.
    pub fn purge_interval(&self) -> Duration {
        self.expiry.max(Duration::from_secs(1))
    }

    pub fn purge_nonces(&self) -> usize {
        self.ledger.purge(Utc::now().timestamp())
    }

    /// Sign a request the way this validator expects it.
    ///
    /// # Errors
    ///
    /// Returns `SignatureError::Crypto` if the secret is rejected as a key.
    pub fn sign(
        &self,
        method: &str,
        path: &str,
        params: &[(&str, &str)],
        body: &[u8],
    ) -> Result<SignedRequest, SignatureError> {
        sign_request(
            self.algorithm,
            &self.secret,
            method,
            path,
            params,
            self.validate_body.then_some(body),
        )
    }

    pub fn verify(&self, ctx: &RequestContext) -> Result<(), SignatureError> {
        self.verify_at(ctx, Utc::now().timestamp())
    }

    /// Verify as if the current time were `now` (seconds since epoch).
    ///
    /// When body validation is enabled the body must already be buffered on
    /// the context.
    pub fn verify_at(&self, ctx: &RequestContext, now: i64) -> Result<(), SignatureError> {
        let params = self.extract(ctx)?;
        let body = if self.validate_body {
            Some(
                ctx.body_bytes()
                    .map(|b| b.as_ref())
                    .ok_or(SignatureError::BodyNotBuffered)?,
            )
        } else {
            None
        };

        let request_time: i64 = params
            .timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp)?;
        let expiry = i64::try_from(self.expiry.as_secs()).unwrap_or(i64::MAX);
        let tolerance = i64::try_from(self.tolerance.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(request_time) > expiry || request_time.saturating_sub(now) > tolerance
        {
            debug!(request_time, now, "Signature timestamp outside window");
            return Err(SignatureError::Expired);
        }

        if let Some(nonce) = params.nonce.as_deref()
            && !self.ledger.check_and_record(nonce, now)
        {
            warn!(nonce, path = %ctx.path(), "Replayed nonce rejected");
            return Err(SignatureError::ReplayedNonce);
        }

        let input = SigningInput {
            method: ctx.method().as_str(),
            path: ctx.path(),
            params: params.business,
            timestamp: &params.timestamp,
            nonce: params.nonce.as_deref(),
            app_key: params.app_key.as_deref(),
            body,
        };
        let expected = compute_signature(self.algorithm, &canonical_string(&input), &self.secret)?;
        let provided = params.signature.trim().to_ascii_lowercase();

        if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    fn extract(&self, ctx: &RequestContext) -> Result<ExtractedParams, SignatureError> {
        let mut query: HashMap<String, String> = HashMap::new();
        let mut business = Vec::new();
        if let Some(raw) = ctx.query() {
            for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
                if self.names.is_signing_param(&key) {
                    query.entry(key.into_owned()).or_insert_with(|| value.into_owned());
                } else {
                    business.push((key.into_owned(), value.into_owned()));
                }
            }
        }

        let pick = |header: &str, name: &str| -> Option<String> {
            ctx.header(header)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .or_else(|| query.get(name).filter(|v| !v.is_empty()).cloned())
        };

        let signature = pick(SIGNATURE_HEADER, &self.names.signature);
        let timestamp = pick(TIMESTAMP_HEADER, &self.names.timestamp);
        let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
            return Err(SignatureError::MissingParams);
        };

        Ok(ExtractedParams {
            signature,
            timestamp,
            nonce: pick(NONCE_HEADER, &self.names.nonce),
            app_key: pick(APP_KEY_HEADER, &self.names.app_key),
            business,
        })
    }
}

/// Guard form of [`SignatureValidator::verify`].
pub struct SignatureGuard {
    validator: Arc<SignatureValidator>,
}

impl SignatureGuard {
    pub fn new(validator: Arc<SignatureValidator>) -> Self {
        Self { validator }
    }
}

impl Guard for SignatureGuard {
    fn name(&self) -> &'static str {
        "signature"
    }

    fn reads_body(&self) -> bool {
        self.validator.validate_body()
    }

    fn inspect(&self, ctx: &mut RequestContext) -> Verdict {
        match self.validator.verify(ctx) {
            Ok(()) => {
                debug!(path = %ctx.path(), "Signature verified");
                Verdict::Continue
            }
            Err(err) => {
                warn!(path = %ctx.path(), reason = %err, "Signature verification failed");
                Verdict::Reject(err.into())
            }
        }
    }
}
