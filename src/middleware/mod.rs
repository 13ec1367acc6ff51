//! Security guards and the layers that carry them.
//!
//! - **IP Admission**: allow/deny rules with CIDR support ([`ip_filter`])
//! - **Rate Limiting**: fixed or sliding windows per client key ([`rate_limit`])
//! - **Audit**: redacted request/response records ([`audit`])
//! - **Bearer Tokens**: HS256 verification and role checks ([`token`])
//! - **Request Signing**: HMAC signatures with nonce replay protection ([`signature`])
//! - **Request ID**: generation and propagation ([`request_id`])
//!
//! # Order
//!
//! ```text
//! Request → Request ID → IP Admission → Rate Limit → Audit → Token/Role | Signature → Handler
//!                            ↓              ↓                    ↓            ↓
//!                         403 Forbidden  429 Too Many      401/403      400/401
//! ```
//!
//! Client addresses come from [`ip::ClientIpResolver`]; forwarded headers are
//! only honoured when proxy trust is enabled.

pub mod audit;
pub mod ip;
pub mod ip_filter;
pub mod rate_limit;
pub mod request_id;
pub mod signature;
pub mod token;

pub use audit::{AuditLayer, AuditLogger, AuditOutput, AuditRecord};
pub use ip::{CidrRange, ClientIpResolver, TrustedProxyConfig, UNKNOWN_IP};
pub use ip_filter::{FilterMode, IpAdmission, IpFilter, IpRule, RuleList};
pub use rate_limit::{RateAlgorithm, RateDecision, RateKey, RateLimitGuard, RateLimiter};
pub use request_id::{REQUEST_ID_HEADER, RequestId, RequestIdLayer};
pub use signature::{
    NONCE_HEADER, SIGNATURE_HEADER, SignatureAlgorithm, SignatureError, SignatureGuard,
    SignatureValidator, TIMESTAMP_HEADER,
};
pub use token::{AuthError, BearerAuth, Claims, RequireRole, TokenAuthenticator};
