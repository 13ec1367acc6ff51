//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with development
//! defaults. In production, configure via environment variables or a `.env`
//! file. The configuration is built once in `main` and handed by reference to
//! each component constructor; nothing reads it from a global.
//!
//! # Security Configuration
//!
//! - `TOKEN_SECRET` / `SIGNATURE_SECRET`: shared keys, at least 16 bytes. The
//!   defaults are for local development only.
//! - `TRUST_PROXY`: read the client address from `PROXY_HEADER`. Only enable
//!   behind a proxy that overwrites that header; restrict further with
//!   `TRUSTED_PROXIES`.
//! - `IP_FILTER_MODE`: `deny_list` (default allow) or `allow_list` (default deny).
//!
//! # Limits
//!
//! - `RATE_LIMIT_MAX_REQUESTS` per `RATE_LIMIT_WINDOW_SECS` (default: 60 per 60s)
//! - `USER_RATE_LIMIT_MAX_REQUESTS`: per-identity quota on authenticated routes (0 = off)
//! - `AUTH_FAILURE_LIMIT_PER_MIN`: failed token attempts per client IP (0 = off)

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::middleware::audit::AuditOutput;
use crate::middleware::ip_filter::{FilterMode, IpRule};
use crate::middleware::rate_limit::{RateAlgorithm, RateKey};
use crate::middleware::signature::SignatureAlgorithm;

/// Minimum length of the token and signature secrets.
pub const MIN_SECRET_LEN: usize = 16;

const DEFAULT_TOKEN_SECRET: &str = "dev-token-secret-change-in-production";
const DEFAULT_SIGNATURE_SECRET: &str = "dev-signature-secret-change-in-production";

/// Bearer token settings.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// HS256 key (`TOKEN_SECRET`)
    pub secret: String,
    /// Lifetime of issued tokens (`TOKEN_TTL_SECS`, default: 24h)
    pub ttl: Duration,
    /// `iss` claim written and required (`TOKEN_ISSUER`)
    pub issuer: String,
    /// Failed attempts per minute per client IP before 429 (`AUTH_FAILURE_LIMIT_PER_MIN`, 0 = off)
    pub failure_limit_per_min: u32,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: DEFAULT_TOKEN_SECRET.to_string(),
            ttl: Duration::from_secs(24 * 60 * 60),
            issuer: "gatekeeper".to_string(),
            failure_limit_per_min: 20,
        }
    }
}

/// Request quota settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub algorithm: RateAlgorithm,
    pub window: Duration,
    /// Requests allowed per window per key
    pub max_requests: u32,
    /// How the global limiter keys clients
    pub key: RateKey,
    /// Per-identity quota on authenticated routes (0 = disabled)
    pub user_max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateAlgorithm::FixedWindow,
            window: Duration::from_secs(60),
            max_requests: 60,
            key: RateKey::Ip,
            user_max_requests: 0,
        }
    }
}

/// Request signing settings.
#[derive(Debug, Clone)]
pub struct SignatureConfig {
    pub secret: String,
    pub algorithm: SignatureAlgorithm,
    /// How old a signed request may be (default: 5 min)
    pub expiry: Duration,
    /// How far in the future a signed request may be dated (default: 2 min)
    pub tolerance: Duration,
    /// Include the raw body in the canonical string
    pub validate_body: bool,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            secret: DEFAULT_SIGNATURE_SECRET.to_string(),
            algorithm: SignatureAlgorithm::HmacSha256,
            expiry: Duration::from_secs(5 * 60),
            tolerance: Duration::from_secs(2 * 60),
            validate_body: true,
        }
    }
}

/// IP admission settings.
#[derive(Debug, Clone)]
pub struct IpFilterConfig {
    pub mode: FilterMode,
    /// Exact addresses or CIDR blocks (`IP_ALLOW_LIST`)
    pub allow: Vec<String>,
    /// Exact addresses or CIDR blocks (`IP_DENY_LIST`)
    pub deny: Vec<String>,
    /// In allow-list mode, also admit private and loopback ranges
    pub allow_private: bool,
    /// Read the client address from `proxy_header`
    pub trust_proxy: bool,
    pub proxy_header: String,
    /// Peers allowed to set `proxy_header`; empty trusts every peer
    ///
    /// Common values:
    /// - Private networks: "10.0.0.0/8,172.16.0.0/12,192.168.0.0/16"
    /// - Docker: "172.17.0.0/16" (default bridge network)
    /// - Localhost: "127.0.0.0/8,::1/128"
    pub trusted_proxies: Vec<String>,
}

impl Default for IpFilterConfig {
    fn default() -> Self {
        Self {
            mode: FilterMode::DenyList,
            allow: Vec::new(),
            deny: Vec::new(),
            allow_private: true,
            trust_proxy: false,
            proxy_header: "X-Forwarded-For".to_string(),
            trusted_proxies: Vec::new(),
        }
    }
}

/// Audit trail settings.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub output: AuditOutput,
    pub file_path: PathBuf,
    pub log_request_body: bool,
    pub log_response_body: bool,
    /// Bytes of request body kept per record
    pub max_request_body: usize,
    /// Bytes of response body kept per record
    pub max_response_body: usize,
    /// JSON keys masked in logged bodies (case-insensitive)
    pub sensitive_fields: Vec<String>,
    /// Paths never audited
    pub exclude_paths: Vec<String>,
    pub queue_capacity: usize,
    /// Write through a background queue instead of on the request task
    pub async_delivery: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output: AuditOutput::Both,
            file_path: PathBuf::from("logs/audit.log"),
            log_request_body: true,
            log_response_body: true,
            max_request_body: 4096,
            max_response_body: 4096,
            sensitive_fields: ["password", "token", "secret", "key", "authorization"]
                .into_iter()
                .map(String::from)
                .collect(),
            exclude_paths: ["/ping", "/health", "/metrics"]
                .into_iter()
                .map(String::from)
                .collect(),
            queue_capacity: 1000,
            async_delivery: true,
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Maximum request body size in bytes (default: 1MB)
    /// Bodies are buffered for auditing and signing, so this bounds memory per request
    pub max_request_body_size: usize,

    // =========================================================================
    // Security Components
    // =========================================================================
    pub token: TokenConfig,
    pub rate_limit: RateLimitConfig,
    pub signature: SignatureConfig,
    pub ip_filter: IpFilterConfig,
    pub audit: AuditConfig,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Emit JSON log lines (`LOG_FORMAT=json`)
    pub log_json: bool,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value cannot be parsed or the
    /// resulting configuration is invalid.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or(defaults.host),
            port: Self::parse_env("PORT", defaults.port)?,
            max_request_body_size: Self::parse_env(
                "MAX_REQUEST_BODY_SIZE",
                defaults.max_request_body_size,
            )?,

            token: TokenConfig {
                secret: env::var("TOKEN_SECRET").unwrap_or(defaults.token.secret),
                ttl: Duration::from_secs(Self::parse_env(
                    "TOKEN_TTL_SECS",
                    defaults.token.ttl.as_secs(),
                )?),
                issuer: env::var("TOKEN_ISSUER").unwrap_or(defaults.token.issuer),
                failure_limit_per_min: Self::parse_env(
                    "AUTH_FAILURE_LIMIT_PER_MIN",
                    defaults.token.failure_limit_per_min,
                )?,
            },

            rate_limit: RateLimitConfig {
                algorithm: Self::parse_env("RATE_LIMIT_ALGORITHM", defaults.rate_limit.algorithm)?,
                window: Duration::from_secs(Self::parse_env(
                    "RATE_LIMIT_WINDOW_SECS",
                    defaults.rate_limit.window.as_secs(),
                )?),
                max_requests: Self::parse_env(
                    "RATE_LIMIT_MAX_REQUESTS",
                    defaults.rate_limit.max_requests,
                )?,
                key: Self::parse_env("RATE_LIMIT_KEY", defaults.rate_limit.key)?,
                user_max_requests: Self::parse_env(
                    "USER_RATE_LIMIT_MAX_REQUESTS",
                    defaults.rate_limit.user_max_requests,
                )?,
            },

            signature: SignatureConfig {
                secret: env::var("SIGNATURE_SECRET").unwrap_or(defaults.signature.secret),
                algorithm: Self::parse_env("SIGNATURE_ALGORITHM", defaults.signature.algorithm)?,
                expiry: Duration::from_secs(Self::parse_env(
                    "SIGNATURE_EXPIRY_SECS",
                    defaults.signature.expiry.as_secs(),
                )?),
                tolerance: Duration::from_secs(Self::parse_env(
                    "SIGNATURE_TOLERANCE_SECS",
                    defaults.signature.tolerance.as_secs(),
                )?),
                validate_body: Self::parse_env(
                    "SIGNATURE_VALIDATE_BODY",
                    defaults.signature.validate_body,
                )?,
            },

            ip_filter: IpFilterConfig {
                mode: Self::parse_env("IP_FILTER_MODE", defaults.ip_filter.mode)?,
                allow: Self::parse_list("IP_ALLOW_LIST").unwrap_or(defaults.ip_filter.allow),
                deny: Self::parse_list("IP_DENY_LIST").unwrap_or(defaults.ip_filter.deny),
                allow_private: Self::parse_env(
                    "IP_ALLOW_PRIVATE",
                    defaults.ip_filter.allow_private,
                )?,
                trust_proxy: Self::parse_env("TRUST_PROXY", defaults.ip_filter.trust_proxy)?,
                proxy_header: env::var("PROXY_HEADER")
                    .ok()
                    .filter(|h| !h.trim().is_empty())
                    .unwrap_or(defaults.ip_filter.proxy_header),
                trusted_proxies: Self::parse_list("TRUSTED_PROXIES")
                    .unwrap_or(defaults.ip_filter.trusted_proxies),
            },

            audit: AuditConfig {
                enabled: Self::parse_env("AUDIT_ENABLED", defaults.audit.enabled)?,
                output: Self::parse_env("AUDIT_OUTPUT", defaults.audit.output)?,
                file_path: env::var("AUDIT_FILE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.audit.file_path),
                log_request_body: Self::parse_env(
                    "AUDIT_LOG_REQUEST_BODY",
                    defaults.audit.log_request_body,
                )?,
                log_response_body: Self::parse_env(
                    "AUDIT_LOG_RESPONSE_BODY",
                    defaults.audit.log_response_body,
                )?,
                max_request_body: Self::parse_env(
                    "AUDIT_MAX_REQUEST_BODY",
                    defaults.audit.max_request_body,
                )?,
                max_response_body: Self::parse_env(
                    "AUDIT_MAX_RESPONSE_BODY",
                    defaults.audit.max_response_body,
                )?,
                sensitive_fields: Self::parse_list("AUDIT_SENSITIVE_FIELDS")
                    .unwrap_or(defaults.audit.sensitive_fields),
                exclude_paths: Self::parse_list("AUDIT_EXCLUDE_PATHS")
                    .map(|paths| paths.into_iter().filter(|p| p.starts_with('/')).collect())
                    .unwrap_or(defaults.audit.exclude_paths),
                queue_capacity: Self::parse_env(
                    "AUDIT_QUEUE_CAPACITY",
                    defaults.audit.queue_capacity,
                )?,
                async_delivery: Self::parse_env("AUDIT_ASYNC", defaults.audit.async_delivery)?,
            },

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: log_json_from_env(),
            metrics_port: Self::parse_env("METRICS_PORT", defaults.metrics_port)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` naming the first offending variable.
    pub fn validate(&self) -> AppResult<()> {
        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.token.secret.len() < MIN_SECRET_LEN {
            return Err(AppError::ConfigError(format!(
                "TOKEN_SECRET must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.token.ttl.is_zero() {
            return Err(AppError::ConfigError(
                "TOKEN_TTL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit.window.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0".to_string(),
            ));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_MAX_REQUESTS must be greater than 0".to_string(),
            ));
        }

        if self.signature.secret.len() < MIN_SECRET_LEN {
            return Err(AppError::ConfigError(format!(
                "SIGNATURE_SECRET must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.signature.expiry.is_zero() {
            return Err(AppError::ConfigError(
                "SIGNATURE_EXPIRY_SECS must be greater than 0".to_string(),
            ));
        }

        for (name, rules) in [
            ("IP_ALLOW_LIST", &self.ip_filter.allow),
            ("IP_DENY_LIST", &self.ip_filter.deny),
        ] {
            for rule in rules {
                IpRule::from_str(rule)
                    .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}")))?;
            }
        }

        if self.audit.max_request_body == 0 || self.audit.max_response_body == 0 {
            return Err(AppError::ConfigError(
                "AUDIT_MAX_REQUEST_BODY and AUDIT_MAX_RESPONSE_BODY must be greater than 0"
                    .to_string(),
            ));
        }
        if self.audit.queue_capacity == 0 {
            return Err(AppError::ConfigError(
                "AUDIT_QUEUE_CAPACITY must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether a per-identity quota is configured.
    pub fn user_rate_limiting_enabled(&self) -> bool {
        self.rate_limit.user_max_requests > 0
    }

    /// Whether the development secrets are still in use.
    pub fn uses_default_secrets(&self) -> bool {
        self.token.secret == DEFAULT_TOKEN_SECRET
            || self.signature.secret == DEFAULT_SIGNATURE_SECRET
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a comma-separated list. `None` when the variable is unset.
    fn parse_list(name: &str) -> Option<Vec<String>> {
        env::var(name).ok().map(|value| split_list(&value))
    }
}

/// Whether `LOG_FORMAT=json` is set.
///
/// Logging is initialized before the rest of the configuration is loaded, so
/// this is readable on its own.
pub fn log_json_from_env() -> bool {
    env::var("LOG_FORMAT").is_ok_and(|f| f.trim().eq_ignore_ascii_case("json"))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_request_body_size: 1024 * 1024, // 1MB
            token: TokenConfig::default(),
            rate_limit: RateLimitConfig::default(),
            signature: SignatureConfig::default(),
            ip_filter: IpFilterConfig::default(),
            audit: AuditConfig::default(),
            log_level: "info".to_string(),
            log_json: false,
            metrics_port: 9090,
        }
    }
}
