//! Windowed request-rate limiting.
//!
//! # Algorithms
//!
//! - **Fixed window**: one counter and a window start per key. The counter
//!   resets on the first request after the window has elapsed. Cheap, but a
//!   client can land up to `2 × max` requests around a window boundary
//!   (`max` at the end of one window, `max` at the start of the next). This
//!   is accepted for abuse prevention, not for precise quota enforcement.
//! - **Sliding window (log)**: an ordered log of request instants per key.
//!   Exact: no trailing window of length `W` ever holds more than `max`
//!   allowed requests. Costs O(max) per check.
//!
//! Each limiter keeps its key map behind a single mutex. The periodic sweep
//! takes the same lock; both critical sections are O(1) or O(max).
//!
//! # Response Headers
//!
//! - `X-RateLimit-Limit`: Configured maximum per window
//! - `X-RateLimit-Remaining`: Requests left for this key
//! - `Retry-After`: Seconds until a request will be accepted (429 only)

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderValue;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::ip::{ClientIpResolver, UNKNOWN_IP};
use crate::config::RateLimitConfig;
use crate::context::RequestContext;
use crate::error::{AppError, RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER};
use crate::pipeline::{Guard, Verdict};

/// Smallest sweep period handed to the timer.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateAlgorithm {
    #[default]
    FixedWindow,
    SlidingWindow,
}

impl FromStr for RateAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" | "fixed_window" => Ok(Self::FixedWindow),
            "sliding" | "sliding_window" => Ok(Self::SlidingWindow),
            other => Err(format!(
                "unknown rate limit algorithm '{other}' (expected fixed_window or sliding_window)"
            )),
        }
    }
}

impl fmt::Display for RateAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedWindow => f.write_str("fixed_window"),
            Self::SlidingWindow => f.write_str("sliding_window"),
        }
    }
}

/// How a request is mapped to a limiter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateKey {
    /// `ip:<addr>`
    #[default]
    Ip,
    /// `user:<subject>` when authenticated, `ip:<addr>` otherwise.
    IdentityOrIp,
    /// `ip:<addr>:<path>`, a separate quota per endpoint.
    IpAndPath,
}

impl FromStr for RateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" => Ok(Self::Ip),
            "user" | "identity" => Ok(Self::IdentityOrIp),
            "ip_path" | "endpoint" => Ok(Self::IpAndPath),
            other => Err(format!(
                "unknown rate limit key '{other}' (expected ip, user or ip_path)"
            )),
        }
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => f.write_str("ip"),
            Self::IdentityOrIp => f.write_str("user"),
            Self::IpAndPath => f.write_str("ip_path"),
        }
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the key can be admitted again; zero when allowed.
    pub retry_after: Duration,
}

impl RateDecision {
    /// `Retry-After` value in whole seconds, never below one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

/// A keyed limiter over a time window.
pub trait WindowLimiter: Send + Sync {
    /// Record a request for `key` at `now` and decide whether it is allowed.
    fn check_at(&self, key: &str, now: Instant) -> RateDecision;

    /// Evict keys with no activity inside the window. Returns the number of
    /// evicted keys.
    fn sweep_at(&self, now: Instant) -> usize;

    fn tracked_keys(&self) -> usize;
}

// =============================================================================
// Fixed Window
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct FixedEntry {
    count: u32,
    window_start: Instant,
}

/// Counter-per-window limiter.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    window: Duration,
    max: u32,
    entries: Mutex<HashMap<String, FixedEntry>>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl WindowLimiter for FixedWindowLimiter {
    fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get_mut(key) else {
            entries.insert(
                key.to_string(),
                FixedEntry {
                    count: 1,
                    window_start: now,
                },
            );
            return allowed(self.max, 1);
        };

        let elapsed = now.saturating_duration_since(entry.window_start);
        if elapsed > self.window {
            entry.count = 1;
            entry.window_start = now;
            return allowed(self.max, 1);
        }

        if entry.count >= self.max {
            return RateDecision {
                allowed: false,
                limit: self.max,
                remaining: 0,
                retry_after: self.window.saturating_sub(elapsed),
            };
        }

        entry.count += 1;
        allowed(self.max, entry.count)
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.window_start) <= self.window);
        before - entries.len()
    }

    fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }
}

// =============================================================================
// Sliding Window
// =============================================================================

/// Timestamp-log limiter.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    window: Duration,
    max: u32,
    entries: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn evict_expired(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = log.front() {
            if now.saturating_duration_since(*oldest) > window {
                log.pop_front();
            } else {
                break;
            }
        }
    }
}

impl WindowLimiter for SlidingWindowLimiter {
    fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut entries = self.entries.lock();
        let log = entries.entry(key.to_string()).or_default();

        Self::evict_expired(log, now, self.window);

        let used = u32::try_from(log.len()).unwrap_or(u32::MAX);
        if used >= self.max {
            let retry_after = log
                .front()
                .map(|oldest| {
                    (*oldest + self.window)
                        .saturating_duration_since(now)
                        .saturating_add(Duration::from_millis(1))
                })
                .unwrap_or(self.window);
            return RateDecision {
                allowed: false,
                limit: self.max,
                remaining: 0,
                retry_after,
            };
        }

        log.push_back(now);
        allowed(self.max, used + 1)
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, log| {
            Self::evict_expired(log, now, self.window);
            !log.is_empty()
        });
        before - entries.len()
    }

    fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }
}

fn allowed(limit: u32, used: u32) -> RateDecision {
    RateDecision {
        allowed: true,
        limit,
        remaining: limit.saturating_sub(used),
        retry_after: Duration::ZERO,
    }
}

// =============================================================================
// Configured Limiter
// =============================================================================

/// The limiter selected by configuration.
pub struct RateLimiter {
    algorithm: RateAlgorithm,
    window: Duration,
    inner: Box<dyn WindowLimiter>,
}

impl RateLimiter {
    pub fn new(algorithm: RateAlgorithm, window: Duration, max_requests: u32) -> Self {
        let inner: Box<dyn WindowLimiter> = match algorithm {
            RateAlgorithm::FixedWindow => Box::new(FixedWindowLimiter::new(window, max_requests)),
            RateAlgorithm::SlidingWindow => {
                Box::new(SlidingWindowLimiter::new(window, max_requests))
            }
        };
        Self {
            algorithm,
            window,
            inner,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.algorithm, config.window, config.max_requests)
    }

    pub fn algorithm(&self) -> RateAlgorithm {
        self.algorithm
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.inner.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        self.inner.check_at(key, now)
    }

    pub fn sweep(&self) -> usize {
        self.inner.sweep_at(Instant::now())
    }

    pub fn tracked_keys(&self) -> usize {
        self.inner.tracked_keys()
    }

    /// Sweep period: the window for fixed windows, half of it for sliding.
    pub fn sweep_interval(&self) -> Duration {
        let period = match self.algorithm {
            RateAlgorithm::FixedWindow => self.window,
            RateAlgorithm::SlidingWindow => self.window / 2,
        };
        period.max(MIN_SWEEP_INTERVAL)
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("algorithm", &self.algorithm)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Guard
// =============================================================================

/// Rejects requests over quota with 429 and stages the informational
/// counters on every response.
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    key: RateKey,
    resolver: Arc<ClientIpResolver>,
}

impl RateLimitGuard {
    pub fn new(limiter: Arc<RateLimiter>, key: RateKey, resolver: Arc<ClientIpResolver>) -> Self {
        Self {
            limiter,
            key,
            resolver,
        }
    }

    fn key_for(&self, ctx: &RequestContext) -> String {
        let ip = self
            .resolver
            .client_ip(ctx)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_IP.to_string());

        match self.key {
            RateKey::Ip => format!("ip:{ip}"),
            RateKey::IdentityOrIp => match &ctx.identity {
                Some(claims) => format!("user:{}", claims.sub),
                None => format!("ip:{ip}"),
            },
            RateKey::IpAndPath => format!("ip:{ip}:{}", ctx.path()),
        }
    }
}

impl Guard for RateLimitGuard {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn inspect(&self, ctx: &mut RequestContext) -> Verdict {
        let key = self.key_for(ctx);
        let decision = self.limiter.check(&key);

        ctx.response_headers
            .insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(decision.limit));
        ctx.response_headers.insert(
            RATE_LIMIT_REMAINING_HEADER,
            HeaderValue::from(decision.remaining),
        );

        if decision.allowed {
            debug!(key = %key, remaining = decision.remaining, "Rate limit check passed");
            return Verdict::Continue;
        }

        let retry_after_secs = decision.retry_after_secs();
        warn!(
            key = %key,
            path = %ctx.path(),
            retry_after_secs,
            "Rate limit exceeded"
        );
        Verdict::Reject(AppError::RateLimited {
            retry_after_secs,
            limit: decision.limit,
        })
    }
}
