//! Shared application state for Axum handlers and the security pipeline.
//!
//! Every security component is created once here, at startup, and shared by
//! reference. Nothing in the pipeline holds per-request state that outlives
//! the request except the limiter counters, the nonce ledger and the IP rules,
//! all of which live in this struct.
//!
//! # Structured Concurrency
//!
//! Housekeeping tasks (limiter sweeps, nonce purges) are managed using
//! `tokio_util::task::TaskTracker` and `CancellationToken`. Call `shutdown()`
//! to stop them and drain the audit queue before the process exits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::middleware::audit::AuditLogger;
use crate::middleware::ip::ClientIpResolver;
use crate::middleware::ip_filter::IpFilter;
use crate::middleware::rate_limit::RateLimiter;
use crate::middleware::signature::SignatureValidator;
use crate::middleware::token::{FailureThrottle, TokenAuthenticator};

/// How often the authentication failure counters are swept.
const FAILURE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state.
///
/// This struct is cloned for each request handler. All internal data
/// is wrapped in `Arc` for efficient sharing.
///
/// # Lifecycle
///
/// Background tasks are spawned when the state is created, so construction
/// must happen inside a Tokio runtime:
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;  // Stop sweepers, flush the audit trail
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Issues and verifies bearer tokens
    pub tokens: Arc<TokenAuthenticator>,
    /// Per-IP failed authentication budget (None = disabled)
    pub auth_failures: Option<Arc<FailureThrottle>>,
    /// Global per-client quota
    pub rate_limiter: Arc<RateLimiter>,
    /// Per-identity quota on authenticated routes (None = disabled)
    pub user_rate_limiter: Option<Arc<RateLimiter>>,
    /// Allow/deny rules, mutable at runtime
    pub ip_filter: Arc<IpFilter>,
    pub ip_resolver: Arc<ClientIpResolver>,
    pub signature: Arc<SignatureValidator>,
    /// Audit trail (None = `AUDIT_ENABLED=false`)
    pub audit: Option<Arc<AuditLogger>>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build every security component from `config` and start housekeeping.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if an IP rule cannot be parsed or the
    /// audit file cannot be opened.
    pub fn new(config: Config) -> AppResult<Self> {
        let ip_filter = IpFilter::new(&config.ip_filter)
            .map_err(|e| AppError::ConfigError(format!("IP filter: {e}")))?;
        let audit = if config.audit.enabled {
            Some(Arc::new(AuditLogger::new(&config.audit)?))
        } else {
            None
        };
        let user_rate_limiter = config.user_rate_limiting_enabled().then(|| {
            Arc::new(RateLimiter::new(
                config.rate_limit.algorithm,
                config.rate_limit.window,
                config.rate_limit.user_max_requests,
            ))
        });

        let state = Self {
            tokens: Arc::new(TokenAuthenticator::new(&config.token)),
            auth_failures: FailureThrottle::new(config.token.failure_limit_per_min).map(Arc::new),
            rate_limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            user_rate_limiter,
            ip_filter: Arc::new(ip_filter),
            ip_resolver: Arc::new(ClientIpResolver::new(&config.ip_filter)),
            signature: Arc::new(SignatureValidator::new(&config.signature)),
            audit,
            config: Arc::new(config),
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_limiter_sweep_task("global", Arc::clone(&state.rate_limiter));
        if let Some(limiter) = &state.user_rate_limiter {
            state.spawn_limiter_sweep_task("user", Arc::clone(limiter));
        }
        state.spawn_nonce_purge_task();
        if let Some(throttle) = &state.auth_failures {
            state.spawn_failure_sweep_task(Arc::clone(throttle));
        }

        Ok(state)
    }

    /// Periodically drop limiter keys whose window has passed.
    fn spawn_limiter_sweep_task(&self, label: &'static str, limiter: Arc<RateLimiter>) {
        let cancel = self.cancellation_token.clone();
        let period = limiter.sweep_interval();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!(limiter = label, "Rate limit sweeper received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        let tracked = limiter.tracked_keys();
                        metrics::set_rate_limit_keys(label, tracked);
                        trace!(limiter = label, removed, tracked, "Rate limit keys swept");
                    }
                }
            }
        });
    }

    /// Periodically forget nonces that can no longer be replayed.
    fn spawn_nonce_purge_task(&self) {
        let cancel = self.cancellation_token.clone();
        let validator = Arc::clone(&self.signature);
        let period = validator.purge_interval();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Nonce purge task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = validator.purge_nonces();
                        let remaining = validator.ledger().len();
                        metrics::set_nonce_ledger_entries(remaining);
                        trace!(removed, remaining, "Nonce ledger purged");
                    }
                }
            }
        });
    }

    fn spawn_failure_sweep_task(&self, throttle: Arc<FailureThrottle>) {
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(FAILURE_SWEEP_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        throttle.sweep();
                        trace!(tracked = throttle.tracked_keys(), "Auth failure counters swept");
                    }
                }
            }
        });
    }

    /// Gracefully shutdown background tasks and flush the audit trail.
    ///
    /// This method:
    /// 1. Signals all tasks to stop via cancellation token
    /// 2. Waits for all tasks to complete
    /// 3. Drains the audit queue and closes the audit file
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        if let Some(audit) = &self.audit {
            audit.shutdown().await;
        }

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
