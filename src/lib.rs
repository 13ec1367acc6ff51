//! # Gatekeeper
//!
//! A security interceptor pipeline for Axum services:
//!
//! - **IP Admission**: allow/deny lists with CIDR blocks, mutable at runtime
//! - **Rate Limiting**: fixed or sliding windows keyed by IP, identity or endpoint
//! - **Audit Logging**: redacted, non-blocking request/response records
//! - **Token Authentication**: HS256 bearer tokens with role checks
//! - **Request Signing**: HMAC-SHA256 signatures with nonce replay protection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Global (Request ID → IP Admission → Rate Limit → Audit)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Per route (Bearer Token → Role | Signature)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, identity, admin, signed echo)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gatekeeper::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state.clone());
//!
//!     // Serve with `into_make_service_with_connect_info::<SocketAddr>()`,
//!     // then flush the audit trail:
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Guarding Your Own Routes
//!
//! ```rust,ignore
//! let pipeline = SecurityPipeline::new(state.clone());
//! let orders = pipeline.require_roles(Router::new().route("/orders", get(list)), &["ops"]);
//! let app = pipeline.wrap_global(Router::new().merge(orders)).with_state(state);
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use context::RequestContext;
pub use error::{AppError, AppResult};
pub use pipeline::{Guard, SecurityPipeline, Verdict};
pub use routes::build_router;
pub use state::AppState;
