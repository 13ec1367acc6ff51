use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::log_json_from_env;
use gatekeeper::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Pick up LOG_FORMAT / RUST_LOG from .env before logging starts
    let _ = dotenvy::dotenv();
    init_tracing();

    info!("Starting gatekeeper v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if log_json_from_env() {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        ip_filter = %config.ip_filter.mode,
        rate_limit = %config.rate_limit.algorithm,
        signature = %config.signature.algorithm,
        audit = config.audit.enabled,
        "Configuration loaded"
    );
    if config.uses_default_secrets() {
        warn!("Development secrets in use; set TOKEN_SECRET and SIGNATURE_SECRET for production");
    }

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    let state = AppState::new(config.clone()).map_err(|e| {
        error!("Failed to initialize security components: {e}");
        exitcode::CONFIG
    })?;
    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET    /health                  - Health check");
    info!("  GET    /ping                    - Liveness check");
    info!("  GET    /api/v1/me               - Authenticated identity");
    info!("  POST   /api/v1/token/refresh    - Re-issue bearer token");
    info!("  GET    /api/v1/admin/ip-rules   - List IP rules (admin)");
    info!("  POST   /api/v1/admin/ip-rules   - Add IP rule (admin)");
    info!("  DELETE /api/v1/admin/ip-rules   - Remove IP rule (admin)");
    info!("  POST   /api/v1/signed/echo      - Signed request echo");

    // Peer addresses are needed for IP admission
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    result.map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("Server shutdown complete");
    Ok(())
}
