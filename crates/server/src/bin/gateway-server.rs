//! Gateway entry point: load configuration, build the dependency graph,
//! bind the listener, and serve until a shutdown signal arrives.
//!
//! Exit codes: `0` clean shutdown, `1` fatal startup error, `2` port
//! bind failure.

use std::process::ExitCode;
use std::sync::Arc;

use gateway_server::{GatewayConfig, GatewayState};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = gateway_log::init() {
        eprintln!("failed to initialise logging: {e}");
        return ExitCode::from(1);
    }

    let config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let port = config.port;
    let state = match GatewayState::build(config).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!(error = %e, "failed to initialise gateway state");
            return ExitCode::from(1);
        }
    };

    let app = gateway_server::router(state.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind listen address");
            return ExitCode::from(2);
        }
    };

    info!(%addr, "gateway listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    state.shutdown();

    match result {
        Ok(()) => {
            info!("gateway shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server exited with an error");
            ExitCode::from(1)
        }
    }
}

/// Resolves on SIGINT (Ctrl-C) or, on Unix, SIGTERM — whichever
/// arrives first.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
