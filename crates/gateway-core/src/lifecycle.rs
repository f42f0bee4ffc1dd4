//! Startup sequencing and graceful shutdown (spec §6.5).
//!
//! Mirrors the `axum::serve(...).with_graceful_shutdown(...)` pattern used
//! throughout this codebase's other services, extended with the
//! second-signal-forces-immediate-exit behaviour: a first SIGINT/SIGTERM
//! starts a bounded drain, a second one within `FORCE_EXIT_WINDOW` of the
//! first terminates immediately.

use crate::errors::GatewayError;
use crate::http::{health_router, ws_router, AppState};
use std::time::Duration;
use tracing::info;

const FORCE_EXIT_WINDOW: Duration = Duration::from_secs(2);

/// Bind both listeners, then run until a shutdown signal is observed and
/// the drain completes (or the drain timeout elapses).
pub async fn run(state: AppState) -> Result<(), GatewayError> {
    let ws_addr = format!("{}:{}", state.config.ws_host, state.config.ws_port);
    let ws_listener = tokio::net::TcpListener::bind(&ws_addr)
        .await
        .map_err(|source| GatewayError::Bind { address: ws_addr.clone(), source })?;
    info!(addr = %ws_addr, "websocket listener bound");

    let health_listener = if state.config.health_check_enabled {
        let health_addr = format!("{}:{}", state.config.ws_host, state.config.health_check_port);
        let listener = tokio::net::TcpListener::bind(&health_addr)
            .await
            .map_err(|source| GatewayError::Bind { address: health_addr.clone(), source })?;
        info!(addr = %health_addr, "health listener bound");
        Some(listener)
    } else {
        None
    };

    let drain_timeout = state.config.drain_timeout;
    let session_manager = state.session_manager.clone();

    let ws_server = axum::serve(ws_listener, ws_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal(drain_timeout, session_manager.clone()));

    let health_server = health_listener.map(|listener| {
        axum::serve(listener, health_router(state.clone())).with_graceful_shutdown(shutdown_signal(drain_timeout, session_manager.clone()))
    });

    match health_server {
        Some(health_server) => {
            let (ws_result, health_result) = tokio::join!(ws_server, health_server);
            ws_result.expect("websocket server error");
            health_result.expect("health server error");
        }
        None => {
            ws_server.await.expect("websocket server error");
        }
    }

    info!("gateway shut down gracefully");
    Ok(())
}

/// Waits for a first SIGINT/SIGTERM, begins draining (stops accepting new
/// upstream work and tells the session manager to wind down), and races
/// the drain against `drain_timeout` and a second signal.
async fn shutdown_signal(drain_timeout: Duration, session_manager: std::sync::Arc<crate::session_manager::SessionManager>) {
    wait_for_signal().await;
    info!("shutdown signal received, draining");
    session_manager.begin_shutdown();

    tokio::select! {
        () = tokio::time::sleep(FORCE_EXIT_WINDOW) => {}
        () = wait_for_signal() => {
            info!("second shutdown signal received within the force-exit window, shutting down immediately");
            return;
        }
    }

    let remaining = drain_timeout.saturating_sub(FORCE_EXIT_WINDOW);
    tokio::time::sleep(remaining).await;
    info!("drain timeout elapsed, forcing shutdown");
}

async fn wait_for_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
