use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use super::api::{self, SharedState};

/// Runtime options for [`serve`].
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Permissive CORS for a locally served frontend.
    pub dev_mode: bool,
    /// How long in-flight analysis runs may finish after the listener closes.
    pub shutdown_grace: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            dev_mode: false,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Build the full application router: REST API plus WebSocket routes.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Serve on `listener` until `shutdown` resolves, then drain analysis runs.
pub async fn serve<F>(
    listener: TcpListener,
    state: SharedState,
    options: ServeOptions,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let runner = state.runner.clone();
    let mut app = build_router(state);
    if options.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, dev_mode = options.dev_mode, "FutureProof API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    info!(
        grace_secs = options.shutdown_grace.as_secs(),
        "listener closed, draining analysis runs"
    );
    runner.shutdown(options.shutdown_grace).await;
    info!("server shut down gracefully");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
