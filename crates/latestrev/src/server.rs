use std::net::SocketAddr;

use anyhow::{Context, Result};

use latestrev_service::config::Config;
use latestrev_service::coordinator::ReleaseCoordinator;
use latestrev_service::metric;

use crate::endpoints;

/// Builds the content source chain and serves it over HTTP until interrupted.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // creating the source chain fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("latestrev-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let coordinator =
        ReleaseCoordinator::from_config(&config).context("failed to create the content sources")?;
    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(socket)
            .await
            .with_context(|| format!("failed to bind to {socket}"))?;
        tracing::info!("Starting HTTP server on {}", socket);

        axum::serve(listener, endpoints::create_app(coordinator))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server failed")
    })?;

    tracing::info!("System shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
