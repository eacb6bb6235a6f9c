use std::sync::Arc;

use anyhow::Context;

use handoff_api::app::{self, AppServices};
use handoff_api::config::AppConfig;
use handoff_auth::Hs256TokenVerifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    handoff_observability::init();

    let config = AppConfig::from_env()?;
    tracing::info!(?config, "starting handoff");

    let services = Arc::new(AppServices::from_config(&config).await?);
    let verifier = Arc::new(Hs256TokenVerifier::new(config.jwt_secret.as_bytes()));

    let worker = services.worker().clone().spawn("handoff-worker");
    let reaper = services.spawn_reaper(config.reaper_interval);

    let app = app::build_app(services, verifier);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    reaper.abort();
    worker.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
