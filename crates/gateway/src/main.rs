use std::sync::Arc;

use anyhow::Context;
use courier_gateway::app::{GatewayServices, build_app};
use courier_infra::{CourierConfig, Pipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = CourierConfig::from_env().context("invalid configuration")?;
    if config.secrets.app_secret.is_none() {
        tracing::warn!("META_APP_SECRET not set; inbound signatures are not verified");
    }

    let pipeline = Pipeline::connect(&config).await.context("failed to start pipeline")?;
    let workers = pipeline.spawn();
    let app = build_app(Arc::new(GatewayServices::from_pipeline(&pipeline)));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("server error")?;

    tracing::info!("draining workers");
    workers.shutdown().await;
    Ok(())
}
