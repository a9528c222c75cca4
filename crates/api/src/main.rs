use std::sync::Arc;

use anyhow::Context;
use tokio::signal;

use ingestflow_infra::config::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ingestflow_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let addr = config.listen_addr;
    tracing::info!(
        environment = %config.env_name,
        failure_mode = %config.failure_mode,
        workers = config.worker_concurrency,
        "starting ingestflow"
    );

    let services = Arc::new(ingestflow_api::app::services::build_services(config).await?);
    services.start_workers();

    let app = ingestflow_api::app::build_app(services.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(stats) = services.shutdown_workers().await {
        tracing::info!(
            batches = stats.batches,
            acked = stats.messages_acked,
            nacked = stats.messages_nacked,
            "workers stopped"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown signal received");
}
