mod bridge;
mod cli;
mod cluster;
mod config;
mod console;
mod error;
mod k8s;
mod locator;
mod model;
mod server;
mod status;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use cli::CliArgs;
use cluster::Orchestrator;
use config::BridgeConfig;
use k8s::KubeGateway;
use server::AppState;
use status::{StatusHub, WorkloadFeed};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    let config = Arc::new(BridgeConfig::resolve(&args)?);
    if let Some(path) = &config.source {
        info!(path = %path, "loaded bridge config file");
    }

    let gateway = KubeGateway::new(config.context.clone()).await?;
    info!(
        cluster = gateway.cluster(),
        context = gateway.context(),
        kubeconfig_namespace = gateway.default_namespace(),
        namespace = %config.namespace,
        workload = %config.workload,
        "connected to cluster"
    );
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(gateway);

    let hub = Arc::new(StatusHub::new(
        WorkloadFeed::new(
            orchestrator.clone(),
            config.kind,
            Some(config.namespace.clone()),
            &config.status,
        ),
        config.status.interval,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub_task = tokio::spawn(hub.clone().run(shutdown_rx));

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(listen = %config.listen, "serving console bridge");

    let app = server::router(AppState::new(orchestrator, config.clone(), hub));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    let _ = shutdown_tx.send(true);
    if let Err(error) = hub_task.await {
        warn!(error = %error, "status hub task ended abnormally");
    }
    info!("console bridge stopped");
    Ok(())
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
