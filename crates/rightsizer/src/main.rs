//! Pod Rightsizer - Kubernetes resource right-sizing controller
//!
//! Watches RightSizingPolicy objects, sizes the pods they target from
//! observed usage and writes the recommendations back to their workloads.

use anyhow::{Context as _, Result};
use rightsizer_lib::{
    controller::{self, Context, KubeCluster},
    cost::CostCalculator,
    health::{components, HealthRegistry},
    metrics::{CachedMetricsProvider, MetricsProvider, MetricsServerProvider, PrometheusProvider},
    observability::StructuredLogger,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting pod-rightsizer");

    let config = config::ControllerConfig::load()?;
    let cloud_provider = config.cloud_provider()?;
    info!(
        api_port = config.api_port,
        concurrency = config.concurrency,
        cloud_provider = %cloud_provider,
        "Controller configured"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let backend: Arc<dyn MetricsProvider> = match &config.prometheus_url {
        Some(url) => Arc::new(
            PrometheusProvider::new(
                url,
                config.prometheus_auth(),
                Duration::from_secs(config.prometheus_timeout_secs),
                Duration::from_secs(config.metrics_step_secs),
            )
            .context("invalid Prometheus configuration")?,
        ),
        None => Arc::new(MetricsServerProvider::new(client.clone())),
    };
    let backend_name = backend.name();

    let metrics_provider: Arc<dyn MetricsProvider> = match config.metrics_cache_ttl() {
        Some(ttl) => {
            let cached = Arc::new(CachedMetricsProvider::new(backend, ttl));
            tokio::spawn(purge_cache(cached.clone(), ttl));
            cached
        }
        None => backend,
    };

    let health_registry = HealthRegistry::new();
    health_registry.register(components::CONTROLLER).await;
    health_registry.register(components::METRICS_PROVIDER).await;
    health_registry.register(components::KUBE_API).await;

    let instance = std::env::var("POD_NAME").unwrap_or_else(|_| "pod-rightsizer".to_string());
    let logger = StructuredLogger::new(instance);
    logger.log_startup(CONTROLLER_VERSION, backend_name);

    let ctx = Arc::new(Context::new(
        Arc::new(KubeCluster::new(client.clone())),
        metrics_provider,
        Arc::new(CostCalculator::for_provider(cloud_provider)),
        health_registry.clone(),
        logger.clone(),
        config.controller_settings(),
    ));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        ctx.metrics.clone(),
    ));
    let (api_stop_tx, api_stop_rx) = oneshot::channel::<()>();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = api_stop_rx.await;
    }));

    // Signal listener feeds the controller's graceful shutdown
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<&'static str>();
    tokio::spawn(async move {
        let reason = shutdown_signal().await;
        let _ = shutdown_tx.send(reason);
    });
    let (reason_tx, reason_rx) = oneshot::channel::<&'static str>();
    let shutdown = async move {
        let reason = shutdown_rx.await.unwrap_or("signal listener dropped");
        let _ = reason_tx.send(reason);
    };

    health_registry.set_initialized(true).await;

    controller::run(client, ctx, shutdown).await;

    let reason = match reason_rx.await {
        Ok(reason) => reason,
        Err(_) => {
            warn!("Controller stream ended without a shutdown signal");
            health_registry
                .set_unhealthy(components::CONTROLLER, "controller stream ended")
                .await;
            "controller stream ended"
        }
    };
    logger.log_shutdown(reason);

    let _ = api_stop_tx.send(());
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    Ok(())
}

async fn purge_cache(cache: Arc<CachedMetricsProvider>, ttl: Duration) {
    let mut interval = tokio::time::interval(ttl);
    loop {
        interval.tick().await;
        cache.purge_expired();
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT received";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT received",
        _ = term.recv() => "SIGTERM received",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT received"
}
