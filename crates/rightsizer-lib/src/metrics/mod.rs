//! Usage metrics providers
//!
//! A [`MetricsProvider`] returns per-pod CPU (cores) and memory (bytes)
//! usage series for a time window ending now. Two backends are available:
//!
//! - [`PrometheusProvider`]: range queries against a Prometheus-compatible
//!   HTTP API, able to serve the full analysis window
//! - [`MetricsServerProvider`]: the cluster `metrics.k8s.io` API, which only
//!   knows current usage and so yields a single sample per call
//!
//! [`CachedMetricsProvider`] wraps either one with a TTL cache.

mod cache;
mod metrics_server;
mod prometheus;

pub use cache::CachedMetricsProvider;
pub use metrics_server::MetricsServerProvider;
pub use prometheus::{PrometheusAuth, PrometheusProvider};

use crate::error::{Error, Result};
use crate::models::{PodMetrics, WorkloadKind, WorkloadMetrics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Usage series for every pod of one workload
    async fn get_workload_metrics(
        &self,
        namespace: &str,
        workload_name: &str,
        workload_kind: WorkloadKind,
        window: Duration,
    ) -> Result<WorkloadMetrics>;

    /// Usage series for a single pod
    async fn get_pod_metrics(
        &self,
        namespace: &str,
        pod_name: &str,
        window: Duration,
    ) -> Result<PodMetrics>;

    /// Backend name for logs and health reporting
    fn name(&self) -> &'static str;
}

/// `(now - window, now)`
pub(crate) fn time_range(window: Duration) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let span = chrono::Duration::from_std(window)
        .map_err(|_| Error::Duration(format!("{:?}", window)))?;
    let end = Utc::now();
    Ok((end - span, end))
}
