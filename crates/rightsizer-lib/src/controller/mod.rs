//! Reconciliation controller for RightSizingPolicy objects
//!
//! Each pass fetches a policy, decides whether analysis is due, discovers
//! and groups the targeted pods, sizes every workload through the metrics
//! provider and the recommendation engine, persists the result in status
//! and, outside dry-run, writes the recommended resources back to the
//! owning workloads.
//!
//! Distinct policies are reconciled concurrently up to a configured limit;
//! passes over the same policy are serialized by the runtime's work queue.

mod apply;
mod cluster;
mod discovery;
mod reconcile;
mod schedule;
mod status;
mod watch;
mod workload;

#[cfg(test)]
mod tests;

pub use apply::{container_targets, merge_resources, needs_update};
pub use cluster::{ClusterApi, KubeCluster};
pub use discovery::{discover, is_candidate, target_namespaces, workload_kind_of, WorkloadGroups};
pub use reconcile::{reconcile_policy, ReconcileOutcome, REASON_COMPLETED, REASON_RECONCILE_ERROR};
pub use schedule::{analysis_interval, due_in, metrics_window, requeue_interval};
pub use status::write_status;
pub use watch::{matching_policies, target_matches, EventMapper, ResourceChangeFilter};
pub use workload::Workload;

use crate::cost::{CostCalculator, CostEstimator};
use crate::crd::RightSizingPolicy;
use crate::engine::RecommendationEngine;
use crate::error::Error;
use crate::health::HealthRegistry;
use crate::metrics::MetricsProvider;
use crate::observability::{ControllerMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Policies reconciled at the same time
    pub concurrency: u16,
    /// Delay before a failed pass is retried
    pub error_requeue: Duration,
    /// Refetch-and-retry attempts on write conflicts
    pub status_write_retries: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            error_requeue: Duration::from_secs(300),
            status_write_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureMark {
    generation: Option<i64>,
    at: DateTime<Utc>,
}

/// Shared state handed to every reconcile pass
pub struct Context {
    pub cluster: Arc<dyn ClusterApi>,
    pub metrics_provider: Arc<dyn MetricsProvider>,
    pub engine: RecommendationEngine,
    pub cost: Arc<CostCalculator>,
    pub health: HealthRegistry,
    pub metrics: ControllerMetrics,
    pub logger: StructuredLogger,
    pub settings: ControllerSettings,
    failures: DashMap<String, FailureMark>,
}

impl Context {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        metrics_provider: Arc<dyn MetricsProvider>,
        cost: Arc<CostCalculator>,
        health: HealthRegistry,
        logger: StructuredLogger,
        settings: ControllerSettings,
    ) -> Self {
        let estimator: Arc<dyn CostEstimator> = cost.clone();
        Self {
            cluster,
            metrics_provider,
            engine: RecommendationEngine::new(estimator),
            cost,
            health,
            metrics: ControllerMetrics::new(),
            logger,
            settings,
            failures: DashMap::new(),
        }
    }

    /// Time left before a policy that failed at this generation may run again
    fn error_backoff_remaining(
        &self,
        key: &str,
        generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let mark = *self.failures.get(key)?;
        if mark.generation != generation {
            return None;
        }
        let elapsed = (now - mark.at).to_std().unwrap_or(Duration::ZERO);
        self.settings
            .error_requeue
            .checked_sub(elapsed)
            .filter(|d| !d.is_zero())
    }

    fn record_failure(&self, key: &str, generation: Option<i64>, at: DateTime<Utc>) {
        self.failures
            .insert(key.to_string(), FailureMark { generation, at });
    }

    fn clear_failure(&self, key: &str) {
        self.failures.remove(key);
    }
}

async fn reconcile(policy: Arc<RightSizingPolicy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let started = Instant::now();
    let namespace = policy.namespace().unwrap_or_default();
    let result = reconcile_policy(&ctx, &namespace, &policy.name_any(), Utc::now()).await;
    ctx.metrics.observe_reconcile(started.elapsed());

    let outcome = result?;
    Ok(match outcome.requeue_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

fn error_policy(policy: Arc<RightSizingPolicy>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.metrics.inc_reconcile_errors(error.reason());
    warn!(
        policy = %policy.key(),
        reason = error.reason(),
        error = %error,
        requeue_secs = ctx.settings.error_requeue.as_secs(),
        "Reconcile failed"
    );
    Action::requeue(ctx.settings.error_requeue)
}

/// Run the controller until `shutdown` resolves
pub async fn run<F>(client: Client, ctx: Arc<Context>, shutdown: F)
where
    F: Future<Output = ()> + Send + Sync + 'static,
{
    let policies: Api<RightSizingPolicy> = Api::all(client.clone());

    // Namespace labels for namespaceSelector matching on events
    let (ns_reader, ns_writer) = reflector::store::<Namespace>();
    let ns_watch = reflector(
        ns_writer,
        watcher(Api::<Namespace>::all(client.clone()), watcher::Config::default()),
    )
    .default_backoff()
    .touched_objects()
    .for_each(|_| futures::future::ready(()));
    tokio::spawn(ns_watch);

    let controller = Controller::new(policies, watcher::Config::default());
    let mapper = EventMapper::new(controller.store(), ns_reader);

    let pod_mapper = mapper.clone();
    let deployment_mapper = mapper.clone();
    let statefulset_mapper = mapper.clone();
    let daemonset_mapper = mapper;

    info!(
        concurrency = ctx.settings.concurrency,
        "Starting RightSizingPolicy controller"
    );

    controller
        .watches(
            Api::<Pod>::all(client.clone()),
            watcher::Config::default(),
            move |pod| pod_mapper.pod_to_policies(pod),
        )
        .watches(
            Api::<Deployment>::all(client.clone()),
            watcher::Config::default(),
            move |d| deployment_mapper.workload_to_policies(Workload::Deployment(d)),
        )
        .watches(
            Api::<StatefulSet>::all(client.clone()),
            watcher::Config::default(),
            move |s| statefulset_mapper.workload_to_policies(Workload::StatefulSet(s)),
        )
        .watches(
            Api::<DaemonSet>::all(client),
            watcher::Config::default(),
            move |d| daemonset_mapper.workload_to_policies(Workload::DaemonSet(d)),
        )
        .with_config(controller::Config::default().concurrency(ctx.settings.concurrency))
        .graceful_shutdown_on(shutdown)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(policy = %obj.name, "Reconciled"),
                Err(e) => debug!(error = %e, "Reconcile dispatch error"),
            }
        })
        .await;
}
