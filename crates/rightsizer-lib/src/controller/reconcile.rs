//! One reconcile pass over a single policy

use super::status::write_status;
use super::{apply, discovery, schedule, Context};
use crate::crd::{Phase, PodRecommendation, RightSizingPolicy, RightSizingPolicySpec};
use crate::error::{Error, Result};
use crate::health::components;
use crate::models::WorkloadRef;
use crate::quantity;
use crate::validation;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Reason recorded on the Ready condition after a failed pass
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub const REASON_COMPLETED: &str = "Completed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Delay before the policy should be looked at again
    pub requeue_after: Option<Duration>,
    /// Whether the pass analysed the target (false for skips and deletions)
    pub analyzed: bool,
}

impl ReconcileOutcome {
    fn deleted() -> Self {
        Self {
            requeue_after: None,
            analyzed: false,
        }
    }

    fn skipped(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
            analyzed: false,
        }
    }

    fn analyzed(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
            analyzed: true,
        }
    }
}

/// Run one pass for the policy `namespace/name` as of `now`
pub async fn reconcile_policy(
    ctx: &Context,
    namespace: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome> {
    let key = format!("{}/{}", namespace, name);

    let fetched = ctx.cluster.get_policy(namespace, name).await;
    ctx.health.record(components::KUBE_API, &fetched).await;
    let Some(mut policy) = fetched? else {
        debug!(policy = %key, "Policy not found, assuming deleted");
        ctx.clear_failure(&key);
        ctx.metrics.remove_policy(&key);
        return Ok(ReconcileOutcome::deleted());
    };

    let generation = policy.metadata.generation;
    ctx.logger.log_reconcile_started(&key, generation);

    if let Some(remaining) = ctx.error_backoff_remaining(&key, generation, now) {
        ctx.logger.log_analysis_skipped(&key, remaining);
        return Ok(ReconcileOutcome::skipped(remaining));
    }

    let spec = policy.spec.clone();
    if let Some(remaining) = schedule::due_in(
        policy.status.as_ref(),
        generation,
        &spec.analysis_window,
        now,
    ) {
        ctx.logger.log_analysis_skipped(&key, remaining);
        let requeue = remaining.min(schedule::requeue_interval(&spec.analysis_window));
        return Ok(ReconcileOutcome::skipped(requeue));
    }

    match run_pass(ctx, &mut policy, &spec, &key, now).await {
        Ok(outcome) => {
            ctx.clear_failure(&key);
            Ok(outcome)
        }
        Err(e) if e.is_not_found() => {
            debug!(policy = %key, "Policy deleted during pass");
            ctx.clear_failure(&key);
            Ok(ReconcileOutcome::deleted())
        }
        Err(e) => {
            ctx.record_failure(&key, generation, now);
            ctx.logger.log_reconcile_failed(&key, e.reason(), &e.to_string());
            mark_error(ctx, &mut policy, &e, now).await;
            Err(e)
        }
    }
}

async fn run_pass(
    ctx: &Context,
    policy: &mut RightSizingPolicy,
    spec: &RightSizingPolicySpec,
    key: &str,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome> {
    validation::validate(spec)?;
    let generation = policy.metadata.generation;

    transition(ctx, policy, Phase::Analyzing, "Starting resource analysis").await?;

    let discovered = discovery::discover(ctx.cluster.as_ref(), &spec.target).await;
    ctx.health.record(components::KUBE_API, &discovered).await;
    let groups = discovered?;

    let targeted: usize = groups.values().map(Vec::len).sum();
    ctx.metrics.set_targeted_pods(key, targeted);
    debug!(
        policy = %key,
        pods = targeted,
        workloads = groups.len(),
        "Discovered target pods"
    );

    let status = policy.status.get_or_insert_with(Default::default);
    status.targeted_pods = clamp_count(targeted);

    if targeted == 0 {
        let message = "No matching pods found";
        status.recommendations.clear();
        status.updated_pods = 0;
        status.last_analysis_time = Some(Time(now));
        status.set_ready(true, REASON_COMPLETED, message, generation, now);
        transition(ctx, policy, Phase::Completed, message).await?;
        return Ok(ReconcileOutcome::analyzed(schedule::requeue_interval(
            &spec.analysis_window,
        )));
    }

    transition(ctx, policy, Phase::Recommending, "Generating recommendations").await?;

    let window = schedule::metrics_window(&spec.analysis_window);
    let mut recommendations = Vec::new();
    for (workload, pods) in &groups {
        match recommend_workload(ctx, key, spec, workload, pods, window).await {
            Ok(recs) => recommendations.extend(recs),
            Err(e) => {
                ctx.logger
                    .log_workload_skipped(key, &workload.to_string(), &e.to_string());
            }
        }
    }

    let status = policy.status.get_or_insert_with(Default::default);
    status.recommendations = recommendations.clone();
    status.last_analysis_time = Some(Time(now));

    let updated = if spec.dry_run {
        0
    } else {
        // Persists recommendations together with the phase change
        transition(ctx, policy, Phase::Updating, "Applying recommendations").await?;
        let updated = apply::apply_recommendations(ctx, key, spec, &recommendations).await?;
        policy
            .status
            .get_or_insert_with(Default::default)
            .last_update_time = Some(Time(now));
        updated
    };

    let mut message = format!(
        "Analysis completed. Found {} recommendations",
        recommendations.len()
    );
    if spec.dry_run {
        message.push_str(" (dry-run mode)");
    }

    let status = policy.status.get_or_insert_with(Default::default);
    status.updated_pods = clamp_count(updated);
    status.set_ready(true, REASON_COMPLETED, &message, generation, now);
    transition(ctx, policy, Phase::Completed, &message).await?;

    let report = ctx.cost.estimate_cluster_savings(&recommendations);
    ctx.logger.log_reconcile_completed(
        key,
        targeted,
        recommendations.len(),
        updated,
        spec.dry_run,
        &report.estimated_monthly_savings,
    );

    Ok(ReconcileOutcome::analyzed(schedule::requeue_interval(
        &spec.analysis_window,
    )))
}

/// Fetch one workload's usage and size each of its pods
async fn recommend_workload(
    ctx: &Context,
    key: &str,
    spec: &RightSizingPolicySpec,
    workload: &WorkloadRef,
    pods: &[Pod],
    window: Duration,
) -> Result<Vec<PodRecommendation>> {
    let started = Instant::now();
    let fetched = ctx
        .metrics_provider
        .get_workload_metrics(&workload.namespace, &workload.name, workload.kind, window)
        .await;
    ctx.metrics
        .observe_metrics_query(started.elapsed(), fetched.is_ok());
    ctx.health
        .record(components::METRICS_PROVIDER, &fetched)
        .await;
    let metrics = fetched?;

    let current = |pod_name: &str| {
        pods.iter()
            .find(|p| p.metadata.name.as_deref() == Some(pod_name))
            .and_then(|p| p.spec.as_ref())
            .map(|s| quantity::sum_container_resources(&s.containers))
    };
    let out = ctx
        .engine
        .recommend_workload(&metrics, &spec.thresholds, current)?;

    ctx.metrics
        .add_recommendations(out.recommendations.len(), out.suppressed + out.insufficient_data);
    if out.suppressed > 0 || out.insufficient_data > 0 {
        ctx.logger
            .log_suppressed(key, workload, out.suppressed, out.insufficient_data);
    }
    for rec in &out.recommendations {
        ctx.logger.log_recommendation(
            key,
            &rec.pod_reference.name,
            &workload.to_string(),
            rec.confidence,
            &rec.potential_savings.cost_savings,
        );
    }

    Ok(out.recommendations)
}

/// Set phase and message and persist the whole status in one write
async fn transition(
    ctx: &Context,
    policy: &mut RightSizingPolicy,
    phase: Phase,
    message: &str,
) -> Result<()> {
    let key = policy.key();
    let status = policy.status.get_or_insert_with(Default::default);
    let from = status.phase;
    status.phase = phase;
    status.message = message.to_string();
    ctx.logger.log_phase_transition(&key, from, phase, message);

    let written = write_status(ctx.cluster.as_ref(), policy, ctx.settings.status_write_retries).await;
    ctx.health.record(components::KUBE_API, &written).await;
    written
}

async fn mark_error(ctx: &Context, policy: &mut RightSizingPolicy, error: &Error, now: DateTime<Utc>) {
    let generation = policy.metadata.generation;
    let message = error.to_string();
    policy
        .status
        .get_or_insert_with(Default::default)
        .set_ready(false, REASON_RECONCILE_ERROR, &message, generation, now);

    if let Err(e) = transition(ctx, policy, Phase::Error, &message).await {
        warn!(policy = %policy.key(), error = %e, "Failed to record error phase");
    }
}

fn clamp_count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
