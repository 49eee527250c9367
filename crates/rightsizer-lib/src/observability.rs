//! Observability for the right-sizing controller
//!
//! Provides:
//! - Prometheus metrics (reconcile latency and outcomes, recommendation
//!   counts, workload updates, metrics backend latency)
//! - A structured logger emitting one `event` per lifecycle moment

use crate::crd::Phase;
use crate::models::WorkloadRef;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Buckets for reconcile passes, which include metrics queries (seconds)
const RECONCILE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Buckets for single metrics backend queries (seconds)
const QUERY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    reconcile_duration_seconds: Histogram,
    reconciles: IntCounter,
    reconcile_errors: IntCounterVec,
    recommendations_generated: IntCounter,
    recommendations_suppressed: IntCounter,
    workload_updates: IntCounterVec,
    metrics_query_errors: IntCounter,
    metrics_query_duration_seconds: Histogram,
    targeted_pods: IntGaugeVec,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_duration_seconds: register_histogram!(
                "rightsizer_reconcile_duration_seconds",
                "Duration of one reconcile pass",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            reconciles: register_int_counter!(
                "rightsizer_reconciles_total",
                "Total number of reconcile passes"
            )
            .expect("Failed to register reconciles_total"),

            reconcile_errors: register_int_counter_vec!(
                "rightsizer_reconcile_errors_total",
                "Total number of failed reconcile passes",
                &["reason"]
            )
            .expect("Failed to register reconcile_errors_total"),

            recommendations_generated: register_int_counter!(
                "rightsizer_recommendations_generated_total",
                "Total number of pod recommendations produced"
            )
            .expect("Failed to register recommendations_generated_total"),

            recommendations_suppressed: register_int_counter!(
                "rightsizer_recommendations_suppressed_total",
                "Total number of pod recommendations dropped below the confidence gate"
            )
            .expect("Failed to register recommendations_suppressed_total"),

            workload_updates: register_int_counter_vec!(
                "rightsizer_workload_updates_total",
                "Total number of workload resource updates",
                &["kind"]
            )
            .expect("Failed to register workload_updates_total"),

            metrics_query_errors: register_int_counter!(
                "rightsizer_metrics_query_errors_total",
                "Total number of failed metrics backend queries"
            )
            .expect("Failed to register metrics_query_errors_total"),

            metrics_query_duration_seconds: register_histogram!(
                "rightsizer_metrics_query_duration_seconds",
                "Duration of one workload metrics query",
                QUERY_BUCKETS.to_vec()
            )
            .expect("Failed to register metrics_query_duration_seconds"),

            targeted_pods: register_int_gauge_vec!(
                "rightsizer_targeted_pods",
                "Pods matched by a policy in its latest pass",
                &["policy"]
            )
            .expect("Failed to register targeted_pods"),
        }
    }
}

/// Handle to the process-wide controller metrics. Clones share one registry entry.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new)
    }

    pub fn observe_reconcile(&self, elapsed: Duration) {
        let inner = self.inner();
        inner.reconciles.inc();
        inner.reconcile_duration_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn inc_reconcile_errors(&self, reason: &str) {
        self.inner()
            .reconcile_errors
            .with_label_values(&[reason])
            .inc();
    }

    pub fn add_recommendations(&self, generated: usize, suppressed: usize) {
        let inner = self.inner();
        inner.recommendations_generated.inc_by(generated as u64);
        inner.recommendations_suppressed.inc_by(suppressed as u64);
    }

    pub fn inc_workload_updates(&self, kind: &str) {
        self.inner()
            .workload_updates
            .with_label_values(&[kind])
            .inc();
    }

    pub fn observe_metrics_query(&self, elapsed: Duration, ok: bool) {
        let inner = self.inner();
        inner
            .metrics_query_duration_seconds
            .observe(elapsed.as_secs_f64());
        if !ok {
            inner.metrics_query_errors.inc();
        }
    }

    pub fn set_targeted_pods(&self, policy: &str, count: usize) {
        self.inner()
            .targeted_pods
            .with_label_values(&[policy])
            .set(count as i64);
    }

    /// Forget per-policy series once a policy is deleted
    pub fn remove_policy(&self, policy: &str) {
        let _ = self.inner().targeted_pods.remove_label_values(&[policy]);
    }
}

/// Structured logger for controller lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, metrics_backend: &str) {
        info!(
            event = "controller_started",
            instance = %self.instance,
            version = %version,
            metrics_backend = %metrics_backend,
            "Right-sizing controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Right-sizing controller shutting down"
        );
    }

    pub fn log_reconcile_started(&self, policy: &str, generation: Option<i64>) {
        debug!(
            event = "reconcile_started",
            instance = %self.instance,
            policy = %policy,
            generation = ?generation,
            "Reconciling policy"
        );
    }

    pub fn log_analysis_skipped(&self, policy: &str, next_in: Duration) {
        debug!(
            event = "analysis_skipped",
            instance = %self.instance,
            policy = %policy,
            next_analysis_secs = next_in.as_secs(),
            "Analysis not due yet"
        );
    }

    pub fn log_phase_transition(&self, policy: &str, from: Phase, to: Phase, message: &str) {
        info!(
            event = "phase_transition",
            instance = %self.instance,
            policy = %policy,
            from = %from,
            to = %to,
            message = %message,
            "Policy phase changed"
        );
    }

    pub fn log_recommendation(
        &self,
        policy: &str,
        pod: &str,
        workload: &str,
        confidence: i32,
        cost_savings: &str,
    ) {
        info!(
            event = "recommendation_generated",
            instance = %self.instance,
            policy = %policy,
            pod = %pod,
            workload = %workload,
            confidence = confidence,
            cost_savings = %cost_savings,
            "Generated resource recommendation"
        );
    }

    pub fn log_suppressed(&self, policy: &str, workload: &WorkloadRef, suppressed: usize, insufficient: usize) {
        info!(
            event = "recommendation_suppressed",
            instance = %self.instance,
            policy = %policy,
            workload = %workload,
            low_confidence = suppressed,
            insufficient_data = insufficient,
            "Pods skipped without a recommendation"
        );
    }

    pub fn log_workload_skipped(&self, policy: &str, workload: &str, reason: &str) {
        warn!(
            event = "workload_skipped",
            instance = %self.instance,
            policy = %policy,
            workload = %workload,
            reason = %reason,
            "Skipping workload"
        );
    }

    pub fn log_workload_updated(&self, policy: &str, workload: &WorkloadRef, containers: usize) {
        info!(
            event = "workload_updated",
            instance = %self.instance,
            policy = %policy,
            workload = %workload,
            containers = containers,
            "Applied recommended resources to workload"
        );
    }

    pub fn log_reconcile_completed(
        &self,
        policy: &str,
        targeted_pods: usize,
        recommendations: usize,
        updated: usize,
        dry_run: bool,
        monthly_savings: &str,
    ) {
        info!(
            event = "reconcile_completed",
            instance = %self.instance,
            policy = %policy,
            targeted_pods = targeted_pods,
            recommendations = recommendations,
            updated_workloads = updated,
            dry_run = dry_run,
            estimated_monthly_savings = %monthly_savings,
            "Reconcile pass completed"
        );
    }

    pub fn log_reconcile_failed(&self, policy: &str, reason: &str, error: &str) {
        warn!(
            event = "reconcile_failed",
            instance = %self.instance,
            policy = %policy,
            reason = %reason,
            error = %error,
            "Reconcile pass failed"
        );
    }
}
