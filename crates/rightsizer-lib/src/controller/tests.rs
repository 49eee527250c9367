//! Reconcile pass scenarios against in-memory cluster and metrics fakes
//!
//! These tests verify:
//! - Dry-run and manual strategy never touch workloads
//! - Passes within the analysis interval do no work
//! - A failing workload does not fail its siblings
//! - Workloads are only rewritten when they differ from the template
//! - Namespace selection, exclusions and every updatable workload kind
//! - Invalid policies enter Error and back off

use super::*;
use crate::crd::{Phase, RightSizingPolicySpec, UpdateStrategy};
use crate::error::Result;
use crate::health::{components, ComponentStatus};
use crate::models::{PodMetrics, ResourceUsage, WorkloadKind, WorkloadMetrics, WorkloadRef};
use crate::selector::Selector;
use async_trait::async_trait;
use chrono::TimeZone;
use k8s_openapi::api::apps::v1::{DaemonSetSpec, DeploymentSpec, ReplicaSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodStatus, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const POLICY_NS: &str = "ops";
const POLICY_NAME: &str = "shop-rightsizing";
const APP_NS: &str = "shop";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn resources(cpu: &str, memory: &str) -> ResourceRequirements {
    let list = || {
        Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ]))
    };
    ResourceRequirements {
        requests: list(),
        limits: list(),
        ..Default::default()
    }
}

fn app_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

fn app_pod(namespace: &str, name: &str, owner_kind: &str, owner: &str, app: &str) -> Pod {
    let mut labels = app_labels(app);
    labels.insert("tier".to_string(), "backend".to_string());
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: owner_kind.to_string(),
                name: owner.to_string(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                resources: Some(resources("3000m", "3Gi")),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

fn replica_set(namespace: &str, name: &str, deployment: Option<&str>) -> ReplicaSet {
    ReplicaSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: deployment.map(|d| {
                vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: d.to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn object_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        resource_version: Some("1".to_string()),
        ..Default::default()
    }
}

fn pod_template(app: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(app_labels(app)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                resources: Some(resources("3000m", "3Gi")),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

fn deployment(namespace: &str, name: &str) -> Deployment {
    Deployment {
        metadata: object_meta(namespace, name),
        spec: Some(DeploymentSpec {
            template: pod_template(name),
            ..Default::default()
        }),
        status: None,
    }
}

fn policy(spec: serde_json::Value) -> RightSizingPolicy {
    let spec: RightSizingPolicySpec = serde_json::from_value(spec).unwrap();
    let mut policy = RightSizingPolicy::new(POLICY_NAME, spec);
    policy.metadata.namespace = Some(POLICY_NS.to_string());
    policy.metadata.generation = Some(1);
    policy.metadata.resource_version = Some("1".to_string());
    policy
}

fn policy_for(dry_run: bool, strategy: &str) -> RightSizingPolicy {
    policy(serde_json::json!({
        "target": { "namespace": APP_NS },
        "dryRun": dry_run,
        "updatePolicy": { "strategy": strategy }
    }))
}

#[derive(Default)]
struct ClusterState {
    policy: Option<RightSizingPolicy>,
    namespaces: Vec<Namespace>,
    pods: Vec<Pod>,
    replica_sets: Vec<ReplicaSet>,
    workloads: BTreeMap<WorkloadRef, Workload>,
    phases: Vec<Phase>,
    status_attempts: usize,
    workload_writes: usize,
    conflicts_to_inject: usize,
}

#[derive(Default)]
struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    fn with_policy(policy: RightSizingPolicy) -> Self {
        let cluster = Self::default();
        cluster.state.lock().unwrap().policy = Some(policy);
        cluster
    }

    fn add_namespace(&self, name: &str, team: &str) {
        self.state.lock().unwrap().namespaces.push(Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([("team".to_string(), team.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        });
    }

    /// Add a Deployment with `replicas` running pods behind one ReplicaSet
    fn add_deployment(&self, name: &str, replicas: usize) {
        self.add_deployment_in(APP_NS, name, replicas);
    }

    fn add_deployment_in(&self, namespace: &str, name: &str, replicas: usize) {
        let mut state = self.state.lock().unwrap();
        let rs_name = format!("{}-5d8f", name);
        state
            .replica_sets
            .push(replica_set(namespace, &rs_name, Some(name)));
        for i in 1..=replicas {
            let pod_name = format!("{}-5d8f-{}", name, i);
            state
                .pods
                .push(app_pod(namespace, &pod_name, "ReplicaSet", &rs_name, name));
        }
        let workload = Workload::Deployment(deployment(namespace, name));
        state.workloads.insert(workload.workload_ref(), workload);
    }

    /// Pods `<name>-0..` owned by a StatefulSet
    fn add_stateful_set(&self, name: &str, replicas: usize) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        let pods: Vec<String> = (0..replicas).map(|i| format!("{}-{}", name, i)).collect();
        for pod_name in &pods {
            state
                .pods
                .push(app_pod(APP_NS, pod_name, "StatefulSet", name, name));
        }
        let workload = Workload::StatefulSet(StatefulSet {
            metadata: object_meta(APP_NS, name),
            spec: Some(StatefulSetSpec {
                template: pod_template(name),
                ..Default::default()
            }),
            status: None,
        });
        state.workloads.insert(workload.workload_ref(), workload);
        pods
    }

    fn add_daemon_set(&self, name: &str, nodes: &[&str]) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        let pods: Vec<String> = nodes.iter().map(|n| format!("{}-{}", name, n)).collect();
        for pod_name in &pods {
            state
                .pods
                .push(app_pod(APP_NS, pod_name, "DaemonSet", name, name));
        }
        let workload = Workload::DaemonSet(DaemonSet {
            metadata: object_meta(APP_NS, name),
            spec: Some(DaemonSetSpec {
                template: pod_template(name),
                ..Default::default()
            }),
            status: None,
        });
        state.workloads.insert(workload.workload_ref(), workload);
        pods
    }

    /// A ReplicaSet created directly, without a Deployment above it
    fn add_orphan_replica_set(&self, name: &str, replicas: usize) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        state.replica_sets.push(replica_set(APP_NS, name, None));
        let pods: Vec<String> = (1..=replicas).map(|i| format!("{}-{}", name, i)).collect();
        for pod_name in &pods {
            state
                .pods
                .push(app_pod(APP_NS, pod_name, "ReplicaSet", name, name));
        }
        pods
    }

    fn workload(&self, namespace: &str, kind: WorkloadKind, name: &str) -> Workload {
        self.state.lock().unwrap().workloads[&WorkloadRef::new(namespace, kind, name)].clone()
    }

    fn deployment(&self, name: &str) -> Deployment {
        match self.workload(APP_NS, WorkloadKind::Deployment, name) {
            Workload::Deployment(d) => d,
            other => panic!("expected a Deployment, found {:?}", other.kind()),
        }
    }

    fn policy(&self) -> RightSizingPolicy {
        self.state.lock().unwrap().policy.clone().unwrap()
    }

    fn status(&self) -> crate::crd::RightSizingPolicyStatus {
        self.policy().status.unwrap_or_default()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<RightSizingPolicy>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .policy
            .clone()
            .filter(|p| p.namespace().as_deref() == Some(namespace) && p.name_any() == name))
    }

    async fn replace_policy_status(&self, policy: &RightSizingPolicy) -> Result<RightSizingPolicy> {
        let mut state = self.state.lock().unwrap();
        state.status_attempts += 1;
        if state.conflicts_to_inject > 0 {
            state.conflicts_to_inject -= 1;
            return Err(Error::Conflict(policy.key()));
        }
        let phase = policy.status.as_ref().map(|s| s.phase).unwrap_or_default();
        let Some(stored) = state.policy.as_mut() else {
            return Err(Error::NotFound {
                kind: "RightSizingPolicy",
                name: policy.key(),
            });
        };
        stored.status = policy.status.clone();
        let version: u64 = stored
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        stored.metadata.resource_version = Some((version + 1).to_string());
        let updated = stored.clone();
        state.phases.push(phase);
        Ok(updated)
    }

    async fn list_namespaces(&self, selector: &Selector) -> Result<Vec<Namespace>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .namespaces
            .iter()
            .filter(|ns| selector.matches(ns.labels()))
            .cloned()
            .collect())
    }

    async fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Pod>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|p| namespace.map_or(true, |ns| p.namespace().as_deref() == Some(ns)))
            .filter(|p| selector.matches(p.labels()))
            .cloned()
            .collect())
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .replica_sets
            .iter()
            .find(|rs| rs.namespace().as_deref() == Some(namespace) && rs.name_any() == name)
            .cloned())
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workloads
            .get(&WorkloadRef::new(namespace, kind, name))
            .cloned())
    }

    async fn replace_workload(&self, workload: &Workload) -> Result<Workload> {
        let mut state = self.state.lock().unwrap();
        state.workload_writes += 1;
        state
            .workloads
            .insert(workload.workload_ref(), workload.clone());
        Ok(workload.clone())
    }
}

/// Serves 15 stable samples per pod; named workloads can be made to fail
#[derive(Default)]
struct FakeMetrics {
    pods: Mutex<BTreeMap<String, Vec<String>>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl FakeMetrics {
    fn serve(&self, workload: &str, replicas: usize) {
        let pods = (1..=replicas)
            .map(|i| format!("{}-5d8f-{}", workload, i))
            .collect();
        self.pods.lock().unwrap().insert(workload.to_string(), pods);
    }

    fn serve_pods(&self, workload: &str, pods: Vec<String>) {
        self.pods.lock().unwrap().insert(workload.to_string(), pods);
    }

    fn fail(&self, workload: &str) {
        self.failing.lock().unwrap().insert(workload.to_string());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn stable_series(namespace: &str, pod_name: &str) -> PodMetrics {
    let start = t0() - chrono::Duration::days(7);
    let samples = 15;
    let at = |i: usize| start + chrono::Duration::hours(i as i64);
    PodMetrics {
        pod_name: pod_name.to_string(),
        namespace: namespace.to_string(),
        cpu_usage: (0..samples)
            .map(|i| ResourceUsage::cores(at(i), 0.08 + 0.04 * i as f64 / 14.0))
            .collect(),
        memory_usage: (0..samples)
            .map(|i| ResourceUsage::bytes(at(i), 200.0 * 1024.0 * 1024.0 + i as f64 * 1024.0))
            .collect(),
        start,
        end: t0(),
    }
}

#[async_trait]
impl MetricsProvider for FakeMetrics {
    async fn get_workload_metrics(
        &self,
        namespace: &str,
        workload_name: &str,
        workload_kind: WorkloadKind,
        _window: Duration,
    ) -> Result<WorkloadMetrics> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(workload_name) {
            return Err(Error::MetricsUnavailable {
                target: workload_name.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let pods = self
            .pods
            .lock()
            .unwrap()
            .get(workload_name)
            .cloned()
            .unwrap_or_default();
        Ok(WorkloadMetrics {
            workload_name: workload_name.to_string(),
            workload_kind,
            namespace: namespace.to_string(),
            pods: pods.iter().map(|p| stable_series(namespace, p)).collect(),
            start: t0() - chrono::Duration::days(7),
            end: t0(),
        })
    }

    async fn get_pod_metrics(
        &self,
        namespace: &str,
        pod_name: &str,
        _window: Duration,
    ) -> Result<PodMetrics> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(stable_series(namespace, pod_name))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

fn context(cluster: Arc<FakeCluster>, metrics: Arc<FakeMetrics>) -> Context {
    Context::new(
        cluster,
        metrics,
        Arc::new(CostCalculator::default()),
        HealthRegistry::new(),
        StructuredLogger::new("controller-test"),
        ControllerSettings::default(),
    )
}

fn setup(policy: RightSizingPolicy) -> (Arc<FakeCluster>, Arc<FakeMetrics>, Context) {
    let cluster = Arc::new(FakeCluster::with_policy(policy));
    cluster.add_deployment("web", 3);
    let metrics = Arc::new(FakeMetrics::default());
    metrics.serve("web", 3);
    let ctx = context(cluster.clone(), metrics.clone());
    (cluster, metrics, ctx)
}

mod pass_tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_never_touches_workloads() {
        let (cluster, _metrics, ctx) = setup(policy_for(true, "immediate"));
        let original = cluster.deployment("web");

        let first = reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();
        assert!(first.analyzed);
        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0() + chrono::Duration::minutes(5))
            .await
            .unwrap();

        let status = cluster.status();
        assert_eq!(status.phase, Phase::Completed);
        assert_eq!(status.updated_pods, 0);
        assert_eq!(status.targeted_pods, 3);
        assert_eq!(status.recommendations.len(), 3);
        assert_eq!(
            status.message,
            "Analysis completed. Found 3 recommendations (dry-run mode)"
        );
        assert_eq!(cluster.deployment("web"), original);
        assert_eq!(cluster.state.lock().unwrap().workload_writes, 0);
    }

    #[tokio::test]
    async fn test_phase_writes_in_order() {
        let (cluster, _metrics, ctx) = setup(policy_for(true, "gradual"));
        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();
        assert_eq!(
            cluster.state.lock().unwrap().phases,
            vec![Phase::Analyzing, Phase::Recommending, Phase::Completed]
        );

        let (cluster, _metrics, ctx) = setup(policy_for(false, "gradual"));
        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();
        assert_eq!(
            cluster.state.lock().unwrap().phases,
            vec![
                Phase::Analyzing,
                Phase::Recommending,
                Phase::Updating,
                Phase::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_recommendations_carry_current_resources() {
        let (cluster, _metrics, ctx) = setup(policy_for(true, "gradual"));
        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();

        let status = cluster.status();
        let rec = &status.recommendations[0];
        assert_eq!(rec.pod_reference.workload_type, "Deployment");
        assert_eq!(rec.pod_reference.workload_name, "web");
        assert_eq!(rec.pod_reference.namespace, APP_NS);
        assert!(rec.confidence > 90);
        assert!(!rec.applied);
        assert!(crate::quantity::resources_equal(
            &rec.current_resources,
            &resources("3", "3Gi")
        ));
        assert!(rec.potential_savings.cost_savings.ends_with("/month"));
    }

    #[tokio::test]
    async fn test_manual_strategy_updates_nothing() {
        let (cluster, _metrics, ctx) = setup(policy_for(false, "manual"));
        let original = cluster.deployment("web");

        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();

        let status = cluster.status();
        assert_eq!(status.phase, Phase::Completed);
        assert!(!status.recommendations.is_empty());
        assert_eq!(status.updated_pods, 0);
        assert!(status.last_update_time.is_some());
        assert_eq!(cluster.deployment("web"), original);
    }

    #[tokio::test]
    async fn test_second_pass_within_interval_is_noop() {
        let (cluster, metrics, ctx) = setup(policy_for(true, "gradual"));

        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();
        let calls = metrics.calls();
        let first_analysis = cluster.status().last_analysis_time;
        let writes = cluster.state.lock().unwrap().status_attempts;

        let second = reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0() + chrono::Duration::hours(1))
            .await
            .unwrap();

        assert!(!second.analyzed);
        assert_eq!(second.requeue_after, Some(Duration::from_secs(6 * 3600)));
        assert_eq!(metrics.calls(), calls);
        assert_eq!(cluster.status().last_analysis_time, first_analysis);
        assert_eq!(cluster.state.lock().unwrap().status_attempts, writes);
    }

    #[tokio::test]
    async fn test_due_again_after_interval() {
        let (_cluster, metrics, ctx) = setup(policy_for(true, "gradual"));

        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();
        let outcome = reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0() + chrono::Duration::hours(8))
            .await
            .unwrap();

        assert!(outcome.analyzed);
        assert_eq!(metrics.calls(), 2);
    }

    #[tokio::test]
    async fn test_spec_change_triggers_analysis() {
        let (cluster, metrics, ctx) = setup(policy_for(true, "gradual"));
        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();

        cluster
            .state
            .lock()
            .unwrap()
            .policy
            .as_mut()
            .unwrap()
            .metadata
            .generation = Some(2);

        let outcome = reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert!(outcome.analyzed);
        assert_eq!(metrics.calls(), 2);
    }

    #[tokio::test]
    async fn test_metrics_failure_isolated_to_workload() {
        let (cluster, metrics, ctx) = setup(policy_for(true, "gradual"));
        cluster.add_deployment("api", 2);
        metrics.serve("api", 2);
        metrics.fail("api");

        let outcome = reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await;
        assert!(outcome.is_ok());

        let status = cluster.status();
        assert_eq!(status.phase, Phase::Completed);
        assert_eq!(status.targeted_pods, 5);
        assert_eq!(status.recommendations.len(), 3);
        assert!(status
            .recommendations
            .iter()
            .all(|r| r.pod_reference.workload_name == "web"));

        let health = ctx.health.health().await;
        assert_eq!(
            health.components[components::METRICS_PROVIDER].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_apply_writes_template_once() {
        let (cluster, _metrics, ctx) = setup(policy_for(false, "immediate"));

        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();

        let status = cluster.status();
        assert_eq!(status.updated_pods, 1);
        let template = &status.recommendations[0].recommended_resources;
        let pod_spec = cluster.deployment("web").spec.unwrap().template.spec.unwrap();
        assert!(crate::quantity::resources_equal(
            pod_spec.containers[0].resources.as_ref().unwrap(),
            template
        ));

        // Same recommendations on the next analysis, nothing left to change
        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0() + chrono::Duration::hours(8))
            .await
            .unwrap();
        assert_eq!(cluster.state.lock().unwrap().workload_writes, 1);
        assert_eq!(cluster.status().updated_pods, 0);
    }

    #[tokio::test]
    async fn test_gradual_and_immediate_write_same_workload() {
        let strategy_policy = |strategy: &str| {
            policy(serde_json::json!({
                "target": { "namespace": APP_NS },
                "updatePolicy": { "strategy": strategy, "maxUnavailable": 1, "maxSurge": "50%" }
            }))
        };

        let (immediate, _metrics, ctx) = setup(strategy_policy("immediate"));
        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();
        let (gradual, _metrics, ctx) = setup(strategy_policy("gradual"));
        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();

        let written = immediate.deployment("web");
        assert_eq!(written, gradual.deployment("web"));
        assert_eq!(immediate.status().updated_pods, 1);
        assert_eq!(gradual.status().updated_pods, 1);
        // Rollout settings stay owned by the workload
        assert!(written.spec.unwrap().strategy.is_none());
    }

    #[tokio::test]
    async fn test_min_change_threshold_blocks_small_update() {
        let (cluster, _metrics, ctx) = setup(policy(serde_json::json!({
            "target": { "namespace": APP_NS },
            "updatePolicy": { "strategy": "immediate" },
            "thresholds": { "minChangeThreshold": 100 }
        })));

        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();

        // Every reduction from 3 cores stays under a 100% change
        assert_eq!(cluster.status().updated_pods, 0);
        assert_eq!(cluster.state.lock().unwrap().workload_writes, 0);
    }

    #[tokio::test]
    async fn test_missing_workload_skipped() {
        let (cluster, _metrics, ctx) = setup(policy_for(false, "immediate"));
        cluster.state.lock().unwrap().workloads.clear();

        let outcome = reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await;
        assert!(outcome.is_ok());
        assert_eq!(cluster.status().phase, Phase::Completed);
        assert_eq!(cluster.status().updated_pods, 0);
    }

    #[tokio::test]
    async fn test_no_matching_pods_completes() {
        let cluster = Arc::new(FakeCluster::with_policy(policy_for(true, "gradual")));
        let metrics = Arc::new(FakeMetrics::default());
        let ctx = context(cluster.clone(), metrics.clone());

        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();

        let status = cluster.status();
        assert_eq!(status.phase, Phase::Completed);
        assert_eq!(status.message, "No matching pods found");
        assert_eq!(status.targeted_pods, 0);
        assert!(status.last_analysis_time.is_some());
        assert_eq!(metrics.calls(), 0);
    }

    #[tokio::test]
    async fn test_deleted_policy_is_noop() {
        let cluster = Arc::new(FakeCluster::default());
        let ctx = context(cluster, Arc::new(FakeMetrics::default()));

        let outcome = reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();
        assert_eq!(outcome.requeue_after, None);
        assert!(!outcome.analyzed);
    }
}

mod error_tests {
    use super::*;

    fn invalid_policy() -> RightSizingPolicy {
        policy(serde_json::json!({
            "target": {
                "namespace": APP_NS,
                "namespaceSelector": { "matchLabels": { "team": "a" } }
            }
        }))
    }

    #[tokio::test]
    async fn test_invalid_policy_enters_error() {
        let (cluster, metrics, ctx) = setup(invalid_policy());

        let err = reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "InvalidPolicy");

        let status = cluster.status();
        assert_eq!(status.phase, Phase::Error);
        assert!(status.message.contains("invalid policy"));
        let ready = status.ready_condition().unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, REASON_RECONCILE_ERROR);
        assert_eq!(ready.observed_generation, Some(1));
        assert_eq!(metrics.calls(), 0);
    }

    #[tokio::test]
    async fn test_error_backoff_blocks_retries() {
        let (cluster, _metrics, ctx) = setup(invalid_policy());
        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap_err();
        let writes = cluster.state.lock().unwrap().status_attempts;

        // Status write events arrive right away and must not re-run the pass
        let outcome = reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0() + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert!(!outcome.analyzed);
        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(290)));
        assert_eq!(cluster.state.lock().unwrap().status_attempts, writes);

        // Once the backoff elapsed the pass runs again
        assert!(
            reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0() + chrono::Duration::minutes(6))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_recovers_after_fix() {
        let (cluster, _metrics, ctx) = setup(invalid_policy());
        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap_err();

        {
            let mut state = cluster.state.lock().unwrap();
            let policy = state.policy.as_mut().unwrap();
            policy.spec.target.namespace_selector = None;
            policy.spec.dry_run = true;
            policy.metadata.generation = Some(2);
        }

        let outcome = reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0() + chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert!(outcome.analyzed);
        let status = cluster.status();
        assert_eq!(status.phase, Phase::Completed);
        assert_eq!(status.ready_condition().unwrap().status, "True");
    }

    #[tokio::test]
    async fn test_status_conflict_retried() {
        let (cluster, _metrics, ctx) = setup(policy_for(true, "gradual"));
        cluster.state.lock().unwrap().conflicts_to_inject = 2;

        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();

        let state = cluster.state.lock().unwrap();
        assert_eq!(state.phases.last(), Some(&Phase::Completed));
        assert_eq!(state.status_attempts, state.phases.len() + 2);
    }

    #[tokio::test]
    async fn test_status_conflict_exhausts_retries() {
        let mut p = policy_for(true, "gradual");
        p.status = Some(crate::crd::RightSizingPolicyStatus {
            phase: Phase::Completed,
            ..Default::default()
        });
        let cluster = FakeCluster::with_policy(p.clone());
        cluster.state.lock().unwrap().conflicts_to_inject = 100;

        let err = write_status(&cluster, &mut p, 3).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(cluster.state.lock().unwrap().status_attempts, 4);
    }
}

mod strategy_tests {
    use super::*;

    #[test]
    fn test_strategy_defaults() {
        let p = policy(serde_json::json!({ "target": { "namespace": APP_NS } }));
        assert_eq!(p.spec.update_policy.strategy, UpdateStrategy::Gradual);
        assert!(!p.spec.dry_run);
    }
}

mod discovery_tests {
    use super::*;

    fn recommended_workloads(cluster: &FakeCluster) -> BTreeSet<(String, String, String)> {
        cluster
            .status()
            .recommendations
            .iter()
            .map(|r| {
                (
                    r.pod_reference.namespace.clone(),
                    r.pod_reference.workload_type.clone(),
                    r.pod_reference.workload_name.clone(),
                )
            })
            .collect()
    }

    fn owned(namespace: &str, kind: &str, name: &str) -> (String, String, String) {
        (namespace.to_string(), kind.to_string(), name.to_string())
    }

    #[tokio::test]
    async fn test_namespace_selector_with_exclusion() {
        let cluster = Arc::new(FakeCluster::with_policy(policy(serde_json::json!({
            "target": {
                "namespaceSelector": { "matchLabels": { "team": "payments" } },
                "excludeNamespaces": ["payments-canary"]
            },
            "dryRun": true
        }))));
        cluster.add_namespace("payments", "payments");
        cluster.add_namespace("payments-eu", "payments");
        cluster.add_namespace("payments-canary", "payments");
        cluster.add_namespace("search", "search");
        let metrics = Arc::new(FakeMetrics::default());
        for (ns, name) in [
            ("payments", "ledger"),
            ("payments-eu", "gateway"),
            ("payments-canary", "ledger-next"),
            ("search", "indexer"),
        ] {
            cluster.add_deployment_in(ns, name, 2);
            metrics.serve(name, 2);
        }
        let ctx = context(cluster.clone(), metrics.clone());

        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();

        let status = cluster.status();
        assert_eq!(status.phase, Phase::Completed);
        assert_eq!(status.targeted_pods, 4);
        assert_eq!(
            recommended_workloads(&cluster),
            BTreeSet::from([
                owned("payments", "Deployment", "ledger"),
                owned("payments-eu", "Deployment", "gateway"),
            ])
        );
        assert_eq!(metrics.calls(), 2);
    }

    #[tokio::test]
    async fn test_all_namespaces_honours_exclusions() {
        let cluster = Arc::new(FakeCluster::with_policy(policy(serde_json::json!({
            "target": {
                "labelSelector": { "matchLabels": { "tier": "backend" } },
                "excludeNamespaces": ["kube-system"]
            },
            "dryRun": true
        }))));
        let metrics = Arc::new(FakeMetrics::default());
        cluster.add_deployment_in(APP_NS, "web", 2);
        cluster.add_deployment_in("kube-system", "coredns", 2);
        metrics.serve("web", 2);
        metrics.serve("coredns", 2);
        let ctx = context(cluster.clone(), metrics.clone());

        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();

        let status = cluster.status();
        assert_eq!(status.targeted_pods, 2);
        assert_eq!(
            recommended_workloads(&cluster),
            BTreeSet::from([owned(APP_NS, "Deployment", "web")])
        );
    }

    #[tokio::test]
    async fn test_stateful_and_daemon_sets_are_patched() {
        let (cluster, metrics, ctx) = setup(policy_for(false, "immediate"));
        let db_pods = cluster.add_stateful_set("db", 2);
        let agent_pods = cluster.add_daemon_set("agent", &["x7k2p", "q9m4t"]);
        metrics.serve_pods("db", db_pods);
        metrics.serve_pods("agent", agent_pods);

        reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await.unwrap();

        let status = cluster.status();
        assert_eq!(status.phase, Phase::Completed);
        assert_eq!(status.targeted_pods, 7);
        assert_eq!(status.updated_pods, 3);
        assert_eq!(cluster.state.lock().unwrap().workload_writes, 3);

        for (kind, name) in [(WorkloadKind::StatefulSet, "db"), (WorkloadKind::DaemonSet, "agent")] {
            let rec = status
                .recommendations
                .iter()
                .find(|r| r.pod_reference.workload_name == name)
                .unwrap();
            assert_eq!(rec.pod_reference.workload_type, kind.as_str());

            let written = cluster.workload(APP_NS, kind, name);
            assert!(crate::quantity::resources_equal(
                written.containers()[0].resources.as_ref().unwrap(),
                &rec.recommended_resources
            ));
        }
    }

    #[tokio::test]
    async fn test_orphan_replica_set_groups_under_own_name() {
        let (cluster, metrics, ctx) = setup(policy_for(false, "immediate"));
        let pods = cluster.add_orphan_replica_set("legacy-7c9d", 2);
        metrics.serve_pods("legacy-7c9d", pods);

        let outcome = reconcile_policy(&ctx, POLICY_NS, POLICY_NAME, t0()).await;
        assert!(outcome.is_ok());

        let status = cluster.status();
        assert_eq!(status.phase, Phase::Completed);
        assert_eq!(
            recommended_workloads(&cluster),
            BTreeSet::from([
                owned(APP_NS, "Deployment", "legacy-7c9d"),
                owned(APP_NS, "Deployment", "web"),
            ])
        );
        // No Deployment of that name exists, only web is written
        assert_eq!(status.updated_pods, 1);
        assert_eq!(cluster.state.lock().unwrap().workload_writes, 1);
    }
}
