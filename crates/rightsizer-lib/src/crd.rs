//! RightSizingPolicy custom resource
//!
//! The spec half configures which pods are analysed and how recommendations
//! are applied. The status half is written only by the controller and is
//! replaced wholesale at every phase transition of a pass.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ResourceRequirements, SecretReference};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_ANALYSIS_WINDOW: &str = "7d";
pub const DEFAULT_SCHEDULE: &str = "0 2 * * *";
pub const DEFAULT_BACKOFF_LIMIT: i32 = 3;
pub const DEFAULT_MIN_STABILITY_PERIOD: &str = "5m";
pub const DEFAULT_MIN_CHANGE_THRESHOLD: i32 = 10;

/// Condition type maintained on every policy
pub const READY_CONDITION: &str = "Ready";

/// Desired state of a right-sizing policy
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "rightsizing.k8s-rightsizer.io",
    version = "v1alpha1",
    kind = "RightSizingPolicy",
    plural = "rightsizingpolicies",
    shortname = "rsp",
    namespaced,
    status = "RightSizingPolicyStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Targeted","type":"integer","jsonPath":".status.targetedPods"}"#,
    printcolumn = r#"{"name":"Updated","type":"integer","jsonPath":".status.updatedPods"}"#,
    printcolumn = r#"{"name":"Last Analysis","type":"date","jsonPath":".status.lastAnalysisTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RightSizingPolicySpec {
    /// Which pods to analyse
    pub target: TargetSpec,

    /// How far back to look for usage, e.g. "7d"
    #[serde(default = "default_analysis_window")]
    pub analysis_window: String,

    #[serde(default)]
    pub update_policy: UpdatePolicy,

    #[serde(default)]
    pub thresholds: ResourceThresholds,

    #[serde(default)]
    pub metrics_source: MetricsSourceSpec,

    /// Cron expression for analysis runs
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// Compute and persist recommendations without touching workloads
    #[serde(default)]
    pub dry_run: bool,
}

fn default_analysis_window() -> String {
    DEFAULT_ANALYSIS_WINDOW.to_string()
}

fn default_schedule() -> String {
    DEFAULT_SCHEDULE.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    /// Single namespace to analyse. Mutually exclusive with `namespaceSelector`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_namespaces: Vec<String>,

    /// Subset of Deployment, StatefulSet, DaemonSet, Job, CronJob. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_workload_types: Vec<String>,
}

impl TargetSpec {
    /// The exact namespace, ignoring an empty string
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    pub fn is_excluded(&self, namespace: &str) -> bool {
        self.exclude_namespaces.iter().any(|ns| ns == namespace)
    }

    pub fn includes_workload_type(&self, workload_type: &str) -> bool {
        self.include_workload_types.is_empty()
            || self.include_workload_types.iter().any(|t| t == workload_type)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    Immediate,
    #[default]
    Gradual,
    Manual,
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateStrategy::Immediate => "immediate",
            UpdateStrategy::Gradual => "gradual",
            UpdateStrategy::Manual => "manual",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicy {
    #[serde(default)]
    pub strategy: UpdateStrategy,

    /// Rollout limit for the workload's own rolling update; recorded on the
    /// policy, never written to the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,

    #[serde(default = "default_backoff_limit")]
    pub backoff_limit: i32,

    #[serde(default = "default_min_stability_period")]
    pub min_stability_period: String,
}

fn default_backoff_limit() -> i32 {
    DEFAULT_BACKOFF_LIMIT
}

fn default_min_stability_period() -> String {
    DEFAULT_MIN_STABILITY_PERIOD.to_string()
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            strategy: UpdateStrategy::default(),
            max_unavailable: None,
            max_surge: None,
            backoff_limit: default_backoff_limit(),
            min_stability_period: default_min_stability_period(),
        }
    }
}

/// Sizing parameters. Unset fields fall back to the engine defaults; an
/// explicit zero is honoured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceThresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_utilization_percentile: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_utilization_percentile: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cpu: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<Quantity>,

    /// Percentage added on top of the observed percentile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_margin: Option<i32>,

    /// Minimum relative change (percent) before a workload is rewritten
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_change_threshold: Option<i32>,
}

impl ResourceThresholds {
    pub fn min_change_threshold(&self) -> f64 {
        f64::from(
            self.min_change_threshold
                .unwrap_or(DEFAULT_MIN_CHANGE_THRESHOLD),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MetricsSourceType {
    #[default]
    #[serde(rename = "prometheus")]
    Prometheus,
    #[serde(rename = "metrics-server")]
    MetricsServer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSourceSpec {
    #[serde(rename = "type", default)]
    pub source_type: MetricsSourceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus_config: Option<PrometheusConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusConfig {
    #[serde(default)]
    pub url: String,

    #[serde(rename = "insecureSkipTLSVerify", default)]
    pub insecure_skip_tls_verify: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_config: Option<AuthConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Bearer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(rename = "type", default)]
    pub auth_type: AuthType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

/// Coarse stage of the most recent reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    #[default]
    Initializing,
    Analyzing,
    Recommending,
    Updating,
    Completed,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Initializing => "Initializing",
            Phase::Analyzing => "Analyzing",
            Phase::Recommending => "Recommending",
            Phase::Updating => "Updating",
            Phase::Completed => "Completed",
            Phase::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RightSizingPolicyStatus {
    #[serde(default)]
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_analysis_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    #[serde(default)]
    pub targeted_pods: i32,

    #[serde(default)]
    pub updated_pods: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<PodRecommendation>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RightSizingPolicyStatus {
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == READY_CONDITION)
    }

    /// Set the Ready condition, keeping the transition time when the status
    /// value itself did not change.
    pub fn set_ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
        now: DateTime<Utc>,
    ) {
        let status = if ready { "True" } else { "False" };
        let last_transition_time = match self.ready_condition() {
            Some(existing) if existing.status == status => existing.last_transition_time.clone(),
            _ => Time(now),
        };

        self.conditions.retain(|c| c.type_ != READY_CONDITION);
        self.conditions.push(Condition {
            type_: READY_CONDITION.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: generation,
            last_transition_time,
        });
    }
}

/// Identifies the pod (and its owning workload) a recommendation was built from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodReference {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workload_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workload_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSavings {
    /// Reduction in CPU requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_savings: Option<Quantity>,

    /// Reduction in memory requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_savings: Option<Quantity>,

    /// e.g. "$12.40/month"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cost_savings: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodRecommendation {
    pub pod_reference: PodReference,

    #[serde(default)]
    pub current_resources: ResourceRequirements,

    #[serde(default)]
    pub recommended_resources: ResourceRequirements,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// 0-100
    #[serde(default)]
    pub confidence: i32,

    #[serde(default)]
    pub potential_savings: ResourceSavings,

    #[serde(default)]
    pub applied: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_time: Option<Time>,
}

impl PodRecommendation {
    /// Grouping key of the owning workload: `namespace/type/name`
    pub fn workload_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.pod_reference.namespace,
            self.pod_reference.workload_type,
            self.pod_reference.workload_name
        )
    }
}

impl RightSizingPolicy {
    /// `namespace/name`, used in logs and metric labels
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::CustomResourceExt;

    #[test]
    fn test_spec_defaults_applied_on_deserialize() {
        let spec: RightSizingPolicySpec = serde_json::from_value(serde_json::json!({
            "target": { "namespace": "shop" }
        }))
        .unwrap();

        assert_eq!(spec.analysis_window, "7d");
        assert_eq!(spec.schedule, "0 2 * * *");
        assert!(!spec.dry_run);
        assert_eq!(spec.update_policy.strategy, UpdateStrategy::Gradual);
        assert_eq!(spec.update_policy.backoff_limit, 3);
        assert_eq!(spec.update_policy.min_stability_period, "5m");
        assert_eq!(spec.metrics_source.source_type, MetricsSourceType::Prometheus);
        assert_eq!(spec.thresholds.min_change_threshold(), 10.0);
    }

    #[test]
    fn test_wire_names() {
        let spec: RightSizingPolicySpec = serde_json::from_value(serde_json::json!({
            "target": {
                "namespaceSelector": { "matchLabels": { "team": "a" } },
                "includeWorkloadTypes": ["Deployment"]
            },
            "thresholds": {
                "cpuUtilizationPercentile": 90,
                "minCpu": "50m",
                "safetyMargin": 0
            },
            "metricsSource": {
                "type": "metrics-server",
                "prometheusConfig": { "url": "http://prom:9090", "insecureSkipTLSVerify": true }
            },
            "updatePolicy": { "strategy": "manual", "maxSurge": "25%" },
            "dryRun": true
        }))
        .unwrap();

        assert_eq!(spec.thresholds.cpu_utilization_percentile, Some(90));
        assert_eq!(spec.thresholds.safety_margin, Some(0));
        assert_eq!(spec.thresholds.min_cpu, Some(Quantity("50m".into())));
        assert_eq!(spec.metrics_source.source_type, MetricsSourceType::MetricsServer);
        assert!(spec.metrics_source.prometheus_config.unwrap().insecure_skip_tls_verify);
        assert_eq!(spec.update_policy.strategy, UpdateStrategy::Manual);
        assert_eq!(
            spec.update_policy.max_surge,
            Some(IntOrString::String("25%".into()))
        );
        assert!(spec.dry_run);
    }

    #[test]
    fn test_crd_identity() {
        let crd = RightSizingPolicy::crd();
        assert_eq!(crd.spec.group, "rightsizing.k8s-rightsizer.io");
        assert_eq!(crd.spec.names.kind, "RightSizingPolicy");
        assert_eq!(crd.spec.names.plural, "rightsizingpolicies");
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_ready_condition_keeps_transition_time() {
        let t0 = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t1 = t0 + chrono::Duration::minutes(10);

        let mut status = RightSizingPolicyStatus::default();
        status.set_ready(false, "ReconcileError", "boom", Some(1), t0);
        status.set_ready(false, "ReconcileError", "boom again", Some(1), t1);

        let cond = status.ready_condition().unwrap();
        assert_eq!(cond.last_transition_time, Time(t0));
        assert_eq!(cond.message, "boom again");
        assert_eq!(status.conditions.len(), 1);

        status.set_ready(true, "Completed", "ok", Some(1), t1);
        assert_eq!(status.ready_condition().unwrap().last_transition_time, Time(t1));
    }

    #[test]
    fn test_status_phase_serializes_as_name() {
        let status = RightSizingPolicyStatus {
            phase: Phase::Recommending,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Recommending");
        assert_eq!(json["targetedPods"], 0);
    }
}
