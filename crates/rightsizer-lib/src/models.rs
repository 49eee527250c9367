//! Core data models shared by the metrics providers, the engine and the controller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const UNIT_CORES: &str = "cores";
pub const UNIT_BYTES: &str = "bytes";

/// One usage sample. Series are ordered by time but not evenly spaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
}

impl ResourceUsage {
    pub fn cores(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            unit: UNIT_CORES.to_string(),
        }
    }

    pub fn bytes(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            unit: UNIT_BYTES.to_string(),
        }
    }
}

/// CPU (cores) and memory (bytes) usage history of one pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodMetrics {
    pub pod_name: String,
    pub namespace: String,
    pub cpu_usage: Vec<ResourceUsage>,
    pub memory_usage: Vec<ResourceUsage>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Per-pod usage histories for every pod of one workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadMetrics {
    pub workload_name: String,
    pub workload_kind: WorkloadKind,
    pub namespace: String,
    pub pods: Vec<PodMetrics>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Kind of object that owns a group of pods
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    /// Owned by something that is not a recognised workload
    Pod,
}

impl WorkloadKind {
    /// Kinds a policy may list in `includeWorkloadTypes`
    pub const FILTERABLE: [WorkloadKind; 5] = [
        WorkloadKind::Deployment,
        WorkloadKind::StatefulSet,
        WorkloadKind::DaemonSet,
        WorkloadKind::Job,
        WorkloadKind::CronJob,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::Job => "Job",
            WorkloadKind::CronJob => "CronJob",
            WorkloadKind::Pod => "Pod",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Deployment" => Some(WorkloadKind::Deployment),
            "StatefulSet" => Some(WorkloadKind::StatefulSet),
            "DaemonSet" => Some(WorkloadKind::DaemonSet),
            "Job" => Some(WorkloadKind::Job),
            "CronJob" => Some(WorkloadKind::CronJob),
            "Pod" => Some(WorkloadKind::Pod),
            _ => None,
        }
    }

    /// Workload kind implied by a pod's direct owner kind.
    /// A ReplicaSet owner means the pod belongs to a Deployment.
    pub fn from_owner_kind(kind: &str) -> Option<Self> {
        match kind {
            "ReplicaSet" | "Deployment" => Some(WorkloadKind::Deployment),
            "StatefulSet" => Some(WorkloadKind::StatefulSet),
            "DaemonSet" => Some(WorkloadKind::DaemonSet),
            "Job" => Some(WorkloadKind::Job),
            "CronJob" => Some(WorkloadKind::CronJob),
            _ => None,
        }
    }

    /// Kinds the controller can write resources back to
    pub fn is_updatable(&self) -> bool {
        matches!(
            self,
            WorkloadKind::Deployment | WorkloadKind::StatefulSet | WorkloadKind::DaemonSet
        )
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one workload group: `(namespace, kind, name)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadRef {
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, kind: WorkloadKind, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}
