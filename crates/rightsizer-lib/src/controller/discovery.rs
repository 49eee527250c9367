//! Target pod discovery and grouping by owning workload

use super::cluster::ClusterApi;
use crate::crd::TargetSpec;
use crate::error::Result;
use crate::models::{WorkloadKind, WorkloadRef};
use crate::quantity;
use crate::selector::Selector;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Pods of one policy's target, keyed by owning workload
pub type WorkloadGroups = BTreeMap<WorkloadRef, Vec<Pod>>;

/// Namespaces to list pods in. `None` stands for all namespaces.
pub async fn target_namespaces(
    cluster: &dyn ClusterApi,
    target: &TargetSpec,
) -> Result<Vec<Option<String>>> {
    let namespaces = if let Some(ns_selector) = &target.namespace_selector {
        let selector = Selector::from_label_selector(ns_selector)?;
        cluster
            .list_namespaces(&selector)
            .await?
            .iter()
            .map(|ns| Some(ns.name_any()))
            .collect()
    } else if let Some(ns) = target.namespace() {
        vec![Some(ns.to_string())]
    } else {
        vec![None]
    };

    Ok(namespaces
        .into_iter()
        .filter(|ns| ns.as_deref().map_or(true, |ns| !target.is_excluded(ns)))
        .collect())
}

/// Find the pods a target selects and group them by owning workload
pub async fn discover(cluster: &dyn ClusterApi, target: &TargetSpec) -> Result<WorkloadGroups> {
    let selector = Selector::from_optional(target.label_selector.as_ref())?;
    let mut owners = OwnerResolver::new(cluster);
    let mut groups = WorkloadGroups::new();

    for namespace in target_namespaces(cluster, target).await? {
        let pods = cluster.list_pods(namespace.as_deref(), &selector).await?;
        debug!(
            namespace = namespace.as_deref().unwrap_or("*"),
            listed = pods.len(),
            "Listed candidate pods"
        );

        for pod in pods {
            // All-namespace listings still honour exclusions
            if target.is_excluded(&pod.namespace().unwrap_or_default()) {
                continue;
            }
            if !is_candidate(&pod, target) {
                continue;
            }
            let workload = owners.resolve(&pod).await;
            groups.entry(workload).or_default().push(pod);
        }
    }

    Ok(groups)
}

/// Running, owned, resource-bearing and of an included workload type
pub fn is_candidate(pod: &Pod, target: &TargetSpec) -> bool {
    let running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some("Running");
    if !running || pod.owner_references().is_empty() {
        return false;
    }
    if !target.includes_workload_type(workload_kind_of(pod).as_str()) {
        return false;
    }
    declares_resources(pod)
}

fn declares_resources(pod: &Pod) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    spec.containers
        .iter()
        .filter_map(|c| c.resources.as_ref())
        .flat_map(|r| r.requests.iter().chain(r.limits.iter()))
        .flat_map(|list| list.values())
        .any(|q| quantity::parse(q).map_or(false, |v| v > 0.0))
}

/// Workload kind from the pod's direct owners; `Pod` when none is recognised
pub fn workload_kind_of(pod: &Pod) -> WorkloadKind {
    pod.owner_references()
        .iter()
        .find_map(|owner| WorkloadKind::from_owner_kind(&owner.kind))
        .unwrap_or(WorkloadKind::Pod)
}

/// Resolves pod owners at most two hops deep (pod, ReplicaSet, Deployment),
/// remembering ReplicaSet lookups for the rest of the pass.
struct OwnerResolver<'a> {
    cluster: &'a dyn ClusterApi,
    replica_sets: HashMap<(String, String), Option<String>>,
}

impl<'a> OwnerResolver<'a> {
    fn new(cluster: &'a dyn ClusterApi) -> Self {
        Self {
            cluster,
            replica_sets: HashMap::new(),
        }
    }

    async fn resolve(&mut self, pod: &Pod) -> WorkloadRef {
        let namespace = pod.namespace().unwrap_or_default();
        let kind = workload_kind_of(pod);

        let owners = pod.owner_references();
        let Some(owner) = owners
            .iter()
            .find(|o| o.controller == Some(true))
            .or_else(|| owners.first())
        else {
            return WorkloadRef::new(namespace, kind, pod.name_any());
        };

        let name = if owner.kind == "ReplicaSet" {
            // A ReplicaSet without a Deployment owner stands for itself
            self.deployment_of(&namespace, &owner.name)
                .await
                .unwrap_or_else(|| owner.name.clone())
        } else {
            owner.name.clone()
        };
        WorkloadRef::new(namespace, kind, name)
    }

    async fn deployment_of(&mut self, namespace: &str, replica_set: &str) -> Option<String> {
        let key = (namespace.to_string(), replica_set.to_string());
        if let Some(cached) = self.replica_sets.get(&key) {
            return cached.clone();
        }

        let deployment = match self.cluster.get_replica_set(namespace, replica_set).await {
            Ok(Some(rs)) => rs
                .owner_references()
                .iter()
                .find(|o| o.kind == "Deployment")
                .map(|o| o.name.clone()),
            Ok(None) => None,
            Err(e) => {
                warn!(
                    namespace = %namespace,
                    replica_set = %replica_set,
                    error = %e,
                    "Failed to resolve ReplicaSet owner"
                );
                None
            }
        };
        self.replica_sets.insert(key, deployment.clone());
        deployment
    }
}
