//! Mapping pod and workload events to the policies that target them
//!
//! Only changes to container resource requirements are interesting. The
//! first observation of an object counts as a change; objects being deleted
//! never trigger a pass.

use super::discovery::workload_kind_of;
use super::workload::Workload;
use crate::crd::{RightSizingPolicy, TargetSpec};
use crate::models::WorkloadKind;
use crate::quantity;
use crate::selector::Selector;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Container, Namespace, Pod, ResourceRequirements};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Entries kept before the least recently observed half is dropped
const DEFAULT_CAPACITY: usize = 65_536;

#[derive(Debug)]
struct Observed {
    resources: Vec<(String, ResourceRequirements)>,
    last_seen: u64,
}

/// Last observed container resources per object uid.
///
/// Objects removed without a deletion timestamp are never announced, so the
/// map is bounded: at capacity the least recently observed half is dropped.
/// A dropped object that is still alive counts as changed when next seen.
#[derive(Debug)]
pub struct ResourceChangeFilter {
    seen: DashMap<String, Observed>,
    clock: AtomicU64,
    capacity: usize,
}

impl Default for ResourceChangeFilter {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ResourceChangeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: DashMap::new(),
            clock: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Record `containers` for `uid` and report whether their resources
    /// differ from the previous observation
    pub fn observe(&self, uid: &str, containers: &[Container]) -> bool {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let current: Vec<(String, ResourceRequirements)> = containers
            .iter()
            .map(|c| (c.name.clone(), c.resources.clone().unwrap_or_default()))
            .collect();

        if let Some(mut previous) = self.seen.get_mut(uid) {
            previous.last_seen = tick;
            if same_resources(&previous.resources, &current) {
                return false;
            }
            previous.resources = current;
            return true;
        }

        if self.seen.len() >= self.capacity {
            self.evict_stalest();
        }
        self.seen.insert(
            uid.to_string(),
            Observed {
                resources: current,
                last_seen: tick,
            },
        );
        true
    }

    pub fn forget(&self, uid: &str) {
        self.seen.remove(uid);
    }

    fn evict_stalest(&self) {
        let mut ticks: Vec<u64> = self.seen.iter().map(|e| e.last_seen).collect();
        if ticks.is_empty() {
            return;
        }
        ticks.sort_unstable();
        let cutoff = ticks[(ticks.len() - 1) / 2];
        self.seen.retain(|_, o| o.last_seen > cutoff);
        debug!(remaining = self.seen.len(), "Dropped stale resource observations");
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn same_resources(a: &[(String, ResourceRequirements)], b: &[(String, ResourceRequirements)]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|((na, ra), (nb, rb))| na == nb && quantity::resources_equal(ra, rb))
}

/// Whether an object with these attributes falls inside a policy's target.
/// Malformed selectors match nothing.
pub fn target_matches(
    target: &TargetSpec,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    kind: WorkloadKind,
    namespace_labels: Option<&BTreeMap<String, String>>,
) -> bool {
    if target.namespace().map_or(false, |ns| ns != namespace) {
        return false;
    }
    if target.is_excluded(namespace) || !target.includes_workload_type(kind.as_str()) {
        return false;
    }
    match Selector::from_optional(target.label_selector.as_ref()) {
        Ok(selector) if selector.matches(labels) => {}
        _ => return false,
    }
    if let Some(ns_selector) = &target.namespace_selector {
        let Some(ns_labels) = namespace_labels else {
            return false;
        };
        match Selector::from_label_selector(ns_selector) {
            Ok(selector) if selector.matches(ns_labels) => {}
            _ => return false,
        }
    }
    true
}

/// Policies whose target covers the given object
pub fn matching_policies<'a>(
    policies: impl IntoIterator<Item = &'a RightSizingPolicy>,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    kind: WorkloadKind,
    namespace_labels: Option<&BTreeMap<String, String>>,
) -> Vec<ObjectRef<RightSizingPolicy>> {
    policies
        .into_iter()
        .filter(|p| target_matches(&p.spec.target, namespace, labels, kind, namespace_labels))
        .map(ObjectRef::from_obj)
        .collect()
}

/// Event mapper backed by the controller's policy cache and a namespace cache
#[derive(Clone)]
pub struct EventMapper {
    policies: Store<RightSizingPolicy>,
    namespaces: Store<Namespace>,
    changes: Arc<ResourceChangeFilter>,
}

impl EventMapper {
    pub fn new(policies: Store<RightSizingPolicy>, namespaces: Store<Namespace>) -> Self {
        Self {
            policies,
            namespaces,
            changes: Arc::new(ResourceChangeFilter::new()),
        }
    }

    fn namespace_labels(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        self.namespaces
            .get(&ObjectRef::new(namespace))
            .map(|ns| ns.labels().clone())
    }

    fn map(
        &self,
        uid: Option<String>,
        deleting: bool,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        kind: WorkloadKind,
        containers: &[Container],
    ) -> Vec<ObjectRef<RightSizingPolicy>> {
        let Some(uid) = uid else {
            return Vec::new();
        };
        if deleting {
            self.changes.forget(&uid);
            return Vec::new();
        }
        if !self.changes.observe(&uid, containers) {
            return Vec::new();
        }

        let ns_labels = self.namespace_labels(namespace);
        let policies = self.policies.state();
        let matched = matching_policies(
            policies.iter().map(|p| p.as_ref()),
            namespace,
            labels,
            kind,
            ns_labels.as_ref(),
        );
        trace!(namespace = %namespace, matched = matched.len(), "Mapped resource change");
        matched
    }

    pub fn pod_to_policies(&self, pod: Pod) -> Vec<ObjectRef<RightSizingPolicy>> {
        let containers = pod
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default();
        self.map(
            pod.uid(),
            pod.metadata.deletion_timestamp.is_some(),
            &pod.namespace().unwrap_or_default(),
            pod.labels(),
            workload_kind_of(&pod),
            containers,
        )
    }

    pub fn workload_to_policies(&self, workload: Workload) -> Vec<ObjectRef<RightSizingPolicy>> {
        let (uid, deleting) = match &workload {
            Workload::Deployment(d) => (d.uid(), d.metadata.deletion_timestamp.is_some()),
            Workload::StatefulSet(s) => (s.uid(), s.metadata.deletion_timestamp.is_some()),
            Workload::DaemonSet(d) => (d.uid(), d.metadata.deletion_timestamp.is_some()),
        };
        self.map(
            uid,
            deleting,
            &workload.namespace(),
            &workload.template_labels(),
            workload.kind(),
            workload.containers(),
        )
    }
}
