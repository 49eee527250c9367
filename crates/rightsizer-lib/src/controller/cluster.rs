//! Cluster access used by the reconcile pass
//!
//! [`ClusterApi`] is the only way the controller touches the API server
//! during a pass. [`KubeCluster`] backs it with a live client.

use super::workload::Workload;
use crate::crd::RightSizingPolicy;
use crate::error::{Error, Result};
use crate::models::WorkloadKind;
use crate::selector::Selector;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// `None` when the policy no longer exists
    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<RightSizingPolicy>>;

    /// Replace the status subresource. The policy's resourceVersion guards
    /// against concurrent writers; a stale version yields a conflict.
    async fn replace_policy_status(&self, policy: &RightSizingPolicy) -> Result<RightSizingPolicy>;

    async fn list_namespaces(&self, selector: &Selector) -> Result<Vec<Namespace>>;

    /// List pods in one namespace, or across the cluster when `namespace` is `None`
    async fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Pod>>;

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>>;

    /// `None` when the workload is gone or its kind cannot be updated
    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>>;

    async fn replace_workload(&self, workload: &Workload) -> Result<Workload>;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn list_params(selector: &Selector) -> ListParams {
    if selector.is_everything() {
        ListParams::default()
    } else {
        ListParams::default().labels(&selector.to_string())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<RightSizingPolicy>> {
        let api: Api<RightSizingPolicy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_policy_status(&self, policy: &RightSizingPolicy) -> Result<RightSizingPolicy> {
        let namespace = policy
            .namespace()
            .ok_or_else(|| Error::InvalidPolicy("policy has no namespace".to_string()))?;
        let api: Api<RightSizingPolicy> = Api::namespaced(self.client.clone(), &namespace);
        let data = serde_json::to_vec(policy)?;
        Ok(api
            .replace_status(&policy.name_any(), &PostParams::default(), data)
            .await?)
    }

    async fn list_namespaces(&self, selector: &Selector) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.list(&list_params(selector)).await?.items)
    }

    async fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Pod>> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&list_params(selector)).await?.items)
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>> {
        let client = self.client.clone();
        let workload = match kind {
            WorkloadKind::Deployment => Api::<Deployment>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::Deployment),
            WorkloadKind::StatefulSet => Api::<StatefulSet>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::StatefulSet),
            WorkloadKind::DaemonSet => Api::<DaemonSet>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::DaemonSet),
            _ => None,
        };
        Ok(workload)
    }

    async fn replace_workload(&self, workload: &Workload) -> Result<Workload> {
        let client = self.client.clone();
        let namespace = workload.namespace();
        let name = workload.name();
        let pp = PostParams::default();
        let updated = match workload {
            Workload::Deployment(d) => Workload::Deployment(
                Api::<Deployment>::namespaced(client, &namespace)
                    .replace(&name, &pp, d)
                    .await?,
            ),
            Workload::StatefulSet(s) => Workload::StatefulSet(
                Api::<StatefulSet>::namespaced(client, &namespace)
                    .replace(&name, &pp, s)
                    .await?,
            ),
            Workload::DaemonSet(d) => Workload::DaemonSet(
                Api::<DaemonSet>::namespaced(client, &namespace)
                    .replace(&name, &pp, d)
                    .await?,
            ),
        };
        Ok(updated)
    }
}
