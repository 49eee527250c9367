//! metrics.k8s.io backend
//!
//! The resource metrics API only reports the most recent scrape, so every
//! series returned here has at most one sample. Pods are attributed to a
//! workload by name prefix since the API carries no owner information.

use super::{time_range, MetricsProvider};
use crate::error::{Error, Result};
use crate::models::{PodMetrics, ResourceUsage, WorkloadKind, WorkloadMetrics};
use crate::quantity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::Client;
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;

const API_PREFIX: &str = "/apis/metrics.k8s.io/v1beta1";

#[derive(Debug, Deserialize)]
struct PodMetricsList {
    #[serde(default)]
    items: Vec<PodMetricsItem>,
}

#[derive(Debug, Deserialize)]
struct PodMetricsItem {
    metadata: ItemMetadata,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    containers: Vec<ContainerUsage>,
}

#[derive(Debug, Deserialize)]
struct ItemMetadata {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ContainerUsage {
    usage: UsageValues,
}

#[derive(Debug, Deserialize)]
struct UsageValues {
    #[serde(default)]
    cpu: Option<String>,
    #[serde(default)]
    memory: Option<String>,
}

pub struct MetricsServerProvider {
    client: Client,
}

impl MetricsServerProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get<T: DeserializeOwned>(&self, path: String) -> Result<T> {
        let request = http::Request::builder()
            .method("GET")
            .uri(&path)
            .body(Vec::new())
            .map_err(|e| Error::MetricsUnavailable {
                target: path.clone(),
                reason: format!("failed to build request: {}", e),
            })?;

        self.client
            .request::<T>(request)
            .await
            .map_err(|e| Error::MetricsUnavailable {
                target: path,
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl MetricsProvider for MetricsServerProvider {
    async fn get_workload_metrics(
        &self,
        namespace: &str,
        workload_name: &str,
        workload_kind: WorkloadKind,
        window: Duration,
    ) -> Result<WorkloadMetrics> {
        let (start, end) = time_range(window)?;
        let list: PodMetricsList = self
            .get(format!("{}/namespaces/{}/pods", API_PREFIX, namespace))
            .await?;

        let mut pods: Vec<PodMetrics> = list
            .items
            .iter()
            .filter(|item| belongs_to(&item.metadata.name, workload_name, workload_kind))
            .map(|item| to_pod_metrics(item, namespace, start, end))
            .collect();
        pods.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));

        Ok(WorkloadMetrics {
            workload_name: workload_name.to_string(),
            workload_kind,
            namespace: namespace.to_string(),
            pods,
            start,
            end,
        })
    }

    async fn get_pod_metrics(
        &self,
        namespace: &str,
        pod_name: &str,
        window: Duration,
    ) -> Result<PodMetrics> {
        let (start, end) = time_range(window)?;
        let item: PodMetricsItem = self
            .get(format!(
                "{}/namespaces/{}/pods/{}",
                API_PREFIX, namespace, pod_name
            ))
            .await?;
        Ok(to_pod_metrics(&item, namespace, start, end))
    }

    fn name(&self) -> &'static str {
        "metrics-server"
    }
}

/// Whether a pod name looks like it was generated for the workload.
///
/// Generated names are `<workload>-<segments>` where the segment shape is
/// fixed per kind, so `web-api-7d9f8-abcde` never counts as a pod of `web`.
fn belongs_to(pod_name: &str, workload_name: &str, kind: WorkloadKind) -> bool {
    if kind == WorkloadKind::Pod {
        return pod_name == workload_name;
    }
    let Some(suffix) = pod_name
        .strip_prefix(workload_name)
        .and_then(|rest| rest.strip_prefix('-'))
    else {
        return false;
    };
    let segments: Vec<&str> = suffix.split('-').collect();
    match (kind, segments.as_slice()) {
        // <set>-<ordinal>
        (WorkloadKind::StatefulSet, [ordinal]) => is_digits(ordinal),
        // <deployment>-<replicaset hash>-<pod hash>
        (WorkloadKind::Deployment, [rs_hash, pod_hash]) => {
            is_name_hash(rs_hash) && is_name_hash(pod_hash)
        }
        // <cronjob>-<schedule time>-<pod hash>
        (WorkloadKind::CronJob, [scheduled, pod_hash]) => {
            is_digits(scheduled) && is_name_hash(pod_hash)
        }
        (WorkloadKind::DaemonSet | WorkloadKind::Job, [pod_hash]) => {
            pod_hash.len() == 5 && is_name_hash(pod_hash)
        }
        _ => false,
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn is_name_hash(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

fn to_pod_metrics(
    item: &PodMetricsItem,
    namespace: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> PodMetrics {
    let timestamp = item
        .timestamp
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(end);

    let sum = |pick: fn(&UsageValues) -> Option<&String>| -> Option<f64> {
        let values: Vec<f64> = item
            .containers
            .iter()
            .filter_map(|c| pick(&c.usage))
            .filter_map(|q| quantity::parse_str(q).ok())
            .collect();
        (!values.is_empty()).then(|| values.iter().sum())
    };

    PodMetrics {
        pod_name: item.metadata.name.clone(),
        namespace: namespace.to_string(),
        cpu_usage: sum(|u| u.cpu.as_ref())
            .map(|v| ResourceUsage::cores(timestamp, v))
            .into_iter()
            .collect(),
        memory_usage: sum(|u| u.memory.as_ref())
            .map(|v| ResourceUsage::bytes(timestamp, v))
            .into_iter()
            .collect(),
        start,
        end,
    }
}
