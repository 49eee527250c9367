//! Prometheus range-query backend

use super::{time_range, MetricsProvider};
use crate::error::{Error, Result};
use crate::models::{PodMetrics, ResourceUsage, WorkloadKind, WorkloadMetrics};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Credentials for the Prometheus endpoint
#[derive(Debug, Clone, Default)]
pub enum PrometheusAuth {
    #[default]
    None,
    Basic { username: String, password: String },
    Bearer(String),
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    metric: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

pub struct PrometheusProvider {
    base_url: Url,
    client: Client,
    auth: PrometheusAuth,
    step: Duration,
}

impl PrometheusProvider {
    pub fn new(url: &str, auth: PrometheusAuth, timeout: Duration, step: Duration) -> Result<Self> {
        // A trailing slash keeps any path prefix when joining the API path
        let normalized = format!("{}/", url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|e| Error::MetricsUnavailable {
                target: url.to_string(),
                reason: format!("invalid Prometheus URL: {}", e),
            })?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url,
            client,
            auth,
            step,
        })
    }

    fn add_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            PrometheusAuth::None => req,
            PrometheusAuth::Basic { username, password } => {
                req.basic_auth(username, Some(password))
            }
            PrometheusAuth::Bearer(token) => req.bearer_auth(token),
        }
    }

    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Series>> {
        let url = self
            .base_url
            .join("api/v1/query_range")
            .map_err(|e| Error::MetricsUnavailable {
                target: self.base_url.to_string(),
                reason: e.to_string(),
            })?;

        debug!(query = %query, "Querying Prometheus");

        let req = self.client.get(url).query(&[
            ("query", query.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
            ("step", format!("{}s", self.step.as_secs().max(1))),
        ]);
        let response = self.add_auth(req).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::MetricsUnavailable {
                target: query.to_string(),
                reason: format!("HTTP {}: {}", status, body),
            });
        }

        let body: QueryResponse = response.json().await?;
        if body.status != "success" {
            return Err(Error::MetricsUnavailable {
                target: query.to_string(),
                reason: body.error.unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        Ok(body.data.map(|d| d.result).unwrap_or_default())
    }
}

#[async_trait]
impl MetricsProvider for PrometheusProvider {
    async fn get_workload_metrics(
        &self,
        namespace: &str,
        workload_name: &str,
        workload_kind: WorkloadKind,
        window: Duration,
    ) -> Result<WorkloadMetrics> {
        let (start, end) = time_range(window)?;
        let selector = format!(
            r#"namespace="{}",{},container!="POD",container!="""#,
            escape(namespace),
            workload_selector(workload_name, workload_kind)
        );

        let cpu = self
            .query_range(
                &format!(
                    "sum by (pod) (rate(container_cpu_usage_seconds_total{{{}}}[5m]))",
                    selector
                ),
                start,
                end,
            )
            .await?;
        let memory = self
            .query_range(
                &format!(
                    "sum by (pod) (container_memory_working_set_bytes{{{}}})",
                    selector
                ),
                start,
                end,
            )
            .await?;

        // Ordered by pod name
        let mut pods: BTreeMap<String, PodMetrics> = BTreeMap::new();
        let empty = |pod: &str| PodMetrics {
            pod_name: pod.to_string(),
            namespace: namespace.to_string(),
            cpu_usage: Vec::new(),
            memory_usage: Vec::new(),
            start,
            end,
        };

        for series in &cpu {
            if let Some(pod) = series.metric.get("pod").filter(|p| !p.is_empty()) {
                pods.entry(pod.clone())
                    .or_insert_with(|| empty(pod))
                    .cpu_usage = to_usage(&series.values, ResourceUsage::cores);
            }
        }
        for series in &memory {
            if let Some(pod) = series.metric.get("pod").filter(|p| !p.is_empty()) {
                pods.entry(pod.clone())
                    .or_insert_with(|| empty(pod))
                    .memory_usage = to_usage(&series.values, ResourceUsage::bytes);
            }
        }

        Ok(WorkloadMetrics {
            workload_name: workload_name.to_string(),
            workload_kind,
            namespace: namespace.to_string(),
            pods: pods.into_values().collect(),
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
        let selector = format!(
            r#"namespace="{}",pod="{}",container!="POD",container!="""#,
            escape(namespace),
            escape(pod_name)
        );

        let cpu = self
            .query_range(
                &format!(
                    "rate(container_cpu_usage_seconds_total{{{}}}[5m])",
                    selector
                ),
                start,
                end,
            )
            .await?;
        let memory = self
            .query_range(
                &format!("container_memory_working_set_bytes{{{}}}", selector),
                start,
                end,
            )
            .await?;

        Ok(PodMetrics {
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            cpu_usage: sum_series(&cpu, ResourceUsage::cores),
            memory_usage: sum_series(&memory, ResourceUsage::bytes),
            start,
            end,
        })
    }

    fn name(&self) -> &'static str {
        "prometheus"
    }
}

/// Label matcher identifying a workload's pods in cAdvisor metrics
fn workload_selector(name: &str, kind: WorkloadKind) -> String {
    let label = match kind {
        WorkloadKind::Deployment => "deployment",
        WorkloadKind::StatefulSet => "statefulset",
        WorkloadKind::DaemonSet => "daemonset",
        WorkloadKind::Job => "job_name",
        _ => "app",
    };
    format!(r#"{}="{}""#, label, escape(name))
}

/// Escape a value for a PromQL double-quoted string literal
fn escape(value: &str) -> String {
    value.replace('\\', r"\\").replace('"', r#"\""#)
}

fn timestamp(secs: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
}

fn to_usage(
    values: &[(f64, String)],
    make: fn(DateTime<Utc>, f64) -> ResourceUsage,
) -> Vec<ResourceUsage> {
    values
        .iter()
        .filter_map(|(ts, v)| Some(make(timestamp(*ts)?, v.parse().ok()?)))
        .collect()
}

/// Collapse per-container series into one series by summing equal timestamps
fn sum_series(
    series: &[Series],
    make: fn(DateTime<Utc>, f64) -> ResourceUsage,
) -> Vec<ResourceUsage> {
    let mut totals: BTreeMap<i64, f64> = BTreeMap::new();
    for s in series {
        for (ts, v) in &s.values {
            if let Ok(v) = v.parse::<f64>() {
                *totals.entry((ts * 1000.0) as i64).or_default() += v;
            }
        }
    }
    totals
        .into_iter()
        .filter_map(|(ms, v)| Some(make(Utc.timestamp_millis_opt(ms).single()?, v)))
        .collect()
}
