//! Recommendation engine
//!
//! Turns per-pod CPU and memory usage histories into sized resource
//! requests and limits. The engine is stateless: every call is a pure
//! function of the samples, the policy thresholds and the fixed defaults
//! in [`EngineConfig`], so one instance can be shared by all reconcile
//! workers.
//!
//! For each resource the engine takes the configured percentile of the
//! samples, adds the safety margin, clamps to the configured bounds and
//! scores confidence from the coefficient of variation. A pod whose
//! combined confidence falls below the gate gets no recommendation.

pub mod stats;

use crate::cost::CostEstimator;
use crate::crd::{PodRecommendation, PodReference, ResourceThresholds};
use crate::error::{Error, Result};
use crate::models::{PodMetrics, ResourceUsage, WorkloadMetrics};
use crate::quantity::{self, CPU, MEMORY};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Fixed engine defaults
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Percentile used when the policy leaves it unset
    pub default_percentile: i32,
    /// Safety margin (percent) used when the policy leaves it unset
    pub default_safety_margin: i32,
    /// Pods scoring below this are dropped
    pub confidence_threshold: i32,
    /// Minimum samples per resource
    pub min_data_points: usize,
    /// CPU request = limit x multiplier
    pub cpu_request_multiplier: f64,
    /// Memory request = limit x multiplier
    pub memory_request_multiplier: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_percentile: 95,
            default_safety_margin: 20,
            confidence_threshold: 70,
            min_data_points: 10,
            cpu_request_multiplier: 0.8,
            memory_request_multiplier: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl ResourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => CPU,
            ResourceKind::Memory => MEMORY,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Cpu => "CPU",
            ResourceKind::Memory => "Memory",
        })
    }
}

/// Sizing result for one resource of one pod
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceAnalysis {
    pub kind: ResourceKind,
    /// Recommended limit in base units (cores or bytes)
    pub limit: f64,
    /// Percentile setting that was applied
    pub percentile: i32,
    /// Observed value at that percentile
    pub percentile_value: f64,
    pub confidence: i32,
    pub data_points: usize,
}

impl ResourceAnalysis {
    fn reason(&self) -> String {
        format!(
            "{}: Based on {}th percentile of {} data points",
            self.kind, self.percentile, self.data_points
        )
    }
}

/// Outcome of sizing one pod
#[derive(Debug, Clone)]
pub enum PodOutcome {
    Recommended(Box<PodRecommendation>),
    /// Confidence below the gate; nothing is emitted for the pod
    Suppressed { confidence: i32 },
}

/// Everything produced for one workload
#[derive(Debug, Clone, Default)]
pub struct WorkloadRecommendations {
    pub recommendations: Vec<PodRecommendation>,
    pub suppressed: usize,
    pub insufficient_data: usize,
}

#[derive(Clone)]
pub struct RecommendationEngine {
    config: EngineConfig,
    cost: Arc<dyn CostEstimator>,
}

impl RecommendationEngine {
    pub fn new(cost: Arc<dyn CostEstimator>) -> Self {
        Self::with_config(EngineConfig::default(), cost)
    }

    pub fn with_config(config: EngineConfig, cost: Arc<dyn CostEstimator>) -> Self {
        Self { config, cost }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn percentile_for(&self, kind: ResourceKind, thresholds: &ResourceThresholds) -> i32 {
        let configured = match kind {
            ResourceKind::Cpu => thresholds.cpu_utilization_percentile,
            ResourceKind::Memory => thresholds.memory_utilization_percentile,
        };
        configured.unwrap_or(self.config.default_percentile)
    }

    fn safety_margin(&self, thresholds: &ResourceThresholds) -> i32 {
        thresholds
            .safety_margin
            .unwrap_or(self.config.default_safety_margin)
    }

    fn bounds(
        &self,
        kind: ResourceKind,
        thresholds: &ResourceThresholds,
    ) -> Result<(Option<f64>, Option<f64>)> {
        let (min, max) = match kind {
            ResourceKind::Cpu => (&thresholds.min_cpu, &thresholds.max_cpu),
            ResourceKind::Memory => (&thresholds.min_memory, &thresholds.max_memory),
        };
        // A zero quantity means "no bound"
        let parse = |q: &Option<Quantity>| -> Result<Option<f64>> {
            match q {
                Some(q) => Ok(Some(quantity::parse(q)?).filter(|v| *v != 0.0)),
                None => Ok(None),
            }
        };
        Ok((parse(min)?, parse(max)?))
    }

    /// Size one resource from its usage samples
    pub fn analyze(
        &self,
        kind: ResourceKind,
        samples: &[ResourceUsage],
        thresholds: &ResourceThresholds,
    ) -> Result<ResourceAnalysis> {
        let mut values: Vec<f64> = samples
            .iter()
            .map(|s| s.value)
            .filter(|v| v.is_finite())
            .collect();

        if values.len() < self.config.min_data_points {
            return Err(Error::InsufficientData {
                resource: kind.name(),
                got: values.len(),
                required: self.config.min_data_points,
            });
        }

        values.sort_by(f64::total_cmp);

        let percentile = self.percentile_for(kind, thresholds);
        let percentile_value = stats::percentile(&values, f64::from(percentile));
        let margin = f64::from(self.safety_margin(thresholds));
        let mut limit = percentile_value * (1.0 + margin / 100.0);

        let (min, max) = self.bounds(kind, thresholds)?;
        if let Some(min) = min {
            if limit < min {
                limit = min;
            }
        }
        if let Some(max) = max {
            if limit > max {
                limit = max;
            }
        }

        Ok(ResourceAnalysis {
            kind,
            limit,
            percentile,
            percentile_value,
            confidence: stats::confidence(&values),
            data_points: values.len(),
        })
    }

    /// Size one pod. `current` is the pod's present requirements, used only
    /// for the savings annotation.
    pub fn recommend_pod(
        &self,
        pod: &PodMetrics,
        thresholds: &ResourceThresholds,
        current: Option<&ResourceRequirements>,
    ) -> Result<PodOutcome> {
        let cpu = self.analyze(ResourceKind::Cpu, &pod.cpu_usage, thresholds)?;
        let memory = self.analyze(ResourceKind::Memory, &pod.memory_usage, thresholds)?;

        let confidence = cpu.confidence.min(memory.confidence);
        debug!(
            pod = %pod.pod_name,
            namespace = %pod.namespace,
            cpu_confidence = cpu.confidence,
            memory_confidence = memory.confidence,
            confidence = confidence,
            "Calculated confidence scores"
        );
        if confidence < self.config.confidence_threshold {
            return Ok(PodOutcome::Suppressed { confidence });
        }

        let recommended = self.build_requirements(&cpu, &memory);
        let current = current.cloned().unwrap_or_default();
        let potential_savings = self.cost.estimate_savings(&current, &recommended);

        Ok(PodOutcome::Recommended(Box::new(PodRecommendation {
            pod_reference: PodReference {
                name: pod.pod_name.clone(),
                namespace: pod.namespace.clone(),
                ..Default::default()
            },
            current_resources: current,
            recommended_resources: recommended,
            reason: self.reason(&cpu, &memory, thresholds),
            confidence,
            potential_savings,
            applied: false,
            applied_time: None,
        })))
    }

    /// Size every pod of a workload. Pods lacking data or confidence are
    /// counted and skipped; the workload itself fails only when no pod
    /// metrics were returned at all.
    pub fn recommend_workload<F>(
        &self,
        workload: &WorkloadMetrics,
        thresholds: &ResourceThresholds,
        current: F,
    ) -> Result<WorkloadRecommendations>
    where
        F: Fn(&str) -> Option<ResourceRequirements>,
    {
        if workload.pods.is_empty() {
            return Err(Error::MetricsUnavailable {
                target: format!(
                    "{}/{}/{}",
                    workload.namespace, workload.workload_kind, workload.workload_name
                ),
                reason: "no pod metrics provided".to_string(),
            });
        }

        let mut out = WorkloadRecommendations::default();
        for pod in &workload.pods {
            let pod_current = current(&pod.pod_name);
            match self.recommend_pod(pod, thresholds, pod_current.as_ref()) {
                Ok(PodOutcome::Recommended(mut rec)) => {
                    rec.pod_reference.workload_type = workload.workload_kind.to_string();
                    rec.pod_reference.workload_name = workload.workload_name.clone();
                    out.recommendations.push(*rec);
                }
                Ok(PodOutcome::Suppressed { confidence }) => {
                    debug!(
                        pod = %pod.pod_name,
                        confidence = confidence,
                        threshold = self.config.confidence_threshold,
                        "Skipping recommendation due to low confidence"
                    );
                    out.suppressed += 1;
                }
                Err(Error::InsufficientData { resource, got, required }) => {
                    debug!(
                        pod = %pod.pod_name,
                        resource = resource,
                        got = got,
                        required = required,
                        "Insufficient data for recommendation"
                    );
                    out.insufficient_data += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn build_requirements(
        &self,
        cpu: &ResourceAnalysis,
        memory: &ResourceAnalysis,
    ) -> ResourceRequirements {
        let cpu_limit_milli = (cpu.limit * 1000.0) as i64;
        let cpu_request_milli = (cpu_limit_milli as f64 * self.config.cpu_request_multiplier) as i64;

        let memory_limit = memory.limit as i64;
        let memory_request = (memory_limit as f64 * self.config.memory_request_multiplier) as i64;

        ResourceRequirements {
            requests: Some(BTreeMap::from([
                (CPU.to_string(), quantity::cpu_from_millis(cpu_request_milli)),
                (MEMORY.to_string(), quantity::memory_from_bytes(memory_request as f64)),
            ])),
            limits: Some(BTreeMap::from([
                (CPU.to_string(), quantity::cpu_from_millis(cpu_limit_milli)),
                (MEMORY.to_string(), quantity::memory_from_bytes(memory_limit as f64)),
            ])),
            ..Default::default()
        }
    }

    fn reason(
        &self,
        cpu: &ResourceAnalysis,
        memory: &ResourceAnalysis,
        thresholds: &ResourceThresholds,
    ) -> String {
        format!(
            "Recommendations based on historical usage analysis. {}. {}. Applied {}% safety margin.",
            cpu.reason(),
            memory.reason(),
            self.safety_margin(thresholds)
        )
    }
}
