//! Writing recommendations back to workloads

use super::Context;
use crate::crd::{PodRecommendation, RightSizingPolicySpec, UpdateStrategy};
use crate::error::{Error, Result};
use crate::models::{WorkloadKind, WorkloadRef};
use crate::quantity::{self, CPU, MEMORY};
use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Apply one template per workload and return how many workloads changed.
///
/// The first recommendation of each workload is its template. Missing
/// workloads and kinds that cannot be updated are skipped. Write failures do
/// not stop the remaining workloads but fail the call once all were tried.
pub async fn apply_recommendations(
    ctx: &Context,
    policy_key: &str,
    spec: &RightSizingPolicySpec,
    recommendations: &[PodRecommendation],
) -> Result<usize> {
    if spec.update_policy.strategy == UpdateStrategy::Manual {
        info!(
            policy = %policy_key,
            recommendations = recommendations.len(),
            "Manual strategy, leaving workloads unchanged"
        );
        return Ok(0);
    }

    let mut templates: BTreeMap<WorkloadRef, &ResourceRequirements> = BTreeMap::new();
    for rec in recommendations {
        let Some(kind) = WorkloadKind::parse(&rec.pod_reference.workload_type) else {
            continue;
        };
        let workload = WorkloadRef::new(
            rec.pod_reference.namespace.clone(),
            kind,
            rec.pod_reference.workload_name.clone(),
        );
        templates
            .entry(workload)
            .or_insert(&rec.recommended_resources);
    }

    let mut updated = 0;
    let mut failures = Vec::new();

    for (workload, template) in templates {
        if !workload.kind.is_updatable() {
            ctx.logger.log_workload_skipped(
                policy_key,
                &workload.to_string(),
                "workload type not supported for updates",
            );
            continue;
        }

        match apply_to_workload(ctx, spec, &workload, template).await {
            Ok(Some(containers)) => {
                updated += 1;
                ctx.metrics.inc_workload_updates(workload.kind.as_str());
                ctx.logger
                    .log_workload_updated(policy_key, &workload, containers);
            }
            Ok(None) => {
                debug!(workload = %workload, "No resource changes needed");
            }
            Err(e) if e.is_not_found() => {
                ctx.logger
                    .log_workload_skipped(policy_key, &workload.to_string(), "workload not found");
            }
            Err(e) => {
                warn!(workload = %workload, error = %e, "Failed to update workload");
                failures.push((workload, e));
            }
        }
    }

    match failures.len() {
        0 => Ok(updated),
        1 => {
            let (workload, e) = failures.remove(0);
            Err(Error::WorkloadUpdate {
                workload: workload.to_string(),
                reason: e.to_string(),
            })
        }
        n => Err(Error::WorkloadUpdate {
            workload: format!("{} workloads", n),
            reason: failures
                .iter()
                .map(|(w, e)| format!("{}: {}", w, e))
                .collect::<Vec<_>>()
                .join("; "),
        }),
    }
}

/// Returns the number of containers rewritten, or `None` when the workload
/// already matches the template closely enough.
async fn apply_to_workload(
    ctx: &Context,
    spec: &RightSizingPolicySpec,
    target: &WorkloadRef,
    template: &ResourceRequirements,
) -> Result<Option<usize>> {
    let threshold = spec.thresholds.min_change_threshold();
    let mut attempt = 0;

    loop {
        let mut workload = ctx
            .cluster
            .get_workload(target.kind, &target.namespace, &target.name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: target.kind.as_str(),
                name: format!("{}/{}", target.namespace, target.name),
            })?;

        if !needs_update(workload.containers(), template, threshold) {
            return Ok(None);
        }

        // Immediate and gradual write the same object; the rollout itself
        // follows the workload's own update strategy.
        let Some(containers) = workload.containers_mut() else {
            return Ok(None);
        };
        let targets = container_targets(containers, template);
        for (container, target) in containers.iter_mut().zip(&targets) {
            container.resources = Some(merge_resources(container.resources.as_ref(), target));
        }
        let count = containers.len();

        match ctx.cluster.replace_workload(&workload).await {
            Ok(_) => return Ok(Some(count)),
            Err(e) if e.is_conflict() && attempt < ctx.settings.status_write_retries => {
                attempt += 1;
                debug!(workload = %target, attempt = attempt, "Workload update conflict, refetching");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Overlay the template's CPU and memory values, keeping any other resources
pub fn merge_resources(
    current: Option<&ResourceRequirements>,
    template: &ResourceRequirements,
) -> ResourceRequirements {
    let mut merged = current.cloned().unwrap_or_default();
    if let Some(requests) = &template.requests {
        let target = merged.requests.get_or_insert_with(BTreeMap::new);
        for (name, q) in requests {
            target.insert(name.clone(), q.clone());
        }
    }
    if let Some(limits) = &template.limits {
        let target = merged.limits.get_or_insert_with(BTreeMap::new);
        for (name, q) in limits {
            target.insert(name.clone(), q.clone());
        }
    }
    merged
}

/// Split a pod-level template across the pod's containers.
///
/// Each CPU and memory request or limit is divided in proportion to the
/// containers' current values for it. When no container declares the value
/// it is divided evenly; a container without a value among others that have
/// one gets none.
pub fn container_targets(
    containers: &[Container],
    template: &ResourceRequirements,
) -> Vec<ResourceRequirements> {
    if containers.len() <= 1 {
        return vec![template.clone(); containers.len()];
    }

    let current: Vec<ResourceRequirements> = containers
        .iter()
        .map(|c| c.resources.clone().unwrap_or_default())
        .collect();
    let mut targets = vec![ResourceRequirements::default(); containers.len()];

    for name in [CPU, MEMORY] {
        if let Some(wanted) = quantity::request(template, name) {
            let weights: Vec<f64> = current
                .iter()
                .map(|r| quantity::request(r, name).unwrap_or(0.0))
                .collect();
            for (target, value) in targets.iter_mut().zip(split(wanted, &weights)) {
                if let Some(q) = to_quantity(name, value) {
                    target.requests.get_or_insert_with(BTreeMap::new).insert(name.to_string(), q);
                }
            }
        }
        if let Some(wanted) = quantity::limit(template, name) {
            let weights: Vec<f64> = current
                .iter()
                .map(|r| quantity::limit(r, name).unwrap_or(0.0))
                .collect();
            for (target, value) in targets.iter_mut().zip(split(wanted, &weights)) {
                if let Some(q) = to_quantity(name, value) {
                    target.limits.get_or_insert_with(BTreeMap::new).insert(name.to_string(), q);
                }
            }
        }
    }
    targets
}

fn split(total: f64, weights: &[f64]) -> Vec<f64> {
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 {
        weights.iter().map(|w| total * w / sum).collect()
    } else {
        vec![total / weights.len() as f64; weights.len()]
    }
}

fn to_quantity(name: &str, value: f64) -> Option<Quantity> {
    if name == CPU {
        let milli = (value * 1000.0).round() as i64;
        (milli > 0).then(|| quantity::cpu_from_millis(milli))
    } else {
        let bytes = value.round();
        (bytes > 0.0).then(|| quantity::memory_from_bytes(bytes))
    }
}

/// Whether any container differs from its share of the template by at
/// least `min_change_pct` percent in some CPU or memory request or limit
pub fn needs_update(
    containers: &[Container],
    template: &ResourceRequirements,
    min_change_pct: f64,
) -> bool {
    let targets = container_targets(containers, template);
    containers.iter().zip(&targets).any(|(c, target)| {
        let current = c.resources.clone().unwrap_or_default();
        let merged = merge_resources(Some(&current), target);
        !quantity::resources_equal(&current, &merged)
            && significant_change(&current, target, min_change_pct)
    })
}

fn significant_change(
    current: &ResourceRequirements,
    template: &ResourceRequirements,
    min_change_pct: f64,
) -> bool {
    let getters: [fn(&ResourceRequirements, &str) -> Option<f64>; 2] =
        [quantity::request, quantity::limit];

    getters.iter().any(|get| {
        [CPU, MEMORY].iter().any(|name| {
            let Some(wanted) = get(template, name) else {
                return false;
            };
            match get(current, name) {
                None => true,
                Some(have) if have == 0.0 => wanted != 0.0,
                Some(have) => {
                    let change = (wanted - have).abs() / have * 100.0;
                    change > 0.0 && change >= min_change_pct
                }
            }
        })
    })
}
