//! Policy validation
//!
//! Checked at the start of every reconcile pass. All violations are
//! collected and reported together in one [`Error::InvalidPolicy`].

use crate::crd::{AuthType, MetricsSourceType, RightSizingPolicySpec};
use crate::duration::parse_duration;
use crate::error::{Error, Result};
use crate::models::WorkloadKind;
use crate::quantity;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::time::Duration;

const MIN_WINDOW: Duration = Duration::from_secs(60 * 60);
const MAX_WINDOW: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Validate a policy spec, returning every violation found
pub fn validate(spec: &RightSizingPolicySpec) -> Result<()> {
    let mut errs = Vec::new();

    validate_target(spec, &mut errs);
    validate_thresholds(spec, &mut errs);
    validate_analysis_window(spec, &mut errs);
    validate_schedule(spec, &mut errs);
    validate_update_policy(spec, &mut errs);
    validate_metrics_source(spec, &mut errs);

    if errs.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidPolicy(errs.join("; ")))
    }
}

fn validate_target(spec: &RightSizingPolicySpec, errs: &mut Vec<String>) {
    let target = &spec.target;

    if target.namespace().is_none()
        && target.label_selector.is_none()
        && target.namespace_selector.is_none()
    {
        errs.push(
            "spec.target: must specify at least one of: namespace, labelSelector, or namespaceSelector"
                .to_string(),
        );
    }

    if target.namespace().is_some() && target.namespace_selector.is_some() {
        errs.push("spec.target.namespace: cannot specify both namespace and namespaceSelector".to_string());
    }

    for (i, t) in target.include_workload_types.iter().enumerate() {
        let valid = WorkloadKind::parse(t).map_or(false, |k| WorkloadKind::FILTERABLE.contains(&k));
        if !valid {
            errs.push(format!(
                "spec.target.includeWorkloadTypes[{}]: {:?} must be one of: Deployment, StatefulSet, DaemonSet, Job, CronJob",
                i, t
            ));
        }
    }
}

fn check_range(errs: &mut Vec<String>, field: &str, value: Option<i32>, max: i32, unit: &str) {
    if let Some(v) = value {
        if !(0..=max).contains(&v) {
            errs.push(format!(
                "spec.thresholds.{}: {} must be between 0 and {}{}",
                field, v, max, unit
            ));
        }
    }
}

fn check_bounds(errs: &mut Vec<String>, name: &str, min: &Option<Quantity>, max: &Option<Quantity>) {
    let parse = |field: &str, q: &Option<Quantity>, errs: &mut Vec<String>| -> Option<f64> {
        let q = q.as_ref()?;
        match quantity::parse(q) {
            Ok(v) => Some(v).filter(|v| *v != 0.0),
            Err(e) => {
                errs.push(format!("spec.thresholds.{}: {}", field, e));
                None
            }
        }
    };
    let min_field = format!("min{}", name);
    let max_field = format!("max{}", name);
    let lo = parse(&min_field, min, errs);
    let hi = parse(&max_field, max, errs);
    if let (Some(lo), Some(hi)) = (lo, hi) {
        if lo > hi {
            errs.push(format!(
                "spec.thresholds.{}: {} cannot be greater than {}",
                min_field, min_field, max_field
            ));
        }
    }
}

fn validate_thresholds(spec: &RightSizingPolicySpec, errs: &mut Vec<String>) {
    let t = &spec.thresholds;
    check_range(errs, "cpuUtilizationPercentile", t.cpu_utilization_percentile, 100, "");
    check_range(errs, "memoryUtilizationPercentile", t.memory_utilization_percentile, 100, "");
    check_range(errs, "safetyMargin", t.safety_margin, 1000, " (percentage)");
    check_range(errs, "minChangeThreshold", t.min_change_threshold, 100, " (percentage)");
    check_bounds(errs, "Cpu", &t.min_cpu, &t.max_cpu);
    check_bounds(errs, "Memory", &t.min_memory, &t.max_memory);
}

fn validate_analysis_window(spec: &RightSizingPolicySpec, errs: &mut Vec<String>) {
    if spec.analysis_window.is_empty() {
        return;
    }
    match parse_duration(&spec.analysis_window) {
        Ok(d) if d < MIN_WINDOW => {
            errs.push("spec.analysisWindow: analysis window must be at least 1 hour".to_string())
        }
        Ok(d) if d > MAX_WINDOW => {
            errs.push("spec.analysisWindow: analysis window must not exceed 90 days".to_string())
        }
        Ok(_) => {}
        Err(e) => errs.push(format!("spec.analysisWindow: {}", e)),
    }
}

fn validate_schedule(spec: &RightSizingPolicySpec, errs: &mut Vec<String>) {
    if spec.schedule.is_empty() {
        return;
    }
    if let Err(e) = check_cron(&spec.schedule) {
        errs.push(format!("spec.schedule: invalid cron expression: {}", e));
    }
}

fn validate_update_policy(spec: &RightSizingPolicySpec, errs: &mut Vec<String>) {
    let policy = &spec.update_policy;
    if policy.backoff_limit < 0 {
        errs.push(format!(
            "spec.updatePolicy.backoffLimit: {} must be non-negative",
            policy.backoff_limit
        ));
    }
    if !policy.min_stability_period.is_empty() {
        if let Err(e) = parse_duration(&policy.min_stability_period) {
            errs.push(format!("spec.updatePolicy.minStabilityPeriod: {}", e));
        }
    }
}

fn validate_metrics_source(spec: &RightSizingPolicySpec, errs: &mut Vec<String>) {
    let source = &spec.metrics_source;
    if source.source_type != MetricsSourceType::Prometheus {
        return;
    }
    let Some(prom) = &source.prometheus_config else {
        return;
    };

    if prom.url.is_empty() {
        errs.push(
            "spec.metricsSource.prometheusConfig.url: Prometheus URL is required when using prometheus metrics source"
                .to_string(),
        );
    }
    if let Some(auth) = &prom.auth_config {
        if auth.auth_type != AuthType::None && auth.secret_ref.is_none() {
            errs.push(
                "spec.metricsSource.prometheusConfig.authConfig.secretRef: secretRef is required when using basic or bearer authentication"
                    .to_string(),
            );
        }
    }
}

const CRON_DESCRIPTORS: &[&str] = &[
    "@yearly",
    "@annually",
    "@monthly",
    "@weekly",
    "@daily",
    "@midnight",
    "@hourly",
];

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct CronField {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    allow_question: bool,
}

const CRON_FIELDS: [CronField; 5] = [
    CronField { name: "minute", min: 0, max: 59, names: &[], allow_question: false },
    CronField { name: "hour", min: 0, max: 23, names: &[], allow_question: false },
    CronField { name: "day of month", min: 1, max: 31, names: &[], allow_question: true },
    CronField { name: "month", min: 1, max: 12, names: MONTH_NAMES, allow_question: false },
    CronField { name: "day of week", min: 0, max: 6, names: DAY_NAMES, allow_question: true },
];

/// Check a standard 5-field cron expression or a predefined descriptor
pub fn check_cron(expr: &str) -> std::result::Result<(), String> {
    let expr = expr.trim();
    if let Some(rest) = expr.strip_prefix("@every ") {
        return parse_duration(rest.trim())
            .map(|_| ())
            .map_err(|e| e.to_string());
    }
    if expr.starts_with('@') {
        return if CRON_DESCRIPTORS.contains(&expr) {
            Ok(())
        } else {
            Err(format!("unrecognized descriptor: {}", expr))
        };
    }

    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() != CRON_FIELDS.len() {
        return Err(format!(
            "expected exactly 5 fields, found {}: {}",
            parts.len(),
            expr
        ));
    }
    for (part, field) in parts.iter().zip(CRON_FIELDS.iter()) {
        for item in part.split(',') {
            check_cron_item(item, field)?;
        }
    }
    Ok(())
}

fn check_cron_item(item: &str, field: &CronField) -> std::result::Result<(), String> {
    let (range, step) = match item.split_once('/') {
        Some((r, s)) => (r, Some(s)),
        None => (item, None),
    };

    if let Some(step) = step {
        match step.parse::<u32>() {
            Ok(s) if s > 0 => {}
            _ => return Err(format!("invalid step {:?} in {} field", step, field.name)),
        }
    }

    if range == "*" || (range == "?" && field.allow_question) {
        return Ok(());
    }

    let (lo, hi) = match range.split_once('-') {
        Some((a, b)) => (cron_value(a, field)?, cron_value(b, field)?),
        None => {
            let v = cron_value(range, field)?;
            (v, v)
        }
    };
    if lo > hi {
        return Err(format!(
            "beginning of range ({}) beyond end of range ({}) in {} field",
            lo, hi, field.name
        ));
    }
    Ok(())
}

fn cron_value(raw: &str, field: &CronField) -> std::result::Result<u32, String> {
    let upper = raw.to_ascii_uppercase();
    if let Some(pos) = field.names.iter().position(|n| *n == upper) {
        return Ok(field.min + pos as u32);
    }
    let v: u32 = raw
        .parse()
        .map_err(|_| format!("failed to parse {:?} in {} field", raw, field.name))?;
    if v < field.min || v > field.max {
        return Err(format!(
            "{} out of range [{}, {}] in {} field",
            v, field.min, field.max, field.name
        ));
    }
    Ok(v)
}
