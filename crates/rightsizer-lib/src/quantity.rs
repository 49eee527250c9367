//! Kubernetes resource quantities
//!
//! Parsing into plain numbers (cores for CPU, bytes for memory), canonical
//! formatting of recommended values, and semantic comparison of
//! `ResourceRequirements` so that "1" and "1000m" compare equal.

use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";

const BINARY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
];

const DECIMAL_SUFFIXES: &[(char, f64)] = &[
    ('n', 1e-9),
    ('u', 1e-6),
    ('m', 1e-3),
    ('k', 1e3),
    ('M', 1e6),
    ('G', 1e9),
    ('T', 1e12),
    ('P', 1e15),
    ('E', 1e18),
];

/// Parse a quantity string into its numeric value in base units
pub fn parse_str(raw: &str) -> Result<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::Quantity(raw.to_string()));
    }

    for (suffix, scale) in BINARY_SUFFIXES {
        if let Some(num) = s.strip_suffix(suffix) {
            return parse_number(num, raw).map(|v| v * scale);
        }
    }

    // Plain numbers and decimal exponents ("1e3", "12E6") parse directly
    if let Ok(v) = s.parse::<f64>() {
        return if v.is_finite() {
            Ok(v)
        } else {
            Err(Error::Quantity(raw.to_string()))
        };
    }

    let last = s.chars().last().ok_or_else(|| Error::Quantity(raw.to_string()))?;
    for (suffix, scale) in DECIMAL_SUFFIXES {
        if last == *suffix {
            return parse_number(&s[..s.len() - 1], raw).map(|v| v * scale);
        }
    }

    Err(Error::Quantity(raw.to_string()))
}

fn parse_number(num: &str, raw: &str) -> Result<f64> {
    num.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::Quantity(raw.to_string()))
}

/// Parse a [`Quantity`] into its numeric value in base units
pub fn parse(q: &Quantity) -> Result<f64> {
    parse_str(&q.0)
}

/// CPU quantity with milli-core precision, truncating sub-milli remainders
pub fn cpu_from_cores(cores: f64) -> Quantity {
    cpu_from_millis((cores * 1000.0) as i64)
}

pub fn cpu_from_millis(milli: i64) -> Quantity {
    if milli % 1000 == 0 {
        Quantity(format!("{}", milli / 1000))
    } else {
        Quantity(format!("{}m", milli))
    }
}

/// Memory quantity with byte precision, using the largest exact binary suffix
pub fn memory_from_bytes(bytes: f64) -> Quantity {
    let bytes = bytes as i64;
    if bytes == 0 {
        return Quantity("0".to_string());
    }
    for (suffix, scale) in BINARY_SUFFIXES.iter().rev() {
        let scale = *scale as i64;
        if bytes % scale == 0 {
            return Quantity(format!("{}{}", bytes / scale, suffix));
        }
    }
    Quantity(bytes.to_string())
}

/// Numeric value of one requested resource, if present and parseable
pub fn request(res: &ResourceRequirements, name: &str) -> Option<f64> {
    res.requests
        .as_ref()
        .and_then(|r| r.get(name))
        .and_then(|q| parse(q).ok())
}

/// Numeric value of one resource limit, if present and parseable
pub fn limit(res: &ResourceRequirements, name: &str) -> Option<f64> {
    res.limits
        .as_ref()
        .and_then(|r| r.get(name))
        .and_then(|q| parse(q).ok())
}

/// Sum CPU and memory requests and limits over a pod's containers
pub fn sum_container_resources(containers: &[Container]) -> ResourceRequirements {
    let mut requests: BTreeMap<&str, f64> = BTreeMap::new();
    let mut limits: BTreeMap<&str, f64> = BTreeMap::new();

    for container in containers {
        let Some(res) = container.resources.as_ref() else {
            continue;
        };
        for name in [CPU, MEMORY] {
            if let Some(v) = request(res, name) {
                *requests.entry(name).or_default() += v;
            }
            if let Some(v) = limit(res, name) {
                *limits.entry(name).or_default() += v;
            }
        }
    }

    ResourceRequirements {
        requests: to_resource_list(requests),
        limits: to_resource_list(limits),
        ..Default::default()
    }
}

fn to_resource_list(values: BTreeMap<&str, f64>) -> Option<BTreeMap<String, Quantity>> {
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .into_iter()
            .map(|(name, v)| {
                let q = if name == CPU {
                    cpu_from_cores(v)
                } else {
                    memory_from_bytes(v)
                };
                (name.to_string(), q)
            })
            .collect(),
    )
}

/// Semantic equality of two resource requirements (requests and limits)
pub fn resources_equal(a: &ResourceRequirements, b: &ResourceRequirements) -> bool {
    lists_equal(a.requests.as_ref(), b.requests.as_ref())
        && lists_equal(a.limits.as_ref(), b.limits.as_ref())
}

fn lists_equal(
    a: Option<&BTreeMap<String, Quantity>>,
    b: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let a = a.unwrap_or(&empty);
    let b = b.unwrap_or(&empty);
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(name, qa)| match b.get(name) {
        Some(qb) => quantities_equal(qa, qb),
        None => false,
    })
}

fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    match (parse(a), parse(b)) {
        (Ok(x), Ok(y)) => (x - y).abs() <= f64::EPSILON * x.abs().max(y.abs()).max(1.0),
        _ => a.0 == b.0,
    }
}
