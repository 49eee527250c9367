//! Cost estimation for recommendations
//!
//! Prices the reduction in CPU and memory requests with flat per-provider
//! rates. Only reductions count: a recommendation that raises a request
//! carries no savings figure for that resource.

use crate::crd::{PodRecommendation, ResourceSavings};
use crate::quantity::{self, CPU, MEMORY};
use k8s_openapi::api::core::v1::ResourceRequirements;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Estimates the savings of moving from `current` to `recommended`
pub trait CostEstimator: Send + Sync {
    fn estimate_savings(
        &self,
        current: &ResourceRequirements,
        recommended: &ResourceRequirements,
    ) -> ResourceSavings;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    #[default]
    Azure,
    Aws,
    Gcp,
}

impl CloudProvider {
    /// Monthly (per core, per GB) list prices in USD
    pub fn pricing(&self) -> Pricing {
        match self {
            CloudProvider::Azure => Pricing {
                cpu_per_core_month: 20.0,
                memory_per_gb_month: 2.5,
            },
            CloudProvider::Aws => Pricing {
                cpu_per_core_month: 25.0,
                memory_per_gb_month: 3.0,
            },
            CloudProvider::Gcp => Pricing {
                cpu_per_core_month: 22.0,
                memory_per_gb_month: 2.8,
            },
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloudProvider::Azure => "azure",
            CloudProvider::Aws => "aws",
            CloudProvider::Gcp => "gcp",
        })
    }
}

impl FromStr for CloudProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "azure" => Ok(CloudProvider::Azure),
            "aws" => Ok(CloudProvider::Aws),
            "gcp" => Ok(CloudProvider::Gcp),
            other => Err(format!("unknown cloud provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub cpu_per_core_month: f64,
    pub memory_per_gb_month: f64,
}

/// Aggregate savings over every recommendation of a pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSavingsReport {
    pub total_recommendations: usize,
    pub total_cpu_savings: String,
    pub total_memory_savings: String,
    pub estimated_monthly_savings: String,
    pub estimated_annual_savings: String,
    pub cloud_provider: CloudProvider,
}

#[derive(Debug, Clone)]
pub struct CostCalculator {
    provider: CloudProvider,
    pricing: Pricing,
}

impl Default for CostCalculator {
    fn default() -> Self {
        Self::for_provider(CloudProvider::default())
    }
}

impl CostCalculator {
    pub fn for_provider(provider: CloudProvider) -> Self {
        Self {
            provider,
            pricing: provider.pricing(),
        }
    }

    pub fn provider(&self) -> CloudProvider {
        self.provider
    }

    pub fn pricing(&self) -> Pricing {
        self.pricing
    }

    fn monthly_cost(&self, cores: f64, bytes: f64) -> f64 {
        cores * self.pricing.cpu_per_core_month
            + bytes / BYTES_PER_GB * self.pricing.memory_per_gb_month
    }

    pub fn estimate_cluster_savings(
        &self,
        recommendations: &[PodRecommendation],
    ) -> ClusterSavingsReport {
        let (cores, bytes) = recommendations.iter().fold((0.0, 0.0), |(c, m), rec| {
            let s = &rec.potential_savings;
            let cpu = s.cpu_savings.as_ref().and_then(|q| quantity::parse(q).ok());
            let mem = s.memory_savings.as_ref().and_then(|q| quantity::parse(q).ok());
            (c + cpu.unwrap_or(0.0), m + mem.unwrap_or(0.0))
        });
        let monthly = self.monthly_cost(cores, bytes);

        ClusterSavingsReport {
            total_recommendations: recommendations.len(),
            total_cpu_savings: format!("{:.3} cores", cores),
            total_memory_savings: format!("{:.2} GB", bytes / BYTES_PER_GB),
            estimated_monthly_savings: format!("${:.2}", monthly),
            estimated_annual_savings: format!("${:.2}", monthly * 12.0),
            cloud_provider: self.provider,
        }
    }
}

impl CostEstimator for CostCalculator {
    fn estimate_savings(
        &self,
        current: &ResourceRequirements,
        recommended: &ResourceRequirements,
    ) -> ResourceSavings {
        let reduction = |name: &str| -> Option<f64> {
            let cur = quantity::request(current, name)?;
            let rec = quantity::request(recommended, name)?;
            Some(cur - rec).filter(|d| *d > 0.0)
        };

        let cpu = reduction(CPU).map(|d| (d * 1000.0) as i64).filter(|m| *m > 0);
        let memory = reduction(MEMORY).map(|d| d as i64).filter(|b| *b > 0);

        let monthly = self.monthly_cost(
            cpu.map_or(0.0, |m| m as f64 / 1000.0),
            memory.map_or(0.0, |b| b as f64),
        );

        ResourceSavings {
            cpu_savings: cpu.map(quantity::cpu_from_millis),
            memory_savings: memory.map(|b| quantity::memory_from_bytes(b as f64)),
            cost_savings: if monthly > 0.0 {
                format!("${:.2}/month", monthly)
            } else {
                String::new()
            },
        }
    }
}
