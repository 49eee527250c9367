//! Controller library for pod right-sizing
//!
//! This crate provides the core functionality for:
//! - The RightSizingPolicy custom resource
//! - Usage history from Prometheus or metrics-server
//! - Percentile-based resource recommendations and cost estimates
//! - The reconcile loop that applies recommendations to workloads
//! - Health checks and observability

pub mod controller;
pub mod cost;
pub mod crd;
pub mod duration;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod quantity;
pub mod selector;
pub mod validation;

pub use crd::{RightSizingPolicy, RightSizingPolicySpec, RightSizingPolicyStatus};
pub use error::{Error, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
