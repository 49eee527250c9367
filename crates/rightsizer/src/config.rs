//! Controller configuration

use anyhow::{Context, Result};
use rightsizer_lib::controller::ControllerSettings;
use rightsizer_lib::cost::CloudProvider;
use rightsizer_lib::metrics::PrometheusAuth;
use serde::Deserialize;
use std::time::Duration;

/// Controller configuration, read from `RIGHTSIZER_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Prometheus base URL; metrics-server is used when unset
    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: Option<String>,

    #[serde(default)]
    pub prometheus_bearer_token: Option<String>,

    #[serde(default)]
    pub prometheus_username: Option<String>,

    #[serde(default)]
    pub prometheus_password: Option<String>,

    #[serde(default = "default_prometheus_timeout")]
    pub prometheus_timeout_secs: u64,

    /// Range query resolution in seconds
    #[serde(default = "default_metrics_step")]
    pub metrics_step_secs: u64,

    /// Metrics cache TTL in seconds, 0 disables the cache
    #[serde(default = "default_metrics_cache_ttl")]
    pub metrics_cache_ttl_secs: u64,

    /// Policies reconciled concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: u16,

    #[serde(default = "default_error_requeue")]
    pub error_requeue_secs: u64,

    /// Pricing preset: azure, aws or gcp
    #[serde(default = "default_cloud_provider")]
    pub cloud_provider: String,

    #[serde(default = "default_status_write_retries")]
    pub status_write_retries: u32,
}

fn default_api_port() -> u16 {
    8081
}

fn default_prometheus_url() -> Option<String> {
    std::env::var("PROMETHEUS_URL").ok().filter(|u| !u.is_empty())
}

fn default_prometheus_timeout() -> u64 {
    30
}

fn default_metrics_step() -> u64 {
    60
}

fn default_metrics_cache_ttl() -> u64 {
    300
}

fn default_concurrency() -> u16 {
    5
}

fn default_error_requeue() -> u64 {
    300
}

fn default_cloud_provider() -> String {
    "azure".to_string()
}

fn default_status_write_retries() -> u32 {
    5
}

impl ControllerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("RIGHTSIZER"))
            .build()?;

        let cfg: Self = config
            .try_deserialize()
            .context("invalid RIGHTSIZER_* configuration")?;
        cfg.cloud_provider()?;
        Ok(cfg)
    }

    pub fn cloud_provider(&self) -> Result<CloudProvider> {
        self.cloud_provider
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    /// Bearer token wins over basic auth when both are set
    pub fn prometheus_auth(&self) -> PrometheusAuth {
        if let Some(token) = &self.prometheus_bearer_token {
            return PrometheusAuth::Bearer(token.clone());
        }
        match (&self.prometheus_username, &self.prometheus_password) {
            (Some(username), Some(password)) => PrometheusAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => PrometheusAuth::None,
        }
    }

    pub fn metrics_cache_ttl(&self) -> Option<Duration> {
        (self.metrics_cache_ttl_secs > 0).then(|| Duration::from_secs(self.metrics_cache_ttl_secs))
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            concurrency: self.concurrency.max(1),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
            status_write_retries: self.status_write_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_json(value: serde_json::Value) -> ControllerConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = from_json(serde_json::json!({ "prometheus_url": null }));
        assert_eq!(cfg.api_port, 8081);
        assert_eq!(cfg.metrics_step_secs, 60);
        assert_eq!(cfg.metrics_cache_ttl(), Some(Duration::from_secs(300)));
        assert_eq!(cfg.cloud_provider().unwrap(), CloudProvider::Azure);

        let settings = cfg.controller_settings();
        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.error_requeue, Duration::from_secs(300));
        assert_eq!(settings.status_write_retries, 5);
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let cfg = from_json(serde_json::json!({ "metrics_cache_ttl_secs": 0 }));
        assert_eq!(cfg.metrics_cache_ttl(), None);
    }

    #[test]
    fn test_auth_selection() {
        let cfg = from_json(serde_json::json!({
            "prometheus_username": "admin",
            "prometheus_password": "secret"
        }));
        assert!(matches!(cfg.prometheus_auth(), PrometheusAuth::Basic { .. }));

        let cfg = from_json(serde_json::json!({
            "prometheus_bearer_token": "t0ken",
            "prometheus_username": "admin",
            "prometheus_password": "secret"
        }));
        assert!(matches!(cfg.prometheus_auth(), PrometheusAuth::Bearer(t) if t == "t0ken"));

        let cfg = from_json(serde_json::json!({}));
        assert!(matches!(cfg.prometheus_auth(), PrometheusAuth::None));
    }

    #[test]
    fn test_unknown_cloud_provider() {
        let cfg = from_json(serde_json::json!({ "cloud_provider": "oracle" }));
        assert!(cfg.cloud_provider().is_err());
    }
}
