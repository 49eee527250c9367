//! TTL cache in front of a metrics provider
//!
//! Each key owns an async mutex. The first caller for a stale key holds the
//! lock across the backend call; concurrent callers for the same key wait
//! on it and then read the fresh entry, so one refresh costs one query.
//! Failures are not cached.

use super::MetricsProvider;
use crate::error::Result;
use crate::models::{PodMetrics, WorkloadKind, WorkloadMetrics};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Workload {
        namespace: String,
        kind: WorkloadKind,
        name: String,
        window: Duration,
    },
    Pod {
        namespace: String,
        name: String,
        window: Duration,
    },
}

#[derive(Clone)]
enum CachedValue {
    Workload(WorkloadMetrics),
    Pod(PodMetrics),
}

struct Entry {
    value: CachedValue,
    fetched_at: Instant,
}

type Slot = Arc<Mutex<Option<Entry>>>;

pub struct CachedMetricsProvider {
    inner: Arc<dyn MetricsProvider>,
    ttl: Duration,
    slots: DashMap<CacheKey, Slot>,
}

impl CachedMetricsProvider {
    pub fn new(inner: Arc<dyn MetricsProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: CacheKey) -> Slot {
        // Clone out of the map so no shard lock is held across an await
        self.slots.entry(key).or_default().clone()
    }

    /// Drop expired entries whose lock is not currently held
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.slots.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => guard
                .as_ref()
                .map_or(false, |e| e.fetched_at.elapsed() < ttl),
            Err(_) => true,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl MetricsProvider for CachedMetricsProvider {
    async fn get_workload_metrics(
        &self,
        namespace: &str,
        workload_name: &str,
        workload_kind: WorkloadKind,
        window: Duration,
    ) -> Result<WorkloadMetrics> {
        let slot = self.slot(CacheKey::Workload {
            namespace: namespace.to_string(),
            kind: workload_kind,
            name: workload_name.to_string(),
            window,
        });
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                if let CachedValue::Workload(metrics) = &entry.value {
                    debug!(
                        namespace = %namespace,
                        workload = %workload_name,
                        "Metrics cache hit"
                    );
                    return Ok(metrics.clone());
                }
            }
        }

        let metrics = self
            .inner
            .get_workload_metrics(namespace, workload_name, workload_kind, window)
            .await?;
        *guard = Some(Entry {
            value: CachedValue::Workload(metrics.clone()),
            fetched_at: Instant::now(),
        });
        Ok(metrics)
    }

    async fn get_pod_metrics(
        &self,
        namespace: &str,
        pod_name: &str,
        window: Duration,
    ) -> Result<PodMetrics> {
        let slot = self.slot(CacheKey::Pod {
            namespace: namespace.to_string(),
            name: pod_name.to_string(),
            window,
        });
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                if let CachedValue::Pod(metrics) = &entry.value {
                    return Ok(metrics.clone());
                }
            }
        }

        let metrics = self
            .inner
            .get_pod_metrics(namespace, pod_name, window)
            .await?;
        *guard = Some(Entry {
            value: CachedValue::Pod(metrics.clone()),
            fetched_at: Instant::now(),
        });
        Ok(metrics)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MetricsProvider for CountingProvider {
        async fn get_workload_metrics(
            &self,
            namespace: &str,
            workload_name: &str,
            workload_kind: WorkloadKind,
            _window: Duration,
        ) -> Result<WorkloadMetrics> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(Error::MetricsUnavailable {
                    target: workload_name.to_string(),
                    reason: "down".to_string(),
                });
            }
            Ok(WorkloadMetrics {
                workload_name: workload_name.to_string(),
                workload_kind,
                namespace: namespace.to_string(),
                pods: vec![],
                start: Utc::now(),
                end: Utc::now(),
            })
        }

        async fn get_pod_metrics(
            &self,
            namespace: &str,
            pod_name: &str,
            _window: Duration,
        ) -> Result<PodMetrics> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PodMetrics {
                pod_name: pod_name.to_string(),
                namespace: namespace.to_string(),
                cpu_usage: vec![],
                memory_usage: vec![],
                start: Utc::now(),
                end: Utc::now(),
            })
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    const WINDOW: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_cached_within_ttl() {
        let backend = Arc::new(CountingProvider::default());
        let cache = CachedMetricsProvider::new(backend.clone(), Duration::from_secs(60));

        for _ in 0..3 {
            cache
                .get_workload_metrics("shop", "web", WorkloadKind::Deployment, WINDOW)
                .await
                .unwrap();
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        // Different window is a different key
        cache
            .get_workload_metrics("shop", "web", WorkloadKind::Deployment, WINDOW * 2)
            .await
            .unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let backend = Arc::new(CountingProvider::default());
        let cache = Arc::new(CachedMetricsProvider::new(
            backend.clone(),
            Duration::from_secs(60),
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .get_workload_metrics("shop", "web", WorkloadKind::Deployment, WINDOW)
                        .await
                })
            })
            .collect();
        for t in futures::future::join_all(tasks).await {
            t.unwrap().unwrap();
        }

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_refetches() {
        let backend = Arc::new(CountingProvider::default());
        let cache = CachedMetricsProvider::new(backend.clone(), Duration::ZERO);

        cache.get_pod_metrics("shop", "web-1", WINDOW).await.unwrap();
        cache.get_pod_metrics("shop", "web-1", WINDOW).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        cache.purge_expired();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let backend = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let cache = CachedMetricsProvider::new(backend.clone(), Duration::from_secs(60));

        for _ in 0..2 {
            assert!(cache
                .get_workload_metrics("shop", "web", WorkloadKind::Deployment, WINDOW)
                .await
                .is_err());
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }
}
