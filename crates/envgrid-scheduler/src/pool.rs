//! Instance pool: N replica backends behind one [`Backend`].
//!
//! The pool owns a fixed, non-empty replica list and a [`LoadBalancer`].
//! Each call goes to exactly one replica; request counters are bumped
//! only for calls that come back `Ok`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use envgrid_backend::{Backend, BackendError, BackendResult};
use envgrid_core::{epoch_millis, BoxFuture, CleanupReport, LbStrategy, MethodInfo};

use crate::load_balancer::LoadBalancer;

/// One replica in a pool.
pub struct InstanceInfo {
    pub host: String,
    pub port: u16,
    pub backend: Arc<dyn Backend>,
    request_count: AtomicU64,
}

impl std::fmt::Debug for InstanceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceInfo")
            .field("name", &self.backend.name())
            .field("host", &self.host)
            .field("port", &self.port)
            .field("request_count", &self.request_count())
            .finish()
    }
}

impl InstanceInfo {
    pub fn new(host: impl Into<String>, port: u16, backend: Arc<dyn Backend>) -> Self {
        Self {
            host: host.into(),
            port,
            backend,
            request_count: AtomicU64::new(0),
        }
    }

    /// Successful calls routed here.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}

/// Per-replica line of [`PoolStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub requests: u64,
}

/// Snapshot of a pool's routing counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub strategy: LbStrategy,
    pub total_instances: usize,
    pub total_requests: u64,
    pub instances: Vec<InstanceStats>,
}

/// A pooled backend.
pub struct InstancePool {
    name: String,
    instances: Vec<InstanceInfo>,
    balancer: LoadBalancer,
    ready: AtomicBool,
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("name", &self.name)
            .field("strategy", &self.balancer.strategy())
            .field("instances", &self.instances)
            .finish()
    }
}

impl InstancePool {
    /// Build a pool. Fails on an empty instance list.
    ///
    /// Without an explicit `name` the pool is called
    /// `{prefix}-pool-{count}-{epoch_ms}`.
    pub fn new(
        instances: Vec<InstanceInfo>,
        strategy: LbStrategy,
        name: Option<String>,
        prefix: &str,
    ) -> BackendResult<Self> {
        if instances.is_empty() {
            return Err(BackendError::new("instance pool requires at least one instance"));
        }
        let name = name.unwrap_or_else(|| Self::default_name(prefix, instances.len()));
        info!(%name, instances = instances.len(), %strategy, "instance pool created");
        Ok(Self {
            name,
            instances,
            balancer: LoadBalancer::new(strategy),
            ready: AtomicBool::new(true),
        })
    }

    pub fn default_name(prefix: &str, count: usize) -> String {
        format!("{prefix}-pool-{count}-{}", epoch_millis())
    }

    pub fn instances(&self) -> &[InstanceInfo] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Always `false` for a constructed pool.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn strategy(&self) -> LbStrategy {
        self.balancer.strategy()
    }

    pub fn get_stats(&self) -> PoolStats {
        let instances: Vec<InstanceStats> = self
            .instances
            .iter()
            .map(|i| InstanceStats {
                name: i.backend.name().to_string(),
                host: i.host.clone(),
                port: i.port,
                requests: i.request_count(),
            })
            .collect();
        PoolStats {
            name: self.name.clone(),
            strategy: self.strategy(),
            total_instances: instances.len(),
            total_requests: instances.iter().map(|i| i.requests).sum(),
            instances,
        }
    }

    /// Clean up every replica concurrently. One failure never blocks the others.
    pub async fn cleanup_instances(&self) -> CleanupReport<BackendError> {
        self.ready.store(false, Ordering::Release);
        let outcomes = join_all(self.instances.iter().map(|i| async move {
            let name = i.backend.name().to_string();
            (name, i.backend.cleanup().await)
        }))
        .await;
        CleanupReport::new(outcomes)
    }
}

impl Backend for InstancePool {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_method<'a>(&'a self, method: &'a str, args: Value) -> BoxFuture<'a, BackendResult<Value>> {
        Box::pin(async move {
            let instance = self.balancer.select_instance(&self.instances)?;
            debug!(pool = %self.name, instance = %instance.backend.name(), %method, "routing call");
            let result = instance.backend.call_method(method, args).await?;
            instance.request_count.fetch_add(1, Ordering::Relaxed);
            Ok(result)
        })
    }

    // Replicas share one image, so any of them describes the pool.
    fn list_methods(&self) -> BoxFuture<'_, BackendResult<Vec<MethodInfo>>> {
        Box::pin(async move {
            let instance = self.balancer.select_instance(&self.instances)?;
            instance.backend.list_methods().await
        })
    }

    /// Healthy only if every replica is.
    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let results = join_all(self.instances.iter().map(|i| i.backend.health_check())).await;
            results.into_iter().all(|ok| ok)
        })
    }

    fn cleanup(&self) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            let report = self.cleanup_instances().await;
            for (name, e) in report.failures() {
                warn!(pool = %self.name, instance = %name, error = %e, "replica cleanup failed");
            }
            info!(
                pool = %self.name,
                cleaned = report.succeeded().len(),
                failed = report.failures().len(),
                "instance pool cleaned up"
            );
            Ok(())
        })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envgrid_backend::fake::FakeBackend;
    use serde_json::json;

    fn fakes(n: usize) -> Vec<Arc<FakeBackend>> {
        (0..n)
            .map(|i| Arc::new(FakeBackend::new(format!("sbx-{i}"))))
            .collect()
    }

    fn infos(backends: &[Arc<FakeBackend>]) -> Vec<InstanceInfo> {
        backends
            .iter()
            .map(|b| InstanceInfo::new("local", 8000, b.clone() as Arc<dyn Backend>))
            .collect()
    }

    #[test]
    fn empty_pool_is_rejected() {
        let result = InstancePool::new(Vec::new(), LbStrategy::RoundRobin, None, "sbx");
        assert!(matches!(result, Err(BackendError::Backend { .. })));
    }

    #[test]
    fn derived_name_includes_prefix_and_count() {
        let backends = fakes(3);
        let pool = InstancePool::new(infos(&backends), LbStrategy::RoundRobin, None, "sbx").unwrap();
        assert!(pool.name().starts_with("sbx-pool-3-"));

        let named = InstancePool::new(
            infos(&backends),
            LbStrategy::Random,
            Some("mine".to_string()),
            "sbx",
        )
        .unwrap();
        assert_eq!(named.name(), "mine");
    }

    #[tokio::test]
    async fn round_robin_routing_counts_requests() {
        let backends = fakes(3);
        let pool = InstancePool::new(infos(&backends), LbStrategy::RoundRobin, None, "sbx").unwrap();

        let mut served = Vec::new();
        for i in 0..6 {
            let out = pool.call_method("step", json!({ "i": i })).await.unwrap();
            served.push(out["backend"].as_str().unwrap().to_string());
        }

        assert_eq!(served, vec!["sbx-0", "sbx-1", "sbx-2", "sbx-0", "sbx-1", "sbx-2"]);
        let stats = pool.get_stats();
        assert_eq!(stats.total_instances, 3);
        assert_eq!(stats.total_requests, 6);
        assert!(stats.instances.iter().all(|i| i.requests == 2));
    }

    #[tokio::test]
    async fn failed_calls_do_not_count() {
        let failing = Arc::new(FakeBackend::new("sbx-0").with_failing_calls());
        let pool = InstancePool::new(
            vec![InstanceInfo::new("local", 8000, failing.clone() as Arc<dyn Backend>)],
            LbStrategy::RoundRobin,
            None,
            "sbx",
        )
        .unwrap();

        let err = pool.call_method("step", json!({})).await.unwrap_err();
        assert!(err.transport_error().is_some());
        assert_eq!(failing.calls(), 1);
        assert_eq!(pool.instances()[0].request_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_attempts_every_instance() {
        let backends = vec![
            Arc::new(FakeBackend::new("sbx-0")),
            Arc::new(FakeBackend::new("sbx-1").with_failing_cleanup()),
            Arc::new(FakeBackend::new("sbx-2")),
        ];
        let pool = InstancePool::new(infos(&backends), LbStrategy::RoundRobin, None, "sbx").unwrap();

        let report = pool.cleanup_instances().await;

        assert_eq!(report.attempted(), 3);
        assert_eq!(report.succeeded(), vec!["sbx-0", "sbx-2"]);
        assert_eq!(report.failures().len(), 1);
        assert!(backends.iter().all(|b| b.cleanups() == 1));
        assert!(!backends[0].is_ready());
        assert!(!backends[2].is_ready());
        assert!(!pool.is_ready());
    }

    #[tokio::test]
    async fn cleanup_through_backend_trait_swallows_failures() {
        let backends = vec![
            Arc::new(FakeBackend::new("sbx-0").with_failing_cleanup()),
            Arc::new(FakeBackend::new("sbx-1")),
        ];
        let pool = InstancePool::new(infos(&backends), LbStrategy::RoundRobin, None, "sbx").unwrap();

        pool.cleanup().await.unwrap();
        assert_eq!(backends[1].cleanups(), 1);
    }

    #[tokio::test]
    async fn list_methods_and_health_delegate() {
        let backends = fakes(2);
        let pool = InstancePool::new(infos(&backends), LbStrategy::Random, None, "sbx").unwrap();

        let methods = pool.list_methods().await.unwrap();
        assert_eq!(methods.len(), 2);
        assert!(pool.health_check().await);

        backends[1].cleanup().await.unwrap();
        assert!(!pool.health_check().await);
    }

    #[test]
    fn stats_serialize() {
        let backends = fakes(1);
        let pool = InstancePool::new(infos(&backends), LbStrategy::RoundRobin, Some("p".into()), "sbx")
            .unwrap();
        let json = serde_json::to_value(pool.get_stats()).unwrap();
        assert_eq!(json["strategy"], "round-robin");
        assert_eq!(json["instances"][0]["host"], "local");
    }
}
