//! Environment registry: name → backend for everything deployed by this
//! process.
//!
//! An explicitly constructed service, cloned into whoever needs it. All
//! mutations go through one `RwLock`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use envgrid_backend::{Backend, BackendError};
use envgrid_core::CleanupReport;

use crate::error::{DeployError, DeployResult};

#[derive(Default)]
struct Entries {
    backends: HashMap<String, Arc<dyn Backend>>,
    /// Names held by deployments still in flight.
    pending: HashSet<String>,
    /// Claimed replica (`{target}/{container}`) → owning registry name.
    replicas: HashMap<String, String>,
}

impl Entries {
    fn taken(&self, name: &str) -> bool {
        self.backends.contains_key(name) || self.pending.contains(name)
    }

    fn release_claims(&mut self, owner: &str) {
        self.replicas.retain(|_, o| o != owner);
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<RwLock<Entries>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `name` and the replicas in `claims` for a deployment about to
    /// start. Fails if the name is registered or reserved, or if any replica
    /// already belongs to another entry. Follow with [`commit`](Self::commit)
    /// or [`release`](Self::release).
    pub async fn reserve(&self, name: &str, claims: &[String]) -> DeployResult<()> {
        let mut entries = self.entries.write().await;
        if entries.taken(name) {
            return Err(DeployError::AlreadyRegistered(name.to_string()));
        }
        if let Some((replica, owner)) = claims
            .iter()
            .find_map(|c| entries.replicas.get(c).map(|owner| (c, owner)))
        {
            return Err(DeployError::ReplicaInUse {
                replica: replica.clone(),
                owner: owner.clone(),
            });
        }
        entries.pending.insert(name.to_string());
        for claim in claims {
            entries.replicas.insert(claim.clone(), name.to_string());
        }
        debug!(%name, replicas = claims.len(), "name reserved");
        Ok(())
    }

    /// Drop a reservation whose deployment failed.
    pub async fn release(&self, name: &str) {
        let mut entries = self.entries.write().await;
        if entries.pending.remove(name) {
            entries.release_claims(name);
        }
    }

    /// Turn a reservation into a live entry.
    pub async fn commit(&self, name: &str, backend: Arc<dyn Backend>) -> DeployResult<()> {
        let mut entries = self.entries.write().await;
        if !entries.pending.remove(name) {
            return Err(DeployError::NotFound(name.to_string()));
        }
        entries.backends.insert(name.to_string(), backend);
        info!(%name, "backend registered");
        Ok(())
    }

    /// Register `backend` under `name`. An existing live or reserved entry is
    /// never overwritten; unregister it first.
    pub async fn register(&self, name: &str, backend: Arc<dyn Backend>) -> DeployResult<()> {
        let mut entries = self.entries.write().await;
        if entries.taken(name) {
            return Err(DeployError::AlreadyRegistered(name.to_string()));
        }
        entries.backends.insert(name.to_string(), backend);
        info!(%name, "backend registered");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.entries.read().await.backends.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.backends.contains_key(name)
    }

    /// Registered names, sorted.
    pub async fn list_all(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove an entry without cleaning it up.
    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Backend>> {
        let mut entries = self.entries.write().await;
        let backend = entries.backends.remove(name)?;
        entries.release_claims(name);
        Some(backend)
    }

    /// Remove and clean up one entry.
    pub async fn cleanup(&self, name: &str) -> DeployResult<()> {
        let backend = self
            .unregister(name)
            .await
            .ok_or_else(|| DeployError::NotFound(name.to_string()))?;
        backend.cleanup().await?;
        info!(%name, "backend cleaned up");
        Ok(())
    }

    /// Remove every entry and clean them all up concurrently.
    pub async fn cleanup_all(&self) -> CleanupReport<BackendError> {
        let drained: Vec<(String, Arc<dyn Backend>)> = {
            let mut entries = self.entries.write().await;
            let drained: Vec<_> = entries.backends.drain().collect();
            for (name, _) in &drained {
                entries.release_claims(name);
            }
            drained
        };
        if drained.is_empty() {
            return CleanupReport::default();
        }

        info!(count = drained.len(), "cleaning up all registered backends");
        let outcomes = join_all(drained.into_iter().map(|(name, backend)| async move {
            let result = backend.cleanup().await;
            if let Err(e) = &result {
                warn!(%name, error = %e, "backend cleanup failed");
            }
            (name, result)
        }))
        .await;
        CleanupReport::new(outcomes)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.backends.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envgrid_backend::fake::FakeBackend;

    #[tokio::test]
    async fn register_get_and_list() {
        let registry = Registry::new();
        registry
            .register("b", Arc::new(FakeBackend::new("b")))
            .await
            .unwrap();
        registry
            .register("a", Arc::new(FakeBackend::new("a")))
            .await
            .unwrap();

        assert_eq!(registry.list_all().await, vec!["a", "b"]);
        assert_eq!(registry.get("a").await.unwrap().name(), "a");
        assert!(registry.get("c").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let registry = Registry::new();
        registry
            .register("env", Arc::new(FakeBackend::new("first")))
            .await
            .unwrap();

        let result = registry
            .register("env", Arc::new(FakeBackend::new("second")))
            .await;
        assert!(matches!(result, Err(DeployError::AlreadyRegistered(_))));
        assert_eq!(registry.get("env").await.unwrap().name(), "first");

        registry.unregister("env").await.unwrap();
        registry
            .register("env", Arc::new(FakeBackend::new("second")))
            .await
            .unwrap();
    }

    fn claims(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| format!("local/{n}")).collect()
    }

    #[tokio::test]
    async fn reserved_name_blocks_register_until_released() {
        let registry = Registry::new();
        registry.reserve("env", &claims(&["env"])).await.unwrap();

        assert!(!registry.contains("env").await);
        let result = registry.register("env", Arc::new(FakeBackend::new("env"))).await;
        assert!(matches!(result, Err(DeployError::AlreadyRegistered(_))));

        registry.release("env").await;
        registry.reserve("env", &claims(&["env"])).await.unwrap();
    }

    #[tokio::test]
    async fn claimed_replica_rejects_second_owner() {
        let registry = Registry::new();
        registry
            .reserve("pool-a", &claims(&["sbx-0", "sbx-1"]))
            .await
            .unwrap();
        registry
            .commit("pool-a", Arc::new(FakeBackend::new("pool-a")))
            .await
            .unwrap();

        let result = registry.reserve("pool-b", &claims(&["sbx-1", "sbx-2"])).await;
        match result {
            Err(DeployError::ReplicaInUse { replica, owner }) => {
                assert_eq!(replica, "local/sbx-1");
                assert_eq!(owner, "pool-a");
            }
            other => panic!("expected ReplicaInUse, got {other:?}"),
        }
        // Rejection leaves nothing behind for pool-b.
        registry.reserve("pool-b", &claims(&["sbx-2"])).await.unwrap();
        registry.release("pool-b").await;

        registry.cleanup("pool-a").await.unwrap();
        registry
            .reserve("pool-b", &claims(&["sbx-0", "sbx-1"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn same_container_on_another_target_is_not_claimed() {
        let registry = Registry::new();
        registry.reserve("a", &["local/sbx-0".to_string()]).await.unwrap();
        registry
            .reserve("b", &["ssh://gpu-1/sbx-0".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commit_without_reservation_is_not_found() {
        let registry = Registry::new();
        let result = registry.commit("env", Arc::new(FakeBackend::new("env"))).await;
        assert!(matches!(result, Err(DeployError::NotFound(_))));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn cleanup_unknown_name_is_not_found() {
        let registry = Registry::new();
        let result = registry.cleanup("ghost").await;
        assert!(matches!(result, Err(DeployError::NotFound(_))));
    }

    #[tokio::test]
    async fn cleanup_all_attempts_every_entry_and_empties() {
        let registry = Registry::new();
        let ok = Arc::new(FakeBackend::new("ok"));
        let bad = Arc::new(FakeBackend::new("bad").with_failing_cleanup());
        registry.register("ok", ok.clone()).await.unwrap();
        registry.register("bad", bad.clone()).await.unwrap();

        let report = registry.cleanup_all().await;

        assert_eq!(report.attempted(), 2);
        assert_eq!(report.succeeded(), vec!["ok"]);
        assert_eq!(bad.cleanups(), 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_registers_of_one_name_admit_exactly_one() {
        let registry = Registry::new();
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .register("env", Arc::new(FakeBackend::new(format!("b{i}"))))
                        .await
                })
            })
            .collect();

        let mut admitted = 0;
        for t in tasks {
            if t.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(registry.len().await, 1);
    }
}
