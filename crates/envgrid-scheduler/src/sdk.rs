//! The caller-facing `Envgrid` facade.
//!
//! Owns one [`Registry`] and one [`Orchestrator`]. Everything deployed
//! through it can be found again by name until it is cleaned up;
//! [`Envgrid::shutdown`] sweeps the entries deployed with
//! `cleanup_on_exit`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use envgrid_backend::{
    Backend, BackendError, HttpBackend, HttpTransportFactory, TransportFactory,
};
use envgrid_core::{CleanupReport, DaemonTarget, EnvgridConfig, MethodInfo};

use crate::deploy::{BackendFactory, ContainerBackendFactory, DeployRequest, Orchestrator};
use crate::error::{DeployError, DeployResult};
use crate::registry::Registry;

pub struct Envgrid {
    orchestrator: Orchestrator,
    transports: Arc<dyn TransportFactory>,
    call_timeout: Duration,
    exit_sweep: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for Envgrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envgrid")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl Envgrid {
    /// Real daemons and HTTP transports, tuned by `config`.
    pub fn new(config: &EnvgridConfig) -> Self {
        let transports: Arc<dyn TransportFactory> = Arc::new(HttpTransportFactory);
        let factory = Arc::new(ContainerBackendFactory::new(transports.clone()));
        Self::with_parts(factory, transports, config)
    }

    /// Inject the replica factory and transport factory.
    pub fn with_parts(
        factory: Arc<dyn BackendFactory>,
        transports: Arc<dyn TransportFactory>,
        config: &EnvgridConfig,
    ) -> Self {
        let settings = config.container_settings();
        let call_timeout = settings.call_timeout;
        Self {
            orchestrator: Orchestrator::new(factory, Registry::new(), settings, config.ssh_options()),
            transports,
            call_timeout,
            exit_sweep: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        self.orchestrator.registry()
    }

    /// Deploy and register. Returns the backend and its registry name.
    pub async fn deploy(&self, request: &DeployRequest) -> DeployResult<(Arc<dyn Backend>, String)> {
        let deployment = self.orchestrator.deploy(request).await?;
        if request.cleanup_on_exit {
            self.exit_sweep.lock().await.insert(deployment.name.clone());
        }
        Ok((deployment.backend, deployment.name))
    }

    /// Attach to a container another process deployed, and register it.
    pub async fn attach(&self, name: &str, target: DaemonTarget) -> DeployResult<Arc<dyn Backend>> {
        let request = DeployRequest {
            name: Some(name.to_string()),
            hosts: Some(vec![target.to_string()]),
            connect_only: true,
            pull: false,
            // An attached container is already serving.
            port_check: false,
            cleanup_on_exit: false,
            ..DeployRequest::default()
        };
        let (backend, _) = self.deploy(&request).await?;
        Ok(backend)
    }

    /// Register an already deployed HTTP service.
    pub async fn deploy_http(&self, name: &str, base_url: &str) -> DeployResult<Arc<dyn Backend>> {
        if self.registry().contains(name).await {
            return Err(DeployError::AlreadyRegistered(name.to_string()));
        }
        let backend: Arc<dyn Backend> = Arc::new(
            HttpBackend::connect(
                Some(name.to_string()),
                base_url,
                self.transports.clone(),
                self.call_timeout,
            )
            .await?,
        );
        self.registry().register(name, backend.clone()).await?;
        Ok(backend)
    }

    pub async fn get(&self, name: &str) -> DeployResult<Arc<dyn Backend>> {
        self.registry()
            .get(name)
            .await
            .ok_or_else(|| DeployError::NotFound(name.to_string()))
    }

    pub async fn call(&self, name: &str, method: &str, args: Value) -> DeployResult<Value> {
        let backend = self.get(name).await?;
        Ok(backend.call_method(method, args).await?)
    }

    pub async fn list_methods(&self, name: &str) -> DeployResult<Vec<MethodInfo>> {
        let backend = self.get(name).await?;
        Ok(backend.list_methods().await?)
    }

    pub async fn list_active(&self) -> Vec<String> {
        self.registry().list_all().await
    }

    pub async fn cleanup(&self, name: &str) -> DeployResult<()> {
        self.exit_sweep.lock().await.remove(name);
        self.registry().cleanup(name).await
    }

    pub async fn cleanup_all(&self) -> CleanupReport<BackendError> {
        self.exit_sweep.lock().await.clear();
        self.registry().cleanup_all().await
    }

    /// Clean up every live entry deployed with `cleanup_on_exit`.
    pub async fn shutdown(&self) -> CleanupReport<BackendError> {
        let names: Vec<String> = self.exit_sweep.lock().await.drain().collect();
        let outcomes = join_all(names.into_iter().map(|name| async move {
            let result = self.registry().cleanup(&name).await;
            (name, result)
        }))
        .await;

        let mut report = CleanupReport::default();
        for (name, result) in outcomes {
            let result = match result {
                Ok(()) => Ok(()),
                // Already cleaned up explicitly.
                Err(DeployError::NotFound(_)) => continue,
                Err(DeployError::Backend(e)) => Err(e),
                Err(e) => Err(BackendError::new(e.to_string())),
            };
            if let Err(e) = &result {
                warn!(%name, error = %e, "cleanup on shutdown failed");
            }
            report.outcomes.push((name, result));
        }
        info!(cleaned = report.succeeded().len(), failed = report.failures().len(), "shutdown sweep done");
        report
    }
}
