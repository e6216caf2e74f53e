//! A backend running in one container.
//!
//! Construction goes through [`ContainerManager`] for the reuse/restart/
//! recreate decision, then resolves the container IP and connects a
//! transport to `ip:internal_port`. With `connect_only` the container must
//! already exist and nothing is pulled or created.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use envgrid_core::config::ContainerSettings;
use envgrid_core::{BoxFuture, DaemonTarget, MethodInfo, SshOptions};
use envgrid_engine::{wait_for_port, ContainerHandle, ContainerManager, ExecOutput, StartOptions};

use crate::backend::Backend;
use crate::error::{BackendError, BackendResult};
use crate::transport::{Transport, TransportFactory};

/// Everything needed to bring up (or attach to) one container backend.
#[derive(Debug, Clone)]
pub struct ContainerBackendConfig {
    pub image: String,
    /// Container name; also the backend name.
    pub name: String,
    pub target: DaemonTarget,
    pub ssh: SshOptions,
    pub settings: ContainerSettings,
    pub start: StartOptions,
    /// Pull before starting (falls back to the local image).
    pub pull: bool,
    pub quiet: bool,
    /// Stop and remove the container on `cleanup`.
    pub auto_cleanup: bool,
    /// Attach to an existing container by name instead of creating one.
    pub connect_only: bool,
    /// Wait for the internal port to accept connections before connecting.
    pub port_check: bool,
}

impl ContainerBackendConfig {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            target: DaemonTarget::Local,
            ssh: SshOptions::default(),
            settings: ContainerSettings::default(),
            start: StartOptions::default(),
            pull: true,
            quiet: false,
            auto_cleanup: true,
            connect_only: false,
            port_check: true,
        }
    }

    /// Config for attaching to an already running container.
    pub fn attach(name: impl Into<String>, target: DaemonTarget) -> Self {
        Self {
            target,
            pull: false,
            auto_cleanup: false,
            connect_only: true,
            ..Self::new(String::new(), name)
        }
    }
}

/// One container plus the transport into it.
pub struct ContainerBackend {
    name: String,
    manager: ContainerManager,
    handle: Mutex<Option<ContainerHandle>>,
    container_id: String,
    transport: Arc<dyn Transport>,
    address: (String, u16),
    auto_cleanup: bool,
    stop_timeout: std::time::Duration,
    ready: AtomicBool,
}

impl std::fmt::Debug for ContainerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerBackend")
            .field("name", &self.name)
            .field("target", self.manager.target())
            .field("address", &self.address)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ContainerBackend {
    /// Connect to the configured daemon and bring the backend up.
    pub async fn create(
        config: ContainerBackendConfig,
        transports: Arc<dyn TransportFactory>,
    ) -> BackendResult<Self> {
        let manager = ContainerManager::connect(
            config.target.clone(),
            &config.settings.docker_socket,
            &config.ssh,
        )
        .await?;
        Self::create_with_manager(manager, config, transports).await
    }

    /// Bring the backend up on an existing manager.
    pub async fn create_with_manager(
        manager: ContainerManager,
        config: ContainerBackendConfig,
        transports: Arc<dyn TransportFactory>,
    ) -> BackendResult<Self> {
        let mut handle = if config.connect_only {
            manager.find_container(&config.name).await?.ok_or_else(|| {
                BackendError::new(format!(
                    "no container named {} on {}",
                    config.name,
                    manager.target()
                ))
            })?
        } else {
            if config.pull {
                manager.pull_image(&config.image, config.quiet).await?;
            }
            manager
                .start_container(&config.image, &config.name, &config.start)
                .await?
        };

        let connected = connect_transport(&manager, &mut handle, &config, transports.as_ref()).await;
        let (transport, address) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                // A container we own and cannot talk to is removed, not leaked.
                if config.auto_cleanup && !config.connect_only {
                    let name = handle.name().to_string();
                    if let Err(stop_err) = manager
                        .stop_container(handle, config.settings.stop_timeout)
                        .await
                    {
                        warn!(%name, error = %stop_err, "failed to remove unreachable container");
                    }
                }
                return Err(e);
            }
        };

        info!(
            name = %config.name,
            target = %manager.target(),
            address = %format!("{}:{}", address.0, address.1),
            flavor = ?transport.flavor(),
            attached = config.connect_only,
            "container backend ready"
        );

        Ok(Self {
            name: config.name,
            container_id: handle.id().to_string(),
            handle: Mutex::new(Some(handle)),
            manager,
            transport,
            address,
            auto_cleanup: config.auto_cleanup,
            stop_timeout: config.settings.stop_timeout,
            ready: AtomicBool::new(true),
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn target(&self) -> &DaemonTarget {
        self.manager.target()
    }

    /// Run a command inside the container.
    pub async fn exec(&self, cmd: &[String], workdir: Option<&str>) -> BackendResult<ExecOutput> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| BackendError::new(format!("backend {} has been cleaned up", self.name)))?;
        Ok(self.manager.exec_command(handle, cmd, workdir).await?)
    }

    fn ensure_ready(&self) -> BackendResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(BackendError::new(format!("backend {} is not ready", self.name)))
        }
    }
}

async fn connect_transport(
    manager: &ContainerManager,
    handle: &mut ContainerHandle,
    config: &ContainerBackendConfig,
    transports: &dyn TransportFactory,
) -> BackendResult<(Arc<dyn Transport>, (String, u16))> {
    let settings = &config.settings;
    let ip = manager.get_container_ip(handle).await?;
    let port = settings.internal_port;

    if config.port_check
        && !wait_for_port(&ip, port, settings.port_timeout, settings.port_interval).await
    {
        return Err(BackendError::new(format!(
            "{} did not open port {port} within {:?}",
            handle.name(),
            settings.port_timeout
        )));
    }

    debug!(name = %handle.name(), %ip, port, "connecting transport");
    let transport = transports
        .connect(&ip, port, settings.call_timeout)
        .await
        .map_err(|e| {
            BackendError::with_source(format!("cannot reach {} at {ip}:{port}", handle.name()), e)
        })?;
    Ok((transport, (ip, port)))
}

impl Backend for ContainerBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_method<'a>(&'a self, method: &'a str, args: Value) -> BoxFuture<'a, BackendResult<Value>> {
        Box::pin(async move {
            self.ensure_ready()?;
            self.transport.call_method(method, args).await.map_err(|e| {
                BackendError::with_source(format!("call {method} on {} failed", self.name), e)
            })
        })
    }

    fn list_methods(&self) -> BoxFuture<'_, BackendResult<Vec<MethodInfo>>> {
        Box::pin(async move {
            self.ensure_ready()?;
            self.transport.list_methods().await.map_err(|e| {
                BackendError::with_source(format!("list methods on {} failed", self.name), e)
            })
        })
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.is_ready() && self.transport.health_check().await })
    }

    fn cleanup(&self) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            self.ready.store(false, Ordering::Release);
            self.transport.close().await;

            let Some(handle) = self.handle.lock().await.take() else {
                return Ok(());
            };
            if !self.auto_cleanup {
                debug!(name = %self.name, "leaving container running");
                return Ok(());
            }
            self.manager.stop_container(handle, self.stop_timeout).await?;
            Ok(())
        })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> Option<(String, u16)> {
        Some(self.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeTransportFactory;
    use crate::transport::TransportError;
    use envgrid_engine::ContainerStatus;
    use envgrid_engine::fake::FakeEngine;
    use serde_json::json;

    fn config(name: &str) -> ContainerBackendConfig {
        ContainerBackendConfig {
            port_check: false,
            quiet: true,
            ..ContainerBackendConfig::new("sandbox:latest", name)
        }
    }

    fn manager(engine: &Arc<FakeEngine>) -> ContainerManager {
        ContainerManager::with_engine(engine.clone())
    }

    #[tokio::test]
    async fn create_starts_container_and_connects() {
        let engine = Arc::new(FakeEngine::new().with_image("sandbox:latest"));
        let transports = Arc::new(FakeTransportFactory::new());

        let backend =
            ContainerBackend::create_with_manager(manager(&engine), config("sbx-0"), transports.clone())
                .await
                .unwrap();

        assert!(backend.is_ready());
        assert_eq!(backend.name(), "sbx-0");
        let (ip, port) = backend.endpoint().unwrap();
        assert!(ip.starts_with("172.17."));
        assert_eq!(port, 8000);
        assert_eq!(transports.connections(), vec![format!("{ip}:8000")]);

        let result = backend.call_method("step", json!({"a": 1})).await.unwrap();
        assert_eq!(result, json!({"method": "step", "args": {"a": 1}}));
    }

    #[tokio::test]
    async fn connect_only_requires_existing_container() {
        let engine = Arc::new(FakeEngine::new().with_image("sandbox:latest"));
        let transports = Arc::new(FakeTransportFactory::new());

        let result = ContainerBackend::create_with_manager(
            manager(&engine),
            ContainerBackendConfig::attach("sbx-0", DaemonTarget::Local),
            transports,
        )
        .await;

        assert!(matches!(result, Err(BackendError::Backend { .. })));
        assert_eq!(engine.create_calls(), 0);
    }

    #[tokio::test]
    async fn connect_only_attaches_and_leaves_container_on_cleanup() {
        let engine = Arc::new(FakeEngine::new().with_image("sandbox:latest"));
        let id = engine.insert_container("sbx-0", "sandbox:latest", ContainerStatus::Running);
        let transports = Arc::new(FakeTransportFactory::new());

        let mut cfg = ContainerBackendConfig::attach("sbx-0", DaemonTarget::Local);
        cfg.port_check = false;
        let backend = ContainerBackend::create_with_manager(manager(&engine), cfg, transports)
            .await
            .unwrap();

        assert_eq!(backend.container_id(), id);
        backend.cleanup().await.unwrap();
        assert!(!backend.is_ready());
        assert_eq!(engine.container_names(), vec!["sbx-0".to_string()]);
    }

    #[tokio::test]
    async fn cleanup_removes_owned_container_once() {
        let engine = Arc::new(FakeEngine::new().with_image("sandbox:latest"));
        let backend = ContainerBackend::create_with_manager(
            manager(&engine),
            config("sbx-0"),
            Arc::new(FakeTransportFactory::new()),
        )
        .await
        .unwrap();

        backend.cleanup().await.unwrap();
        backend.cleanup().await.unwrap();
        assert!(engine.container_names().is_empty());

        let err = backend.call_method("step", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("not ready"));
        assert!(!backend.health_check().await);
    }

    #[tokio::test]
    async fn transport_errors_are_wrapped_with_cause() {
        let engine = Arc::new(FakeEngine::new().with_image("sandbox:latest"));
        let transports = Arc::new(FakeTransportFactory::new().failing_method("boom"));
        let backend =
            ContainerBackend::create_with_manager(manager(&engine), config("sbx-0"), transports)
                .await
                .unwrap();

        let err = backend.call_method("boom", json!({})).await.unwrap_err();
        assert!(matches!(err.transport_error(), Some(TransportError::Http { status: 500, .. })));
    }

    #[tokio::test]
    async fn unreachable_container_is_removed() {
        let engine = Arc::new(FakeEngine::new().with_image("sandbox:latest"));
        let transports = Arc::new(FakeTransportFactory::new().refusing());

        let result =
            ContainerBackend::create_with_manager(manager(&engine), config("sbx-0"), transports).await;

        let err = result.unwrap_err();
        assert!(matches!(err.transport_error(), Some(TransportError::Connect(_))));
        assert!(engine.container_names().is_empty());
    }

    #[tokio::test]
    async fn missing_image_surfaces_engine_error() {
        let engine = Arc::new(FakeEngine::new().with_failing_pull());
        let result = ContainerBackend::create_with_manager(
            manager(&engine),
            config("sbx-0"),
            Arc::new(FakeTransportFactory::new()),
        )
        .await;

        assert!(matches!(
            result,
            Err(BackendError::Engine(envgrid_engine::EngineError::ImageNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn exec_runs_in_container() {
        let engine = Arc::new(FakeEngine::new().with_image("sandbox:latest"));
        let backend = ContainerBackend::create_with_manager(
            manager(&engine),
            config("sbx-0"),
            Arc::new(FakeTransportFactory::new()),
        )
        .await
        .unwrap();

        let out = backend.exec(&["ls".to_string()], None).await.unwrap();
        assert_eq!(out.output, "ls");

        backend.cleanup().await.unwrap();
        assert!(backend.exec(&["ls".to_string()], None).await.is_err());
    }
}
