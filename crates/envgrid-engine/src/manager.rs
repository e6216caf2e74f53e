//! Container lifecycle on one daemon: reconcile, start, stop and sweep.
//!
//! The manager owns the reuse/restart/recreate decision applied when a
//! container name already exists, so repeated deploys under one name stay
//! idempotent:
//!
//! ```text
//! start_container(image, name)
//!   ├── image missing locally ─────────────▶ ImageNotFound
//!   ├── name exists
//!   │    ├── force_recreate ──▶ remove ─────▶ create
//!   │    ├── running ───────────────────────▶ reuse
//!   │    └── stopped ──▶ restart ─┬─ running ▶ reuse
//!   │                             └─ else ──▶ remove ─▶ create
//!   └── name free ──────────────────────────▶ create ─▶ verify running (else Start)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use envgrid_core::{CleanupReport, DaemonTarget, SshOptions};

use crate::api::{ContainerEngine, ContainerStatus, ContainerSummary, CreateSpec, ExecOutput};
use crate::docker::{managed_labels, DockerEngine};
use crate::error::{EngineError, EngineResult};

/// A container owned by exactly one backend.
///
/// Deliberately not `Clone`: stopping consumes the handle.
#[derive(Debug, PartialEq, Eq)]
pub struct ContainerHandle {
    id: String,
    name: String,
    ip: Option<String>,
    status: ContainerStatus,
}

impl ContainerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// IP cached by [`ContainerManager::get_container_ip`].
    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn status(&self) -> &ContainerStatus {
        &self.status
    }

    fn from_summary(summary: ContainerSummary) -> Self {
        Self {
            id: summary.id,
            name: summary.name,
            ip: None,
            status: summary.status,
        }
    }
}

/// Options applied when a container has to be created.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Remove any existing container of the same name first.
    pub force_recreate: bool,
    /// Memory limit in bytes.
    pub mem_limit: Option<i64>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub command: Option<Vec<String>>,
}

/// Lifecycle operations against one container daemon.
#[derive(Clone)]
pub struct ContainerManager {
    engine: Arc<dyn ContainerEngine>,
}

impl std::fmt::Debug for ContainerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerManager")
            .field("target", self.engine.target())
            .finish()
    }
}

impl ContainerManager {
    /// Open a connection to the daemon at `target` and verify it responds.
    pub async fn connect(
        target: DaemonTarget,
        socket: &str,
        ssh: &SshOptions,
    ) -> EngineResult<Self> {
        let engine = DockerEngine::connect(target, socket, ssh.clone()).await?;
        Ok(Self::with_engine(Arc::new(engine)))
    }

    /// Wrap an already-constructed engine.
    pub fn with_engine(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    pub fn target(&self) -> &DaemonTarget {
        self.engine.target()
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Pull an image, falling back to the local store on any failure.
    ///
    /// Registries are often unreachable from sandboxes; a cached image is
    /// good enough. Fails only when the image is absent both ways.
    pub async fn pull_image(&self, image: &str, quiet: bool) -> EngineResult<()> {
        if !quiet {
            info!(%image, target = %self.target(), "pulling image");
        }
        match self.engine.pull_image(image).await {
            Ok(()) => {
                debug!(%image, "image pulled");
                Ok(())
            }
            Err(pull_err) => {
                let present = self.engine.image_exists(image).await.unwrap_or(false);
                if present {
                    warn!(%image, error = %pull_err, "pull failed, using local image");
                    Ok(())
                } else {
                    Err(EngineError::ImageNotFound(format!(
                        "{image} (pull failed: {pull_err}; not present locally)"
                    )))
                }
            }
        }
    }

    pub async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        self.engine.image_exists(image).await
    }

    /// Look up a container by exact name.
    pub async fn find_container(&self, name: &str) -> EngineResult<Option<ContainerHandle>> {
        Ok(self.find_summary(name).await?.map(ContainerHandle::from_summary))
    }

    async fn find_summary(&self, name: &str) -> EngineResult<Option<ContainerSummary>> {
        let candidates = self.engine.list_containers(name).await?;
        Ok(candidates.into_iter().find(|c| c.name == name))
    }

    /// Force-remove the container called `name`. Returns `false` if absent.
    pub async fn remove_container(&self, name: &str) -> EngineResult<bool> {
        match self.find_summary(name).await? {
            Some(c) => {
                let removed = self.engine.remove_container(&c.id, true).await?;
                info!(%name, id = %short_id(&c.id), "container removed");
                Ok(removed)
            }
            None => Ok(false),
        }
    }

    /// Return a running container named `name`, reusing, restarting or
    /// recreating an existing one as needed.
    pub async fn start_container(
        &self,
        image: &str,
        name: &str,
        opts: &StartOptions,
    ) -> EngineResult<ContainerHandle> {
        if !self.engine.image_exists(image).await? {
            return Err(EngineError::ImageNotFound(image.to_string()));
        }

        if let Some(existing) = self.find_summary(name).await? {
            if opts.force_recreate {
                info!(%name, id = %short_id(&existing.id), "force recreate, removing existing container");
                self.engine.remove_container(&existing.id, true).await?;
            } else if existing.status.is_running() {
                info!(%name, id = %short_id(&existing.id), "reusing running container");
                return Ok(ContainerHandle::from_summary(existing));
            } else {
                info!(%name, status = %existing.status, "restarting stopped container");
                match self.restart_existing(&existing.id).await {
                    Ok(Some(handle)) => return Ok(handle),
                    Ok(None) => {}
                    Err(e) => warn!(%name, error = %e, "restart failed"),
                }
                info!(%name, "removing container that would not restart");
                self.engine.remove_container(&existing.id, true).await?;
            }
        }

        self.create_and_start(image, name, opts).await
    }

    async fn restart_existing(&self, id: &str) -> EngineResult<Option<ContainerHandle>> {
        self.engine.restart_container(id).await?;
        let details = self.engine.inspect_container(id).await?;
        if details.status.is_running() {
            Ok(Some(ContainerHandle {
                id: details.id,
                name: details.name,
                ip: None,
                status: details.status,
            }))
        } else {
            Ok(None)
        }
    }

    async fn create_and_start(
        &self,
        image: &str,
        name: &str,
        opts: &StartOptions,
    ) -> EngineResult<ContainerHandle> {
        let spec = CreateSpec {
            name: name.to_string(),
            image: image.to_string(),
            env: opts.env.clone(),
            labels: managed_labels(&opts.labels),
            command: opts.command.clone(),
            mem_limit: opts.mem_limit,
        };

        let id = match self.engine.create_container(&spec).await {
            Ok(id) => id,
            Err(EngineError::ImageNotFound(i)) => return Err(EngineError::ImageNotFound(i)),
            Err(e) => {
                return Err(EngineError::Container(format!(
                    "failed to create {name}: {e}"
                )));
            }
        };

        if let Err(e) = self.engine.start_container(&id).await {
            self.discard(&id, name).await;
            return Err(EngineError::Start(format!("{name}: {e}")));
        }

        let details = self.engine.inspect_container(&id).await?;
        if !details.status.is_running() {
            self.discard(&id, name).await;
            return Err(EngineError::Start(format!(
                "{name} did not reach running state (status: {})",
                details.status
            )));
        }

        info!(%name, id = %short_id(&id), %image, target = %self.target(), "container started");
        Ok(ContainerHandle {
            id,
            name: name.to_string(),
            ip: None,
            status: details.status,
        })
    }

    /// Best-effort removal of a container that failed to come up.
    async fn discard(&self, id: &str, name: &str) {
        if let Err(e) = self.engine.remove_container(id, true).await {
            warn!(%name, error = %e, "failed to discard broken container");
        }
    }

    /// Stop gracefully, then force-remove.
    ///
    /// A failed stop is not fatal; removal is what must succeed.
    pub async fn stop_container(&self, handle: ContainerHandle, timeout: Duration) -> EngineResult<()> {
        if let Err(e) = self.engine.stop_container(&handle.id, timeout).await {
            debug!(name = %handle.name, error = %e, "graceful stop failed, forcing removal");
        }
        match self.engine.remove_container(&handle.id, true).await {
            Ok(_) => {
                info!(name = %handle.name, id = %short_id(&handle.id), "container stopped and removed");
                Ok(())
            }
            Err(e) => Err(EngineError::Container(format!(
                "failed to remove {}: {e}",
                handle.name
            ))),
        }
    }

    /// First non-empty IP across the container's networks. Cached on the handle.
    pub async fn get_container_ip(&self, handle: &mut ContainerHandle) -> EngineResult<String> {
        if let Some(ip) = &handle.ip {
            return Ok(ip.clone());
        }
        let details = self.engine.inspect_container(&handle.id).await?;
        handle.status = details.status;
        let ip = details
            .ip_addresses
            .into_iter()
            .find(|ip| !ip.is_empty())
            .ok_or_else(|| {
                EngineError::Container(format!("container {} has no IP address", handle.name))
            })?;
        handle.ip = Some(ip.clone());
        Ok(ip)
    }

    pub async fn exec_command(
        &self,
        handle: &ContainerHandle,
        cmd: &[String],
        workdir: Option<&str>,
    ) -> EngineResult<ExecOutput> {
        debug!(name = %handle.name, ?cmd, "exec");
        self.engine.exec(&handle.id, cmd, workdir).await
    }

    /// Force-stop and remove every container whose name contains `pattern`.
    ///
    /// All matches are attempted concurrently; failures are reported, not raised.
    pub async fn sweep(&self, pattern: &str, timeout: Duration) -> EngineResult<CleanupReport<EngineError>> {
        let matches: Vec<ContainerSummary> = self
            .engine
            .list_containers(pattern)
            .await?
            .into_iter()
            .filter(|c| c.name.contains(pattern))
            .collect();

        info!(%pattern, count = matches.len(), target = %self.target(), "sweeping containers");

        let outcomes = join_all(matches.into_iter().map(|c| async move {
            let name = c.name.clone();
            let result = self.stop_container(ContainerHandle::from_summary(c), timeout).await;
            if let Err(e) = &result {
                warn!(%name, error = %e, "sweep failed for container");
            }
            (name, result)
        }))
        .await;

        Ok(CleanupReport::new(outcomes))
    }
}

/// Poll a raw TCP connect until it succeeds or `timeout` elapses.
///
/// Never fails: returns `false` on timeout.
pub async fn wait_for_port(host: &str, port: u16, timeout: Duration, interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let addr = format!("{host}:{port}");
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(%addr, ?timeout, "port did not open in time");
            return false;
        }
        match tokio::time::timeout(interval.min(remaining), TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => {
                debug!(%addr, "port open");
                return true;
            }
            Ok(Err(e)) => debug!(%addr, error = %e, "port not ready"),
            Err(_) => debug!(%addr, "port probe timed out"),
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(interval.min(remaining)).await;
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
