//! Deployment orchestrator: (image, replicas, hosts) to one ready backend.
//!
//! ```text
//! Requested ─▶ Validating ─▶ Deploying ─┬─▶ Ready
//!                  │                    └─▶ RollingBack ─▶ Failed
//!                  └─ invalid ─────────────────────────────▶ Failed
//! ```
//!
//! Validation never touches a daemon. Replicas are built concurrently,
//! one task per assigned host, named `{prefix}-{index}`. If any replica
//! fails, every replica that did come up is cleaned up before the
//! original error is returned.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use envgrid_backend::{
    Backend, BackendError, BackendResult, ContainerBackend, ContainerBackendConfig,
    TransportFactory,
};
use envgrid_core::config::ContainerSettings;
use envgrid_core::{parse_memory, BoxFuture, CleanupReport, DaemonTarget, EnvgridConfig, LbStrategy, SshOptions};
use envgrid_engine::{BuildOptions, ContainerEngine, ContainerManager, ImageBuilder, StartOptions};

use crate::error::{DeployError, DeployResult, DeployStage};
use crate::pool::{InstanceInfo, InstancePool};
use crate::registry::Registry;

/// Label carrying the deployment a container belongs to.
pub const DEPLOYMENT_LABEL: &str = "envgrid.deployment";

/// Where a deployment currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Requested,
    Validating,
    Deploying,
    RollingBack,
    Ready,
    Failed,
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployPhase::Requested => "requested",
            DeployPhase::Validating => "validating",
            DeployPhase::Deploying => "deploying",
            DeployPhase::RollingBack => "rolling-back",
            DeployPhase::Ready => "ready",
            DeployPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What to deploy.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Pre-built image. With `src_dir` set, the tag to build.
    pub image: Option<String>,
    /// Source tree with a Dockerfile, built on every target host.
    pub src_dir: Option<PathBuf>,
    pub replicas: usize,
    /// Daemon targets, one per replica. `None` means all local.
    pub hosts: Option<Vec<String>>,
    pub strategy: LbStrategy,
    /// Registry name; defaults to the backend or pool name.
    pub name: Option<String>,
    /// Replica name prefix; defaults to `name`, then the image's repository.
    pub prefix: Option<String>,
    pub env: HashMap<String, String>,
    pub force_recreate: bool,
    pub pull: bool,
    pub mem_limit: Option<i64>,
    /// Clean up on [`Envgrid::shutdown`](crate::Envgrid::shutdown).
    pub cleanup_on_exit: bool,
    /// Attach to an existing container named `{prefix}-0` (or `name`).
    pub connect_only: bool,
    pub port_check: bool,
    pub quiet: bool,
    pub build: BuildOptions,
    pub push_registry: Option<String>,
}

impl Default for DeployRequest {
    fn default() -> Self {
        Self {
            image: None,
            src_dir: None,
            replicas: 1,
            hosts: None,
            strategy: LbStrategy::default(),
            name: None,
            prefix: None,
            env: HashMap::new(),
            force_recreate: false,
            pull: true,
            mem_limit: None,
            cleanup_on_exit: true,
            connect_only: false,
            port_check: true,
            quiet: false,
            build: BuildOptions::default(),
            push_registry: None,
        }
    }
}

impl DeployRequest {
    pub fn image(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            ..Self::default()
        }
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Request described by the `[deploy]` and `[build]` sections of a config file.
    pub fn from_config(config: &EnvgridConfig) -> DeployResult<Self> {
        let d = &config.deploy;
        let defaults = Self::default();
        let mem_limit = match d.mem_limit.as_deref() {
            Some(raw) => Some(parse_memory(raw).ok_or_else(|| {
                DeployError::Validation(format!("invalid mem_limit: {raw}"))
            })?),
            None => None,
        };
        let (build, push_registry, tag) = match &config.build {
            Some(b) => (
                BuildOptions {
                    nocache: b.nocache.unwrap_or(false),
                    quiet: b.quiet.unwrap_or(false),
                    build_args: b.args.clone().unwrap_or_default(),
                },
                b.push_registry.clone(),
                b.tag.clone(),
            ),
            None => (BuildOptions::default(), None, None),
        };

        Ok(Self {
            image: d.image.clone().or(tag),
            src_dir: d.src_dir.as_ref().map(PathBuf::from),
            replicas: d.replicas.map(|r| r as usize).unwrap_or(defaults.replicas),
            hosts: d.hosts.clone(),
            strategy: d.strategy.unwrap_or_default(),
            name: d.name.clone(),
            prefix: d.prefix.clone(),
            env: d.env.clone().unwrap_or_default(),
            force_recreate: d.force_recreate.unwrap_or(false),
            pull: d.pull.unwrap_or(defaults.pull),
            mem_limit,
            cleanup_on_exit: d.cleanup_on_exit.unwrap_or(defaults.cleanup_on_exit),
            build,
            push_registry,
            ..defaults
        })
    }
}

/// A validated request: every replica has a name and a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployPlan {
    pub prefix: String,
    pub image: String,
    /// `(replica name, daemon target)` in index order.
    pub replicas: Vec<(String, DaemonTarget)>,
}

/// Check a request and assign names and hosts. Performs no I/O.
/// The registry name a deployment will be known by: the requested name, else
/// the single replica's container name, else a generated pool name.
fn registry_name(request: &DeployRequest, plan: &DeployPlan) -> String {
    match (&request.name, plan.replicas.as_slice()) {
        (Some(name), _) => name.clone(),
        (None, [(replica, _)]) => replica.clone(),
        (None, replicas) => InstancePool::default_name(&plan.prefix, replicas.len()),
    }
}

/// Containers this deployment will own and destroy on cleanup, as
/// `{target}/{container}`. An attached container is never destroyed, so
/// attaching claims nothing.
fn replica_claims(request: &DeployRequest, plan: &DeployPlan) -> Vec<String> {
    if request.connect_only {
        return Vec::new();
    }
    plan.replicas
        .iter()
        .map(|(replica, target)| format!("{target}/{replica}"))
        .collect()
}

pub fn validate(request: &DeployRequest) -> DeployResult<DeployPlan> {
    if request.replicas == 0 {
        return Err(DeployError::Validation("replicas must be at least 1".to_string()));
    }
    if request.connect_only && request.replicas > 1 {
        return Err(DeployError::Validation(
            "connect_only attaches to a single container; replicas must be 1".to_string(),
        ));
    }
    if request.connect_only && request.src_dir.is_some() {
        return Err(DeployError::Validation(
            "connect_only cannot build from a source tree".to_string(),
        ));
    }

    let targets: Vec<DaemonTarget> = match &request.hosts {
        Some(hosts) => {
            if hosts.len() < request.replicas {
                return Err(DeployError::Validation(format!(
                    "{} replicas requested but only {} host(s) given",
                    request.replicas,
                    hosts.len()
                )));
            }
            hosts
                .iter()
                .take(request.replicas)
                .map(|h| {
                    DaemonTarget::parse(h)
                        .map_err(|e| DeployError::Validation(format!("host {h}: {e}")))
                })
                .collect::<DeployResult<_>>()?
        }
        None => vec![DaemonTarget::Local; request.replicas],
    };

    let image = match (&request.image, &request.src_dir, &request.name, &request.prefix) {
        (Some(image), _, _, _) => image.clone(),
        (None, Some(_), _, Some(p)) | (None, Some(_), Some(p), None) => format!("{p}:latest"),
        (None, Some(dir), None, None) => format!("{}:latest", dir_stem(dir)),
        (None, None, _, _) if request.connect_only => String::new(),
        (None, None, _, _) => {
            return Err(DeployError::Validation(
                "either an image or a source directory is required".to_string(),
            ));
        }
    };

    let prefix = match (&request.prefix, &request.name) {
        (Some(p), _) | (None, Some(p)) => p.clone(),
        (None, None) => image_stem(&image),
    };
    if prefix.is_empty() {
        return Err(DeployError::Validation(
            "a name or prefix is required to attach".to_string(),
        ));
    }

    let replicas = if request.connect_only {
        let name = request.name.clone().unwrap_or_else(|| format!("{prefix}-0"));
        vec![(name, targets[0].clone())]
    } else {
        targets
            .into_iter()
            .enumerate()
            .map(|(i, target)| (format!("{prefix}-{i}"), target))
            .collect()
    };

    Ok(DeployPlan {
        prefix,
        image,
        replicas,
    })
}

/// Repository part of an image reference, usable as a container name.
fn image_stem(image: &str) -> String {
    let repo = image.rsplit('/').next().unwrap_or(image);
    let repo = repo.split(['@', ':']).next().unwrap_or(repo);
    sanitize(repo)
}

fn dir_stem(dir: &std::path::Path) -> String {
    dir.file_name()
        .map(|n| sanitize(&n.to_string_lossy()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "envgrid".to_string())
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Builds one replica backend. Injected so deployments can be exercised
/// without a daemon.
pub trait BackendFactory: Send + Sync {
    fn create(&self, config: ContainerBackendConfig) -> BoxFuture<'_, BackendResult<Arc<dyn Backend>>>;
}

/// Builds [`ContainerBackend`]s, connecting to each replica's daemon.
pub struct ContainerBackendFactory {
    transports: Arc<dyn TransportFactory>,
    engine: Option<Arc<dyn ContainerEngine>>,
}

impl ContainerBackendFactory {
    pub fn new(transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            transports,
            engine: None,
        }
    }

    /// Use one engine for every replica regardless of target.
    pub fn with_engine(engine: Arc<dyn ContainerEngine>, transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            transports,
            engine: Some(engine),
        }
    }
}

impl BackendFactory for ContainerBackendFactory {
    fn create(&self, config: ContainerBackendConfig) -> BoxFuture<'_, BackendResult<Arc<dyn Backend>>> {
        Box::pin(async move {
            let backend = match &self.engine {
                Some(engine) => {
                    let manager = ContainerManager::with_engine(engine.clone());
                    ContainerBackend::create_with_manager(manager, config, self.transports.clone())
                        .await?
                }
                None => ContainerBackend::create(config, self.transports.clone()).await?,
            };
            Ok(Arc::new(backend) as Arc<dyn Backend>)
        })
    }
}

/// A successful deployment.
#[derive(Clone)]
pub struct Deployment {
    /// Registry name.
    pub name: String,
    pub backend: Arc<dyn Backend>,
    /// Replica container names, in index order.
    pub replicas: Vec<String>,
}

impl fmt::Debug for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deployment")
            .field("name", &self.name)
            .field("replicas", &self.replicas)
            .finish()
    }
}

/// Turns [`DeployRequest`]s into registered backends.
pub struct Orchestrator {
    factory: Arc<dyn BackendFactory>,
    registry: Registry,
    settings: ContainerSettings,
    ssh: SshOptions,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("ssh", &self.ssh)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        registry: Registry,
        settings: ContainerSettings,
        ssh: SshOptions,
    ) -> Self {
        Self {
            factory,
            registry,
            settings,
            ssh,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub async fn deploy(&self, request: &DeployRequest) -> DeployResult<Deployment> {
        let label = request.name.as_deref().or(request.image.as_deref()).unwrap_or("-");
        debug!(deployment = %label, phase = %DeployPhase::Requested, replicas = request.replicas);

        debug!(deployment = %label, phase = %DeployPhase::Validating);
        let plan = match validate(request) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(deployment = %label, phase = %DeployPhase::Failed, error = %e, "deployment rejected");
                return Err(e);
            }
        };
        let name = registry_name(request, &plan);
        self.registry.reserve(&name, &replica_claims(request, &plan)).await?;

        match self.deploy_reserved(request, &plan, &name).await {
            Ok(backend) => {
                self.registry.commit(&name, backend.clone()).await?;
                info!(%name, replicas = plan.replicas.len(), phase = %DeployPhase::Ready, "deployment ready");
                Ok(Deployment {
                    name,
                    backend,
                    replicas: plan.replicas.into_iter().map(|(n, _)| n).collect(),
                })
            }
            Err(e) => {
                self.registry.release(&name).await;
                Err(e)
            }
        }
    }

    async fn deploy_reserved(
        &self,
        request: &DeployRequest,
        plan: &DeployPlan,
        name: &str,
    ) -> DeployResult<Arc<dyn Backend>> {
        info!(
            %name,
            prefix = %plan.prefix,
            image = %plan.image,
            replicas = plan.replicas.len(),
            phase = %DeployPhase::Deploying,
            "deploying"
        );

        let built = match &request.src_dir {
            Some(dir) => {
                self.build_images(plan, dir, request).await?;
                true
            }
            None => false,
        };

        let configs: Vec<ContainerBackendConfig> = plan
            .replicas
            .iter()
            .map(|(replica, target)| self.replica_config(plan, replica, target, request, built))
            .collect();

        if configs.len() == 1 {
            let config = configs.into_iter().next().ok_or_else(|| {
                DeployError::Validation("no replicas planned".to_string())
            })?;
            self.factory.create(config).await.map_err(|source| {
                warn!(%name, phase = %DeployPhase::Failed, error = %source, "deployment failed");
                DeployError::Failed {
                    name: plan.prefix.clone(),
                    stage: DeployStage::of(&source),
                    rolled_back: 0,
                    source,
                }
            })
        } else {
            let instances = self.build_replicas(plan, configs).await?;
            let pool = InstancePool::new(instances, request.strategy, Some(name.to_string()), &plan.prefix)?;
            Ok(Arc::new(pool))
        }
    }

    /// Build every replica concurrently; roll back the survivors if any fails.
    async fn build_replicas(
        &self,
        plan: &DeployPlan,
        configs: Vec<ContainerBackendConfig>,
    ) -> DeployResult<Vec<InstanceInfo>> {
        let port = self.settings.internal_port;
        let results = join_all(configs.into_iter().map(|config| {
            let host = config.target.to_string();
            let name = config.name.clone();
            async move {
                let result = self.factory.create(config).await;
                (name, host, result)
            }
        }))
        .await;

        let mut instances = Vec::with_capacity(results.len());
        let mut first_error: Option<(String, BackendError)> = None;
        for (name, host, result) in results {
            match result {
                Ok(backend) => instances.push(InstanceInfo::new(host, port, backend)),
                Err(e) => {
                    warn!(replica = %name, error = %e, "replica failed");
                    if first_error.is_none() {
                        first_error = Some((name, e));
                    }
                }
            }
        }

        let Some((failed, source)) = first_error else {
            return Ok(instances);
        };

        warn!(
            prefix = %plan.prefix,
            %failed,
            survivors = instances.len(),
            phase = %DeployPhase::RollingBack,
            "rolling back partial deployment"
        );
        let report = rollback(&instances).await;
        for (name, e) in report.failures() {
            warn!(replica = %name, error = %e, "rollback cleanup failed");
        }
        warn!(prefix = %plan.prefix, phase = %DeployPhase::Failed, "deployment failed");

        Err(DeployError::Failed {
            name: plan.prefix.clone(),
            stage: DeployStage::of(&source),
            rolled_back: report.succeeded().len(),
            source,
        })
    }

    /// Build (and optionally push) the image once per distinct target.
    async fn build_images(
        &self,
        plan: &DeployPlan,
        dir: &std::path::Path,
        request: &DeployRequest,
    ) -> DeployResult<()> {
        let mut targets: Vec<DaemonTarget> = Vec::new();
        for (_, target) in &plan.replicas {
            if !targets.contains(target) {
                targets.push(target.clone());
            }
        }

        let results = join_all(targets.into_iter().map(|target| async move {
            let builder = ImageBuilder::new(target);
            builder.build_from_env(dir, &plan.image, &request.build).await?;
            if let Some(registry) = &request.push_registry {
                builder.push_image(&plan.image, Some(registry.as_str())).await?;
            }
            Ok::<_, envgrid_engine::EngineError>(())
        }))
        .await;

        match results.into_iter().find_map(Result::err) {
            Some(e) => Err(DeployError::Failed {
                name: plan.prefix.clone(),
                stage: DeployStage::Build,
                rolled_back: 0,
                source: e.into(),
            }),
            None => Ok(()),
        }
    }

    fn replica_config(
        &self,
        plan: &DeployPlan,
        name: &str,
        target: &DaemonTarget,
        request: &DeployRequest,
        built: bool,
    ) -> ContainerBackendConfig {
        let mut labels = HashMap::new();
        labels.insert(DEPLOYMENT_LABEL.to_string(), plan.prefix.clone());
        ContainerBackendConfig {
            image: plan.image.clone(),
            name: name.to_string(),
            target: target.clone(),
            ssh: self.ssh.clone(),
            settings: self.settings.clone(),
            start: StartOptions {
                force_recreate: request.force_recreate,
                mem_limit: request.mem_limit,
                env: request.env.clone(),
                labels,
                command: None,
            },
            pull: request.pull && !built,
            quiet: request.quiet,
            auto_cleanup: !request.connect_only,
            connect_only: request.connect_only,
            port_check: request.port_check,
        }
    }
}

/// Clean up every constructed replica concurrently.
async fn rollback(instances: &[InstanceInfo]) -> CleanupReport<BackendError> {
    let outcomes = join_all(instances.iter().map(|i| async move {
        (i.backend.name().to_string(), i.backend.cleanup().await)
    }))
    .await;
    CleanupReport::new(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_assigns_local_replicas() {
        let plan = validate(&DeployRequest::image("registry.io/team/sandbox:1.2").with_replicas(3)).unwrap();
        assert_eq!(plan.prefix, "sandbox");
        let names: Vec<&str> = plan.replicas.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["sandbox-0", "sandbox-1", "sandbox-2"]);
        assert!(plan.replicas.iter().all(|(_, t)| t.is_local()));
    }

    #[test]
    fn validation_rejects_zero_replicas() {
        let result = validate(&DeployRequest::image("sandbox").with_replicas(0));
        assert!(matches!(result, Err(DeployError::Validation(_))));
    }

    #[test]
    fn validation_rejects_too_few_hosts() {
        let request = DeployRequest {
            hosts: Some(vec!["ssh://a".to_string(), "ssh://b".to_string()]),
            ..DeployRequest::image("sandbox").with_replicas(3)
        };
        assert!(matches!(validate(&request), Err(DeployError::Validation(_))));
    }

    #[test]
    fn validation_assigns_hosts_in_order() {
        let request = DeployRequest {
            hosts: Some(vec![
                "ssh://ubuntu@gpu-1".to_string(),
                "local".to_string(),
                "ssh://gpu-3".to_string(),
            ]),
            prefix: Some("job".to_string()),
            ..DeployRequest::image("sandbox").with_replicas(2)
        };
        let plan = validate(&request).unwrap();
        assert_eq!(plan.replicas[0].1.to_string(), "ssh://ubuntu@gpu-1");
        assert!(plan.replicas[1].1.is_local());
        assert_eq!(plan.replicas.len(), 2);
    }

    #[test]
    fn validation_rejects_connect_only_pools() {
        let request = DeployRequest {
            connect_only: true,
            name: Some("sbx-0".to_string()),
            ..DeployRequest::default().with_replicas(2)
        };
        assert!(matches!(validate(&request), Err(DeployError::Validation(_))));
    }

    #[test]
    fn validation_requires_image_or_source() {
        assert!(matches!(
            validate(&DeployRequest::default()),
            Err(DeployError::Validation(_))
        ));
    }

    #[test]
    fn connect_only_targets_named_container() {
        let request = DeployRequest {
            connect_only: true,
            name: Some("sbx-7".to_string()),
            ..DeployRequest::default()
        };
        let plan = validate(&request).unwrap();
        assert_eq!(plan.replicas[0].0, "sbx-7");
    }

    #[test]
    fn source_builds_default_tag_from_prefix() {
        let request = DeployRequest {
            src_dir: Some(PathBuf::from("/work/My Env")),
            ..DeployRequest::default()
        };
        let plan = validate(&request).unwrap();
        assert_eq!(plan.image, "my-env:latest");
        assert_eq!(plan.prefix, "my-env");
    }

    #[test]
    fn request_from_config() {
        let config = EnvgridConfig::from_toml_str(
            r#"
[deploy]
image = "sandbox:latest"
replicas = 4
strategy = "random"
mem_limit = "512m"
pull = false
"#,
        )
        .unwrap();
        let request = DeployRequest::from_config(&config).unwrap();
        assert_eq!(request.replicas, 4);
        assert_eq!(request.strategy, LbStrategy::Random);
        assert_eq!(request.mem_limit, Some(512 * 1024 * 1024));
        assert!(!request.pull);
        assert!(request.cleanup_on_exit);
    }

    #[test]
    fn bad_mem_limit_is_validation_error() {
        let config = EnvgridConfig::from_toml_str("[deploy]\nmem_limit = \"lots\"\n").unwrap();
        assert!(matches!(
            DeployRequest::from_config(&config),
            Err(DeployError::Validation(_))
        ));
    }

    #[test]
    fn image_stem_strips_registry_and_tag() {
        assert_eq!(image_stem("ghcr.io/org/env:v1"), "env");
        assert_eq!(image_stem("env@sha256:abc"), "env");
        assert_eq!(image_stem("Env_Name"), "env_name");
    }
}
