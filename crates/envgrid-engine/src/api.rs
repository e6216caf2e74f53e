//! The low-level Engine API surface envgrid needs from a container daemon.
//!
//! [`ContainerEngine`] is dyn-compatible (boxed futures) so the
//! [`ContainerManager`](crate::ContainerManager) can run against the real
//! Docker daemon or an in-memory fake.

use std::collections::HashMap;
use std::time::Duration;

use envgrid_core::{BoxFuture, DaemonTarget};

use crate::error::EngineResult;

/// Lifecycle state reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Other(String),
}

impl ContainerStatus {
    pub fn from_docker(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            other => ContainerStatus::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        *self == ContainerStatus::Running
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Other(s) => s.as_str(),
        };
        write!(f, "{s}")
    }
}

/// One row of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Name without the daemon's leading `/`.
    pub name: String,
    pub status: ContainerStatus,
}

/// Inspect output reduced to what lifecycle management needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    /// IP address per attached network, ordered by network name.
    pub ip_addresses: Vec<String>,
}

/// Parameters for creating a detached container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub command: Option<Vec<String>>,
    /// Memory limit in bytes.
    pub mem_limit: Option<i64>,
}

/// Result of running a command inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Container daemon operations, one call per Engine API request.
pub trait ContainerEngine: Send + Sync {
    /// The daemon this engine talks to.
    fn target(&self) -> &DaemonTarget;

    /// Liveness probe.
    fn ping(&self) -> BoxFuture<'_, EngineResult<()>>;

    /// Pull an image from its registry.
    fn pull_image<'a>(&'a self, image: &'a str) -> BoxFuture<'a, EngineResult<()>>;

    /// Whether the image is present in the daemon's local store.
    fn image_exists<'a>(&'a self, image: &'a str) -> BoxFuture<'a, EngineResult<bool>>;

    /// Containers in any state whose name matches `name_filter`.
    fn list_containers<'a>(
        &'a self,
        name_filter: &'a str,
    ) -> BoxFuture<'a, EngineResult<Vec<ContainerSummary>>>;

    fn inspect_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, EngineResult<ContainerDetails>>;

    /// Create a container and return its id. Does not start it.
    fn create_container<'a>(&'a self, spec: &'a CreateSpec) -> BoxFuture<'a, EngineResult<String>>;

    fn start_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, EngineResult<()>>;

    fn restart_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, EngineResult<()>>;

    fn stop_container<'a>(&'a self, id: &'a str, timeout: Duration) -> BoxFuture<'a, EngineResult<()>>;

    /// Remove a container. Returns `false` if it did not exist.
    fn remove_container<'a>(&'a self, id: &'a str, force: bool) -> BoxFuture<'a, EngineResult<bool>>;

    fn exec<'a>(
        &'a self,
        id: &'a str,
        cmd: &'a [String],
        workdir: Option<&'a str>,
    ) -> BoxFuture<'a, EngineResult<ExecOutput>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_docker_strings() {
        assert_eq!(ContainerStatus::from_docker("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_docker("Exited"), ContainerStatus::Exited);
        assert_eq!(
            ContainerStatus::from_docker("weird"),
            ContainerStatus::Other("weird".to_string())
        );
        assert!(ContainerStatus::Running.is_running());
        assert!(!ContainerStatus::Created.is_running());
    }

    #[test]
    fn status_display_matches_docker() {
        assert_eq!(ContainerStatus::Exited.to_string(), "exited");
        assert_eq!(ContainerStatus::Other("x".to_string()).to_string(), "x");
    }
}
