//! In-memory [`ContainerEngine`] with failure injection, for tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use envgrid_core::{BoxFuture, DaemonTarget};

use crate::api::{
    ContainerDetails, ContainerEngine, ContainerStatus, ContainerSummary, CreateSpec, ExecOutput,
};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
struct FakeContainer {
    name: String,
    image: String,
    status: ContainerStatus,
    ip: String,
}

#[derive(Debug, Default)]
struct FakeState {
    images: HashSet<String>,
    /// id → container
    containers: BTreeMap<String, FakeContainer>,
    fail_create: HashSet<String>,
    fail_remove: HashSet<String>,
    exit_on_start: HashSet<String>,
}

/// A container daemon that lives in memory.
#[derive(Debug)]
pub struct FakeEngine {
    target: DaemonTarget,
    state: Mutex<FakeState>,
    next_id: AtomicUsize,
    create_calls: AtomicUsize,
    pull_fails: bool,
    restart_fails: bool,
    stop_fails: bool,
    assign_ips: bool,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            target: DaemonTarget::Local,
            state: Mutex::new(FakeState::default()),
            next_id: AtomicUsize::new(1),
            create_calls: AtomicUsize::new(0),
            pull_fails: false,
            restart_fails: false,
            stop_fails: false,
            assign_ips: true,
        }
    }

    pub fn with_target(mut self, target: DaemonTarget) -> Self {
        self.target = target;
        self
    }

    /// Seed an image in the local store.
    pub fn with_image(self, image: &str) -> Self {
        self.lock().images.insert(image.to_string());
        self
    }

    /// Every registry pull fails.
    pub fn with_failing_pull(mut self) -> Self {
        self.pull_fails = true;
        self
    }

    /// Restart leaves containers stopped.
    pub fn with_failing_restart(mut self) -> Self {
        self.restart_fails = true;
        self
    }

    /// Graceful stop always errors.
    pub fn with_failing_stop(mut self) -> Self {
        self.stop_fails = true;
        self
    }

    /// Containers come up without network addresses.
    pub fn without_ips(mut self) -> Self {
        self.assign_ips = false;
        self
    }

    /// Containers with this name exit right after starting.
    pub fn with_exit_on_start(self, name: &str) -> Self {
        self.lock().exit_on_start.insert(name.to_string());
        self
    }

    /// Creation of a container with this name fails.
    pub fn fail_create_for(&self, name: &str) {
        self.lock().fail_create.insert(name.to_string());
    }

    /// Removal of a container with this name fails.
    pub fn fail_remove_for(&self, name: &str) {
        self.lock().fail_remove.insert(name.to_string());
    }

    /// Insert a pre-existing container and return its id.
    pub fn insert_container(&self, name: &str, image: &str, status: ContainerStatus) -> String {
        let id = self.allocate_id();
        let ip = self.ip_for(&id);
        self.lock().containers.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                image: image.to_string(),
                status,
                ip,
            },
        );
        id
    }

    /// Names of all containers, sorted.
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{n:016x}{:048x}", 0)
    }

    fn ip_for(&self, id: &str) -> String {
        if !self.assign_ips {
            return String::new();
        }
        let n = usize::from_str_radix(&id[..16], 16).unwrap_or(0);
        format!("172.17.{}.{}", n / 250, n % 250 + 2)
    }

    fn missing(id: &str) -> EngineError {
        EngineError::Api {
            status: 404,
            message: format!("No such container: {id}"),
        }
    }
}

impl ContainerEngine for FakeEngine {
    fn target(&self) -> &DaemonTarget {
        &self.target
    }

    fn ping(&self) -> BoxFuture<'_, EngineResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn pull_image<'a>(&'a self, image: &'a str) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            if self.pull_fails {
                return Err(EngineError::Connection {
                    target: "registry".to_string(),
                    message: "registry unreachable".to_string(),
                });
            }
            self.lock().images.insert(image.to_string());
            Ok(())
        })
    }

    fn image_exists<'a>(&'a self, image: &'a str) -> BoxFuture<'a, EngineResult<bool>> {
        Box::pin(async move { Ok(self.lock().images.contains(image)) })
    }

    fn list_containers<'a>(
        &'a self,
        name_filter: &'a str,
    ) -> BoxFuture<'a, EngineResult<Vec<ContainerSummary>>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .containers
                .iter()
                .filter(|(_, c)| c.name.contains(name_filter))
                .map(|(id, c)| ContainerSummary {
                    id: id.clone(),
                    name: c.name.clone(),
                    status: c.status.clone(),
                })
                .collect())
        })
    }

    fn inspect_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, EngineResult<ContainerDetails>> {
        Box::pin(async move {
            let state = self.lock();
            let c = state.containers.get(id).ok_or_else(|| Self::missing(id))?;
            Ok(ContainerDetails {
                id: id.to_string(),
                name: c.name.clone(),
                image: c.image.clone(),
                status: c.status.clone(),
                ip_addresses: vec![c.ip.clone()],
            })
        })
    }

    fn create_container<'a>(&'a self, spec: &'a CreateSpec) -> BoxFuture<'a, EngineResult<String>> {
        Box::pin(async move {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            {
                let state = self.lock();
                if state.fail_create.contains(&spec.name) {
                    return Err(EngineError::Api {
                        status: 500,
                        message: format!("injected create failure for {}", spec.name),
                    });
                }
                if !state.images.contains(&spec.image) {
                    return Err(EngineError::ImageNotFound(spec.image.clone()));
                }
                if state.containers.values().any(|c| c.name == spec.name) {
                    return Err(EngineError::Api {
                        status: 409,
                        message: format!("name {} already in use", spec.name),
                    });
                }
            }
            Ok(self.insert_container(&spec.name, &spec.image, ContainerStatus::Created))
        })
    }

    fn start_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            let exits = {
                let c = state.containers.get(id).ok_or_else(|| Self::missing(id))?;
                state.exit_on_start.contains(&c.name)
            };
            if let Some(c) = state.containers.get_mut(id) {
                c.status = if exits {
                    ContainerStatus::Exited
                } else {
                    ContainerStatus::Running
                };
            }
            Ok(())
        })
    }

    fn restart_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            let c = state.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
            if !self.restart_fails {
                c.status = ContainerStatus::Running;
            }
            Ok(())
        })
    }

    fn stop_container<'a>(&'a self, id: &'a str, _timeout: Duration) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            if self.stop_fails {
                return Err(EngineError::Api {
                    status: 500,
                    message: "injected stop failure".to_string(),
                });
            }
            let mut state = self.lock();
            let c = state.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
            c.status = ContainerStatus::Exited;
            Ok(())
        })
    }

    fn remove_container<'a>(&'a self, id: &'a str, _force: bool) -> BoxFuture<'a, EngineResult<bool>> {
        Box::pin(async move {
            let mut state = self.lock();
            let Some(name) = state.containers.get(id).map(|c| c.name.clone()) else {
                return Ok(false);
            };
            if state.fail_remove.contains(&name) {
                return Err(EngineError::Api {
                    status: 500,
                    message: format!("injected remove failure for {name}"),
                });
            }
            state.containers.remove(id);
            Ok(true)
        })
    }

    fn exec<'a>(
        &'a self,
        id: &'a str,
        cmd: &'a [String],
        _workdir: Option<&'a str>,
    ) -> BoxFuture<'a, EngineResult<ExecOutput>> {
        Box::pin(async move {
            let state = self.lock();
            let c = state.containers.get(id).ok_or_else(|| Self::missing(id))?;
            if !c.status.is_running() {
                return Err(EngineError::Container(format!("{} is not running", c.name)));
            }
            Ok(ExecOutput {
                exit_code: 0,
                output: cmd.join(" "),
            })
        })
    }
}
