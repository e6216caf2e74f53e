//! envgrid-scheduler — replica deployment, pooling and lookup.
//!
//! Turns a [`DeployRequest`] into one ready [`Backend`](envgrid_backend::Backend):
//!
//! - Validates the request before any daemon I/O
//! - Builds replicas concurrently, rolling back survivors on failure
//! - Wraps multiple replicas in an [`InstancePool`] behind a [`LoadBalancer`]
//! - Registers the result by name in the [`Registry`]
//!
//! # Architecture
//!
//! ```text
//! Envgrid
//!   └── Orchestrator
//!         ├── BackendFactory (one ContainerBackend per replica)
//!         ├── InstancePool
//!         │     ├── Vec<InstanceInfo> (backend + atomic request counter)
//!         │     └── LoadBalancer (round-robin cursor | random)
//!         └── Registry (name → Arc<dyn Backend>, RwLock)
//! ```

pub mod deploy;
pub mod error;
pub mod load_balancer;
pub mod pool;
pub mod registry;
pub mod sdk;

pub use deploy::{
    validate, BackendFactory, ContainerBackendFactory, DeployPhase, DeployPlan, DeployRequest,
    Deployment, Orchestrator,
};
pub use error::{DeployError, DeployResult, DeployStage};
pub use load_balancer::LoadBalancer;
pub use pool::{InstanceInfo, InstancePool, InstanceStats, PoolStats};
pub use registry::Registry;
pub use sdk::Envgrid;
