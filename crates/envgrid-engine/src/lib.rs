//! envgrid-engine — container lifecycle management on one daemon.
//!
//! Talks to a Docker-compatible daemon, local or SSH-tunneled, and knows
//! nothing about pools. The pieces:
//!
//! - [`ContainerEngine`]: the Engine API calls envgrid makes, as a
//!   dyn-compatible trait
//! - [`DockerEngine`]: the hyper-based implementation
//! - [`ContainerManager`]: pull fallback, name reconciliation, stop,
//!   port waiting, exec and sweeping
//! - [`ImageBuilder`]: builds images from a source tree via the docker CLI
//!
//! # Architecture
//!
//! ```text
//! ContainerManager
//!   └── Arc<dyn ContainerEngine>
//!         ├── DockerEngine ── unix socket
//!         │               └── ssh user@host docker system dial-stdio
//!         └── FakeEngine (tests, feature "test-util")
//! ```

pub mod api;
pub mod builder;
pub mod docker;
pub mod error;
pub mod manager;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use api::{
    ContainerDetails, ContainerEngine, ContainerStatus, ContainerSummary, CreateSpec, ExecOutput,
};
pub use builder::{BuildOptions, ImageBuilder};
pub use docker::DockerEngine;
pub use error::{EngineError, EngineResult};
pub use manager::{wait_for_port, ContainerHandle, ContainerManager, StartOptions};
