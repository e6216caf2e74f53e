//! envgrid-core — shared types for the envgrid deployment stack.
//!
//! Everything here is plain data: where a container lives
//! ([`DaemonTarget`]), how to reach remote daemons ([`SshOptions`]),
//! how replicas are balanced ([`LbStrategy`]), and the `envgrid.toml`
//! file format ([`EnvgridConfig`]).

pub mod config;
pub mod report;
pub mod target;
pub mod types;

pub use config::EnvgridConfig;
pub use report::CleanupReport;
pub use target::{DaemonTarget, SshOptions, TargetError};
pub use types::*;
