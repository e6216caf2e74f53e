//! envgrid-backend — one execution backend behind a uniform capability.
//!
//! A [`Backend`] answers `call_method`, `list_methods`, `health_check`,
//! `cleanup` and `is_ready`. Two concrete kinds live here:
//!
//! - [`ContainerBackend`]: owns exactly one container on one daemon
//! - [`HttpBackend`]: a client to an already deployed service
//!
//! Both forward calls through a [`Transport`] obtained from an injected
//! [`TransportFactory`]; [`HttpTransportFactory`] is the real one.

pub mod backend;
pub mod container;
pub mod error;
pub mod http;
pub mod http_transport;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use backend::Backend;
pub use container::{ContainerBackend, ContainerBackendConfig};
pub use error::{BackendError, BackendResult};
pub use http::HttpBackend;
pub use http_transport::{HttpTransport, HttpTransportFactory};
pub use transport::{Transport, TransportError, TransportFactory, TransportFlavor};
