//! The remote-call transport seam.
//!
//! A [`Transport`] turns `call_method` into an actual network request
//! against one running backend. Backends only see these traits, so the
//! wire protocol can be swapped without touching lifecycle code.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use envgrid_core::{BoxFuture, MethodInfo};

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot connect to {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("transport closed")]
    Closed,
}

/// Upstream protocol flavor spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFlavor {
    /// Methods discovered by probing `/methods`, invoked at `/call/{name}`.
    Endpoint,
    /// Methods described by an OpenAPI document, invoked at `/{name}`.
    Schema,
}

/// One connection to a running backend.
pub trait Transport: Send + Sync {
    fn flavor(&self) -> TransportFlavor;

    fn call_method<'a>(
        &'a self,
        name: &'a str,
        args: Value,
    ) -> BoxFuture<'a, Result<Value, TransportError>>;

    fn list_methods(&self) -> BoxFuture<'_, Result<Vec<MethodInfo>, TransportError>>;

    /// Liveness. Never errors.
    fn health_check(&self) -> BoxFuture<'_, bool>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Opens a transport to one `host:port` server.
pub trait TransportFactory: Send + Sync {
    /// Connect to `host:port`, detecting the flavor. `timeout` bounds each call.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Arc<dyn Transport>, TransportError>>;
}
