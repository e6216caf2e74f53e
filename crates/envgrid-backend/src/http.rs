//! A backend that is already deployed somewhere and reached over HTTP.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use envgrid_core::{BoxFuture, MethodInfo};

use crate::backend::Backend;
use crate::error::{BackendError, BackendResult};
use crate::transport::{Transport, TransportFactory};

/// Client to a fixed base URL. Owns no container; cleanup only closes
/// the transport.
pub struct HttpBackend {
    name: String,
    host: String,
    port: u16,
    transport: Arc<dyn Transport>,
    ready: AtomicBool,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl HttpBackend {
    /// Connect to `base_url` (`http://host[:port][/]`). The name defaults to
    /// `host-port`.
    pub async fn connect(
        name: Option<String>,
        base_url: &str,
        transports: Arc<dyn TransportFactory>,
        timeout: Duration,
    ) -> BackendResult<Self> {
        let (host, port) = parse_base_url(base_url)?;
        let name = name.unwrap_or_else(|| format!("{host}-{port}"));

        let transport = transports.connect(&host, port, timeout).await.map_err(|e| {
            BackendError::with_source(format!("cannot reach {name} at {base_url}"), e)
        })?;

        info!(%name, %host, port, flavor = ?transport.flavor(), "http backend ready");
        Ok(Self {
            name,
            host,
            port,
            transport,
            ready: AtomicBool::new(true),
        })
    }
}

/// Split a base URL into host and port. Only plain `http` is accepted.
pub fn parse_base_url(base_url: &str) -> BackendResult<(String, u16)> {
    let uri: http::Uri = base_url
        .parse()
        .map_err(|e| BackendError::with_source(format!("invalid base url {base_url}"), e))?;

    match uri.scheme_str() {
        Some("http") | None => {}
        Some(other) => {
            return Err(BackendError::new(format!(
                "unsupported scheme {other} in {base_url}"
            )));
        }
    }
    if !matches!(uri.path(), "" | "/") {
        return Err(BackendError::new(format!(
            "base url {base_url} must not have a path"
        )));
    }

    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| BackendError::new(format!("no host in {base_url}")))?;
    Ok((host.to_string(), uri.port_u16().unwrap_or(80)))
}

impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_method<'a>(&'a self, method: &'a str, args: Value) -> BoxFuture<'a, BackendResult<Value>> {
        Box::pin(async move {
            if !self.is_ready() {
                return Err(BackendError::new(format!("backend {} is not ready", self.name)));
            }
            self.transport.call_method(method, args).await.map_err(|e| {
                BackendError::with_source(format!("call {method} on {} failed", self.name), e)
            })
        })
    }

    fn list_methods(&self) -> BoxFuture<'_, BackendResult<Vec<MethodInfo>>> {
        Box::pin(async move {
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
            if self.ready.swap(false, Ordering::AcqRel) {
                self.transport.close().await;
            }
            Ok(())
        })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> Option<(String, u16)> {
        Some((self.host.clone(), self.port))
    }
}
