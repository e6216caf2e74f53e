//! In-memory transports and backends with failure injection, for tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use envgrid_core::{BoxFuture, MethodInfo};

use crate::backend::Backend;
use crate::error::{BackendError, BackendResult};
use crate::transport::{Transport, TransportError, TransportFactory, TransportFlavor};

/// Transport that echoes `{"method", "args"}` back.
#[derive(Debug)]
pub struct FakeTransport {
    flavor: TransportFlavor,
    failing: HashSet<String>,
    closed: AtomicBool,
}

impl Transport for FakeTransport {
    fn flavor(&self) -> TransportFlavor {
        self.flavor
    }

    fn call_method<'a>(
        &'a self,
        name: &'a str,
        args: Value,
    ) -> BoxFuture<'a, Result<Value, TransportError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            if self.failing.contains(name) {
                return Err(TransportError::Http {
                    status: 500,
                    body: format!("injected failure for {name}"),
                });
            }
            Ok(json!({ "method": name, "args": args }))
        })
    }

    fn list_methods(&self) -> BoxFuture<'_, Result<Vec<MethodInfo>, TransportError>> {
        Box::pin(async { Ok(vec![MethodInfo::new("reset"), MethodInfo::new("step")]) })
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { !self.closed.load(Ordering::Acquire) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.closed.store(true, Ordering::Release);
        Box::pin(async {})
    }
}

/// Hands out [`FakeTransport`]s and records every `host:port` asked for.
#[derive(Debug)]
pub struct FakeTransportFactory {
    flavor: TransportFlavor,
    failing: HashSet<String>,
    refuse: bool,
    connections: Mutex<Vec<String>>,
}

impl Default for FakeTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self {
            flavor: TransportFlavor::Endpoint,
            failing: HashSet::new(),
            refuse: false,
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn with_flavor(mut self, flavor: TransportFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Calls to `method` answer HTTP 500.
    pub fn failing_method(mut self, method: &str) -> Self {
        self.failing.insert(method.to_string());
        self
    }

    /// Every connect fails.
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn connections(&self) -> Vec<String> {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<Arc<dyn Transport>, TransportError>> {
        Box::pin(async move {
            let address = format!("{host}:{port}");
            if self.refuse {
                return Err(TransportError::Connect(address));
            }
            self.connections
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(address);
            Ok(Arc::new(FakeTransport {
                flavor: self.flavor,
                failing: self.failing.clone(),
                closed: AtomicBool::new(false),
            }) as Arc<dyn Transport>)
        })
    }
}

/// A [`Backend`] that counts calls and cleanups.
#[derive(Debug)]
pub struct FakeBackend {
    name: String,
    endpoint: Option<(String, u16)>,
    fail_calls: bool,
    fail_cleanup: bool,
    calls: AtomicUsize,
    cleanups: AtomicUsize,
    ready: AtomicBool,
}

impl FakeBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
            fail_calls: false,
            fail_cleanup: false,
            calls: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            ready: AtomicBool::new(true),
        }
    }

    pub fn with_endpoint(mut self, host: &str, port: u16) -> Self {
        self.endpoint = Some((host.to_string(), port));
        self
    }

    /// Every `call_method` errors.
    pub fn with_failing_calls(mut self) -> Self {
        self.fail_calls = true;
        self
    }

    /// `cleanup` errors (after being counted).
    pub fn with_failing_cleanup(mut self) -> Self {
        self.fail_cleanup = true;
        self
    }

    /// Calls received, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl Backend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_method<'a>(&'a self, method: &'a str, args: Value) -> BoxFuture<'a, BackendResult<Value>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_calls {
                return Err(BackendError::with_source(
                    format!("call {method} on {} failed", self.name),
                    TransportError::Timeout(method.to_string()),
                ));
            }
            Ok(json!({ "backend": self.name, "method": method, "args": args }))
        })
    }

    fn list_methods(&self) -> BoxFuture<'_, BackendResult<Vec<MethodInfo>>> {
        Box::pin(async { Ok(vec![MethodInfo::new("reset"), MethodInfo::new("step")]) })
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.is_ready() })
    }

    fn cleanup(&self) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            if self.fail_cleanup {
                return Err(BackendError::new(format!("injected cleanup failure for {}", self.name)));
            }
            self.ready.store(false, Ordering::Release);
            Ok(())
        })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> Option<(String, u16)> {
        self.endpoint.clone()
    }
}
