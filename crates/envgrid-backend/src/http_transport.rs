//! JSON-over-HTTP transport.
//!
//! Opens a plain TCP connection per request and drives hyper's HTTP/1
//! client over it, the same way the health prober does. The flavor is
//! detected once at connect time:
//!
//! - `GET /openapi.json` answers 2xx → [`TransportFlavor::Schema`]
//! - otherwise → [`TransportFlavor::Endpoint`]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tracing::debug;

use envgrid_core::{BoxFuture, MethodInfo};

use crate::transport::{Transport, TransportError, TransportFactory, TransportFlavor};

/// Probe timeout used during flavor detection.
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A transport bound to one `host:port`.
#[derive(Debug)]
pub struct HttpTransport {
    address: String,
    flavor: TransportFlavor,
    timeout: Duration,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Build a transport for a known flavor without probing.
    pub fn new(host: &str, port: u16, flavor: TransportFlavor, timeout: Duration) -> Self {
        Self {
            address: format!("{host}:{port}"),
            flavor,
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Connect and detect the flavor.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let address = format!("{host}:{port}");
        let (status, _) = send(
            &address,
            Method::GET,
            "/openapi.json",
            None,
            DETECT_TIMEOUT.min(timeout),
        )
        .await?;

        let flavor = if status.is_success() {
            TransportFlavor::Schema
        } else {
            TransportFlavor::Endpoint
        };
        debug!(%address, ?flavor, "transport flavor detected");
        Ok(Self::new(host, port, flavor, timeout))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let (status, bytes) = send(&self.address, method, path, body, self.timeout).await?;
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).trim().to_string(),
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }

    fn call_path(&self, name: &str) -> String {
        match self.flavor {
            TransportFlavor::Endpoint => format!("/call/{name}"),
            TransportFlavor::Schema => format!("/{name}"),
        }
    }
}

/// One request over a fresh connection.
async fn send(
    address: &str,
    method: Method,
    path: &str,
    body: Option<&Value>,
    timeout: Duration,
) -> Result<(StatusCode, Bytes), TransportError> {
    let fut = async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::Connect(format!("{address}: {e}")))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TransportError::Connect(format!("{address}: handshake failed: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let payload = match body {
            Some(v) => Bytes::from(
                serde_json::to_vec(v).map_err(|e| TransportError::Decode(e.to_string()))?,
            ),
            None => Bytes::new(),
        };

        let req = http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", address)
            .header("content-type", "application/json")
            .header("user-agent", "envgrid/0.1")
            .body(Full::new(payload))
            .map_err(|e| TransportError::Decode(format!("invalid request {path}: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| TransportError::Connect(format!("{address}{path}: {e}")))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?
            .to_bytes();
        Ok::<_, TransportError>((status, bytes))
    };

    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(format!("{address}{path}"))),
    }
}

/// Methods from an OpenAPI document: every path with a POST operation.
pub(crate) fn methods_from_openapi(doc: &Value) -> Vec<MethodInfo> {
    let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut methods: Vec<MethodInfo> = paths
        .iter()
        .filter_map(|(path, item)| {
            let post = item.get("post")?;
            let name = path.trim_start_matches('/');
            if name.is_empty() || name.contains('{') {
                return None;
            }
            Some(MethodInfo {
                name: name.to_string(),
                description: post
                    .get("summary")
                    .or_else(|| post.get("description"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                parameters: post
                    .pointer("/requestBody/content/application~1json/schema")
                    .cloned(),
            })
        })
        .collect();
    methods.sort_by(|a, b| a.name.cmp(&b.name));
    methods
}

/// Methods from a `/methods` listing: either `["a", "b"]` or `[{name, ...}]`.
pub(crate) fn methods_from_listing(listing: Value) -> Result<Vec<MethodInfo>, TransportError> {
    let items = match listing {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("methods") {
            Some(Value::Array(items)) => items,
            _ => return Err(TransportError::Decode("expected a method list".to_string())),
        },
        _ => return Err(TransportError::Decode("expected a method list".to_string())),
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(name) => Ok(MethodInfo::new(name)),
            other => serde_json::from_value(other).map_err(|e| TransportError::Decode(e.to_string())),
        })
        .collect()
}

impl Transport for HttpTransport {
    fn flavor(&self) -> TransportFlavor {
        self.flavor
    }

    fn call_method<'a>(
        &'a self,
        name: &'a str,
        args: Value,
    ) -> BoxFuture<'a, Result<Value, TransportError>> {
        Box::pin(async move {
            let path = self.call_path(name);
            self.request(Method::POST, &path, Some(&args)).await
        })
    }

    fn list_methods(&self) -> BoxFuture<'_, Result<Vec<MethodInfo>, TransportError>> {
        Box::pin(async move {
            match self.flavor {
                TransportFlavor::Schema => {
                    let doc = self.request(Method::GET, "/openapi.json", None).await?;
                    Ok(methods_from_openapi(&doc))
                }
                TransportFlavor::Endpoint => {
                    let listing = self.request(Method::GET, "/methods", None).await?;
                    methods_from_listing(listing)
                }
            }
        })
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match self.request(Method::GET, "/health", None).await {
                Ok(_) => true,
                Err(e) => {
                    debug!(address = %self.address, error = %e, "health check failed");
                    false
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.closed.store(true, Ordering::Release);
        Box::pin(async {})
    }
}

/// Default factory: [`HttpTransport::connect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Arc<dyn Transport>, TransportError>> {
        Box::pin(async move {
            let transport = HttpTransport::connect(host, port, timeout).await?;
            Ok(Arc::new(transport) as Arc<dyn Transport>)
        })
    }
}
