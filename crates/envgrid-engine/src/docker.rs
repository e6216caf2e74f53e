//! Docker Engine API client.
//!
//! Speaks HTTP/1.1 to the daemon over a fresh stream per request:
//!
//! - local daemon: the unix socket (`/var/run/docker.sock` by default)
//! - remote daemon: `ssh user@host docker system dial-stdio`, with the
//!   child's stdout/stdin joined into one duplex stream
//!
//! The per-request connection mirrors how the health prober drives hyper:
//! handshake, spawn the connection future, send one request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use envgrid_core::{BoxFuture, DaemonTarget, SshOptions};

use crate::api::{
    ContainerDetails, ContainerEngine, ContainerStatus, ContainerSummary, CreateSpec, ExecOutput,
};
use crate::error::{EngineError, EngineResult};

const API_VERSION: &str = "v1.43";

/// Any duplex byte stream to a daemon.
trait DaemonStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DaemonStream for T {}

/// stdout/stdin of an `ssh … docker system dial-stdio` child.
struct SshStream {
    stdout: ChildStdout,
    stdin: ChildStdin,
}

impl AsyncRead for SshStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for SshStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdin).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_shutdown(cx)
    }
}

/// Engine API client bound to one daemon.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    target: DaemonTarget,
    socket: PathBuf,
    ssh: SshOptions,
}

impl DockerEngine {
    /// Build a client without probing the daemon.
    pub fn new(target: DaemonTarget, socket: impl Into<PathBuf>, ssh: SshOptions) -> Self {
        Self {
            target,
            socket: socket.into(),
            ssh,
        }
    }

    /// Build a client and verify the daemon answers `/_ping` within the
    /// SSH connect bound.
    pub async fn connect(
        target: DaemonTarget,
        socket: impl Into<PathBuf>,
        ssh: SshOptions,
    ) -> EngineResult<Self> {
        let engine = Self::new(target, socket, ssh);
        let bound = engine.ssh.connect_timeout;

        match tokio::time::timeout(bound, engine.ping_daemon()).await {
            Ok(Ok(())) => {
                info!(target = %engine.target, "connected to container daemon");
                Ok(engine)
            }
            Ok(Err(e)) => Err(EngineError::Connection {
                target: engine.target.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(EngineError::Connection {
                target: engine.target.to_string(),
                message: format!("liveness probe did not respond within {bound:?}"),
            }),
        }
    }

    fn connection_error(&self, message: impl Into<String>) -> EngineError {
        EngineError::Connection {
            target: self.target.to_string(),
            message: message.into(),
        }
    }

    async fn open_stream(&self) -> EngineResult<Box<dyn DaemonStream>> {
        match &self.target {
            DaemonTarget::Local => self.open_unix(&self.socket).await,
            DaemonTarget::Socket(path) => self.open_unix(Path::new(path)).await,
            DaemonTarget::Ssh { port, .. } => {
                let destination = self
                    .target
                    .ssh_destination()
                    .ok_or_else(|| self.connection_error("missing ssh destination"))?;

                let mut cmd = Command::new("ssh");
                cmd.args(self.ssh.to_args(*port))
                    .arg(&destination)
                    .args(["docker", "system", "dial-stdio"])
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true);

                let mut child = cmd
                    .spawn()
                    .map_err(|e| self.connection_error(format!("failed to spawn ssh: {e}")))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| self.connection_error("ssh stdout unavailable"))?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| self.connection_error("ssh stdin unavailable"))?;

                // Reap the tunnel once the stream closes its stdin.
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });

                Ok(Box::new(SshStream { stdout, stdin }))
            }
        }
    }

    async fn open_unix(&self, socket: &Path) -> EngineResult<Box<dyn DaemonStream>> {
        let stream = tokio::net::UnixStream::connect(socket)
            .await
            .map_err(|e| self.connection_error(format!("{}: {e}", socket.display())))?;
        Ok(Box::new(stream))
    }

    /// Issue one request and collect the whole response body.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> EngineResult<(StatusCode, Bytes)> {
        let stream = tokio::time::timeout(self.ssh.connect_timeout, self.open_stream())
            .await
            .map_err(|_| self.connection_error("timed out opening daemon stream"))??;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| self.connection_error(format!("handshake failed: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "daemon connection closed with error");
            }
        });

        let payload = match body {
            Some(v) => Bytes::from(serde_json::to_vec(&v).map_err(|e| {
                EngineError::Container(format!("failed to encode request body: {e}"))
            })?),
            None => Bytes::new(),
        };

        let uri = format!("/{API_VERSION}{path}");
        let req = http::Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header("host", "docker")
            .header("content-type", "application/json")
            .header("user-agent", "envgrid/0.1")
            .body(Full::new(payload))
            .map_err(|e| EngineError::Container(format!("invalid request {uri}: {e}")))?;

        debug!(%method, %uri, target = %self.target, "daemon request");

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| self.connection_error(format!("{method} {uri}: {e}")))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| self.connection_error(format!("reading {uri}: {e}")))?
            .to_bytes();

        Ok((status, bytes))
    }

    /// Request that must succeed; non-2xx becomes [`EngineError::Api`].
    async fn request_ok(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> EngineResult<Bytes> {
        let (status, bytes) = self.request(method, path, body).await?;
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(bytes)
        } else {
            Err(EngineError::api(status, error_message(&bytes)))
        }
    }

    async fn ping_daemon(&self) -> EngineResult<()> {
        self.request_ok(Method::GET, "/_ping", None).await.map(|_| ())
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    state: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: Option<InspectConfig>,
    #[serde(default)]
    state: Option<InspectState>,
    #[serde(default)]
    network_settings: Option<InspectNetworkSettings>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: Option<std::collections::BTreeMap<String, InspectNetwork>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecInspect {
    #[serde(default)]
    exit_code: Option<i64>,
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8], what: &str) -> EngineResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| EngineError::Container(format!("unexpected {what} response: {e}")))
}

/// Extract `{"message": ...}` from an error body.
fn error_message(bytes: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).trim().to_string())
}

/// Scan a streamed pull/progress body for an `error` entry.
pub(crate) fn stream_error(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
        .find_map(|v| {
            v.get("errorDetail")
                .and_then(|d| d.get("message"))
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
}

/// Split `repo[:tag]` / `repo@digest` into the `fromImage`/`tag` pull params.
pub(crate) fn split_image(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    let last_slash = image.rfind('/').unwrap_or(0);
    match image.rfind(':') {
        Some(colon) if colon > last_slash => (&image[..colon], &image[colon + 1..]),
        _ => (image, "latest"),
    }
}

/// Percent-encode a query value.
pub(crate) fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Escape regex metacharacters so a name filter matches literally.
pub(crate) fn escape_regex(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(
            c,
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn strip_slash(name: &str) -> String {
    name.trim_start_matches('/').to_string()
}

fn create_body(spec: &CreateSpec) -> serde_json::Value {
    let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    env.sort();

    let mut host_config = json!({});
    if let Some(mem) = spec.mem_limit {
        host_config["Memory"] = json!(mem);
    }

    let mut body = json!({
        "Image": spec.image,
        "Env": env,
        "Labels": spec.labels,
        // tty + open stdin keep PID 1 alive without a foreground command.
        "Tty": true,
        "OpenStdin": true,
        "AttachStdin": false,
        "AttachStdout": false,
        "AttachStderr": false,
        "HostConfig": host_config,
    });
    if let Some(cmd) = &spec.command {
        body["Cmd"] = json!(cmd);
    }
    body
}

impl ContainerEngine for DockerEngine {
    fn target(&self) -> &DaemonTarget {
        &self.target
    }

    fn ping(&self) -> BoxFuture<'_, EngineResult<()>> {
        Box::pin(self.ping_daemon())
    }

    fn pull_image<'a>(&'a self, image: &'a str) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            let (from, tag) = split_image(image);
            let mut path = format!("/images/create?fromImage={}", encode_query(from));
            if !tag.is_empty() {
                path.push_str(&format!("&tag={}", encode_query(tag)));
            }
            let bytes = self.request_ok(Method::POST, &path, None).await?;
            match stream_error(&bytes) {
                Some(message) => Err(EngineError::Api {
                    status: 500,
                    message,
                }),
                None => Ok(()),
            }
        })
    }

    fn image_exists<'a>(&'a self, image: &'a str) -> BoxFuture<'a, EngineResult<bool>> {
        Box::pin(async move {
            let (status, bytes) = self
                .request(Method::GET, &format!("/images/{image}/json"), None)
                .await?;
            if status.is_success() {
                Ok(true)
            } else if status == StatusCode::NOT_FOUND {
                Ok(false)
            } else {
                Err(EngineError::api(status, error_message(&bytes)))
            }
        })
    }

    fn list_containers<'a>(
        &'a self,
        name_filter: &'a str,
    ) -> BoxFuture<'a, EngineResult<Vec<ContainerSummary>>> {
        Box::pin(async move {
            // The daemon matches `name` as a regular expression.
            let filters = json!({ "name": [escape_regex(name_filter)] }).to_string();
            let path = format!("/containers/json?all=true&filters={}", encode_query(&filters));
            let bytes = self.request_ok(Method::GET, &path, None).await?;
            let entries: Vec<ListEntry> = decode(&bytes, "container list")?;
            Ok(entries
                .into_iter()
                .map(|e| ContainerSummary {
                    name: e.names.first().map(|n| strip_slash(n)).unwrap_or_default(),
                    status: ContainerStatus::from_docker(&e.state),
                    id: e.id,
                })
                .collect())
        })
    }

    fn inspect_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, EngineResult<ContainerDetails>> {
        Box::pin(async move {
            let bytes = self
                .request_ok(Method::GET, &format!("/containers/{id}/json"), None)
                .await?;
            let resp: InspectResponse = decode(&bytes, "container inspect")?;
            let ip_addresses = resp
                .network_settings
                .and_then(|n| n.networks)
                .map(|nets| nets.into_values().map(|n| n.ip_address).collect())
                .unwrap_or_default();
            Ok(ContainerDetails {
                id: resp.id,
                name: strip_slash(&resp.name),
                image: resp.config.map(|c| c.image).unwrap_or_default(),
                status: ContainerStatus::from_docker(
                    &resp.state.map(|s| s.status).unwrap_or_default(),
                ),
                ip_addresses,
            })
        })
    }

    fn create_container<'a>(&'a self, spec: &'a CreateSpec) -> BoxFuture<'a, EngineResult<String>> {
        Box::pin(async move {
            let path = format!("/containers/create?name={}", encode_query(&spec.name));
            let (status, bytes) = self
                .request(Method::POST, &path, Some(create_body(spec)))
                .await?;
            if status == StatusCode::NOT_FOUND {
                return Err(EngineError::ImageNotFound(spec.image.clone()));
            }
            if !status.is_success() {
                return Err(EngineError::api(status, error_message(&bytes)));
            }
            let resp: IdResponse = decode(&bytes, "container create")?;
            Ok(resp.id)
        })
    }

    fn start_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            self.request_ok(Method::POST, &format!("/containers/{id}/start"), None)
                .await
                .map(|_| ())
        })
    }

    fn restart_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            self.request_ok(Method::POST, &format!("/containers/{id}/restart?t=10"), None)
                .await
                .map(|_| ())
        })
    }

    fn stop_container<'a>(&'a self, id: &'a str, timeout: Duration) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            let path = format!("/containers/{id}/stop?t={}", timeout.as_secs());
            self.request_ok(Method::POST, &path, None).await.map(|_| ())
        })
    }

    fn remove_container<'a>(&'a self, id: &'a str, force: bool) -> BoxFuture<'a, EngineResult<bool>> {
        Box::pin(async move {
            let path = format!("/containers/{id}?force={force}&v=true");
            let (status, bytes) = self.request(Method::DELETE, &path, None).await?;
            if status.is_success() {
                Ok(true)
            } else if status == StatusCode::NOT_FOUND {
                Ok(false)
            } else {
                Err(EngineError::api(status, error_message(&bytes)))
            }
        })
    }

    fn exec<'a>(
        &'a self,
        id: &'a str,
        cmd: &'a [String],
        workdir: Option<&'a str>,
    ) -> BoxFuture<'a, EngineResult<ExecOutput>> {
        Box::pin(async move {
            let mut body = json!({
                "Cmd": cmd,
                "AttachStdout": true,
                "AttachStderr": true,
                "Tty": true,
            });
            if let Some(dir) = workdir {
                body["WorkingDir"] = json!(dir);
            }
            let bytes = self
                .request_ok(Method::POST, &format!("/containers/{id}/exec"), Some(body))
                .await?;
            let exec: IdResponse = decode(&bytes, "exec create")?;

            let output = self
                .request_ok(
                    Method::POST,
                    &format!("/exec/{}/start", exec.id),
                    Some(json!({ "Detach": false, "Tty": true })),
                )
                .await?;

            let bytes = self
                .request_ok(Method::GET, &format!("/exec/{}/json", exec.id), None)
                .await?;
            let inspect: ExecInspect = decode(&bytes, "exec inspect")?;

            Ok(ExecOutput {
                exit_code: inspect.exit_code.unwrap_or(-1),
                output: String::from_utf8_lossy(&output).into_owned(),
            })
        })
    }
}

/// Labels stamped on every container envgrid creates.
pub fn managed_labels(extra: &HashMap<String, String>) -> HashMap<String, String> {
    let mut labels = extra.clone();
    labels.insert("envgrid.managed".to_string(), "true".to_string());
    labels
}
