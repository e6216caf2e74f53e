//! envgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::target::SshOptions;
use crate::types::{parse_duration, LbStrategy};

/// Port the remote-call server listens on inside every container.
pub const DEFAULT_INTERNAL_PORT: u16 = 8000;
/// Default local daemon socket.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvgridConfig {
    #[serde(default)]
    pub deploy: DeployConfig,
    pub container: Option<ContainerConfig>,
    pub ssh: Option<SshConfig>,
    pub build: Option<BuildConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    pub image: Option<String>,
    pub src_dir: Option<String>,
    pub replicas: Option<u32>,
    pub hosts: Option<Vec<String>>,
    pub strategy: Option<LbStrategy>,
    pub name: Option<String>,
    pub prefix: Option<String>,
    pub force_recreate: Option<bool>,
    pub pull: Option<bool>,
    pub mem_limit: Option<String>,
    pub cleanup_on_exit: Option<bool>,
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub internal_port: Option<u16>,
    pub port_timeout: Option<String>,
    pub port_interval: Option<String>,
    pub stop_timeout: Option<String>,
    pub call_timeout: Option<String>,
    pub docker_socket: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshConfig {
    pub connect_timeout: Option<String>,
    pub keepalive: Option<String>,
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    pub tag: Option<String>,
    pub nocache: Option<bool>,
    pub quiet: Option<bool>,
    pub args: Option<HashMap<String, String>>,
    pub push_registry: Option<String>,
}

/// Container timing and wiring with every default filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    pub internal_port: u16,
    pub port_timeout: Duration,
    pub port_interval: Duration,
    pub stop_timeout: Duration,
    pub call_timeout: Duration,
    pub docker_socket: String,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            internal_port: DEFAULT_INTERNAL_PORT,
            port_timeout: Duration::from_secs(30),
            port_interval: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(300),
            docker_socket: default_socket(),
        }
    }
}

/// Honors `DOCKER_HOST=unix://...` the way the docker CLI does.
fn default_socket() -> String {
    std::env::var("DOCKER_HOST")
        .ok()
        .and_then(|h| h.strip_prefix("unix://").map(str::to_string))
        .unwrap_or_else(|| DEFAULT_DOCKER_SOCKET.to_string())
}

impl EnvgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: EnvgridConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn container_settings(&self) -> ContainerSettings {
        let defaults = ContainerSettings::default();
        let Some(c) = &self.container else {
            return defaults;
        };
        let dur = |v: &Option<String>, d: Duration| {
            v.as_deref().and_then(parse_duration).unwrap_or(d)
        };
        ContainerSettings {
            internal_port: c.internal_port.unwrap_or(defaults.internal_port),
            port_timeout: dur(&c.port_timeout, defaults.port_timeout),
            port_interval: dur(&c.port_interval, defaults.port_interval),
            stop_timeout: dur(&c.stop_timeout, defaults.stop_timeout),
            call_timeout: dur(&c.call_timeout, defaults.call_timeout),
            docker_socket: c.docker_socket.clone().unwrap_or(defaults.docker_socket),
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        let defaults = SshOptions::default();
        let Some(s) = &self.ssh else {
            return defaults;
        };
        SshOptions {
            connect_timeout: s
                .connect_timeout
                .as_deref()
                .and_then(parse_duration)
                .unwrap_or(defaults.connect_timeout),
            keepalive_interval: s
                .keepalive
                .as_deref()
                .and_then(parse_duration)
                .unwrap_or(defaults.keepalive_interval),
            extra_options: s.options.clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config = EnvgridConfig::from_toml_str(
            r#"
[deploy]
image = "sandbox:latest"
"#,
        )
        .unwrap();
        assert_eq!(config.deploy.image.as_deref(), Some("sandbox:latest"));
        assert!(config.container.is_none());
        assert_eq!(config.container_settings().internal_port, DEFAULT_INTERNAL_PORT);
    }

    #[test]
    fn test_parse_full() {
        let config = EnvgridConfig::from_toml_str(
            r#"
[deploy]
image = "sandbox:latest"
replicas = 4
hosts = ["local", "ssh://ubuntu@gpu-1", "ssh://ubuntu@gpu-2", "ssh://ubuntu@gpu-3"]
strategy = "random"
prefix = "sbx"
mem_limit = "2g"

[deploy.env]
LOG_LEVEL = "debug"

[container]
internal_port = 9000
port_timeout = "45s"
stop_timeout = "3s"

[ssh]
connect_timeout = "30s"
options = ["StrictHostKeyChecking=no"]
"#,
        )
        .unwrap();

        assert_eq!(config.deploy.replicas, Some(4));
        assert_eq!(config.deploy.strategy, Some(LbStrategy::Random));
        assert_eq!(config.deploy.hosts.as_ref().map(Vec::len), Some(4));
        assert_eq!(
            config.deploy.env.as_ref().and_then(|e| e.get("LOG_LEVEL")).map(String::as_str),
            Some("debug")
        );

        let settings = config.container_settings();
        assert_eq!(settings.internal_port, 9000);
        assert_eq!(settings.port_timeout, Duration::from_secs(45));
        assert_eq!(settings.stop_timeout, Duration::from_secs(3));
        assert_eq!(settings.port_interval, Duration::from_millis(500));

        let ssh = config.ssh_options();
        assert_eq!(ssh.connect_timeout, Duration::from_secs(30));
        assert_eq!(ssh.keepalive_interval, Duration::from_secs(60));
        assert_eq!(ssh.extra_options, vec!["StrictHostKeyChecking=no".to_string()]);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("envgrid.toml");
        std::fs::write(&path, "[deploy]\nreplicas = 2\nstrategy = \"round-robin\"\n").unwrap();

        let config = EnvgridConfig::from_file(&path).unwrap();
        assert_eq!(config.deploy.replicas, Some(2));
        assert_eq!(config.deploy.strategy, Some(LbStrategy::RoundRobin));
    }

    #[test]
    fn test_roundtrip_to_toml() {
        let mut config = EnvgridConfig::default();
        config.deploy.image = Some("sandbox:v2".to_string());
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("sandbox:v2"));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let result = EnvgridConfig::from_toml_str("[deploy]\nstrategy = \"least-conn\"\n");
        assert!(result.is_err());
    }
}
