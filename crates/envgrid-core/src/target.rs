//! Daemon target resolution: which container engine a backend lives on.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The container-engine endpoint a container is created on.
///
/// Immutable for the lifetime of a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DaemonTarget {
    /// The local daemon, reached over its unix socket.
    #[default]
    Local,
    /// A local daemon on an explicit socket: unix:///path/to/docker.sock
    Socket(String),
    /// A remote daemon reached through an SSH tunnel: ssh://user@host:port
    Ssh {
        user: Option<String>,
        host: String,
        port: Option<u16>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("unsupported daemon scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid daemon target: {0}")]
    Invalid(String),
}

impl DaemonTarget {
    /// Parse a host string as given on the command line or in `hosts = [...]`.
    ///
    /// `local`, `localhost` and the empty string map to the local daemon,
    /// `unix:///path` to that socket. `ssh://user@host:port`, `user@host`
    /// and bare hostnames map to SSH.
    pub fn parse(spec: &str) -> Result<Self, TargetError> {
        let spec = spec.trim();
        if spec.is_empty() || spec == "local" || spec == "localhost" {
            return Ok(DaemonTarget::Local);
        }
        if let Some(path) = spec.strip_prefix("unix://") {
            if !path.starts_with('/') {
                return Err(TargetError::Invalid(spec.to_string()));
            }
            return Ok(DaemonTarget::Socket(path.to_string()));
        }

        let rest = match spec.split_once("://") {
            Some(("ssh", rest)) => rest,
            Some((scheme, _)) => return Err(TargetError::UnsupportedScheme(scheme.to_string())),
            None => spec,
        };
        let rest = rest.trim_end_matches('/');

        let (user, host_port) = match rest.rsplit_once('@') {
            Some((user, hp)) if !user.is_empty() => (Some(user.to_string()), hp),
            Some(_) => return Err(TargetError::Invalid(spec.to_string())),
            None => (None, rest),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| TargetError::Invalid(spec.to_string()))?;
                (host, Some(port))
            }
            None => (host_port, None),
        };

        if host.is_empty() || host.contains('/') {
            return Err(TargetError::Invalid(spec.to_string()));
        }

        Ok(DaemonTarget::Ssh {
            user,
            host: host.to_string(),
            port,
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self, DaemonTarget::Local | DaemonTarget::Socket(_))
    }

    /// `user@host` destination as passed to the ssh client.
    pub fn ssh_destination(&self) -> Option<String> {
        match self {
            DaemonTarget::Local | DaemonTarget::Socket(_) => None,
            DaemonTarget::Ssh { user: Some(u), host, .. } => Some(format!("{u}@{host}")),
            DaemonTarget::Ssh { user: None, host, .. } => Some(host.clone()),
        }
    }
}

impl fmt::Display for DaemonTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonTarget::Local => write!(f, "local"),
            DaemonTarget::Socket(path) => write!(f, "unix://{path}"),
            DaemonTarget::Ssh { port: Some(p), .. } => {
                write!(f, "ssh://{}:{p}", self.ssh_destination().unwrap_or_default())
            }
            DaemonTarget::Ssh { port: None, .. } => {
                write!(f, "ssh://{}", self.ssh_destination().unwrap_or_default())
            }
        }
    }
}

/// SSH client options for one daemon connection.
///
/// Carried per connection so concurrent deploys to different hosts never
/// share mutable process state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    /// Bound on establishing the tunnel.
    pub connect_timeout: Duration,
    /// Server keepalive probe interval.
    pub keepalive_interval: Duration,
    /// Extra `-o Key=Value` options.
    pub extra_options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(180),
            keepalive_interval: Duration::from_secs(60),
            extra_options: Vec::new(),
        }
    }
}

impl SshOptions {
    /// Arguments placed before the destination on the ssh command line.
    pub fn to_args(&self, port: Option<u16>) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.keepalive_interval.as_secs()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        for opt in &self.extra_options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        if let Some(port) = port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_aliases() {
        assert_eq!(DaemonTarget::parse("").unwrap(), DaemonTarget::Local);
        assert_eq!(DaemonTarget::parse("local").unwrap(), DaemonTarget::Local);
        assert_eq!(DaemonTarget::parse("localhost").unwrap(), DaemonTarget::Local);
    }

    #[test]
    fn test_parse_unix_socket_keeps_path() {
        let target = DaemonTarget::parse("unix:///run/user/1000/docker.sock").unwrap();
        assert_eq!(target, DaemonTarget::Socket("/run/user/1000/docker.sock".to_string()));
        assert!(target.is_local());
        assert_eq!(target.ssh_destination(), None);
        assert_eq!(target.to_string(), "unix:///run/user/1000/docker.sock");
        assert!(DaemonTarget::parse("unix://").is_err());
    }

    #[test]
    fn test_parse_ssh_uri() {
        let target = DaemonTarget::parse("ssh://ubuntu@10.0.0.5:2222").unwrap();
        assert_eq!(
            target,
            DaemonTarget::Ssh {
                user: Some("ubuntu".to_string()),
                host: "10.0.0.5".to_string(),
                port: Some(2222),
            }
        );
        assert_eq!(target.to_string(), "ssh://ubuntu@10.0.0.5:2222");
    }

    #[test]
    fn test_parse_bare_host() {
        let target = DaemonTarget::parse("gpu-node-3").unwrap();
        assert_eq!(target.ssh_destination().as_deref(), Some("gpu-node-3"));
        assert!(!target.is_local());
    }

    #[test]
    fn test_parse_user_at_host() {
        let target = DaemonTarget::parse("root@box").unwrap();
        assert_eq!(target.to_string(), "ssh://root@box");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert_eq!(
            DaemonTarget::parse("tcp://1.2.3.4:2375"),
            Err(TargetError::UnsupportedScheme("tcp".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!(DaemonTarget::parse("ssh://host:notaport").is_err());
        assert!(DaemonTarget::parse("ssh://@host").is_err());
    }

    #[test]
    fn test_ssh_options_args() {
        let opts = SshOptions::default();
        let args = opts.to_args(Some(2222));
        assert!(args.contains(&"ConnectTimeout=180".to_string()));
        assert!(args.contains(&"ServerAliveInterval=60".to_string()));
        assert_eq!(&args[args.len() - 2..], &["-p".to_string(), "2222".to_string()]);
    }
}
