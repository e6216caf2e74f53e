pub mod call;
pub mod deploy;
pub mod sweep;

use std::path::Path;

use anyhow::Context;

use envgrid_core::{DaemonTarget, EnvgridConfig};

const DEFAULT_CONFIG: &str = "envgrid.toml";

/// Load `path`, or `./envgrid.toml` if present, or defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EnvgridConfig> {
    match path {
        Some(p) => EnvgridConfig::from_file(p)
            .with_context(|| format!("failed to load config {}", p.display())),
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.is_file() {
                EnvgridConfig::from_file(default)
                    .with_context(|| format!("failed to load {DEFAULT_CONFIG}"))
            } else {
                Ok(EnvgridConfig::default())
            }
        }
    }
}

pub fn parse_target(host: &str) -> anyhow::Result<DaemonTarget> {
    DaemonTarget::parse(host).with_context(|| format!("invalid host {host}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.toml");
        std::fs::write(&path, "[deploy]\nimage = \"sbx:1\"\nreplicas = 3\n").unwrap();

        let config = load_config(Some(path.as_path())).unwrap();
        assert_eq!(config.deploy.image.as_deref(), Some("sbx:1"));
        assert_eq!(config.deploy.replicas, Some(3));
    }

    #[test]
    fn missing_explicit_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(dir.path().join("nope.toml").as_path())).is_err());
    }

    #[test]
    fn bad_host_is_error() {
        assert!(parse_target("tcp://docker:2375").is_err());
        assert!(parse_target("ssh://ubuntu@gpu-1").is_ok());
    }
}
