//! Turns a source tree into a tagged image.
//!
//! Shells out to the `docker` CLI, pointed at the same daemon the
//! replicas will run on (`-H ssh://…` for remote targets).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use envgrid_core::DaemonTarget;

use crate::error::{EngineError, EngineResult};

/// Build flags.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub nocache: bool,
    pub quiet: bool,
    pub build_args: HashMap<String, String>,
}

/// Builds and pushes images through the docker CLI.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    target: DaemonTarget,
    docker_bin: PathBuf,
}

impl ImageBuilder {
    pub fn new(target: DaemonTarget) -> Self {
        Self {
            target,
            docker_bin: PathBuf::from("docker"),
        }
    }

    /// Use a specific docker binary instead of the one on `$PATH`.
    pub fn with_docker_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.docker_bin = bin.into();
        self
    }

    /// Build the image at `path` (which must contain a Dockerfile) and tag it.
    /// Returns the image id.
    pub async fn build_from_env(
        &self,
        path: &Path,
        tag: &str,
        opts: &BuildOptions,
    ) -> EngineResult<String> {
        if !path.join("Dockerfile").is_file() {
            return Err(EngineError::Build(format!(
                "no Dockerfile in {}",
                path.display()
            )));
        }

        info!(path = %path.display(), %tag, target = %self.target, "building image");
        self.run(build_args(&self.target, path, tag, opts)).await?;

        let id = self
            .run(host_args(&self.target)
                .into_iter()
                .chain(["image", "inspect", "--format", "{{.Id}}", tag].map(String::from))
                .collect())
            .await?;
        let id = id.trim().to_string();
        info!(%tag, %id, "image built");
        Ok(id)
    }

    /// Tag `tag` into `registry` (if given) and push it. Returns the pushed reference.
    pub async fn push_image(&self, tag: &str, registry: Option<&str>) -> EngineResult<String> {
        let reference = match registry {
            Some(reg) => {
                let reference = format!("{}/{tag}", reg.trim_end_matches('/'));
                self.run(host_args(&self.target)
                    .into_iter()
                    .chain(["tag".to_string(), tag.to_string(), reference.clone()])
                    .collect())
                    .await?;
                reference
            }
            None => tag.to_string(),
        };

        info!(%reference, "pushing image");
        self.run(host_args(&self.target)
            .into_iter()
            .chain(["push".to_string(), reference.clone()])
            .collect())
            .await?;
        Ok(reference)
    }

    async fn run(&self, args: Vec<String>) -> EngineResult<String> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(&args);
        debug!("Running: {:?}", cmd);

        let output = cmd.output().await.map_err(|e| {
            EngineError::Build(format!(
                "failed to execute {}: {e}",
                self.docker_bin.display()
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Build(format!(
                "{} {} exited with {}: {}",
                self.docker_bin.display(),
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn host_args(target: &DaemonTarget) -> Vec<String> {
    match target {
        DaemonTarget::Local => Vec::new(),
        other => vec!["-H".to_string(), other.to_string()],
    }
}

fn build_args(target: &DaemonTarget, path: &Path, tag: &str, opts: &BuildOptions) -> Vec<String> {
    let mut args = host_args(target);
    args.push("build".to_string());
    args.push("-t".to_string());
    args.push(tag.to_string());
    if opts.nocache {
        args.push("--no-cache".to_string());
    }
    if opts.quiet {
        args.push("--quiet".to_string());
    }
    // Sorted for reproducible command lines.
    let sorted: BTreeMap<_, _> = opts.build_args.iter().collect();
    for (k, v) in sorted {
        args.push("--build-arg".to_string());
        args.push(format!("{k}={v}"));
    }
    args.push(path.display().to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_local() {
        let mut opts = BuildOptions {
            nocache: true,
            ..BuildOptions::default()
        };
        opts.build_args.insert("B".to_string(), "2".to_string());
        opts.build_args.insert("A".to_string(), "1".to_string());

        let args = build_args(&DaemonTarget::Local, Path::new("/src/env"), "env:dev", &opts);
        assert_eq!(
            args,
            vec![
                "build", "-t", "env:dev", "--no-cache", "--build-arg", "A=1", "--build-arg",
                "B=2", "/src/env"
            ]
        );
    }

    #[test]
    fn build_args_explicit_socket_sets_host() {
        let target = DaemonTarget::parse("unix:///run/user/1000/docker.sock").unwrap();
        let args = build_args(&target, Path::new("."), "env:dev", &BuildOptions::default());
        assert_eq!(&args[..2], &["-H", "unix:///run/user/1000/docker.sock"]);
    }

    #[test]
    fn build_args_remote_sets_host() {
        let target = DaemonTarget::parse("ssh://ubuntu@gpu-1").unwrap();
        let args = build_args(&target, Path::new("."), "env:dev", &BuildOptions::default());
        assert_eq!(&args[..3], &["-H", "ssh://ubuntu@gpu-1", "build"]);
    }

    #[tokio::test]
    async fn build_without_dockerfile_fails_fast() {
        let dir = std::env::temp_dir().join("envgrid-no-dockerfile");
        std::fs::create_dir_all(&dir).unwrap();
        let builder = ImageBuilder::new(DaemonTarget::Local);

        let result = builder
            .build_from_env(&dir, "env:dev", &BuildOptions::default())
            .await;
        assert!(matches!(result, Err(EngineError::Build(_))));
    }

    #[tokio::test]
    async fn missing_docker_binary_is_build_error() {
        let builder =
            ImageBuilder::new(DaemonTarget::Local).with_docker_bin("/nonexistent/docker");
        let result = builder.push_image("env:dev", None).await;
        assert!(matches!(result, Err(EngineError::Build(_))));
    }
}
