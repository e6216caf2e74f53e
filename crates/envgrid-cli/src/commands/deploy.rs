use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tracing::info;

use envgrid_core::{parse_memory, EnvgridConfig, LbStrategy};
use envgrid_scheduler::{DeployRequest, Envgrid};

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Pre-built image
    #[arg(short, long)]
    pub image: Option<String>,
    /// Source tree to build instead of pulling an image
    #[arg(long)]
    pub src_dir: Option<PathBuf>,
    #[arg(short, long)]
    pub replicas: Option<usize>,
    /// Daemon per replica (repeatable): local, ssh://user@host[:port]
    #[arg(long)]
    pub host: Vec<String>,
    /// round-robin or random
    #[arg(short, long)]
    pub strategy: Option<LbStrategy>,
    /// Registry name
    #[arg(short, long)]
    pub name: Option<String>,
    /// Replica name prefix
    #[arg(long)]
    pub prefix: Option<String>,
    /// Container environment, KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = parse_env)]
    pub env: Vec<(String, String)>,
    #[arg(long)]
    pub force_recreate: bool,
    /// Use the local image without pulling
    #[arg(long)]
    pub no_pull: bool,
    /// Memory limit, e.g. 512m or 2g
    #[arg(long)]
    pub mem_limit: Option<String>,
    /// Keep running until Ctrl-C, then clean up
    #[arg(long)]
    pub hold: bool,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got {s}"))
}

/// Config-file request with command-line flags applied on top.
pub fn build_request(config: &EnvgridConfig, args: &DeployArgs) -> anyhow::Result<DeployRequest> {
    let mut request = DeployRequest::from_config(config)?;
    if let Some(image) = &args.image {
        request.image = Some(image.clone());
    }
    if let Some(dir) = &args.src_dir {
        request.src_dir = Some(dir.clone());
    }
    if let Some(replicas) = args.replicas {
        request.replicas = replicas;
    }
    if !args.host.is_empty() {
        request.hosts = Some(args.host.clone());
    }
    if let Some(strategy) = args.strategy {
        request.strategy = strategy;
    }
    if args.name.is_some() {
        request.name = args.name.clone();
    }
    if args.prefix.is_some() {
        request.prefix = args.prefix.clone();
    }
    request.env.extend(args.env.iter().cloned());
    request.force_recreate |= args.force_recreate;
    if args.no_pull {
        request.pull = false;
    }
    if let Some(raw) = &args.mem_limit {
        request.mem_limit =
            Some(parse_memory(raw).with_context(|| format!("invalid --mem-limit {raw}"))?);
    }
    if args.hold {
        request.cleanup_on_exit = true;
    }
    Ok(request)
}

pub async fn run(config: &EnvgridConfig, args: DeployArgs) -> anyhow::Result<()> {
    let request = build_request(config, &args)?;
    let grid = Envgrid::new(config);

    let (backend, name) = grid.deploy(&request).await?;
    let methods = backend.list_methods().await.unwrap_or_default();

    println!("✓ Deployed {name}");
    if let Some((host, port)) = backend.endpoint() {
        println!("  Endpoint: {host}:{port}");
    }
    println!("  Replicas: {}", request.replicas);
    if !methods.is_empty() {
        let names: Vec<&str> = methods.iter().map(|m| m.name.as_str()).collect();
        println!("  Methods:  {}", names.join(", "));
    }

    if !args.hold {
        return Ok(());
    }

    println!("Holding; press Ctrl-C to clean up.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown signal received");

    let report = grid.shutdown().await;
    if report.is_clean() {
        println!("✓ Cleaned up {}", report.succeeded().len());
        Ok(())
    } else {
        anyhow::bail!("cleanup incomplete: {}", report.failure_summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> DeployArgs {
        DeployArgs {
            image: None,
            src_dir: None,
            replicas: None,
            host: Vec::new(),
            strategy: None,
            name: None,
            prefix: None,
            env: Vec::new(),
            force_recreate: false,
            no_pull: false,
            mem_limit: None,
            hold: false,
        }
    }

    #[test]
    fn flags_override_config() {
        let config = EnvgridConfig::from_toml_str(
            "[deploy]\nimage = \"sbx:1\"\nreplicas = 2\nstrategy = \"random\"\n",
        )
        .unwrap();
        let request = build_request(
            &config,
            &DeployArgs {
                replicas: Some(5),
                env: vec![("SEED".to_string(), "7".to_string())],
                mem_limit: Some("1g".to_string()),
                no_pull: true,
                ..args()
            },
        )
        .unwrap();

        assert_eq!(request.image.as_deref(), Some("sbx:1"));
        assert_eq!(request.replicas, 5);
        assert_eq!(request.strategy, LbStrategy::Random);
        assert_eq!(request.env.get("SEED").map(String::as_str), Some("7"));
        assert_eq!(request.mem_limit, Some(1024 * 1024 * 1024));
        assert!(!request.pull);
        assert!(request.cleanup_on_exit);
    }

    #[test]
    fn config_cleanup_on_exit_survives_without_hold() {
        let config =
            EnvgridConfig::from_toml_str("[deploy]\nimage = \"sbx:1\"\ncleanup_on_exit = false\n")
                .unwrap();

        let request = build_request(&config, &args()).unwrap();
        assert!(!request.cleanup_on_exit);

        let held = build_request(&config, &DeployArgs { hold: true, ..args() }).unwrap();
        assert!(held.cleanup_on_exit);
    }

    #[test]
    fn env_pairs_parse() {
        assert_eq!(parse_env("A=b=c"), Ok(("A".to_string(), "b=c".to_string())));
        assert!(parse_env("=x").is_err());
        assert!(parse_env("novalue").is_err());
    }

    #[test]
    fn bad_mem_limit_is_rejected() {
        let result = build_request(
            &EnvgridConfig::default(),
            &DeployArgs {
                mem_limit: Some("huge".to_string()),
                ..args()
            },
        );
        assert!(result.is_err());
    }
}
