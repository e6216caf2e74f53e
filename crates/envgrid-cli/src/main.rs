//! envgrid — deploy and drive execution backends from the shell.
//!
//! # Usage
//!
//! ```text
//! envgrid deploy --image sandbox:latest --replicas 4 --hold
//! envgrid call --name sandbox-0 --method reset --args '{}'
//! envgrid methods --name sandbox-0 --host ssh://ubuntu@gpu-1
//! envgrid sweep --pattern sandbox-
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "envgrid",
    about = "Container fleets behind one remote-call surface",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: ./envgrid.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy one backend or a pool of replicas.
    ///
    /// Flags override the [deploy] section of the config file.
    Deploy(commands::deploy::DeployArgs),
    /// Call a method on a deployed container.
    Call {
        /// Container name
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        method: String,
        /// JSON arguments
        #[arg(short, long, default_value = "{}")]
        args: String,
        /// Daemon the container runs on
        #[arg(long, default_value = "local")]
        host: String,
    },
    /// List the methods a deployed container exposes.
    Methods {
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value = "local")]
        host: String,
    },
    /// Stop and remove every container whose name contains a pattern.
    Sweep {
        #[arg(short, long)]
        pattern: String,
        #[arg(long, default_value = "local")]
        host: String,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,envgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Deploy(args) => commands::deploy::run(&config, args).await,
        Command::Call {
            name,
            method,
            args,
            host,
        } => commands::call::call(&config, &name, &method, &args, &host).await,
        Command::Methods { name, host } => commands::call::methods(&config, &name, &host).await,
        Command::Sweep { pattern, host } => commands::sweep::sweep(&config, &pattern, &host).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_with_defaults() {
        let cli = Cli::try_parse_from(["envgrid", "call", "--name", "sbx-0", "--method", "reset"])
            .unwrap();
        match cli.command {
            Command::Call { args, host, .. } => {
                assert_eq!(args, "{}");
                assert_eq!(host, "local");
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["envgrid", "sweep", "--pattern", "sbx", "--config", "x.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }

    #[test]
    fn deploy_collects_repeated_hosts() {
        let cli = Cli::try_parse_from([
            "envgrid", "deploy", "--image", "sbx:1", "--replicas", "2", "--host", "ssh://a",
            "--host", "ssh://b",
        ])
        .unwrap();
        match cli.command {
            Command::Deploy(args) => {
                assert_eq!(args.host, vec!["ssh://a", "ssh://b"]);
                assert_eq!(args.replicas, Some(2));
            }
            _ => panic!("expected deploy"),
        }
    }
}
