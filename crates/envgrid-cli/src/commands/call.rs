use anyhow::Context;
use serde_json::Value;

use envgrid_core::EnvgridConfig;
use envgrid_scheduler::Envgrid;

use super::parse_target;

/// `--args` is passed through as-is once it parses as JSON.
fn parse_args(raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--args is not valid JSON: {raw}"))
}

pub async fn call(
    config: &EnvgridConfig,
    name: &str,
    method: &str,
    args: &str,
    host: &str,
) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    let grid = Envgrid::new(config);
    grid.attach(name, parse_target(host)?).await?;

    let result = grid.call(name, method, args).await;
    // Detach only; the container keeps running.
    grid.registry().unregister(name).await;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

pub async fn methods(config: &EnvgridConfig, name: &str, host: &str) -> anyhow::Result<()> {
    let grid = Envgrid::new(config);
    grid.attach(name, parse_target(host)?).await?;

    let result = grid.list_methods(name).await;
    grid.registry().unregister(name).await;

    let methods = result?;
    if methods.is_empty() {
        println!("{name} exposes no methods");
    }
    for method in methods {
        match method.description {
            Some(desc) => println!("{:<24} {desc}", method.name),
            None => println!("{}", method.name),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_must_be_json() {
        assert_eq!(parse_args(r#"{"seed": 7}"#).unwrap()["seed"], 7);
        assert!(parse_args("{seed: 7}").is_err());
    }
}
