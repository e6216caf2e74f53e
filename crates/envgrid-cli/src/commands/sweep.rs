use anyhow::Context;

use envgrid_core::EnvgridConfig;
use envgrid_engine::ContainerManager;

use super::parse_target;

pub async fn sweep(config: &EnvgridConfig, pattern: &str, host: &str) -> anyhow::Result<()> {
    if pattern.is_empty() {
        anyhow::bail!("refusing to sweep with an empty pattern");
    }
    let target = parse_target(host)?;
    let settings = config.container_settings();
    let manager = ContainerManager::connect(target, &settings.docker_socket, &config.ssh_options())
        .await
        .with_context(|| format!("cannot reach daemon at {host}"))?;

    let report = manager.sweep(pattern, settings.stop_timeout).await?;
    if report.attempted() == 0 {
        println!("No containers match '{pattern}'");
        return Ok(());
    }
    for name in report.succeeded() {
        println!("✓ Removed {name}");
    }
    for (name, e) in report.failures() {
        println!("✗ {name}: {e}");
    }
    if !report.is_clean() {
        anyhow::bail!("{} container(s) could not be removed", report.failures().len());
    }
    Ok(())
}
