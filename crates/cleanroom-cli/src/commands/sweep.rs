//! Reconciliation sweep command.

use anyhow::{Context, Result};
use cleanroom_cloud::GcpProvider;
use cleanroom_config::load_system_config;
use cleanroom_runner::KubernetesJobRunner;
use cleanroom_scheduler::{HttpStatusCallback, Monitor, SweepReport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Run the monitor once, or forever with `watch`.
pub async fn run(
    config_path: &Path,
    api_url: Option<String>,
    watch: bool,
    interval: Option<u64>,
) -> Result<()> {
    let mut config = load_system_config(config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;
    if let Some(url) = api_url {
        config.monitor.api_url = url;
    }

    let cloud = Arc::new(GcpProvider::new(config.cloud.clone())?);
    let runner = Arc::new(
        KubernetesJobRunner::new(config.cluster.namespace.clone())
            .await
            .context("Failed to connect to Kubernetes")?,
    );
    let callback = Arc::new(HttpStatusCallback::new(
        reqwest::Client::new(),
        &config.monitor.api_url,
    ));
    let interval = Duration::from_secs(interval.unwrap_or(config.monitor.interval_secs));
    let monitor = Monitor::new(cloud, runner, callback, config);

    if watch {
        tracing::info!(interval_secs = interval.as_secs(), "Sweeping continuously");
        monitor.run(interval).await;
        return Ok(());
    }

    let report = monitor.run_once().await;
    print_report("build jobs", &report.builds);
    print_report("instances", &report.instances);

    let failed = report.builds.failures.len() + report.instances.failures.len();
    if failed > 0 {
        anyhow::bail!("{} item(s) could not be reconciled", failed);
    }
    Ok(())
}

fn print_report(label: &str, report: &SweepReport) {
    println!(
        "{}: {} examined, {} reconciled, {} skipped, {} failed",
        label,
        report.examined,
        report.reconciled,
        report.skipped,
        report.failures.len()
    );
    for failure in &report.failures {
        println!("  ✗ {}: {}", failure.resource, failure.error);
    }
}
