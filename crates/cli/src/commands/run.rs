//! `run` command implementation.

use anyhow::{Context, Result};
use contracts::{CaptureConfig, MonitorBlueprint};
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::pipeline::{Pipeline, PipelineConfig};

/// Execute the `run` command
pub async fn run_pipeline(args: &RunArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");

    // Validate config path
    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {}", args.config.display());
    }

    // Load and parse configuration
    let mut blueprint = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    // Apply CLI overrides
    if apply_overrides(&mut blueprint, args) {
        config_loader::ConfigLoader::validate(&blueprint)
            .context("Configuration invalid after CLI overrides")?;
    }

    info!(
        server = %blueprint.general.server_name,
        captures = blueprint.captures.len(),
        sinks = blueprint.sinks.len(),
        "Configuration loaded"
    );

    // Dry run - just validate and exit
    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_config_summary(&blueprint);
        return Ok(());
    }

    let pipeline_config = PipelineConfig {
        blueprint,
        config_dir: args.config.parent().map(|p| p.to_path_buf()),
        timeout: if args.timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(args.timeout))
        },
        metrics_port: if args.metrics_port == 0 {
            None
        } else {
            Some(args.metrics_port)
        },
    };

    let summary = Pipeline::new(pipeline_config)
        .run(shutdown_signal())
        .await
        .context("Pipeline execution failed")?;

    info!(
        packets = summary.total_packets(),
        dropped = summary.total_dropped(),
        failed_rows = summary.total_failed(),
        duration_secs = summary.elapsed.as_secs_f64(),
        "Pipeline finished"
    );
    println!("\n{summary}");

    if summary.total_failed() > 0 {
        warn!(rows = summary.total_failed(), "some rows could not be written");
    }
    Ok(())
}

/// Apply `--device` / `--filter`; returns true if anything changed
fn apply_overrides(blueprint: &mut MonitorBlueprint, args: &RunArgs) -> bool {
    let mut changed = false;
    if !args.devices.is_empty() {
        let template = blueprint
            .captures
            .first()
            .cloned()
            .unwrap_or_else(|| CaptureConfig::new(""));
        info!(devices = ?args.devices, "Overriding capture devices from CLI");
        blueprint.captures = args
            .devices
            .iter()
            .map(|device| CaptureConfig {
                device: device.clone(),
                ..template.clone()
            })
            .collect();
        changed = true;
    }
    if let Some(ref filter) = args.filter {
        info!(filter = %filter, "Overriding capture filter from CLI");
        for capture in &mut blueprint.captures {
            capture.filter = filter.clone();
        }
        changed = true;
    }
    changed
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("Received shutdown signal, stopping pipeline...");
}

/// Print configuration summary for dry-run mode
fn print_config_summary(blueprint: &MonitorBlueprint) {
    println!("\n=== Configuration Summary ===\n");
    println!("Server: {}", blueprint.general.server_name);
    println!(
        "  Queue capacity: {}  Shutdown timeout: {}ms",
        blueprint.general.result_queue_capacity, blueprint.general.shutdown_timeout_ms
    );

    println!("\nCaptures ({}):", blueprint.captures.len());
    for capture in &blueprint.captures {
        println!(
            "  - {} [{}] filter=\"{}\"",
            capture.device,
            capture.mode.as_str(),
            capture.filter
        );
    }

    if !blueprint.sinks.is_empty() {
        println!("\nSinks ({}):", blueprint.sinks.len());
        for sink in &blueprint.sinks {
            println!("  - {} ({:?}, mode={})", sink.name, sink.sink_type, sink.output_mode);
        }
    }

    println!();
}
