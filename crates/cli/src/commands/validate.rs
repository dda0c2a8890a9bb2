//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{MonitorBlueprint, SinkType};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    server_name: String,
    capture_count: usize,
    sink_count: usize,
    enabled_sink_count: usize,
    skip_entries: usize,
    allow_entries: usize,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn invalid(config_path: String, error: String) -> ValidationResult {
    ValidationResult {
        valid: false,
        config_path,
        error: Some(error),
        warnings: None,
        summary: None,
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    // Check file exists
    if !args.config.exists() {
        return invalid(config_path, format!("File not found: {}", args.config.display()));
    }

    let blueprint = match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(blueprint) => blueprint,
        Err(e) => return invalid(config_path, e.to_string()),
    };

    // Domain list files are read at startup, so check them here too
    let filter = match config_loader::load_domain_filter(&blueprint.general, args.config.parent()) {
        Ok(filter) => filter,
        Err(e) => return invalid(config_path, e.to_string()),
    };

    let warnings = collect_warnings(&blueprint);
    ValidationResult {
        valid: true,
        config_path,
        error: None,
        warnings: if warnings.is_empty() {
            None
        } else {
            Some(warnings)
        },
        summary: Some(ConfigSummary {
            version: format!("{:?}", blueprint.version),
            server_name: blueprint.general.server_name.clone(),
            capture_count: blueprint.captures.len(),
            sink_count: blueprint.sinks.len(),
            enabled_sink_count: blueprint
                .sinks
                .iter()
                .filter(|s| s.output_mode.is_enabled())
                .count(),
            skip_entries: filter.skip.len(),
            allow_entries: filter.allow.len(),
        }),
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(blueprint: &MonitorBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();

    if blueprint.sinks.iter().all(|s| !s.output_mode.is_enabled()) {
        warnings.push("No enabled sinks - captured results will be discarded".to_string());
    }

    for capture in &blueprint.captures {
        if capture.filter.trim().is_empty() {
            warnings.push(format!(
                "Capture '{}' has no filter - every packet reaches the decoder",
                capture.device
            ));
        }
    }

    for sink in &blueprint.sinks {
        if sink.sink_type != SinkType::Sql || !sink.output_mode.is_enabled() {
            continue;
        }
        let delay = sink.params.get("batch_delay_ms").map(|s| s.trim());
        let batch_size = sink.params.get("batch_size").map(|s| s.trim());
        if delay.is_some_and(|d| d != "0") && batch_size.is_some() {
            warnings.push(format!(
                "Sink '{}': batch_delay_ms is set, batch_size is ignored (one row per flush)",
                sink.name
            ));
        }
        if delay.is_none_or(|d| d == "0") {
            warnings.push(format!(
                "Sink '{}': size-triggered batching has no periodic flush; a partial batch waits for more traffic",
                sink.name
            ));
        }
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Server: {}", summary.server_name);
            println!("  Captures: {}", summary.capture_count);
            println!(
                "  Sinks: {} ({} enabled)",
                summary.sink_count, summary.enabled_sink_count
            );
            println!(
                "  Domain lists: {} skip, {} allow",
                summary.skip_entries, summary.allow_entries
            );
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const CONFIG: &str = r#"
[general]
skip_domains_file = "skip.csv"

[[captures]]
device = "eth0"

[[sinks]]
name = "db"
sink_type = "sql"
output_mode = "skip"
[sinks.params]
endpoint = "mysql://dns@127.0.0.1/dns"
batch_size = "100"
"#;

    #[test]
    fn test_valid_config_with_list_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("skip.csv"), "ads.example.com\ntracker,prefix\n").unwrap();
        let path = dir.path().join("dnscope.toml");
        std::fs::write(&path, CONFIG).unwrap();

        let result = validate_config(&ValidateArgs {
            config: path,
            json: true,
        });
        assert!(result.valid, "{:?}", result.error);
        let summary = result.summary.unwrap();
        assert_eq!(summary.skip_entries, 2);
        assert_eq!(summary.enabled_sink_count, 1);
        let warnings = result.warnings.unwrap();
        assert!(warnings.iter().any(|w| w.contains("no periodic flush")));
    }

    #[test]
    fn test_missing_list_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnscope.toml");
        std::fs::write(&path, CONFIG).unwrap();

        let result = validate_config(&ValidateArgs {
            config: path,
            json: false,
        });
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("skip.csv"));
    }

    #[test]
    fn test_missing_config_file() {
        let result = validate_config(&ValidateArgs {
            config: PathBuf::from("/nonexistent/dnscope.toml"),
            json: false,
        });
        assert!(!result.valid);
    }
}
