//! Config command - View and manage rostersync configuration
//!
//! Provides the `rostersync config` CLI command which:
//! 1. Shows the effective configuration (YAML or JSON)
//! 2. Prints the configuration file path
//! 3. Validates the configuration file and reports errors
//! 4. Sets individual configuration values via dot-notation keys

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing::info;

use rostersync_core::config::Config;

use crate::output::{count, OutputFormat, Printer};

/// Config subcommands
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display current configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Validate configuration file
    Validate,
    /// Set a configuration value
    Set {
        /// Configuration key (e.g., "sync.refresh_interval_secs")
        key: String,
        /// New value
        value: String,
    },
}

impl ConfigCommand {
    /// Execute the config command against the file at `config_path`
    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        match self {
            ConfigCommand::Show => execute_show(config_path, format),
            ConfigCommand::Path => execute_path(config_path, format),
            ConfigCommand::Validate => execute_validate(config_path, format),
            ConfigCommand::Set { key, value } => execute_set(config_path, key, value, format),
        }
    }
}

fn execute_show(config_path: &Path, format: OutputFormat) -> Result<()> {
    let printer = Printer::new(format);
    let config = Config::load_or_default(config_path);

    info!(config_path = %config_path.display(), "Showing configuration");

    if format.is_json() {
        let json =
            serde_json::to_value(&config).context("Failed to serialize configuration to JSON")?;
        printer.document(&json);
    } else {
        printer.done(&format!("Configuration ({})", config_path.display()));
        printer.line("");

        let yaml =
            serde_yaml::to_string(&config).context("Failed to serialize configuration to YAML")?;
        for line in yaml.lines() {
            printer.line(line);
        }
    }

    Ok(())
}

fn execute_path(config_path: &Path, format: OutputFormat) -> Result<()> {
    if format.is_json() {
        Printer::new(format).document(&serde_json::json!({
            "config_path": config_path.display().to_string(),
            "exists": config_path.exists(),
        }));
    } else {
        println!("{}", config_path.display());
    }
    Ok(())
}

fn execute_validate(config_path: &Path, format: OutputFormat) -> Result<()> {
    let printer = Printer::new(format);

    // Load explicitly: a parse failure must be reported, not defaulted
    let config = match Config::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            let message = if config_path.exists() {
                format!("Failed to parse configuration: {e}")
            } else {
                "Configuration file not found. Using defaults.".to_string()
            };
            if format.is_json() {
                printer.document(&serde_json::json!({
                    "valid": false,
                    "config_path": config_path.display().to_string(),
                    "errors": [message],
                }));
            } else {
                printer.failed(&message);
                printer.line(&format!("File: {}", config_path.display()));
            }
            return Ok(());
        }
    };

    info!(config_path = %config_path.display(), "Validating configuration");

    let errors = config.validate();

    if format.is_json() {
        let error_strings: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        printer.document(&serde_json::json!({
            "valid": errors.is_empty(),
            "config_path": config_path.display().to_string(),
            "errors": error_strings,
        }));
    } else if errors.is_empty() {
        printer.done("Configuration is valid");
        printer.line(&format!("File: {}", config_path.display()));
    } else {
        printer.failed(&format!(
            "Configuration has {}:",
            count(errors.len(), "error", "errors")
        ));
        printer.line(&format!("File: {}", config_path.display()));
        printer.line("");
        for error in &errors {
            printer.line(&format!("  {} - {}", error.field, error.message));
        }
    }

    Ok(())
}

fn execute_set(config_path: &Path, key: &str, value: &str, format: OutputFormat) -> Result<()> {
    let printer = Printer::new(format);
    let mut config = Config::load_or_default(config_path);

    info!(key = %key, value = %value, "Setting configuration value");

    if let Err(e) = apply_config_value(&mut config, key, value) {
        if format.is_json() {
            printer.document(&serde_json::json!({
                "success": false,
                "key": key,
                "error": e.to_string(),
            }));
        } else {
            printer.failed(&format!("Failed to set '{key}': {e}"));
            printer.line("");
            printer.line("Supported keys:");
            for supported in SUPPORTED_KEYS {
                printer.line(&format!("  {supported}"));
            }
        }
        return Ok(());
    }

    let errors = config.validate();
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        if format.is_json() {
            printer.document(&serde_json::json!({
                "success": false,
                "key": key,
                "errors": messages,
            }));
        } else {
            printer.failed(&format!("Invalid value for '{key}': {}", messages.join("; ")));
        }
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create configuration directory")?;
    }
    let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
    std::fs::write(config_path, yaml).context("Failed to write configuration file")?;

    if format.is_json() {
        printer.document(&serde_json::json!({
            "success": true,
            "key": key,
            "value": value,
            "config_path": config_path.display().to_string(),
        }));
    } else {
        printer.done(&format!("Set {key} = {value}"));
        printer.line(&format!("Saved to {}", config_path.display()));
    }
    Ok(())
}

const SUPPORTED_KEYS: [&str; 8] = [
    "sync.auto_sync",
    "sync.max_recovery_attempts",
    "sync.refresh_interval_secs",
    "storage.database",
    "notification.event_capacity",
    "notification.reply_buffer",
    "logging.level",
    "logging.file",
];

/// Apply a dot-notation key/value pair to a Config struct
fn apply_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        // --- sync ---
        "sync.auto_sync" => {
            config.sync.auto_sync = value
                .parse::<bool>()
                .context("Expected true or false for sync.auto_sync")?;
        }
        "sync.max_recovery_attempts" => {
            config.sync.max_recovery_attempts = value
                .parse::<u32>()
                .context("Expected a positive integer for sync.max_recovery_attempts")?;
        }
        "sync.refresh_interval_secs" => {
            config.sync.refresh_interval_secs = value
                .parse::<u64>()
                .context("Expected a positive integer for sync.refresh_interval_secs")?;
        }

        // --- storage ---
        "storage.database" => {
            config.storage.database = PathBuf::from(value);
        }

        // --- notification ---
        "notification.event_capacity" => {
            config.notification.event_capacity = value
                .parse::<usize>()
                .context("Expected a positive integer")?;
        }
        "notification.reply_buffer" => {
            config.notification.reply_buffer = value
                .parse::<usize>()
                .context("Expected a positive integer")?;
        }

        // --- logging ---
        "logging.level" => {
            config.logging.level = value.to_string();
        }
        "logging.file" => {
            config.logging.file = if value.is_empty() || value == "none" {
                None
            } else {
                Some(PathBuf::from(value))
            };
        }

        _ => {
            anyhow::bail!("Unknown configuration key: '{}'", key);
        }
    }

    Ok(())
}
