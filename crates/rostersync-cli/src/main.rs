//! rostersync CLI - Command-line interface for rostersync
//!
//! Provides commands for:
//! - Previewing the list documents sent to the notification server
//! - Inspecting and discarding the persisted roster
//! - Viewing and validating configuration

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rostersync_core::config::Config;

mod commands;
mod output;

use commands::{batch::BatchCommand, cache::CacheCommand, config::ConfigCommand};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(
    name = "rostersync",
    version,
    about = "Contact-list synchronization for instant messaging accounts"
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the list documents built for a set of contacts
    Batch(BatchCommand),
    /// Inspect or discard the persisted roster
    #[command(subcommand)]
    Cache(CacheCommand),
    /// View and validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// Installs the global subscriber
///
/// `-v` flags win over the configured level; `RUST_LOG` wins over both.
fn init_tracing(config: &Config, verbose: u8, json: bool) -> Result<()> {
    let level = match verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match (&config.logging.file, json) {
        (Some(path), _) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        (None, true) => builder.json().with_writer(std::io::stderr).init(),
        (None, false) => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path);
    init_tracing(&config, cli.verbose, cli.json)?;

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };

    match cli.command {
        Commands::Batch(cmd) => cmd.execute(format).await,
        Commands::Cache(cmd) => cmd.execute(&config, format).await,
        Commands::Config(cmd) => cmd.execute(&config_path, format).await,
    }
}
