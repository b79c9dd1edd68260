// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Cortex Operator CLI
//!
//! The `cortex` binary runs and inspects the cortex learning engine.
//!
//! ## Commands
//!
//! - `cortex serve` - Run the engine with background consolidation until Ctrl-C
//! - `cortex consolidate` - Run one dream cycle to completion
//! - `cortex metrics|insights|patterns` - Inspect the store
//! - `cortex recover` - Seal orphaned trajectories
//! - `cortex config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use aegis_cortex::domain::config::CortexConfigManifest;
use aegis_cortex_cli::commands::{self, ConfigCommand, InsightsArgs, PatternsArgs, ServeArgs};
use aegis_cortex_cli::output::OutputFormat;

/// Cortex - self-improving pattern memory for quality agents
#[derive(Parser)]
#[command(name = "cortex")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "CORTEX_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(long, global = true, env = "CORTEX_LOG_LEVEL")]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and background consolidation until interrupted
    #[command(name = "serve")]
    Serve(ServeArgs),

    /// Run one manual dream cycle to completion
    #[command(name = "consolidate")]
    Consolidate,

    /// Show store and consolidation metrics
    #[command(name = "metrics")]
    Metrics,

    /// List insights produced by consolidation
    #[command(name = "insights")]
    Insights(InsightsArgs),

    /// List stored patterns
    #[command(name = "patterns")]
    Patterns(PatternsArgs),

    /// Seal trajectories abandoned past the orphan timeout
    #[command(name = "recover")]
    Recover,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the manifest when it loads; a broken
    // manifest still gets reported through a default subscriber.
    let manifest = CortexConfigManifest::load_or_default(cli.config.clone());
    let logging = manifest
        .as_ref()
        .map(|m| m.spec.observability.logging.clone())
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, &logging.format)?;

    let output = if cli.json { OutputFormat::Json } else { OutputFormat::Text };

    match cli.command {
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config, output).await,
        Some(Commands::Serve(args)) => commands::serve::run(&loaded(manifest)?, args).await,
        Some(Commands::Consolidate) => commands::consolidate::run(&loaded(manifest)?, output).await,
        Some(Commands::Metrics) => commands::inspect::metrics(&loaded(manifest)?, output).await,
        Some(Commands::Insights(args)) => commands::inspect::insights(&loaded(manifest)?, args, output).await,
        Some(Commands::Patterns(args)) => commands::inspect::patterns(&loaded(manifest)?, args, output).await,
        Some(Commands::Recover) => commands::inspect::recover(&loaded(manifest)?, output).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

fn loaded(manifest: Result<CortexConfigManifest>) -> Result<CortexConfigManifest> {
    manifest.context("Failed to load configuration")
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
