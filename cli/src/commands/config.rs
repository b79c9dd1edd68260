// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use aegis_cortex::domain::config::CortexConfigManifest;

use crate::output::{print_json, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./cortex-config.yaml)
        #[arg(short, long, default_value = "./cortex-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
    output: OutputFormat,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths, output).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(&output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, output: OutputFormat) -> Result<()> {
    let config = CortexConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if output.is_json() {
        return print_json(&config);
    }

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. CORTEX_CONFIG_PATH: {}",
            std::env::var("CORTEX_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./cortex-config.yaml");
        println!("  4. ~/.aegis/cortex.yaml");
        println!("  5. /etc/aegis/cortex.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Storage:".bold());
    println!("  Database: {}", spec.storage.database_path.display());
    println!("  Connections: {}", spec.storage.max_connections);
    println!();

    println!("{}", "Embedding & Index:".bold());
    println!("  Dimension: {}", spec.embedding.dimension);
    println!(
        "  HNSW: M={} ef_construction={} ef_search={}",
        spec.index.m, spec.index.ef_construction, spec.index.ef_search
    );
    println!();

    println!("{}", "Learning:".bold());
    println!("  alpha={} gamma={}", spec.learning.alpha, spec.learning.gamma);
    println!(
        "  Penalty ratio: {}:1 ({}:1 safety-critical)",
        spec.learning.default_penalty_ratio, spec.learning.safety_critical_penalty_ratio
    );
    let critical: Vec<_> = spec.learning.safety_critical_domains.iter().map(|d| d.as_str()).collect();
    println!("  Safety-critical domains: {}", critical.join(", "));
    println!(
        "  Quarantine below {} (rehabilitated after {} successes)",
        spec.learning.quarantine_threshold, spec.learning.rehabilitation_successes
    );
    println!();

    println!("{}", "Dreaming:".bold());
    println!("  Interval: {:?}", spec.dream.interval);
    println!("  Buffer threshold: {} experiences", spec.dream.buffer_threshold);
    println!("  Time box: {:?}", spec.dream.time_box);
    println!();

    println!("{}", "Promotion:".bold());
    println!(
        "  usage >= {}, success rate >= {}, confidence >= {}",
        spec.promotion.min_usage, spec.promotion.min_success_rate, spec.promotion.min_confidence
    );
    println!();

    println!("{}", "Transfer:".bold());
    for edge in spec.transfer.edges() {
        println!("  {} → {} (×{})", edge.source, edge.target, edge.weight);
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = CortexConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, with_examples: bool) -> Result<()> {
    if with_examples {
        std::fs::write(output, include_str!("../../templates/cortex-config-with-examples.yaml"))
            .with_context(|| format!("Failed to write config to {:?}", output))?;
    } else {
        CortexConfigManifest::default()
            .to_yaml_file(output)
            .with_context(|| format!("Failed to write config to {:?}", output))?;
    }

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generated_configs_validate() {
        let dir = tempfile::tempdir().unwrap();
        for examples in [false, true] {
            let path = dir.path().join(format!("cortex-{}.yaml", examples));
            generate(&path, examples).await.unwrap();

            let manifest = CortexConfigManifest::from_yaml_file(&path).unwrap();
            manifest.validate().unwrap();
        }
    }
}
