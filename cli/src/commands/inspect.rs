// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Read-mostly inspection commands
//!
//! Commands: metrics, insights, patterns, recover

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use aegis_cortex::application::cortex_service::CortexService;
use aegis_cortex::application::runtime::CortexRuntime;
use aegis_cortex::domain::config::CortexConfigManifest;
use aegis_cortex::domain::pattern::{Pattern, PatternId, PatternStatus, Polarity};
use aegis_cortex::domain::qe_domain::QeDomain;
use aegis_cortex::domain::repository::PatternFilter;

use crate::output::{confidence_bar, print_json, short_id, OutputFormat};

#[derive(Args, Debug, Clone)]
pub struct InsightsArgs {
    /// Only insights for this domain (e.g. test-generation)
    #[arg(long)]
    pub domain: Option<QeDomain>,

    /// Only insights created at or after this RFC 3339 timestamp
    #[arg(long, value_name = "TIMESTAMP")]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Args, Debug, Clone)]
pub struct PatternsArgs {
    /// Only patterns for this domain
    #[arg(long)]
    pub domain: Option<QeDomain>,

    /// short_term, long_term or quarantined
    #[arg(long)]
    pub status: Option<PatternStatus>,

    /// Minimum confidence
    #[arg(long, value_name = "CONFIDENCE")]
    pub min_confidence: Option<f64>,

    /// Maximum number of patterns
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

impl PatternsArgs {
    fn filter(&self) -> PatternFilter {
        PatternFilter {
            domain: self.domain,
            status: self.status,
            min_confidence: self.min_confidence,
            limit: Some(self.limit),
        }
    }
}

/// Pattern listing without the embedding or payload bytes
#[derive(Debug, Serialize)]
struct PatternRow {
    id: PatternId,
    domain: QeDomain,
    status: PatternStatus,
    polarity: Polarity,
    confidence: f64,
    usage_count: u64,
    success_rate: f64,
    tags: Vec<String>,
    transferred_from: Option<PatternId>,
    payload_bytes: usize,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

impl From<&Pattern> for PatternRow {
    fn from(pattern: &Pattern) -> Self {
        Self {
            id: pattern.id,
            domain: pattern.domain,
            status: pattern.status,
            polarity: pattern.polarity,
            confidence: pattern.confidence,
            usage_count: pattern.usage_count,
            success_rate: pattern.success_rate(),
            tags: pattern.tags.clone(),
            transferred_from: pattern.transferred_from,
            payload_bytes: pattern.payload.len(),
            created_at: pattern.created_at,
            last_used_at: pattern.last_used_at,
        }
    }
}

pub async fn metrics(manifest: &CortexConfigManifest, output: OutputFormat) -> Result<()> {
    let runtime = CortexRuntime::bootstrap(manifest).await?;
    let result = runtime.service().get_metrics().await;
    runtime.shutdown().await;
    let metrics = result?;

    if output.is_json() {
        return print_json(&metrics);
    }

    let counts = &metrics.counts;
    println!("{}", "Patterns:".bold());
    println!("  Total: {}", counts.total_patterns);
    println!("  Short-term: {}", counts.short_term_patterns);
    println!("  Long-term: {}", counts.long_term_patterns);
    println!("  Quarantined: {}", counts.quarantined_patterns.to_string().red());
    println!();

    println!("{}", "Experiences:".bold());
    println!("  Total: {}", counts.total_experiences);
    println!("  Open: {}", counts.open_experiences);
    println!("  Awaiting consolidation: {}", counts.unconsolidated_experiences);
    println!();

    println!("{}", "Learning:".bold());
    println!("  Q-values: {}", counts.q_values);
    println!("  Insights: {} ({} applied)", counts.insights, counts.applied_insights);
    match metrics.last_consolidation_at {
        Some(at) => println!("  Last consolidation: {}", at.to_rfc3339()),
        None => println!("  Last consolidation: {}", "never".dimmed()),
    }
    if metrics.consolidation_pending {
        println!("  {}", "Interrupted dream cycle pending".yellow());
    }
    println!();

    println!("{}", "Index:".bold());
    println!(
        "  Entries: {} ({} tombstoned)",
        metrics.index_entries, metrics.index_tombstones
    );

    if metrics.halted {
        println!();
        println!("{}", "✗ Cortex is halted".red().bold());
    }

    Ok(())
}

pub async fn insights(manifest: &CortexConfigManifest, args: InsightsArgs, output: OutputFormat) -> Result<()> {
    let runtime = CortexRuntime::bootstrap(manifest).await?;
    let result = runtime.service().get_insights(args.domain, args.since).await;
    runtime.shutdown().await;
    let insights = result?;

    if output.is_json() {
        return print_json(&insights);
    }

    if insights.is_empty() {
        println!("{}", "No insights found".dimmed());
        return Ok(());
    }

    println!(
        "{:<10} {:<13} {:<24} {:<6} {:<8} {}",
        "ID".bold(),
        "KIND".bold(),
        "DOMAIN".bold(),
        "CONF".bold(),
        "APPLIED".bold(),
        "DESCRIPTION".bold()
    );
    for insight in &insights {
        let applied = if insight.applied { "yes".green() } else { "no".dimmed() };
        println!(
            "{:<10} {:<13} {:<24} {:<6.2} {:<8} {}",
            short_id(&insight.id),
            insight.kind.label(),
            insight.domain.as_str(),
            insight.confidence,
            applied,
            insight.description
        );
    }

    Ok(())
}

pub async fn patterns(manifest: &CortexConfigManifest, args: PatternsArgs, output: OutputFormat) -> Result<()> {
    let runtime = CortexRuntime::bootstrap(manifest).await?;
    let result = runtime.service().list_patterns(args.filter()).await;
    runtime.shutdown().await;
    let patterns = result?;
    let rows: Vec<PatternRow> = patterns.iter().map(PatternRow::from).collect();

    if output.is_json() {
        return print_json(&rows);
    }

    if rows.is_empty() {
        println!("{}", "No patterns found".dimmed());
        return Ok(());
    }

    println!(
        "{:<10} {:<24} {:<12} {:<18} {:<7} {}",
        "ID".bold(),
        "DOMAIN".bold(),
        "STATUS".bold(),
        "CONFIDENCE".bold(),
        "USES".bold(),
        "SUCCESS".bold()
    );
    for row in &rows {
        let status = match row.status {
            PatternStatus::LongTerm => row.status.as_str().green(),
            PatternStatus::Quarantined => row.status.as_str().red(),
            PatternStatus::ShortTerm => row.status.as_str().normal(),
        };
        println!(
            "{:<10} {:<24} {:<12} {} {:.2} {:<7} {:.0}%",
            short_id(&row.id),
            row.domain.as_str(),
            status,
            confidence_bar(row.confidence),
            row.confidence,
            row.usage_count,
            row.success_rate * 100.0
        );
    }

    Ok(())
}

pub async fn recover(manifest: &CortexConfigManifest, output: OutputFormat) -> Result<()> {
    let runtime = CortexRuntime::bootstrap(manifest).await?;
    let mut sealed = runtime.recovered_at_startup().to_vec();
    let result = runtime.service().recover_orphans().await;
    runtime.shutdown().await;
    sealed.extend(result?);

    if output.is_json() {
        return print_json(&sealed);
    }

    if sealed.is_empty() {
        println!("{}", "✓ No orphaned trajectories".green());
        return Ok(());
    }

    println!(
        "{}",
        format!("✓ Sealed {} orphaned trajectories as infra_error", sealed.len()).green()
    );
    for id in &sealed {
        println!("  {}", id);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        patterns: PatternsArgs,
    }

    #[test]
    fn test_pattern_args_build_filter() {
        let harness = Harness::try_parse_from([
            "cortex",
            "--domain",
            "security-compliance",
            "--status",
            "quarantined",
            "--min-confidence",
            "0.2",
        ])
        .unwrap();

        let filter = harness.patterns.filter();
        assert_eq!(filter.domain, Some(QeDomain::SecurityCompliance));
        assert_eq!(filter.status, Some(PatternStatus::Quarantined));
        assert_eq!(filter.min_confidence, Some(0.2));
        assert_eq!(filter.limit, Some(50));
    }

    #[test]
    fn test_unknown_domain_is_rejected() {
        assert!(Harness::try_parse_from(["cortex", "--domain", "astrology"]).is_err());
    }

    #[test]
    fn test_pattern_row_omits_payload() {
        let pattern = Pattern::new(QeDomain::TestGeneration, vec![1.0, 0.0], b"secret".to_vec(), 0.5);
        let row = serde_json::to_value(PatternRow::from(&pattern)).unwrap();
        assert_eq!(row["payload_bytes"], 6);
        assert!(row.get("payload").is_none());
        assert!(row.get("embedding").is_none());
    }
}
