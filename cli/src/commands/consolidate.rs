// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Manual dream cycle

use anyhow::Result;
use colored::Colorize;
use serde_json::json;

use aegis_cortex::application::dream_engine::DreamReport;
use aegis_cortex::application::runtime::CortexRuntime;
use aegis_cortex::domain::config::CortexConfigManifest;
use aegis_cortex::domain::dream::ConsolidationTrigger;

use crate::output::{print_json, short_id, OutputFormat};

pub async fn run(manifest: &CortexConfigManifest, output: OutputFormat) -> Result<()> {
    let runtime = CortexRuntime::bootstrap(manifest).await?;
    let result = runtime
        .components()
        .dream
        .run_to_completion(ConsolidationTrigger::Manual)
        .await;
    runtime.shutdown().await;
    let report = result?;

    if output.is_json() {
        return print_json(&report_json(&report));
    }

    println!(
        "{}",
        format!("✓ Dream cycle {} completed in {:?}", short_id(&report.cycle_id), report.duration).green()
    );
    println!("  Experiences replayed: {}", report.experiences);
    println!("  Concept nodes: {} ({} merged)", report.nodes, report.merged_nodes);
    println!(
        "  Insights: {} ({} applied)",
        report.insights.len(),
        report.applied_insights
    );
    for insight in &report.insights {
        let marker = if insight.applied { "applied".green() } else { "pending".dimmed() };
        println!(
            "    {} {:<13} {:<24} {:.2} {}",
            short_id(&insight.id),
            insight.kind.label(),
            insight.domain.as_str(),
            insight.confidence,
            marker
        );
    }
    println!("  Promoted: {}", report.promoted.len());
    println!("  Transferred: {}", report.transferred);
    if let Some(compaction) = &report.compaction {
        println!(
            "  Index compacted: {} removed, {} remaining",
            compaction.removed, compaction.remaining
        );
    }

    Ok(())
}

fn report_json(report: &DreamReport) -> serde_json::Value {
    json!({
        "cycle_id": report.cycle_id,
        "trigger": report.trigger.as_str(),
        "experiences": report.experiences,
        "nodes": report.nodes,
        "merged_nodes": report.merged_nodes,
        "insights": report.insights,
        "applied_insights": report.applied_insights,
        "promoted": report.promoted,
        "transferred": report.transferred,
        "compaction": report.compaction.as_ref().map(|c| json!({
            "removed": c.removed,
            "remaining": c.remaining,
            "replayed": c.replayed,
        })),
        "duration_ms": report.duration.as_millis() as u64,
    })
}
