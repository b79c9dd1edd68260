// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Metric names and recording helpers on the `metrics` facade.
//!
//! The library only records; installing an exporter is up to the host
//! (the `cortex serve` command installs a Prometheus listener).

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Duration;

use crate::domain::dream::{ConsolidationTrigger, DreamPhase};
use crate::domain::qe_domain::QeDomain;
use crate::domain::repository::StoreCounts;

pub fn describe_metrics() {
    describe_counter!("cortex_outcomes_total", "Task outcomes recorded, by domain and outcome");
    describe_counter!("cortex_patterns_quarantined_total", "Patterns moved to quarantine");
    describe_counter!("cortex_patterns_rehabilitated_total", "Quarantined patterns restored to short-term");
    describe_counter!("cortex_promotions_total", "Promotion gate decisions, by result");
    describe_counter!("cortex_transfers_total", "Cross-domain pattern copies created");
    describe_counter!("cortex_insights_total", "Insights extracted, by kind and whether applied");
    describe_counter!("cortex_dream_cycles_total", "Dream cycles, by result");
    describe_counter!("cortex_index_unavailable_total", "Searches that timed out on the index lock");
    describe_counter!("cortex_orphans_sealed_total", "Abandoned trajectories sealed as infra_error");
    describe_histogram!("cortex_dream_phase_seconds", Unit::Seconds, "Time spent per dream phase");
    describe_histogram!("cortex_retrieval_seconds", Unit::Seconds, "Pattern retrieval latency");
    describe_gauge!("cortex_patterns", "Stored patterns, by status");
    describe_gauge!("cortex_unconsolidated_experiences", "Sealed experiences awaiting consolidation");
}

pub fn record_outcome(domain: QeDomain, outcome: &'static str) {
    counter!("cortex_outcomes_total", "domain" => domain.as_str(), "outcome" => outcome).increment(1);
}

pub fn record_quarantine(domain: QeDomain) {
    counter!("cortex_patterns_quarantined_total", "domain" => domain.as_str()).increment(1);
}

pub fn record_rehabilitation(domain: QeDomain) {
    counter!("cortex_patterns_rehabilitated_total", "domain" => domain.as_str()).increment(1);
}

pub fn record_promotion(result: &'static str) {
    counter!("cortex_promotions_total", "result" => result).increment(1);
}

pub fn record_transfer(target: QeDomain) {
    counter!("cortex_transfers_total", "target" => target.as_str()).increment(1);
}

pub fn record_insight(kind: &'static str, applied: bool) {
    let applied = if applied { "true" } else { "false" };
    counter!("cortex_insights_total", "kind" => kind, "applied" => applied).increment(1);
}

pub fn record_dream_cycle(trigger: ConsolidationTrigger, result: &'static str) {
    counter!("cortex_dream_cycles_total", "trigger" => trigger.as_str(), "result" => result).increment(1);
}

pub fn record_phase(phase: DreamPhase, elapsed: Duration) {
    histogram!("cortex_dream_phase_seconds", "phase" => phase.as_str()).record(elapsed.as_secs_f64());
}

pub fn record_retrieval(elapsed: Duration) {
    histogram!("cortex_retrieval_seconds").record(elapsed.as_secs_f64());
}

pub fn record_orphans_sealed(count: usize) {
    counter!("cortex_orphans_sealed_total").increment(count as u64);
}

pub fn set_store_gauges(counts: &StoreCounts) {
    gauge!("cortex_patterns", "status" => "short_term").set(counts.short_term_patterns as f64);
    gauge!("cortex_patterns", "status" => "long_term").set(counts.long_term_patterns as f64);
    gauge!("cortex_patterns", "status" => "quarantined").set(counts.quarantined_patterns as f64);
    gauge!("cortex_unconsolidated_experiences").set(counts.unconsolidated_experiences as f64);
}
