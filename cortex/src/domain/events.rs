// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Domain events for the Cortex bounded context
//!
//! Published on the event bus for observers. Events that concern a single
//! pattern are also written to `pattern_audit` in the same transaction as
//! the pattern row they describe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::dream::{ConsolidationTrigger, DreamPhase};
use super::experience::TrajectoryId;
use super::insight::InsightId;
use super::pattern::PatternId;
use super::qe_domain::QeDomain;

/// Cortex domain events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CortexEvent {
    // Pattern lifecycle

    /// A new pattern was stored
    PatternStored {
        pattern_id: PatternId,
        domain: QeDomain,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// A reported usage moved a pattern's confidence
    PatternOutcomeRecorded {
        pattern_id: PatternId,
        trajectory_id: TrajectoryId,
        outcome: String,
        old_confidence: f64,
        new_confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// Confidence fell below the quarantine threshold
    PatternQuarantined {
        pattern_id: PatternId,
        domain: QeDomain,
        confidence: f64,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// Enough consecutive successes returned a quarantined pattern to short-term
    PatternRehabilitated {
        pattern_id: PatternId,
        domain: QeDomain,
        consecutive_successes: u32,
        timestamp: DateTime<Utc>,
    },

    /// The coherence gate promoted a pattern to long-term
    PatternPromoted {
        pattern_id: PatternId,
        domain: QeDomain,
        confidence: f64,
        success_rate: f64,
        timestamp: DateTime<Utc>,
    },

    /// The coherence gate refused a promotion
    PromotionBlocked {
        pattern_id: PatternId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A promoted pattern was copied into a compatible domain
    PatternTransferred {
        source_pattern_id: PatternId,
        copy_pattern_id: PatternId,
        source_domain: QeDomain,
        target_domain: QeDomain,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    // Experience capture

    /// A trajectory ended and was persisted
    ExperienceSealed {
        trajectory_id: TrajectoryId,
        domain: QeDomain,
        outcome: String,
        steps: usize,
        timestamp: DateTime<Utc>,
    },

    /// A trajectory was never sealed and got closed as an infrastructure error
    TrajectoryOrphaned {
        trajectory_id: TrajectoryId,
        domain: QeDomain,
        age_seconds: i64,
        timestamp: DateTime<Utc>,
    },

    // Consolidation

    /// The dream engine produced an insight
    InsightGenerated {
        insight_id: InsightId,
        kind: String,
        domain: QeDomain,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// A high-confidence insight was applied through the gate
    InsightApplied {
        insight_id: InsightId,
        kind: String,
        derived_pattern_id: Option<PatternId>,
        timestamp: DateTime<Utc>,
    },

    /// A dream cycle ran to completion
    ConsolidationCompleted {
        cycle_id: Uuid,
        trigger: ConsolidationTrigger,
        nodes: usize,
        merged_nodes: usize,
        insights: usize,
        applied_insights: usize,
        promoted: usize,
        transferred: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A dream cycle checkpointed and gave way to live traffic
    ConsolidationYielded {
        cycle_id: Uuid,
        next_phase: DreamPhase,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Tombstones were removed from the semantic index
    IndexCompacted {
        removed: usize,
        remaining: usize,
        timestamp: DateTime<Utc>,
    },
}

impl CortexEvent {
    /// Get the timestamp of the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CortexEvent::PatternStored { timestamp, .. } => *timestamp,
            CortexEvent::PatternOutcomeRecorded { timestamp, .. } => *timestamp,
            CortexEvent::PatternQuarantined { timestamp, .. } => *timestamp,
            CortexEvent::PatternRehabilitated { timestamp, .. } => *timestamp,
            CortexEvent::PatternPromoted { timestamp, .. } => *timestamp,
            CortexEvent::PromotionBlocked { timestamp, .. } => *timestamp,
            CortexEvent::PatternTransferred { timestamp, .. } => *timestamp,
            CortexEvent::ExperienceSealed { timestamp, .. } => *timestamp,
            CortexEvent::TrajectoryOrphaned { timestamp, .. } => *timestamp,
            CortexEvent::InsightGenerated { timestamp, .. } => *timestamp,
            CortexEvent::InsightApplied { timestamp, .. } => *timestamp,
            CortexEvent::ConsolidationCompleted { timestamp, .. } => *timestamp,
            CortexEvent::ConsolidationYielded { timestamp, .. } => *timestamp,
            CortexEvent::IndexCompacted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            CortexEvent::PatternStored { .. } => "pattern_stored",
            CortexEvent::PatternOutcomeRecorded { .. } => "pattern_outcome_recorded",
            CortexEvent::PatternQuarantined { .. } => "pattern_quarantined",
            CortexEvent::PatternRehabilitated { .. } => "pattern_rehabilitated",
            CortexEvent::PatternPromoted { .. } => "pattern_promoted",
            CortexEvent::PromotionBlocked { .. } => "promotion_blocked",
            CortexEvent::PatternTransferred { .. } => "pattern_transferred",
            CortexEvent::ExperienceSealed { .. } => "experience_sealed",
            CortexEvent::TrajectoryOrphaned { .. } => "trajectory_orphaned",
            CortexEvent::InsightGenerated { .. } => "insight_generated",
            CortexEvent::InsightApplied { .. } => "insight_applied",
            CortexEvent::ConsolidationCompleted { .. } => "consolidation_completed",
            CortexEvent::ConsolidationYielded { .. } => "consolidation_yielded",
            CortexEvent::IndexCompacted { .. } => "index_compacted",
        }
    }

    /// The pattern an event is about, for the audit trail
    pub fn pattern_id(&self) -> Option<PatternId> {
        match self {
            CortexEvent::PatternStored { pattern_id, .. }
            | CortexEvent::PatternOutcomeRecorded { pattern_id, .. }
            | CortexEvent::PatternQuarantined { pattern_id, .. }
            | CortexEvent::PatternRehabilitated { pattern_id, .. }
            | CortexEvent::PatternPromoted { pattern_id, .. }
            | CortexEvent::PromotionBlocked { pattern_id, .. } => Some(*pattern_id),
            CortexEvent::PatternTransferred { copy_pattern_id, .. } => Some(*copy_pattern_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = CortexEvent::PatternStored {
            pattern_id: PatternId::new(),
            domain: QeDomain::TestGeneration,
            confidence: 0.5,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: CortexEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(event.event_type(), deserialized.event_type());
        assert!(json.contains("\"type\":\"pattern_stored\""));
    }

    #[test]
    fn test_transfer_event_audits_the_copy() {
        let copy = PatternId::new();
        let event = CortexEvent::PatternTransferred {
            source_pattern_id: PatternId::new(),
            copy_pattern_id: copy,
            source_domain: QeDomain::TestGeneration,
            target_domain: QeDomain::TestExecution,
            confidence: 0.64,
            timestamp: Utc::now(),
        };

        assert_eq!(event.pattern_id(), Some(copy));
        assert_eq!(event.event_type(), "pattern_transferred");
    }

    #[test]
    fn test_cycle_events_have_no_pattern() {
        let event = CortexEvent::IndexCompacted { removed: 2, remaining: 10, timestamp: Utc::now() };
        assert!(event.pattern_id().is_none());
    }
}
