// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Dream cycle state: phases, triggers and the persisted checkpoint that
//! lets an interrupted cycle resume from its last completed phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DreamPhase {
    Idle,
    Preparing,
    Replaying,
    Consolidating,
    Dreaming,
    ExtractingInsights,
}

impl DreamPhase {
    /// Phase that follows this one; `ExtractingInsights` wraps to `Idle`
    pub fn next(&self) -> DreamPhase {
        match self {
            DreamPhase::Idle => DreamPhase::Preparing,
            DreamPhase::Preparing => DreamPhase::Replaying,
            DreamPhase::Replaying => DreamPhase::Consolidating,
            DreamPhase::Consolidating => DreamPhase::Dreaming,
            DreamPhase::Dreaming => DreamPhase::ExtractingInsights,
            DreamPhase::ExtractingInsights => DreamPhase::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DreamPhase::Idle => "idle",
            DreamPhase::Preparing => "preparing",
            DreamPhase::Replaying => "replaying",
            DreamPhase::Consolidating => "consolidating",
            DreamPhase::Dreaming => "dreaming",
            DreamPhase::ExtractingInsights => "extracting_insights",
        }
    }
}

impl fmt::Display for DreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a dream cycle was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationTrigger {
    Timer,
    BufferThreshold,
    QualityGateFailure,
    Manual,
}

impl ConsolidationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationTrigger::Timer => "timer",
            ConsolidationTrigger::BufferThreshold => "buffer_threshold",
            ConsolidationTrigger::QualityGateFailure => "quality_gate_failure",
            ConsolidationTrigger::Manual => "manual",
        }
    }

    /// Higher runs first when several triggers are pending
    pub fn priority(&self) -> u8 {
        match self {
            ConsolidationTrigger::QualityGateFailure => 3,
            ConsolidationTrigger::Manual => 2,
            ConsolidationTrigger::BufferThreshold => 1,
            ConsolidationTrigger::Timer => 0,
        }
    }
}

impl fmt::Display for ConsolidationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted marker of an in-progress cycle.
///
/// `phase` is the next phase to run; `replay_cursor` indexes into the
/// cycle's experience batch, which is the unconsolidated backlog at the
/// time the cycle started, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DreamCheckpoint {
    pub cycle_id: Uuid,
    pub trigger: ConsolidationTrigger,
    pub phase: DreamPhase,
    pub replay_cursor: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DreamCheckpoint {
    pub fn start(trigger: ConsolidationTrigger) -> Self {
        let now = Utc::now();
        Self {
            cycle_id: Uuid::new_v4(),
            trigger,
            phase: DreamPhase::Preparing,
            replay_cursor: 0,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, phase: DreamPhase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_cycle_returns_to_idle() {
        let mut phase = DreamPhase::Idle;
        let mut seen = Vec::new();
        loop {
            phase = phase.next();
            seen.push(phase);
            if phase == DreamPhase::Idle {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                DreamPhase::Preparing,
                DreamPhase::Replaying,
                DreamPhase::Consolidating,
                DreamPhase::Dreaming,
                DreamPhase::ExtractingInsights,
                DreamPhase::Idle,
            ]
        );
    }

    #[test]
    fn test_quality_gate_trigger_outranks_timer() {
        assert!(ConsolidationTrigger::QualityGateFailure.priority() > ConsolidationTrigger::Timer.priority());
    }
}
