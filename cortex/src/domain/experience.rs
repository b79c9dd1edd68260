// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Experience aggregate: one recorded task execution.
//!
//! An experience is open while the task runs and sealed exactly once when it
//! ends. Sealed experiences are immutable apart from the `consolidated` flag
//! the dream engine sets after replaying them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::CortexError;
use super::pattern::PatternId;
use super::qe_domain::QeDomain;

/// Handle for an in-flight trajectory; also the experience's primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrajectoryId(pub Uuid);

impl TrajectoryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrajectoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrajectoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TrajectoryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub state_key: String,
    pub action_key: String,
    pub reward: f64,
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    /// The strategy was wrong
    Failure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The tooling failed to run; reward-neutral
    InfraError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl TaskOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        TaskOutcome::Failure { reason: Some(reason.into()) }
    }

    pub fn infra_error(reason: impl Into<String>) -> Self {
        TaskOutcome::InfraError { reason: Some(reason.into()) }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }

    pub fn is_infra_error(&self) -> bool {
        matches!(self, TaskOutcome::InfraError { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Success => "success",
            TaskOutcome::Failure { .. } => "failure",
            TaskOutcome::InfraError { .. } => "infra_error",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            TaskOutcome::Success => None,
            TaskOutcome::Failure { reason } | TaskOutcome::InfraError { reason } => reason.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub id: TrajectoryId,
    pub task_id: String,
    pub domain: QeDomain,
    pub trajectory: Vec<TrajectoryStep>,
    /// Retrieved patterns the task reported using, each at most once
    pub used_patterns: Vec<PatternId>,
    /// `None` while the trajectory is still open
    pub outcome: Option<TaskOutcome>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub consolidated: bool,
}

impl Experience {
    pub fn open(id: TrajectoryId, task_id: impl Into<String>, domain: QeDomain) -> Self {
        Self {
            id,
            task_id: task_id.into(),
            domain,
            trajectory: Vec::new(),
            used_patterns: Vec::new(),
            outcome: None,
            started_at: Utc::now(),
            completed_at: None,
            consolidated: false,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn push_step(&mut self, step: TrajectoryStep) -> Result<(), CortexError> {
        self.ensure_open()?;
        self.trajectory.push(step);
        Ok(())
    }

    pub fn mark_pattern_used(&mut self, pattern_id: PatternId) -> Result<(), CortexError> {
        self.ensure_open()?;
        if !self.used_patterns.contains(&pattern_id) {
            self.used_patterns.push(pattern_id);
        }
        Ok(())
    }

    pub fn seal(&mut self, outcome: TaskOutcome) -> Result<(), CortexError> {
        self.ensure_open()?;
        self.outcome = Some(outcome);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Whether the learning engine should look at this experience at all
    pub fn is_learnable(&self) -> bool {
        matches!(&self.outcome, Some(o) if !o.is_infra_error())
    }

    fn ensure_open(&self) -> Result<(), CortexError> {
        if self.is_sealed() {
            return Err(CortexError::InvalidState(format!(
                "trajectory {} is already sealed",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(reward: f64) -> TrajectoryStep {
        TrajectoryStep {
            state_key: "s".to_string(),
            action_key: "a".to_string(),
            reward,
        }
    }

    #[test]
    fn test_seal_is_final() {
        let mut exp = Experience::open(TrajectoryId::new(), "task-1", QeDomain::TestGeneration);
        exp.push_step(step(1.0)).unwrap();
        exp.seal(TaskOutcome::Success).unwrap();

        assert!(exp.is_sealed());
        assert!(exp.completed_at.is_some());
        assert!(matches!(exp.push_step(step(0.5)), Err(CortexError::InvalidState(_))));
        assert!(matches!(exp.seal(TaskOutcome::Success), Err(CortexError::InvalidState(_))));
    }

    #[test]
    fn test_used_patterns_are_deduplicated() {
        let mut exp = Experience::open(TrajectoryId::new(), "task-2", QeDomain::CoverageAnalysis);
        let id = PatternId::new();
        exp.mark_pattern_used(id).unwrap();
        exp.mark_pattern_used(id).unwrap();
        assert_eq!(exp.used_patterns, vec![id]);
    }

    #[test]
    fn test_infra_error_is_not_learnable() {
        let mut exp = Experience::open(TrajectoryId::new(), "task-3", QeDomain::TestExecution);
        assert!(!exp.is_learnable());
        exp.seal(TaskOutcome::infra_error("docker daemon unreachable")).unwrap();
        assert!(!exp.is_learnable());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&TaskOutcome::failure("assertion mismatch")).unwrap();
        assert_eq!(json, r#"{"kind":"failure","reason":"assertion mismatch"}"#);
        let back: TaskOutcome = serde_json::from_str(r#"{"kind":"success"}"#).unwrap();
        assert_eq!(back, TaskOutcome::Success);
    }
}
