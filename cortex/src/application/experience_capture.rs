// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Experience Capture
//!
//! Records task trajectories while they run and seals them into immutable
//! experiences.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Buffer steps in memory, persist on seal, recover orphans
//!
//! An open row is written when a trajectory starts so a crash leaves a trace;
//! steps stay in memory until `end_trajectory` flushes them with the sealed
//! experience. Trajectories left open longer than the orphan timeout are
//! sealed as `infra_error` at startup and by the periodic sweep.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::error::CortexError;
use crate::domain::events::CortexEvent;
use crate::domain::experience::{Experience, TaskOutcome, TrajectoryId, TrajectoryStep};
use crate::domain::pattern::PatternId;
use crate::domain::qe_domain::QeDomain;
use crate::domain::repository::{StoreError, WriteBatch, WriteOp};
use crate::infrastructure::infra_classifier::InfraErrorClassifier;
use crate::infrastructure::telemetry;

use super::knowledge::KnowledgeBase;

/// In-flight state of one handle
#[derive(Debug)]
enum Slot {
    Open(Experience),
    /// Claimed by an `end_trajectory` call that has not finished persisting
    Sealing,
}

pub struct ExperienceCapture {
    kb: Arc<KnowledgeBase>,
    classifier: Arc<dyn InfraErrorClassifier>,
    open: DashMap<TrajectoryId, Slot>,
    /// Serializes adopting or claiming handles that are only in the store
    adoption: Mutex<()>,
    orphan_timeout: Duration,
}

fn being_sealed(id: TrajectoryId) -> CortexError {
    CortexError::InvalidState(format!("trajectory {} is being sealed", id))
}

impl ExperienceCapture {
    pub fn new(kb: Arc<KnowledgeBase>, classifier: Arc<dyn InfraErrorClassifier>, orphan_timeout: Duration) -> Self {
        Self {
            kb,
            classifier,
            open: DashMap::new(),
            adoption: Mutex::new(()),
            orphan_timeout,
        }
    }

    pub async fn start_trajectory(&self, task_id: impl Into<String>, domain: QeDomain) -> Result<TrajectoryId, CortexError> {
        let experience = Experience::open(TrajectoryId::new(), task_id, domain);
        let id = experience.id;

        self.kb
            .commit(WriteBatch::single(WriteOp::PutExperience(experience.clone())), Vec::new())
            .await?;
        self.open.insert(id, Slot::Open(experience));

        debug!(trajectory_id = %id, domain = %domain, "Trajectory started");
        Ok(id)
    }

    pub async fn record_step(
        &self,
        id: TrajectoryId,
        state_key: impl Into<String>,
        action_key: impl Into<String>,
        reward: f64,
    ) -> Result<(), CortexError> {
        if !reward.is_finite() {
            return Err(CortexError::InvalidInput(format!("reward must be finite, got {}", reward)));
        }
        let step = TrajectoryStep {
            state_key: state_key.into(),
            action_key: action_key.into(),
            reward,
        };
        self.with_open(id, move |experience| experience.push_step(step)).await
    }

    /// Report a retrieved pattern as used by the task; counted once
    pub async fn use_pattern(&self, id: TrajectoryId, pattern_id: PatternId) -> Result<(), CortexError> {
        self.with_open(id, move |experience| experience.mark_pattern_used(pattern_id))
            .await
    }

    /// Run `f` on the buffered trajectory. A handle this process has not
    /// seen is adopted from its persisted open row.
    async fn with_open<F>(&self, id: TrajectoryId, f: F) -> Result<(), CortexError>
    where
        F: FnOnce(&mut Experience) -> Result<(), CortexError>,
    {
        if let Some(mut slot) = self.open.get_mut(&id) {
            return match slot.value_mut() {
                Slot::Open(experience) => f(experience),
                Slot::Sealing => Err(being_sealed(id)),
            };
        }

        let _adoption = self.adoption.lock().await;
        if !self.open.contains_key(&id) {
            let persisted = self.load_open(id).await?;
            debug!(trajectory_id = %id, "Adopted persisted open trajectory");
            self.open.entry(id).or_insert(Slot::Open(persisted));
        }
        let mut slot = self
            .open
            .get_mut(&id)
            .ok_or_else(|| CortexError::NotFound(format!("trajectory {}", id)))?;
        match slot.value_mut() {
            Slot::Open(experience) => f(experience),
            Slot::Sealing => Err(being_sealed(id)),
        }
    }

    /// Take the handle for sealing; exactly one caller wins
    async fn claim(&self, id: TrajectoryId) -> Result<Experience, CortexError> {
        if let Some(experience) = self.claim_buffered(id)? {
            return Ok(experience);
        }

        let _adoption = self.adoption.lock().await;
        if let Some(experience) = self.claim_buffered(id)? {
            return Ok(experience);
        }
        let persisted = self.load_open(id).await?;
        self.open.insert(id, Slot::Sealing);
        Ok(persisted)
    }

    fn claim_buffered(&self, id: TrajectoryId) -> Result<Option<Experience>, CortexError> {
        match self.open.entry(id) {
            Entry::Occupied(mut entry) => match std::mem::replace(entry.get_mut(), Slot::Sealing) {
                Slot::Open(experience) => Ok(Some(experience)),
                Slot::Sealing => Err(being_sealed(id)),
            },
            Entry::Vacant(_) => Ok(None),
        }
    }

    /// Seal a trajectory with its outcome and persist it.
    ///
    /// Failures whose reason matches an infrastructure signature are
    /// recorded as `infra_error`. A handle unknown to this process (e.g.
    /// opened before a restart) is sealed from its persisted open row.
    pub async fn end_trajectory(&self, id: TrajectoryId, outcome: TaskOutcome) -> Result<Experience, CortexError> {
        let mut experience = self.claim(id).await?;
        let unsealed = experience.clone();

        let outcome = self.classifier.classify(outcome);
        if let Err(e) = experience.seal(outcome) {
            self.open.remove(&id);
            return Err(e);
        }

        match self.persist_sealed(&experience).await {
            Ok(()) => {
                self.open.remove(&id);
            }
            Err(CortexError::Conflict(reason)) => {
                // Sealed elsewhere in the meantime
                self.open.remove(&id);
                return Err(CortexError::InvalidState(format!(
                    "trajectory {} is already sealed: {}",
                    id, reason
                )));
            }
            Err(e) => {
                // Leave the trajectory open so the caller can retry
                self.open.insert(id, Slot::Open(unsealed));
                return Err(e);
            }
        }

        telemetry::record_outcome(experience.domain, experience.outcome.as_ref().map_or("unknown", TaskOutcome::label));
        info!(
            trajectory_id = %id,
            domain = %experience.domain,
            outcome = experience.outcome.as_ref().map_or("unknown", TaskOutcome::label),
            steps = experience.trajectory.len(),
            "Trajectory sealed"
        );
        Ok(experience)
    }

    async fn load_open(&self, id: TrajectoryId) -> Result<Experience, CortexError> {
        let result = self.kb.store().get_experience(id).await;
        let experience = match result {
            Ok(experience) => experience,
            Err(StoreError::NotFound(_)) => {
                return Err(CortexError::NotFound(format!("trajectory {}", id)));
            }
            Err(e) => return self.kb.observe(Err(e.into())),
        };
        if experience.is_sealed() {
            return Err(CortexError::InvalidState(format!("trajectory {} is already sealed", id)));
        }
        Ok(experience)
    }

    async fn persist_sealed(&self, experience: &Experience) -> Result<(), CortexError> {
        let event = CortexEvent::ExperienceSealed {
            trajectory_id: experience.id,
            domain: experience.domain,
            outcome: experience.outcome.as_ref().map_or("unknown", TaskOutcome::label).to_string(),
            steps: experience.trajectory.len(),
            timestamp: Utc::now(),
        };
        self.kb
            .commit(WriteBatch::single(WriteOp::PutExperience(experience.clone())), vec![event])
            .await
    }

    /// Seal every trajectory that has been open longer than the orphan
    /// timeout as `infra_error`; returns the sealed ids.
    pub async fn recover_orphans(&self) -> Result<Vec<TrajectoryId>, CortexError> {
        let result = self.kb.store().get_open_experiences().await.map_err(CortexError::from);
        let persisted_open = self.kb.observe(result)?;

        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.orphan_timeout).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut sealed = Vec::new();

        for persisted in persisted_open {
            let age = now - persisted.started_at;
            if age < timeout {
                continue;
            }
            let id = persisted.id;
            let _adoption = self.adoption.lock().await;
            // Prefer the in-memory copy, it carries the buffered steps
            let mut experience = match self.claim_buffered(id) {
                Ok(Some(buffered)) => buffered,
                Ok(None) => persisted,
                Err(_) => continue,
            };
            if experience.is_sealed() {
                self.open.remove(&id);
                continue;
            }
            experience.seal(TaskOutcome::infra_error(format!(
                "trajectory not sealed within {}s",
                self.orphan_timeout.as_secs()
            )))?;

            let event = CortexEvent::TrajectoryOrphaned {
                trajectory_id: id,
                domain: experience.domain,
                age_seconds: age.num_seconds(),
                timestamp: now,
            };
            let committed = self
                .kb
                .commit(WriteBatch::single(WriteOp::PutExperience(experience)), vec![event])
                .await;
            self.open.remove(&id);
            match committed {
                Ok(()) => {}
                Err(CortexError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
            warn!(trajectory_id = %id, age_seconds = age.num_seconds(), "Sealed orphaned trajectory as infra_error");
            sealed.push(id);
        }

        if !sealed.is_empty() {
            telemetry::record_orphans_sealed(sealed.len());
            info!(count = sealed.len(), "Orphan recovery complete");
        }
        Ok(sealed)
    }

    /// Handles buffered or mid-seal in this process
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn is_open(&self, id: TrajectoryId) -> bool {
        self.open.get(&id).is_some_and(|slot| matches!(slot.value(), Slot::Open(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::knowledge::test_support::knowledge_base;
    use super::*;
    use crate::infrastructure::infra_classifier::{NoopClassifier, SignatureClassifier};

    fn capture(kb: Arc<KnowledgeBase>) -> ExperienceCapture {
        let classifier = SignatureClassifier::new(["docker daemon", "(?i)connection refused"]).unwrap();
        ExperienceCapture::new(kb, Arc::new(classifier), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_steps_are_flushed_on_seal() {
        let kb = knowledge_base();
        let capture = capture(kb.clone());
        let id = capture.start_trajectory("task-1", QeDomain::TestGeneration).await.unwrap();

        capture.record_step(id, "s0", "generate_unit", 0.5).await.unwrap();
        capture.record_step(id, "s1", "run_suite", 1.0).await.unwrap();

        // Open row exists before sealing but carries no steps yet
        let open = kb.store().get_experience(id).await.unwrap();
        assert!(!open.is_sealed());
        assert!(open.trajectory.is_empty());

        let sealed = capture.end_trajectory(id, TaskOutcome::Success).await.unwrap();
        assert_eq!(sealed.trajectory.len(), 2);

        let stored = kb.store().get_experience(id).await.unwrap();
        assert_eq!(stored.outcome, Some(TaskOutcome::Success));
        assert_eq!(stored.trajectory.len(), 2);
        assert_eq!(capture.open_count(), 0);
    }

    #[tokio::test]
    async fn test_sealed_trajectory_rejects_further_calls() {
        let kb = knowledge_base();
        let capture = capture(kb);
        let id = capture.start_trajectory("task-2", QeDomain::TestExecution).await.unwrap();
        capture.end_trajectory(id, TaskOutcome::Success).await.unwrap();

        assert!(matches!(
            capture.record_step(id, "s", "a", 1.0).await,
            Err(CortexError::InvalidState(_))
        ));
        assert!(matches!(
            capture.use_pattern(id, PatternId::new()).await,
            Err(CortexError::InvalidState(_))
        ));
        assert!(matches!(
            capture.end_trajectory(id, TaskOutcome::Success).await,
            Err(CortexError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_handle_is_not_found() {
        let capture = capture(knowledge_base());
        let missing = TrajectoryId::new();
        assert!(matches!(
            capture.use_pattern(missing, PatternId::new()).await,
            Err(CortexError::NotFound(_))
        ));
        assert!(matches!(
            capture.record_step(missing, "s", "a", 1.0).await,
            Err(CortexError::NotFound(_))
        ));
        assert_eq!(capture.open_count(), 0);
        assert!(matches!(
            capture.end_trajectory(missing, TaskOutcome::Success).await,
            Err(CortexError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_non_finite_reward_is_rejected() {
        let capture = capture(knowledge_base());
        let id = capture.start_trajectory("task-3", QeDomain::TestGeneration).await.unwrap();
        assert!(matches!(
            capture.record_step(id, "s", "a", f64::NAN).await,
            Err(CortexError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_infra_failure_is_reclassified() {
        let capture = capture(knowledge_base());
        let id = capture.start_trajectory("task-4", QeDomain::TestExecution).await.unwrap();
        let sealed = capture
            .end_trajectory(id, TaskOutcome::failure("Cannot connect to the docker daemon"))
            .await
            .unwrap();
        assert!(sealed.outcome.as_ref().unwrap().is_infra_error());
        assert!(!sealed.is_learnable());
    }

    #[tokio::test]
    async fn test_orphans_older_than_timeout_are_sealed() {
        let kb = knowledge_base();
        let capture = ExperienceCapture::new(kb.clone(), Arc::new(NoopClassifier), Duration::from_secs(60));

        let mut stale = Experience::open(TrajectoryId::new(), "crashed", QeDomain::CoverageAnalysis);
        stale.started_at = Utc::now() - chrono::Duration::hours(2);
        kb.store().put_experience(&stale).await.unwrap();

        let fresh = capture.start_trajectory("running", QeDomain::CoverageAnalysis).await.unwrap();

        let sealed = capture.recover_orphans().await.unwrap();
        assert_eq!(sealed, vec![stale.id]);

        let stored = kb.store().get_experience(stale.id).await.unwrap();
        assert!(stored.outcome.unwrap().is_infra_error());
        assert!(capture.is_open(fresh));
    }

    #[tokio::test]
    async fn test_end_after_restart_uses_persisted_row() {
        let kb = knowledge_base();
        let before = capture(kb.clone());
        let id = before.start_trajectory("task-5", QeDomain::TestGeneration).await.unwrap();
        drop(before);

        let after = capture(kb.clone());
        let sealed = after.end_trajectory(id, TaskOutcome::Success).await.unwrap();
        assert!(sealed.trajectory.is_empty());
        assert_eq!(kb.store().get_experience(id).await.unwrap().outcome, Some(TaskOutcome::Success));
    }

    #[tokio::test]
    async fn test_steps_after_restart_adopt_persisted_row() {
        let kb = knowledge_base();
        let before = capture(kb.clone());
        let id = before.start_trajectory("task-6", QeDomain::ContractTesting).await.unwrap();
        drop(before);

        let after = capture(kb.clone());
        after.record_step(id, "provider-drift", "pin-version", 1.0).await.unwrap();
        assert!(after.is_open(id));

        let sealed = after.end_trajectory(id, TaskOutcome::Success).await.unwrap();
        assert_eq!(sealed.trajectory.len(), 1);
        assert_eq!(after.open_count(), 0);
    }

    #[tokio::test]
    async fn test_persisted_sealed_row_is_invalid_state_for_new_process() {
        let kb = knowledge_base();
        let before = capture(kb.clone());
        let id = before.start_trajectory("task-7", QeDomain::TestExecution).await.unwrap();
        before.end_trajectory(id, TaskOutcome::Success).await.unwrap();

        let after = capture(kb);
        assert!(matches!(
            after.record_step(id, "s", "a", 1.0).await,
            Err(CortexError::InvalidState(_))
        ));
        assert_eq!(after.open_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_seals_have_one_winner() {
        let kb = knowledge_base();
        let capture = Arc::new(capture(kb.clone()));

        for round in 0..25 {
            // Alternate buffered handles and handles known only to the store
            let id = if round % 2 == 0 {
                capture.start_trajectory("race", QeDomain::TestGeneration).await.unwrap()
            } else {
                let other = ExperienceCapture::new(kb.clone(), Arc::new(NoopClassifier), Duration::from_secs(3600));
                other.start_trajectory("race", QeDomain::TestGeneration).await.unwrap()
            };

            let first = tokio::spawn({
                let capture = capture.clone();
                async move { capture.end_trajectory(id, TaskOutcome::Success).await }
            });
            let second = tokio::spawn({
                let capture = capture.clone();
                async move { capture.end_trajectory(id, TaskOutcome::Success).await }
            });
            let results = [first.await.unwrap(), second.await.unwrap()];

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(CortexError::InvalidState(_)))));
            assert!(!capture.is_open(id));
            assert!(matches!(
                capture.record_step(id, "s", "a", 1.0).await,
                Err(CortexError::InvalidState(_))
            ));
        }
        assert_eq!(capture.open_count(), 0);
    }
}
