// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # CortexService - Agent-facing facade of the learning loop
//!
//! Every operation an agent (or the operator CLI) performs goes through this
//! trait: semantic retrieval at task start, trajectory capture while the task
//! runs, and the learning update when it completes.
//!
//! ## Retrieval
//!
//! The index is asked for `k × overfetch_factor` candidates so quarantined
//! and stale hits can be dropped without starving the result. Results are
//! ordered by similarity, descending.
//!
//! ## Completion
//!
//! `complete_task` seals the trajectory, runs the asymmetric learning update
//! and requests a consolidation run once the unconsolidated backlog reaches
//! `dream.buffer_threshold`.
//!
//! ## Halting
//!
//! After a checksum mismatch every operation answers `CortexError::Halted`.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Single entry point over capture, learning, promotion and dreaming

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::domain::config::CortexConfigSpec;
use crate::domain::dream::ConsolidationTrigger;
use crate::domain::error::CortexError;
use crate::domain::events::CortexEvent;
use crate::domain::experience::{TaskOutcome, TrajectoryId};
use crate::domain::insight::Insight;
use crate::domain::pattern::{NewPattern, Pattern, PatternId, PatternSummary};
use crate::domain::qe_domain::QeDomain;
use crate::domain::repository::{PatternFilter, StoreCounts};
use crate::infrastructure::semantic_index::IndexFilter;
use crate::infrastructure::telemetry;

use super::consolidation_worker::ConsolidationHandle;
use super::dream_engine::DreamEngine;
use super::experience_capture::ExperienceCapture;
use super::knowledge::KnowledgeBase;
use super::learning::{ActionRecommendation, LearningEngine, LearningReport};
use super::promotion::{PromotionDecision, PromotionGate};
use super::transfer::TransferService;

/// CortexService interface
#[async_trait]
pub trait CortexService: Send + Sync {
    /// Nearest retrievable patterns of a domain, similarity descending
    async fn retrieve_patterns(
        &self,
        domain: QeDomain,
        query_embedding: &[f32],
        k: usize,
        min_confidence: f64,
    ) -> Result<Vec<PatternSummary>, CortexError>;

    async fn begin_task(&self, task_id: &str, domain: QeDomain) -> Result<TrajectoryId, CortexError>;

    async fn record_step(
        &self,
        handle: TrajectoryId,
        state_key: &str,
        action_key: &str,
        reward: f64,
    ) -> Result<(), CortexError>;

    /// Report a retrieved pattern as used by the task
    async fn use_pattern(&self, handle: TrajectoryId, pattern_id: PatternId) -> Result<(), CortexError>;

    async fn complete_task(&self, handle: TrajectoryId, outcome: TaskOutcome) -> Result<TaskCompletion, CortexError>;

    /// Request a consolidation run; returns without waiting for it
    async fn force_consolidation(&self) -> Result<(), CortexError>;

    /// A quality gate failed in `domain`; dreams with the highest priority
    async fn report_quality_gate_failure(&self, domain: QeDomain) -> Result<(), CortexError>;

    async fn get_insights(
        &self,
        domain: Option<QeDomain>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Insight>, CortexError>;

    async fn get_metrics(&self) -> Result<CortexMetrics, CortexError>;

    /// Store a pattern; a same-domain near-duplicate returns the existing id
    async fn store_pattern(&self, pattern: NewPattern) -> Result<PatternId, CortexError>;

    async fn get_pattern(&self, id: PatternId) -> Result<Pattern, CortexError>;

    async fn list_patterns(&self, filter: PatternFilter) -> Result<Vec<Pattern>, CortexError>;

    /// Audit trail of one pattern, oldest first
    async fn pattern_history(&self, id: PatternId) -> Result<Vec<CortexEvent>, CortexError>;

    /// Run the promotion gate for one pattern now
    async fn promote_pattern(&self, id: PatternId) -> Result<PromotionDecision, CortexError>;

    async fn recommend_action(
        &self,
        domain: QeDomain,
        state_key: &str,
    ) -> Result<Option<ActionRecommendation>, CortexError>;

    /// Seal trajectories left open past the orphan timeout
    async fn recover_orphans(&self) -> Result<Vec<TrajectoryId>, CortexError>;
}

/// What `complete_task` did
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    pub trajectory_id: TrajectoryId,
    /// Outcome after infrastructure-failure classification
    pub outcome: TaskOutcome,
    pub learning: LearningReport,
    pub consolidation_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CortexMetrics {
    #[serde(flatten)]
    pub counts: StoreCounts,
    pub last_consolidation_at: Option<DateTime<Utc>>,
    pub consolidation_pending: bool,
    pub in_flight_trajectories: usize,
    pub index_entries: usize,
    pub index_tombstones: usize,
    pub halted: bool,
}

/// Facade knobs taken from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub overfetch_factor: usize,
    pub buffer_threshold: usize,
    pub dedup_similarity: f64,
    pub initial_confidence: f64,
}

impl ServiceSettings {
    pub fn from_spec(spec: &CortexConfigSpec) -> Self {
        Self {
            overfetch_factor: spec.index.overfetch_factor.max(1),
            buffer_threshold: spec.dream.buffer_threshold,
            dedup_similarity: spec.learning.dedup_similarity,
            initial_confidence: spec.learning.initial_confidence,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_spec(&CortexConfigSpec::default())
    }
}

/// The services the facade coordinates
#[derive(Clone)]
pub struct CortexComponents {
    pub knowledge: Arc<KnowledgeBase>,
    pub capture: Arc<ExperienceCapture>,
    pub learning: Arc<LearningEngine>,
    pub gate: Arc<PromotionGate>,
    pub transfer: Arc<TransferService>,
    pub dream: Arc<DreamEngine>,
}

/// Standard implementation of CortexService
pub struct StandardCortexService {
    components: CortexComponents,
    consolidation: ConsolidationHandle,
    settings: ServiceSettings,
}

impl StandardCortexService {
    pub fn new(components: CortexComponents, consolidation: ConsolidationHandle, settings: ServiceSettings) -> Self {
        Self {
            components,
            consolidation,
            settings,
        }
    }

    pub fn components(&self) -> &CortexComponents {
        &self.components
    }

    fn kb(&self) -> &KnowledgeBase {
        &self.components.knowledge
    }

    fn validate_new_pattern(&self, pattern: &NewPattern) -> Result<(), CortexError> {
        if pattern.embedding.iter().any(|x| !x.is_finite()) {
            return Err(CortexError::InvalidInput("embedding contains non-finite values".into()));
        }
        if let Some(confidence) = pattern.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(CortexError::InvalidInput(format!(
                    "confidence must be within [0, 1], got {}",
                    confidence
                )));
            }
        }
        Ok(())
    }

    async fn backlog_reached(&self) -> Result<bool, CortexError> {
        if self.settings.buffer_threshold == 0 {
            return Ok(false);
        }
        let result = self.kb().store().counts().await.map_err(CortexError::from);
        let counts = self.kb().observe(result)?;
        Ok(counts.unconsolidated_experiences >= self.settings.buffer_threshold as u64)
    }
}

#[async_trait]
impl CortexService for StandardCortexService {
    async fn retrieve_patterns(
        &self,
        domain: QeDomain,
        query_embedding: &[f32],
        k: usize,
        min_confidence: f64,
    ) -> Result<Vec<PatternSummary>, CortexError> {
        self.kb().ensure_running()?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let _live = self.kb().enter_live();
        let started = Instant::now();

        let candidates = k.saturating_mul(self.settings.overfetch_factor);
        let filter = IndexFilter::in_domain(domain)
            .with_min_confidence(min_confidence)
            .retrievable();
        let hits = self.kb().search(query_embedding, candidates, filter).await?;

        let mut results = Vec::with_capacity(k);
        for hit in hits {
            let pattern = match self.kb().get_pattern(hit.pattern_id).await {
                Ok(pattern) => pattern,
                Err(CortexError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if pattern.domain != domain || !pattern.is_retrievable() || pattern.confidence < min_confidence {
                continue;
            }
            results.push(pattern.summary(hit.similarity));
        }
        results.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        results.truncate(k);

        telemetry::record_retrieval(started.elapsed());
        debug!(domain = %domain, k, returned = results.len(), "Patterns retrieved");
        Ok(results)
    }

    async fn begin_task(&self, task_id: &str, domain: QeDomain) -> Result<TrajectoryId, CortexError> {
        self.kb().ensure_running()?;
        let _live = self.kb().enter_live();
        self.components.capture.start_trajectory(task_id, domain).await
    }

    async fn record_step(
        &self,
        handle: TrajectoryId,
        state_key: &str,
        action_key: &str,
        reward: f64,
    ) -> Result<(), CortexError> {
        self.kb().ensure_running()?;
        self.components
            .capture
            .record_step(handle, state_key, action_key, reward)
            .await
    }

    async fn use_pattern(&self, handle: TrajectoryId, pattern_id: PatternId) -> Result<(), CortexError> {
        self.kb().ensure_running()?;
        self.kb().get_pattern(pattern_id).await?;
        self.components.capture.use_pattern(handle, pattern_id).await
    }

    async fn complete_task(&self, handle: TrajectoryId, outcome: TaskOutcome) -> Result<TaskCompletion, CortexError> {
        self.kb().ensure_running()?;
        let _live = self.kb().enter_live();

        let experience = self.components.capture.end_trajectory(handle, outcome).await?;
        let learning = self.components.learning.record_outcome(&experience).await?;

        let consolidation_requested =
            self.backlog_reached().await? && self.consolidation.trigger(ConsolidationTrigger::BufferThreshold);

        let outcome = experience.outcome.clone().unwrap_or_else(|| TaskOutcome::infra_error("unsealed"));
        debug!(
            trajectory_id = %handle,
            outcome = outcome.label(),
            patterns_updated = learning.patterns_updated.len(),
            "Task completed"
        );
        Ok(TaskCompletion {
            trajectory_id: handle,
            outcome,
            learning,
            consolidation_requested,
        })
    }

    async fn force_consolidation(&self) -> Result<(), CortexError> {
        self.kb().ensure_running()?;
        info!("Manual consolidation requested");
        self.consolidation.trigger(ConsolidationTrigger::Manual);
        Ok(())
    }

    async fn report_quality_gate_failure(&self, domain: QeDomain) -> Result<(), CortexError> {
        self.kb().ensure_running()?;
        info!(domain = %domain, "Quality gate failure reported, requesting consolidation");
        self.consolidation.trigger(ConsolidationTrigger::QualityGateFailure);
        Ok(())
    }

    async fn get_insights(
        &self,
        domain: Option<QeDomain>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Insight>, CortexError> {
        self.kb().ensure_running()?;
        let result = self.kb().store().get_insights(domain, since).await.map_err(CortexError::from);
        self.kb().observe(result)
    }

    async fn get_metrics(&self) -> Result<CortexMetrics, CortexError> {
        let halted = self.kb().halt().is_halted();
        let result = self.kb().store().counts().await.map_err(CortexError::from);
        let counts = self.kb().observe(result)?;
        telemetry::set_store_gauges(&counts);

        Ok(CortexMetrics {
            counts,
            last_consolidation_at: self.components.dream.last_consolidation_at().await?,
            consolidation_pending: self.components.dream.has_pending_cycle().await?,
            in_flight_trajectories: self.components.capture.open_count(),
            index_entries: self.kb().index().len(),
            index_tombstones: self.kb().index().tombstones(),
            halted,
        })
    }

    async fn store_pattern(&self, pattern: NewPattern) -> Result<PatternId, CortexError> {
        self.kb().ensure_running()?;
        self.validate_new_pattern(&pattern)?;
        let _live = self.kb().enter_live();

        let confidence = pattern.confidence.unwrap_or(self.settings.initial_confidence);
        let mut candidate = Pattern::new(pattern.domain, pattern.embedding, pattern.payload, confidence)
            .with_polarity(pattern.polarity)
            .with_tags(pattern.tags);
        candidate.binding = pattern.binding;

        let _writer = self.kb().write_lock().await;
        let outcome = self
            .kb()
            .insert_pattern(candidate, self.settings.dedup_similarity)
            .await?;
        Ok(outcome.id())
    }

    async fn get_pattern(&self, id: PatternId) -> Result<Pattern, CortexError> {
        self.kb().ensure_running()?;
        self.kb().get_pattern(id).await
    }

    async fn list_patterns(&self, filter: PatternFilter) -> Result<Vec<Pattern>, CortexError> {
        self.kb().ensure_running()?;
        let result = self.kb().store().query_patterns(&filter).await.map_err(CortexError::from);
        self.kb().observe(result)
    }

    async fn pattern_history(&self, id: PatternId) -> Result<Vec<CortexEvent>, CortexError> {
        self.kb().ensure_running()?;
        let result = self.kb().store().get_pattern_audit(id).await.map_err(CortexError::from);
        self.kb().observe(result)
    }

    async fn promote_pattern(&self, id: PatternId) -> Result<PromotionDecision, CortexError> {
        self.kb().ensure_running()?;
        let _writer = self.kb().write_lock().await;
        let decision = self.components.gate.try_promote_locked(id).await?;
        if let PromotionDecision::Promoted(pattern) = &decision {
            self.components.transfer.propagate(pattern).await?;
        }
        Ok(decision)
    }

    async fn recommend_action(
        &self,
        domain: QeDomain,
        state_key: &str,
    ) -> Result<Option<ActionRecommendation>, CortexError> {
        self.kb().ensure_running()?;
        self.components.learning.recommend_action(domain, state_key).await
    }

    async fn recover_orphans(&self) -> Result<Vec<TrajectoryId>, CortexError> {
        self.kb().ensure_running()?;
        self.components.capture.recover_orphans().await
    }
}
