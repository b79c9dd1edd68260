// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory [`CortexStore`] for tests and embedded development.
//!
//! Batches are applied to a copy of the state and swapped in only when every
//! operation succeeded, so a failed batch leaves nothing behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::domain::events::CortexEvent;
use crate::domain::experience::{Experience, TrajectoryId};
use crate::domain::insight::{Insight, InsightId};
use crate::domain::pattern::{ActionBinding, Pattern, PatternId, PatternStatus};
use crate::domain::qe_domain::QeDomain;
use crate::domain::qvalue::{QKey, QValue};
use crate::domain::repository::{
    CortexStore, PatternFilter, StoreCounts, StoreError, WriteBatch, WriteOp,
};
use crate::domain::transfer::DomainTransferEdge;

#[derive(Debug, Clone, Default)]
struct State {
    patterns: HashMap<PatternId, Pattern>,
    experiences: HashMap<TrajectoryId, Experience>,
    qvalues: BTreeMap<QKey, QValue>,
    insights: HashMap<InsightId, Insight>,
    audit: HashMap<PatternId, Vec<CortexEvent>>,
    state: HashMap<String, serde_json::Value>,
    transfer_edges: Vec<DomainTransferEdge>,
}

impl State {
    fn apply(&mut self, op: WriteOp) -> Result<(), StoreError> {
        match op {
            WriteOp::PutPattern(pattern) => {
                if let Some(source) = pattern.transferred_from {
                    let duplicate = self.patterns.values().any(|p| {
                        p.id != pattern.id && p.transferred_from == Some(source) && p.domain == pattern.domain
                    });
                    if duplicate {
                        return Err(StoreError::Conflict(format!(
                            "pattern {} already has a copy in {}",
                            source, pattern.domain
                        )));
                    }
                }
                self.patterns.insert(pattern.id, pattern);
            }
            WriteOp::PutExperience(experience) => {
                if let Some(existing) = self.experiences.get(&experience.id) {
                    if existing.is_sealed() {
                        return Err(StoreError::Conflict(format!(
                            "experience {} is sealed and cannot be rewritten",
                            experience.id
                        )));
                    }
                }
                self.experiences.insert(experience.id, experience);
            }
            WriteOp::PutQValue(qvalue) => {
                self.qvalues.insert(qvalue.key.clone(), qvalue);
            }
            WriteOp::PutInsight(insight) => {
                self.insights.insert(insight.id, insight);
            }
            WriteOp::Audit(event) => {
                let pattern_id = event.pattern_id().ok_or_else(|| {
                    StoreError::Conflict(format!("{} event does not name a pattern", event.event_type()))
                })?;
                self.audit.entry(pattern_id).or_default().push(event);
            }
            WriteOp::MarkConsolidated(ids) => {
                for id in ids {
                    if let Some(exp) = self.experiences.get_mut(&id) {
                        if exp.is_sealed() {
                            exp.consolidated = true;
                        }
                    }
                }
            }
            WriteOp::PutState { key, value } => {
                self.state.insert(key, value);
            }
            WriteOp::ReplaceTransferEdges(edges) => {
                self.transfer_edges = edges;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCortexStore {
    state: RwLock<State>,
    #[cfg(test)]
    failing_consolidations: std::sync::atomic::AtomicUsize,
}

impl InMemoryCortexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` batches that mark experiences consolidated
    #[cfg(test)]
    pub(crate) fn fail_consolidations(&self, n: usize) {
        self.failing_consolidations.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_failure(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        use std::sync::atomic::Ordering;
        let consolidates = batch.ops().iter().any(|op| matches!(op, WriteOp::MarkConsolidated(_)));
        if consolidates
            && self
                .failing_consolidations
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Database("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CortexStore for InMemoryCortexStore {
    async fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        #[cfg(test)]
        self.injected_failure(&batch)?;
        let mut guard = self.state.write();
        let mut staged = guard.clone();
        for op in batch.into_ops() {
            staged.apply(op)?;
        }
        *guard = staged;
        Ok(())
    }

    async fn get_pattern(&self, id: PatternId) -> Result<Pattern, StoreError> {
        self.state
            .read()
            .patterns
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("pattern {id}")))
    }

    async fn query_patterns(&self, filter: &PatternFilter) -> Result<Vec<Pattern>, StoreError> {
        let state = self.state.read();
        let mut patterns: Vec<Pattern> = state
            .patterns
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        patterns.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = filter.limit {
            patterns.truncate(limit);
        }
        Ok(patterns)
    }

    async fn find_patterns_by_binding(
        &self,
        domain: QeDomain,
        binding: &ActionBinding,
    ) -> Result<Vec<Pattern>, StoreError> {
        let state = self.state.read();
        let mut patterns: Vec<Pattern> = state
            .patterns
            .values()
            .filter(|p| p.domain == domain && p.binding.as_ref() == Some(binding))
            .cloned()
            .collect();
        patterns.sort_by_key(|p| p.id);
        Ok(patterns)
    }

    async fn find_transferred_copies(&self, source: PatternId) -> Result<Vec<Pattern>, StoreError> {
        let state = self.state.read();
        let mut copies: Vec<Pattern> = state
            .patterns
            .values()
            .filter(|p| p.transferred_from == Some(source))
            .cloned()
            .collect();
        copies.sort_by_key(|p| p.domain);
        Ok(copies)
    }

    async fn get_experience(&self, id: TrajectoryId) -> Result<Experience, StoreError> {
        self.state
            .read()
            .experiences
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("experience {id}")))
    }

    async fn get_recent_experiences(
        &self,
        domain: Option<QeDomain>,
        limit: usize,
    ) -> Result<Vec<Experience>, StoreError> {
        let state = self.state.read();
        let mut sealed: Vec<Experience> = state
            .experiences
            .values()
            .filter(|e| e.is_sealed() && domain.is_none_or(|d| e.domain == d))
            .cloned()
            .collect();
        sealed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at).then_with(|| a.id.cmp(&b.id)));
        sealed.truncate(limit);
        Ok(sealed)
    }

    async fn get_unconsolidated_experiences(&self, limit: usize) -> Result<Vec<Experience>, StoreError> {
        let state = self.state.read();
        let mut backlog: Vec<Experience> = state
            .experiences
            .values()
            .filter(|e| e.is_sealed() && !e.consolidated)
            .cloned()
            .collect();
        backlog.sort_by(|a, b| a.completed_at.cmp(&b.completed_at).then_with(|| a.id.cmp(&b.id)));
        backlog.truncate(limit);
        Ok(backlog)
    }

    async fn get_open_experiences(&self) -> Result<Vec<Experience>, StoreError> {
        let state = self.state.read();
        let mut open: Vec<Experience> = state
            .experiences
            .values()
            .filter(|e| !e.is_sealed())
            .cloned()
            .collect();
        open.sort_by_key(|e| e.started_at);
        Ok(open)
    }

    async fn get_qvalue(&self, key: &QKey) -> Result<Option<QValue>, StoreError> {
        Ok(self.state.read().qvalues.get(key).cloned())
    }

    async fn get_qvalues_for_state(
        &self,
        domain: QeDomain,
        state_key: &str,
    ) -> Result<Vec<QValue>, StoreError> {
        Ok(self
            .state
            .read()
            .qvalues
            .values()
            .filter(|q| q.key.domain == domain && q.key.state_key == state_key)
            .cloned()
            .collect())
    }

    async fn get_insights(
        &self,
        domain: Option<QeDomain>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Insight>, StoreError> {
        let state = self.state.read();
        let mut insights: Vec<Insight> = state
            .insights
            .values()
            .filter(|i| domain.is_none_or(|d| i.domain == d) && since.is_none_or(|s| i.created_at >= s))
            .cloned()
            .collect();
        insights.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(insights)
    }

    async fn get_pattern_audit(&self, id: PatternId) -> Result<Vec<CortexEvent>, StoreError> {
        Ok(self.state.read().audit.get(&id).cloned().unwrap_or_default())
    }

    async fn load_transfer_edges(&self) -> Result<Vec<DomainTransferEdge>, StoreError> {
        Ok(self.state.read().transfer_edges.clone())
    }

    async fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.state.read().state.get(key).cloned())
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let state = self.state.read();
        let by_status = |status: PatternStatus| state.patterns.values().filter(|p| p.status == status).count() as u64;
        Ok(StoreCounts {
            total_patterns: state.patterns.len() as u64,
            short_term_patterns: by_status(PatternStatus::ShortTerm),
            long_term_patterns: by_status(PatternStatus::LongTerm),
            quarantined_patterns: by_status(PatternStatus::Quarantined),
            total_experiences: state.experiences.len() as u64,
            open_experiences: state.experiences.values().filter(|e| !e.is_sealed()).count() as u64,
            unconsolidated_experiences: state
                .experiences
                .values()
                .filter(|e| e.is_sealed() && !e.consolidated)
                .count() as u64,
            q_values: state.qvalues.len() as u64,
            insights: state.insights.len() as u64,
            applied_insights: state.insights.values().filter(|i| i.applied).count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::experience::TaskOutcome;

    #[tokio::test]
    async fn test_failed_batch_leaves_no_trace() {
        let store = InMemoryCortexStore::new();
        let mut exp = Experience::open(TrajectoryId::new(), "task", QeDomain::TestGeneration);
        exp.seal(TaskOutcome::Success).unwrap();
        store.put_experience(&exp).await.unwrap();

        let p = Pattern::new(QeDomain::TestGeneration, vec![1.0], vec![1, 2, 3], 0.5);
        let batch = WriteBatch::new()
            .with(WriteOp::PutPattern(p.clone()))
            .with(WriteOp::PutExperience(exp));

        assert!(matches!(store.apply(batch).await, Err(StoreError::Conflict(_))));
        assert!(matches!(store.get_pattern(p.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_counts() {
        let store = InMemoryCortexStore::new();
        let mut quarantined = Pattern::new(QeDomain::TestGeneration, vec![1.0], vec![], 0.1);
        quarantined.status = PatternStatus::Quarantined;
        store.put_pattern(&quarantined).await.unwrap();
        store
            .put_pattern(&Pattern::new(QeDomain::TestGeneration, vec![1.0], vec![], 0.6))
            .await
            .unwrap();
        store
            .put_experience(&Experience::open(TrajectoryId::new(), "open", QeDomain::TestGeneration))
            .await
            .unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.total_patterns, 2);
        assert_eq!(counts.quarantined_patterns, 1);
        assert_eq!(counts.open_experiences, 1);
        assert_eq!(counts.unconsolidated_experiences, 0);
    }
}
