// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Knowledge Base
//!
//! Shared handle over the persistence store, the semantic index and the
//! event bus that every application service goes through.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** One place for commit-then-publish, halt handling and the
//!   single-writer lock on learning state
//!
//! Every mutation of pattern confidence, status or Q-values happens while
//! holding [`KnowledgeBase::write_lock`]. The live path takes it for one
//! `record_outcome`; the dream engine takes it per applied insight and per
//! promotion so live writes are never queued behind a whole cycle.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::domain::error::CortexError;
use crate::domain::events::CortexEvent;
use crate::domain::pattern::{cosine_similarity, OutcomeClass, Pattern, PatternId, PatternStatus};
use crate::domain::qe_domain::QeDomain;
use crate::domain::repository::{CortexStore, PatternFilter, WriteBatch};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::semantic_index::{IndexEntryMeta, IndexError, IndexFilter, IndexHit, SemanticIndex};

use super::activity::{ActivityGuard, HaltLatch, LiveActivity};

/// Retry policy for searches that hit a compaction swap
#[derive(Debug, Clone, Copy)]
pub struct SearchRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for SearchRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Result of inserting a pattern with deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(PatternId),
    /// A same-domain, same-polarity pattern was already close enough
    Duplicate(PatternId),
}

impl InsertOutcome {
    pub fn id(&self) -> PatternId {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Duplicate(id) => *id,
        }
    }
}

pub struct KnowledgeBase {
    store: Arc<dyn CortexStore>,
    index: Arc<SemanticIndex>,
    events: EventBus,
    writer: Mutex<()>,
    halt: HaltLatch,
    activity: LiveActivity,
    retry: SearchRetry,
}

impl KnowledgeBase {
    pub fn new(store: Arc<dyn CortexStore>, index: Arc<SemanticIndex>, events: EventBus) -> Self {
        Self {
            store,
            index,
            events,
            writer: Mutex::new(()),
            halt: HaltLatch::new(),
            activity: LiveActivity::new(),
            retry: SearchRetry::default(),
        }
    }

    pub fn with_search_retry(mut self, retry: SearchRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn CortexStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<SemanticIndex> {
        &self.index
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn activity(&self) -> &LiveActivity {
        &self.activity
    }

    pub fn halt(&self) -> &HaltLatch {
        &self.halt
    }

    /// Mark a live-path request as in flight
    pub fn enter_live(&self) -> ActivityGuard {
        self.activity.enter()
    }

    pub async fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    pub fn ensure_running(&self) -> Result<(), CortexError> {
        self.halt.ensure_running()
    }

    pub fn observe<T>(&self, result: Result<T, CortexError>) -> Result<T, CortexError> {
        self.halt.observe(result)
    }

    /// Apply a batch atomically, then publish its events
    pub async fn commit(&self, batch: WriteBatch, events: Vec<CortexEvent>) -> Result<(), CortexError> {
        if !batch.is_empty() {
            let result = self.store.apply(batch).await.map_err(CortexError::from);
            self.observe(result)?;
        }
        self.events.publish_all(events);
        Ok(())
    }

    pub async fn get_pattern(&self, id: PatternId) -> Result<Pattern, CortexError> {
        let result = self.store.get_pattern(id).await.map_err(CortexError::from);
        self.observe(result)
    }

    pub fn index_pattern(&self, pattern: &Pattern) -> Result<(), CortexError> {
        self.index
            .index(pattern.id, &pattern.embedding, meta_of(pattern))
            .map_err(CortexError::from)
    }

    pub fn refresh_index_meta(&self, pattern: &Pattern) {
        self.index.update_meta(pattern.id, meta_of(pattern));
    }

    /// Index search that rides out a compaction swap.
    ///
    /// Retries with doubling backoff, then answers from the compaction
    /// snapshot. `IndexUnavailable` only escapes when there is no snapshot.
    pub async fn search(&self, query: &[f32], k: usize, filter: IndexFilter) -> Result<Vec<IndexHit>, CortexError> {
        let mut backoff = self.retry.backoff;
        for attempt in 0..=self.retry.attempts {
            match self.index.search(query, k, filter) {
                Ok(hits) => return Ok(hits),
                Err(IndexError::Unavailable) => {
                    debug!(attempt, "Semantic index busy, backing off");
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self.index.stale_search(query, k, filter) {
            Some(hits) => {
                warn!(hits = hits.len(), "Serving stale read from compaction snapshot");
                Ok(hits)
            }
            None => Err(CortexError::IndexUnavailable),
        }
    }

    /// Nearest same-domain, same-polarity pattern above `threshold`
    pub async fn find_duplicate(&self, candidate: &Pattern, threshold: f64) -> Result<Option<(PatternId, f64)>, CortexError> {
        let hits = self
            .search(&candidate.embedding, 8, IndexFilter::in_domain(candidate.domain))
            .await?;
        for hit in hits {
            if hit.similarity <= threshold {
                break;
            }
            let existing = match self.get_pattern(hit.pattern_id).await {
                Ok(p) => p,
                Err(CortexError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if existing.polarity == candidate.polarity {
                return Ok(Some((existing.id, hit.similarity)));
            }
        }
        Ok(None)
    }

    /// Store a new pattern unless a near-duplicate exists. Callers hold the
    /// write lock.
    pub async fn insert_pattern(&self, pattern: Pattern, dedup_threshold: f64) -> Result<InsertOutcome, CortexError> {
        self.index.check_dimension(&pattern.embedding)?;
        if let Some((existing, similarity)) = self.find_duplicate(&pattern, dedup_threshold).await? {
            debug!(existing = %existing, similarity, "Near-duplicate pattern, returning existing id");
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let event = CortexEvent::PatternStored {
            pattern_id: pattern.id,
            domain: pattern.domain,
            confidence: pattern.confidence,
            timestamp: chrono::Utc::now(),
        };
        let mut batch = WriteBatch::new();
        batch.put_pattern_audited(pattern.clone(), event.clone());
        self.commit(batch, vec![event]).await?;
        self.index_pattern(&pattern)?;
        Ok(InsertOutcome::Inserted(pattern.id))
    }

    /// Long-term pattern in `domain` that contradicts an embedding with the
    /// given recorded outcome
    pub async fn find_contradiction(
        &self,
        domain: QeDomain,
        embedding: &[f32],
        outcome: OutcomeClass,
        exclude: Option<PatternId>,
        similarity_threshold: f64,
    ) -> Result<Option<(PatternId, f64)>, CortexError> {
        let filter = PatternFilter::domain(domain).with_status(PatternStatus::LongTerm);
        let result = self.store.query_patterns(&filter).await.map_err(CortexError::from);
        let long_term = self.observe(result)?;

        let mut worst: Option<(PatternId, f64)> = None;
        for other in long_term {
            if Some(other.id) == exclude || other.recorded_outcome() == outcome {
                continue;
            }
            let similarity = cosine_similarity(embedding, &other.embedding);
            if similarity >= similarity_threshold && worst.is_none_or(|(_, s)| similarity > s) {
                worst = Some((other.id, similarity));
            }
        }
        Ok(worst)
    }
}

pub(crate) fn meta_of(pattern: &Pattern) -> IndexEntryMeta {
    IndexEntryMeta {
        domain: pattern.domain,
        confidence: pattern.confidence,
        retrievable: pattern.is_retrievable(),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::domain::pattern::Polarity;

    #[tokio::test]
    async fn test_insert_pattern_deduplicates_same_polarity_only() {
        let kb = knowledge_base();
        let first = Pattern::new(QeDomain::TestGeneration, embedding(0, 0.0), b"a".to_vec(), 0.5);
        let outcome = kb.insert_pattern(first.clone(), 0.95).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted(first.id));

        let near = Pattern::new(QeDomain::TestGeneration, embedding(0, 0.05), b"b".to_vec(), 0.5);
        assert_eq!(kb.insert_pattern(near, 0.95).await.unwrap(), InsertOutcome::Duplicate(first.id));

        let negative = Pattern::new(QeDomain::TestGeneration, embedding(0, 0.05), b"c".to_vec(), 0.5)
            .with_polarity(Polarity::Negative);
        assert!(matches!(kb.insert_pattern(negative, 0.95).await.unwrap(), InsertOutcome::Inserted(_)));

        let other_domain = Pattern::new(QeDomain::TestExecution, embedding(0, 0.0), b"d".to_vec(), 0.5);
        assert!(matches!(kb.insert_pattern(other_domain, 0.95).await.unwrap(), InsertOutcome::Inserted(_)));
    }

    #[tokio::test]
    async fn test_insert_rejects_wrong_dimension() {
        let kb = knowledge_base();
        let bad = Pattern::new(QeDomain::TestGeneration, vec![1.0; DIM + 1], Vec::new(), 0.5);
        assert!(matches!(kb.insert_pattern(bad, 0.95).await, Err(CortexError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_find_contradiction_needs_opposite_outcome() {
        let kb = knowledge_base();
        let mut long_term = Pattern::new(QeDomain::TestGeneration, embedding(2, 0.0), Vec::new(), 0.9)
            .with_polarity(Polarity::Negative);
        long_term.status = PatternStatus::LongTerm;
        seed(&kb, long_term.clone()).await;

        let found = kb
            .find_contradiction(QeDomain::TestGeneration, &embedding(2, 0.1), OutcomeClass::Success, None, 0.9)
            .await
            .unwrap();
        assert_eq!(found.map(|(id, _)| id), Some(long_term.id));

        let same_outcome = kb
            .find_contradiction(QeDomain::TestGeneration, &embedding(2, 0.1), OutcomeClass::Failure, None, 0.9)
            .await
            .unwrap();
        assert!(same_outcome.is_none());
    }

    #[tokio::test]
    async fn test_tripped_latch_refuses_operations() {
        let kb = knowledge_base();
        kb.halt().trip("checksum mismatch on pattern x");
        assert!(matches!(kb.ensure_running(), Err(CortexError::Halted)));
    }

    fn search_while_locked(kb: &Arc<KnowledgeBase>, query: Vec<f32>) -> Result<Vec<IndexHit>, CortexError> {
        let reader = kb.clone();
        kb.index().with_exclusive_lock(|| {
            std::thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
                rt.block_on(reader.search(&query, 5, IndexFilter::in_domain(QeDomain::TestGeneration).retrievable()))
            })
            .join()
            .unwrap()
        })
    }

    #[tokio::test]
    async fn test_search_falls_back_to_snapshot_when_index_stays_locked() {
        let kb = knowledge_base();
        let live = seed(&kb, Pattern::new(QeDomain::TestGeneration, embedding(3, 0.0), b"a".to_vec(), 0.6)).await;
        let mut quarantined = Pattern::new(QeDomain::TestGeneration, embedding(3, 0.05), b"q".to_vec(), 0.6);
        quarantined.status = PatternStatus::Quarantined;
        seed(&kb, quarantined).await;
        kb.index().publish_snapshot();

        let hits = search_while_locked(&kb, embedding(3, 0.0)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern_id, live.id);
    }

    #[tokio::test]
    async fn test_search_without_snapshot_reports_unavailable() {
        let kb = knowledge_base();
        seed(&kb, Pattern::new(QeDomain::TestGeneration, embedding(4, 0.0), b"a".to_vec(), 0.6)).await;

        let result = search_while_locked(&kb, embedding(4, 0.0));
        assert!(matches!(result, Err(CortexError::IndexUnavailable)));
    }
}
