// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Semantic Index
//!
//! Concurrent ANN index over pattern embeddings, wrapping an [`HnswGraph`]
//! with per-entry metadata (domain, confidence, retrievability) so filters
//! are applied inside the search and quarantined entries never crowd out
//! live ones.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Live similarity search that never waits on consolidation
//!
//! Readers share a `parking_lot::RwLock` and give up with
//! [`IndexError::Unavailable`] after `read_timeout`. Inserts take the write
//! lock for one HNSW insertion. Compaction snapshots live entries under a
//! read lock, rebuilds a fresh graph with no lock held, then takes the write
//! lock only to replay writes that raced with the rebuild and swap graphs.
//! While a compaction is in flight, [`SemanticIndex::stale_search`] answers
//! from the snapshot with an exact scan.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::config::IndexConfig;
use crate::domain::error::CortexError;
use crate::domain::pattern::{cosine_similarity, PatternId};
use crate::domain::qe_domain::QeDomain;

use super::hnsw::{HnswGraph, HnswParams};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexError {
    #[error("Semantic index unavailable")]
    Unavailable,

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl From<IndexError> for CortexError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Unavailable => CortexError::IndexUnavailable,
            IndexError::DimensionMismatch { .. } => CortexError::InvalidInput(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexEntryMeta {
    pub domain: QeDomain,
    pub confidence: f64,
    /// False while the pattern is quarantined
    pub retrievable: bool,
}

/// One search hit, similarity in [-1, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHit {
    pub pattern_id: PatternId,
    pub similarity: f64,
}

/// Which entries a search may return
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IndexFilter {
    pub domain: Option<QeDomain>,
    pub min_confidence: f64,
    pub retrievable_only: bool,
}

impl IndexFilter {
    pub fn in_domain(domain: QeDomain) -> Self {
        Self {
            domain: Some(domain),
            ..Default::default()
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Skip quarantined entries
    pub fn retrievable(mut self) -> Self {
        self.retrievable_only = true;
        self
    }

    fn admits(&self, meta: &IndexEntryMeta) -> bool {
        meta.confidence >= self.min_confidence
            && self.domain.is_none_or(|d| d == meta.domain)
            && (meta.retrievable || !self.retrievable_only)
    }
}

struct IndexState {
    graph: HnswGraph,
    meta: HashMap<PatternId, IndexEntryMeta>,
}

/// Writes that happened after a compaction snapshot was taken
#[derive(Debug, Clone)]
enum PendingOp {
    Insert(PatternId, Vec<f32>, IndexEntryMeta),
    Remove(PatternId),
    Meta(PatternId, IndexEntryMeta),
}

#[derive(Debug, Clone)]
struct SnapshotEntry {
    id: PatternId,
    vector: Vec<f32>,
    meta: IndexEntryMeta,
}

/// Outcome of one compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub removed: usize,
    pub remaining: usize,
    pub replayed: usize,
}

pub struct SemanticIndex {
    dimension: usize,
    params: HnswParams,
    ef_search: usize,
    read_timeout: Duration,
    overfetch_factor: usize,
    state: RwLock<IndexState>,
    /// `Some` while a compaction is in flight
    pending: Mutex<Option<Vec<PendingOp>>>,
    snapshot: RwLock<Option<Arc<Vec<SnapshotEntry>>>>,
}

impl SemanticIndex {
    pub fn new(dimension: usize, config: &IndexConfig) -> Self {
        let params = HnswParams::new(config.m, config.ef_construction);
        Self {
            dimension,
            params,
            ef_search: config.ef_search,
            read_timeout: config.read_timeout,
            overfetch_factor: config.overfetch_factor.max(1),
            state: RwLock::new(IndexState {
                graph: HnswGraph::new(params),
                meta: HashMap::new(),
            }),
            pending: Mutex::new(None),
            snapshot: RwLock::new(None),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn check_dimension(&self, embedding: &[f32]) -> Result<(), IndexError> {
        if embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.read().graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstones(&self) -> usize {
        self.state.read().graph.tombstones()
    }

    pub fn is_compacting(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Add or replace an entry
    pub fn index(&self, id: PatternId, embedding: &[f32], meta: IndexEntryMeta) -> Result<(), IndexError> {
        self.check_dimension(embedding)?;
        let mut state = self.state.write();
        state.graph.insert(id, embedding, rand::random::<f64>());
        state.meta.insert(id, meta);
        self.log_pending(PendingOp::Insert(id, embedding.to_vec(), meta));
        Ok(())
    }

    /// Tombstone an entry; returns whether it was indexed
    pub fn remove(&self, id: PatternId) -> bool {
        let mut state = self.state.write();
        let removed = state.graph.remove(id);
        state.meta.remove(&id);
        if removed {
            self.log_pending(PendingOp::Remove(id));
        }
        removed
    }

    /// Refresh the metadata used for filtering after a confidence change
    pub fn update_meta(&self, id: PatternId, meta: IndexEntryMeta) {
        let mut state = self.state.write();
        if let Some(existing) = state.meta.get_mut(&id) {
            *existing = meta;
            self.log_pending(PendingOp::Meta(id, meta));
        }
    }

    fn log_pending(&self, op: PendingOp) {
        if let Some(log) = self.pending.lock().as_mut() {
            log.push(op);
        }
    }

    /// Up to `k` entries admitted by `filter`, similarity descending
    pub fn search(&self, query: &[f32], k: usize, filter: IndexFilter) -> Result<Vec<IndexHit>, IndexError> {
        self.check_dimension(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let state = self.state.try_read_for(self.read_timeout).ok_or_else(|| {
            metrics::counter!("cortex_index_unavailable_total").increment(1);
            IndexError::Unavailable
        })?;

        let live = state.graph.len();
        let mut fetch = k.saturating_mul(self.overfetch_factor);
        loop {
            let raw = state.graph.search(query, fetch, self.ef_search.max(fetch));
            let hits: Vec<IndexHit> = raw
                .iter()
                .filter(|(id, _)| state.meta.get(id).is_some_and(|m| filter.admits(m)))
                .take(k)
                .map(|&(pattern_id, similarity)| IndexHit { pattern_id, similarity })
                .collect();

            // Widen until enough hits survive filtering or the graph is exhausted
            if hits.len() >= k || fetch >= live {
                return Ok(hits);
            }
            fetch = fetch.saturating_mul(2).min(live);
        }
    }

    /// Exact scan over the compaction snapshot. `None` when no compaction
    /// is in flight.
    pub fn stale_search(&self, query: &[f32], k: usize, filter: IndexFilter) -> Option<Vec<IndexHit>> {
        let snapshot = self.snapshot.read().clone()?;
        let mut hits: Vec<IndexHit> = snapshot
            .iter()
            .filter(|e| filter.admits(&e.meta))
            .map(|e| IndexHit {
                pattern_id: e.id,
                similarity: cosine_similarity(query, &e.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });
        hits.truncate(k);
        Some(hits)
    }

    /// Replace the whole index, e.g. when rebuilding from the store at startup
    pub fn rebuild<I>(&self, entries: I) -> Result<usize, IndexError>
    where
        I: IntoIterator<Item = (PatternId, Vec<f32>, IndexEntryMeta)>,
    {
        let mut graph = HnswGraph::new(self.params);
        let mut meta = HashMap::new();
        for (id, vector, entry_meta) in entries {
            self.check_dimension(&vector)?;
            graph.insert(id, &vector, rand::random::<f64>());
            meta.insert(id, entry_meta);
        }
        let count = graph.len();
        let mut state = self.state.write();
        *state = IndexState { graph, meta };
        info!(entries = count, "Semantic index rebuilt");
        Ok(count)
    }

    /// Drop tombstones by rebuilding the graph off-lock and swapping it in
    pub fn compact(&self) -> CompactionReport {
        let entries = {
            let state = self.state.read();
            let entries: Vec<SnapshotEntry> = state
                .graph
                .live_entries()
                .into_iter()
                .filter_map(|(id, vector)| {
                    state.meta.get(&id).map(|&meta| SnapshotEntry { id, vector, meta })
                })
                .collect();
            // Start logging before the read lock is released so no write is missed
            *self.pending.lock() = Some(Vec::new());
            Arc::new(entries)
        };
        *self.snapshot.write() = Some(entries.clone());

        let mut graph = HnswGraph::new(self.params);
        let mut meta = HashMap::with_capacity(entries.len());
        for entry in entries.iter() {
            graph.insert(entry.id, &entry.vector, rand::random::<f64>());
            meta.insert(entry.id, entry.meta);
        }

        let report = {
            let mut state = self.state.write();
            let removed = state.graph.tombstones();
            let pending = self.pending.lock().take().unwrap_or_default();
            let replayed = pending.len();
            for op in pending {
                match op {
                    PendingOp::Insert(id, vector, entry_meta) => {
                        graph.insert(id, &vector, rand::random::<f64>());
                        meta.insert(id, entry_meta);
                    }
                    PendingOp::Remove(id) => {
                        graph.remove(id);
                        meta.remove(&id);
                    }
                    PendingOp::Meta(id, entry_meta) => {
                        if let Some(existing) = meta.get_mut(&id) {
                            *existing = entry_meta;
                        }
                    }
                }
            }
            let remaining = graph.len();
            *state = IndexState { graph, meta };
            CompactionReport { removed, remaining, replayed }
        };
        *self.snapshot.write() = None;

        debug!(
            removed = report.removed,
            remaining = report.remaining,
            replayed = report.replayed,
            "Semantic index compacted"
        );
        report
    }

    /// Run `f` while holding the exclusive lock, as the compaction swap does
    #[cfg(test)]
    pub(crate) fn with_exclusive_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.state.write();
        f()
    }

    /// Publish a snapshot without starting a rebuild
    #[cfg(test)]
    pub(crate) fn publish_snapshot(&self) {
        let state = self.state.read();
        let entries: Vec<SnapshotEntry> = state
            .graph
            .live_entries()
            .into_iter()
            .filter_map(|(id, vector)| state.meta.get(&id).map(|&meta| SnapshotEntry { id, vector, meta }))
            .collect();
        *self.snapshot.write() = Some(Arc::new(entries));
    }
}
