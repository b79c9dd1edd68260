// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Cortex Persistence Contract
//!
//! One store for the whole learning loop: patterns, experiences, Q-values,
//! insights, the pattern audit trail and a small key/value state table.
//!
//! | Implementation | Backend | Use |
//! |----------------|---------|-----|
//! | `SqliteCortexStore` | SQLite (WAL) via `sqlx` | production |
//! | `InMemoryCortexStore` | `parking_lot::RwLock` maps | tests, embedded dev |
//!
//! ## Write Semantics
//!
//! Every mutation goes through [`CortexStore::apply`] with a [`WriteBatch`];
//! all operations of a batch commit in one transaction, so a pattern update
//! and the audit event describing it are never observed apart. Only one
//! write transaction runs at a time. Reads see the last committed state and
//! never wait on a writer for longer than one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::CortexEvent;
use super::experience::{Experience, TrajectoryId};
use super::insight::Insight;
use super::pattern::{ActionBinding, Pattern, PatternId, PatternStatus};
use super::qe_domain::QeDomain;
use super::qvalue::{QKey, QValue};
use super::transfer::DomainTransferEdge;

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Conflict(String),

    /// Checksum mismatch on a persisted row. Fatal.
    #[error("Corrupted record: {0}")]
    Corruption(String),

    /// Contention outlasted the bounded retries
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternFilter {
    pub domain: Option<QeDomain>,
    pub status: Option<PatternStatus>,
    pub min_confidence: Option<f64>,
    pub limit: Option<usize>,
}

impl PatternFilter {
    pub fn domain(domain: QeDomain) -> Self {
        Self {
            domain: Some(domain),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: PatternStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = Some(min_confidence);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, pattern: &Pattern) -> bool {
        self.domain.is_none_or(|d| pattern.domain == d)
            && self.status.is_none_or(|s| pattern.status == s)
            && self.min_confidence.is_none_or(|c| pattern.confidence >= c)
    }
}

/// A single mutation inside a [`WriteBatch`]
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert or replace a pattern
    PutPattern(Pattern),
    /// Insert an open or sealed experience, or seal an open one.
    /// Rewriting an already sealed experience is a `Conflict`.
    PutExperience(Experience),
    /// Upsert keyed by `(domain, state, action)`
    PutQValue(QValue),
    PutInsight(Insight),
    /// Append to the audit trail of the pattern the event names
    Audit(CortexEvent),
    MarkConsolidated(Vec<TrajectoryId>),
    PutState { key: String, value: serde_json::Value },
    /// Replace the whole compatibility matrix
    ReplaceTransferEdges(Vec<DomainTransferEdge>),
}

/// Ordered set of writes committed atomically
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(op: WriteOp) -> Self {
        Self { ops: vec![op] }
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn with(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    /// Pattern write plus its audit record
    pub fn put_pattern_audited(&mut self, pattern: Pattern, event: CortexEvent) -> &mut Self {
        self.ops.push(WriteOp::PutPattern(pattern));
        self.ops.push(WriteOp::Audit(event));
        self
    }

    pub fn extend(&mut self, other: WriteBatch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Row counts for metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub total_patterns: u64,
    pub short_term_patterns: u64,
    pub long_term_patterns: u64,
    pub quarantined_patterns: u64,
    pub total_experiences: u64,
    pub open_experiences: u64,
    pub unconsolidated_experiences: u64,
    pub q_values: u64,
    pub insights: u64,
    pub applied_insights: u64,
}

#[async_trait]
pub trait CortexStore: Send + Sync {
    /// Commit all operations of the batch in one transaction
    async fn apply(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Fails with `NotFound` for an unknown id and `Corruption` on a
    /// checksum mismatch
    async fn get_pattern(&self, id: PatternId) -> Result<Pattern, StoreError>;

    async fn query_patterns(&self, filter: &PatternFilter) -> Result<Vec<Pattern>, StoreError>;

    /// Patterns bound to a `(state, action)` pair in a domain
    async fn find_patterns_by_binding(
        &self,
        domain: QeDomain,
        binding: &ActionBinding,
    ) -> Result<Vec<Pattern>, StoreError>;

    /// Cross-domain copies made from `source`
    async fn find_transferred_copies(&self, source: PatternId) -> Result<Vec<Pattern>, StoreError>;

    async fn get_experience(&self, id: TrajectoryId) -> Result<Experience, StoreError>;

    /// Sealed experiences, newest first
    async fn get_recent_experiences(
        &self,
        domain: Option<QeDomain>,
        limit: usize,
    ) -> Result<Vec<Experience>, StoreError>;

    /// Sealed experiences the dream engine has not replayed yet, oldest first
    async fn get_unconsolidated_experiences(&self, limit: usize) -> Result<Vec<Experience>, StoreError>;

    /// Experiences that were started but never sealed
    async fn get_open_experiences(&self) -> Result<Vec<Experience>, StoreError>;

    async fn get_qvalue(&self, key: &QKey) -> Result<Option<QValue>, StoreError>;

    /// All actions recorded for a state
    async fn get_qvalues_for_state(
        &self,
        domain: QeDomain,
        state_key: &str,
    ) -> Result<Vec<QValue>, StoreError>;

    /// Insights, newest first
    async fn get_insights(
        &self,
        domain: Option<QeDomain>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Insight>, StoreError>;

    /// Audit trail of one pattern, oldest first
    async fn get_pattern_audit(&self, id: PatternId) -> Result<Vec<CortexEvent>, StoreError>;

    async fn load_transfer_edges(&self) -> Result<Vec<DomainTransferEdge>, StoreError>;

    async fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;

    async fn put_pattern(&self, pattern: &Pattern) -> Result<(), StoreError> {
        self.apply(WriteBatch::single(WriteOp::PutPattern(pattern.clone()))).await
    }

    async fn put_experience(&self, experience: &Experience) -> Result<(), StoreError> {
        self.apply(WriteBatch::single(WriteOp::PutExperience(experience.clone()))).await
    }

    async fn put_qvalue(&self, qvalue: &QValue) -> Result<(), StoreError> {
        self.apply(WriteBatch::single(WriteOp::PutQValue(qvalue.clone()))).await
    }

    async fn put_insight(&self, insight: &Insight) -> Result<(), StoreError> {
        self.apply(WriteBatch::single(WriteOp::PutInsight(insight.clone()))).await
    }
}
