// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Insights produced by dream consolidation.
//!
//! Insights are retained for audit whether or not they were applied. The
//! kind is a closed tagged union; the promotion gate matches on it
//! exhaustively when deciding what applying an insight means.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use super::pattern::{Pattern, PatternId};
use super::qe_domain::QeDomain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InsightId(pub Uuid);

impl InsightId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InsightId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InsightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InsightKind {
    /// Directly connected patterns that keep firing together
    Correlation { co_occurrences: u32, edge_weight: f64 },
    /// Activation far outside the cycle's distribution
    Anomaly { activation: f64, z_score: f64 },
    /// Near-duplicates collapsed into one representative
    Optimization { representative: PatternId, similarity: f64 },
    /// A pattern whose replayed experiences mostly failed
    AntiPattern { failure_ratio: f64, observations: u32 },
    /// Co-activated patterns with no direct co-occurrence edge
    Novel { co_activation: f64, cross_domain: bool },
}

impl InsightKind {
    pub fn label(&self) -> &'static str {
        match self {
            InsightKind::Correlation { .. } => "correlation",
            InsightKind::Anomaly { .. } => "anomaly",
            InsightKind::Optimization { .. } => "optimization",
            InsightKind::AntiPattern { .. } => "anti_pattern",
            InsightKind::Novel { .. } => "novel",
        }
    }

    /// Tie-break rank for auto-apply ordering; lower applies first
    pub fn rank(&self) -> u8 {
        match self {
            InsightKind::AntiPattern { .. } => 0,
            InsightKind::Optimization { .. } => 1,
            InsightKind::Correlation { .. } => 2,
            InsightKind::Novel { .. } => 3,
            InsightKind::Anomaly { .. } => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: InsightId,
    pub kind: InsightKind,
    pub domain: QeDomain,
    /// Sorted, without duplicates
    pub source_pattern_ids: Vec<PatternId>,
    pub confidence: f64,
    pub derived_pattern: Option<Pattern>,
    pub applied: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Insight {
    pub fn new(
        kind: InsightKind,
        domain: QeDomain,
        mut source_pattern_ids: Vec<PatternId>,
        confidence: f64,
        description: impl Into<String>,
    ) -> Self {
        source_pattern_ids.sort();
        source_pattern_ids.dedup();
        Self {
            id: InsightId::new(),
            kind,
            domain,
            source_pattern_ids,
            confidence: confidence.clamp(0.0, 1.0),
            derived_pattern: None,
            applied: false,
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_derived_pattern(mut self, pattern: Pattern) -> Self {
        self.derived_pattern = Some(pattern);
        self
    }
}

/// Deterministic order in which auto-applicable insights are applied:
/// confidence descending, then more source patterns first, then kind rank,
/// then insight id.
pub fn auto_apply_order(a: &Insight, b: &Insight) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.source_pattern_ids.len().cmp(&a.source_pattern_ids.len()))
        .then_with(|| a.kind.rank().cmp(&b.kind.rank()))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn novel(confidence: f64, sources: usize) -> Insight {
        Insight::new(
            InsightKind::Novel { co_activation: 0.9, cross_domain: false },
            QeDomain::TestGeneration,
            (0..sources).map(|_| PatternId::new()).collect(),
            confidence,
            "test",
        )
    }

    #[test]
    fn test_sources_are_a_set() {
        let id = PatternId::new();
        let insight = Insight::new(
            InsightKind::AntiPattern { failure_ratio: 1.0, observations: 4 },
            QeDomain::TestGeneration,
            vec![id, id],
            0.9,
            "dup",
        );
        assert_eq!(insight.source_pattern_ids, vec![id]);
    }

    #[test]
    fn test_auto_apply_order_ties_break_on_source_count() {
        let mut insights = vec![novel(0.85, 2), novel(0.9, 2), novel(0.85, 3)];
        insights.sort_by(auto_apply_order);

        assert_eq!(insights[0].confidence, 0.9);
        assert_eq!(insights[1].source_pattern_ids.len(), 3);
        assert_eq!(insights[2].source_pattern_ids.len(), 2);
    }

    #[test]
    fn test_kind_serialization_is_tagged() {
        let kind = InsightKind::Optimization { representative: PatternId::new(), similarity: 0.97 };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "optimization");
        assert_eq!(kind.label(), "optimization");
    }
}
