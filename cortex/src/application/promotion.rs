// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Promotion Gate
//!
//! Coherence check that moves a short-term pattern into long-term memory.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Keep long-term memory free of weak or contradictory patterns
//!
//! A pattern is promoted when it has enough usage, a high enough success
//! rate and confidence, and no long-term pattern in its domain is at least
//! `contradiction_similarity` close while recording the opposite outcome.
//! A blocked promotion is a normal outcome: logged, audited, never an error.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::config::PromotionConfig;
use crate::domain::error::CortexError;
use crate::domain::events::CortexEvent;
use crate::domain::pattern::{Pattern, PatternId, PatternStatus};
use crate::domain::repository::{WriteBatch, WriteOp};
use crate::infrastructure::telemetry;

use super::knowledge::KnowledgeBase;

#[derive(Debug, Clone, PartialEq)]
pub enum BlockReason {
    NotShortTerm(PatternStatus),
    InsufficientUsage { usage: u64, required: u64 },
    LowSuccessRate { rate: f64, required: f64 },
    LowConfidence { confidence: f64, required: f64 },
    Contradiction { conflicting: PatternId, similarity: f64 },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::NotShortTerm(status) => write!(f, "pattern is {}, not short_term", status.as_str()),
            BlockReason::InsufficientUsage { usage, required } => {
                write!(f, "usage {} below required {}", usage, required)
            }
            BlockReason::LowSuccessRate { rate, required } => {
                write!(f, "success rate {:.2} below required {:.2}", rate, required)
            }
            BlockReason::LowConfidence { confidence, required } => {
                write!(f, "confidence {:.2} below required {:.2}", confidence, required)
            }
            BlockReason::Contradiction { conflicting, similarity } => {
                write!(f, "contradicts long-term pattern {} (similarity {:.3})", conflicting, similarity)
            }
        }
    }
}

impl BlockReason {
    fn label(&self) -> &'static str {
        match self {
            BlockReason::NotShortTerm(_) => "not_short_term",
            BlockReason::InsufficientUsage { .. } => "insufficient_usage",
            BlockReason::LowSuccessRate { .. } => "low_success_rate",
            BlockReason::LowConfidence { .. } => "low_confidence",
            BlockReason::Contradiction { .. } => "contradiction",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromotionDecision {
    /// Carries the pattern as written, status `long_term`
    Promoted(Pattern),
    Blocked(BlockReason),
}

impl PromotionDecision {
    pub fn is_promoted(&self) -> bool {
        matches!(self, PromotionDecision::Promoted(_))
    }
}

pub struct PromotionGate {
    kb: Arc<KnowledgeBase>,
    config: PromotionConfig,
}

impl PromotionGate {
    pub fn new(kb: Arc<KnowledgeBase>, config: PromotionConfig) -> Self {
        Self { kb, config }
    }

    pub fn config(&self) -> &PromotionConfig {
        &self.config
    }

    /// Check the thresholds that need no store access
    pub fn check_thresholds(&self, pattern: &Pattern) -> Option<BlockReason> {
        if pattern.status != PatternStatus::ShortTerm {
            return Some(BlockReason::NotShortTerm(pattern.status));
        }
        if pattern.usage_count < self.config.min_usage {
            return Some(BlockReason::InsufficientUsage {
                usage: pattern.usage_count,
                required: self.config.min_usage,
            });
        }
        if pattern.success_rate() < self.config.min_success_rate {
            return Some(BlockReason::LowSuccessRate {
                rate: pattern.success_rate(),
                required: self.config.min_success_rate,
            });
        }
        if pattern.confidence < self.config.min_confidence {
            return Some(BlockReason::LowConfidence {
                confidence: pattern.confidence,
                required: self.config.min_confidence,
            });
        }
        None
    }

    pub async fn evaluate(&self, pattern: &Pattern) -> Result<Option<BlockReason>, CortexError> {
        if let Some(reason) = self.check_thresholds(pattern) {
            return Ok(Some(reason));
        }
        let contradiction = self
            .kb
            .find_contradiction(
                pattern.domain,
                &pattern.embedding,
                pattern.recorded_outcome(),
                Some(pattern.id),
                self.config.contradiction_similarity,
            )
            .await?;
        Ok(contradiction.map(|(conflicting, similarity)| BlockReason::Contradiction { conflicting, similarity }))
    }

    /// Run the gate for one pattern, taking the write lock
    pub async fn try_promote(&self, id: PatternId) -> Result<PromotionDecision, CortexError> {
        let _writer = self.kb.write_lock().await;
        self.try_promote_locked(id).await
    }

    /// Same as [`PromotionGate::try_promote`] for callers already holding
    /// the write lock. The pattern is re-read so the decision sees the
    /// latest learning update.
    pub async fn try_promote_locked(&self, id: PatternId) -> Result<PromotionDecision, CortexError> {
        let mut pattern = self.kb.get_pattern(id).await?;

        if let Some(reason) = self.evaluate(&pattern).await? {
            telemetry::record_promotion(reason.label());
            if matches!(reason, BlockReason::Contradiction { .. }) {
                info!(pattern_id = %id, reason = %reason, "Promotion blocked");
            } else {
                debug!(pattern_id = %id, reason = %reason, "Promotion blocked");
            }
            let event = CortexEvent::PromotionBlocked {
                pattern_id: id,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            };
            self.kb
                .commit(WriteBatch::single(WriteOp::Audit(event.clone())), vec![event])
                .await?;
            return Ok(PromotionDecision::Blocked(reason));
        }

        pattern.status = PatternStatus::LongTerm;
        let event = CortexEvent::PatternPromoted {
            pattern_id: id,
            domain: pattern.domain,
            confidence: pattern.confidence,
            success_rate: pattern.success_rate(),
            timestamp: Utc::now(),
        };
        let mut batch = WriteBatch::new();
        batch.put_pattern_audited(pattern.clone(), event.clone());
        self.kb.commit(batch, vec![event]).await?;

        telemetry::record_promotion("promoted");
        info!(
            pattern_id = %id,
            domain = %pattern.domain,
            confidence = pattern.confidence,
            success_rate = pattern.success_rate(),
            "Pattern promoted to long-term"
        );
        Ok(PromotionDecision::Promoted(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::super::knowledge::test_support::{embedding, knowledge_base, seed};
    use super::*;
    use crate::domain::pattern::Polarity;
    use crate::domain::qe_domain::QeDomain;

    fn proven(axis: usize, tilt: f32) -> Pattern {
        let mut p = Pattern::new(QeDomain::TestGeneration, embedding(axis, tilt), Vec::new(), 0.8);
        p.usage_count = 4;
        p.success_count = 4;
        p
    }

    #[tokio::test]
    async fn test_promotes_proven_pattern() {
        let kb = knowledge_base();
        let gate = PromotionGate::new(kb.clone(), PromotionConfig::default());
        let pattern = seed(&kb, proven(0, 0.0)).await;

        let decision = gate.try_promote(pattern.id).await.unwrap();
        assert!(decision.is_promoted());
        assert_eq!(kb.store().get_pattern(pattern.id).await.unwrap().status, PatternStatus::LongTerm);
    }

    #[tokio::test]
    async fn test_thresholds_block() {
        let kb = knowledge_base();
        let gate = PromotionGate::new(kb.clone(), PromotionConfig::default());

        let mut unused = proven(1, 0.0);
        unused.usage_count = 2;
        unused.success_count = 2;
        assert!(matches!(
            gate.check_thresholds(&unused),
            Some(BlockReason::InsufficientUsage { usage: 2, required: 3 })
        ));

        let mut flaky = proven(1, 0.0);
        flaky.success_count = 2;
        flaky.failure_count = 2;
        assert!(matches!(gate.check_thresholds(&flaky), Some(BlockReason::LowSuccessRate { .. })));

        let mut weak = proven(1, 0.0);
        weak.confidence = 0.5;
        assert!(matches!(gate.check_thresholds(&weak), Some(BlockReason::LowConfidence { .. })));

        let mut quarantined = proven(1, 0.0);
        quarantined.status = PatternStatus::Quarantined;
        assert!(matches!(
            gate.check_thresholds(&quarantined),
            Some(BlockReason::NotShortTerm(PatternStatus::Quarantined))
        ));
    }

    #[tokio::test]
    async fn test_contradiction_blocks_and_is_audited() {
        let kb = knowledge_base();
        let gate = PromotionGate::new(kb.clone(), PromotionConfig::default());

        let mut established = Pattern::new(QeDomain::TestGeneration, embedding(2, 0.0), Vec::new(), 0.9)
            .with_polarity(Polarity::Negative);
        established.status = PatternStatus::LongTerm;
        let established = seed(&kb, established).await;
        let candidate = seed(&kb, proven(2, 0.1)).await;

        let decision = gate.try_promote(candidate.id).await.unwrap();
        match decision {
            PromotionDecision::Blocked(BlockReason::Contradiction { conflicting, similarity }) => {
                assert_eq!(conflicting, established.id);
                assert!(similarity >= 0.9);
            }
            other => panic!("expected contradiction, got {:?}", other),
        }
        assert_eq!(kb.store().get_pattern(candidate.id).await.unwrap().status, PatternStatus::ShortTerm);

        let audit = kb.store().get_pattern_audit(candidate.id).await.unwrap();
        assert!(matches!(audit.last(), Some(CortexEvent::PromotionBlocked { .. })));
    }

    #[tokio::test]
    async fn test_same_outcome_neighbour_does_not_block() {
        let kb = knowledge_base();
        let gate = PromotionGate::new(kb.clone(), PromotionConfig::default());

        let mut established = proven(3, 0.0);
        established.status = PatternStatus::LongTerm;
        seed(&kb, established).await;
        let candidate = seed(&kb, proven(3, 0.1)).await;

        assert!(gate.try_promote(candidate.id).await.unwrap().is_promoted());
    }
}
