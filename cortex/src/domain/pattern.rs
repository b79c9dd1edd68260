// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pattern aggregate: a scored unit of reusable agent knowledge.
//!
//! Confidence only moves through [`Pattern::apply_success`] and
//! [`Pattern::apply_failure`], which the learning engine calls once per
//! reported usage. Status transitions out of `short_term` into `long_term`
//! are owned by the promotion gate and are not reachable from here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::qe_domain::QeDomain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternId(pub Uuid);

impl PatternId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PatternId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PatternId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle status of a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    /// Provisional knowledge, retrievable but not yet trusted
    ShortTerm,
    /// Promoted through the coherence gate
    LongTerm,
    /// Excluded from retrieval until rehabilitated
    Quarantined,
}

impl PatternStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternStatus::ShortTerm => "short_term",
            PatternStatus::LongTerm => "long_term",
            PatternStatus::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for PatternStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short_term" => Ok(PatternStatus::ShortTerm),
            "long_term" => Ok(PatternStatus::LongTerm),
            "quarantined" => Ok(PatternStatus::Quarantined),
            other => Err(format!("Unknown pattern status: '{}'", other)),
        }
    }
}

/// Whether a pattern describes something to do or something to avoid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    Positive,
    Negative,
}

/// Outcome class used by the coherence check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Success,
    Failure,
}

/// The `(state, action)` pair a pattern is the strategy for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionBinding {
    pub state_key: String,
    pub action_key: String,
}

impl ActionBinding {
    pub fn new(state_key: impl Into<String>, action_key: impl Into<String>) -> Self {
        Self {
            state_key: state_key.into(),
            action_key: action_key.into(),
        }
    }
}

/// A status change caused by a learning update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: PatternStatus,
    pub to: PatternStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub domain: QeDomain,
    pub embedding: Vec<f32>,
    pub confidence: f64,
    pub usage_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub status: PatternStatus,
    pub polarity: Polarity,
    pub binding: Option<ActionBinding>,
    pub tags: Vec<String>,
    /// Source pattern when this row is a cross-domain copy
    pub transferred_from: Option<PatternId>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Opaque strategy content, never interpreted by the cortex
    pub payload: Vec<u8>,
}

impl Pattern {
    pub fn new(domain: QeDomain, embedding: Vec<f32>, payload: Vec<u8>, confidence: f64) -> Self {
        Self {
            id: PatternId::new(),
            domain,
            embedding,
            confidence: confidence.clamp(0.0, 1.0),
            usage_count: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            status: PatternStatus::ShortTerm,
            polarity: Polarity::Positive,
            binding: None,
            tags: Vec::new(),
            transferred_from: None,
            created_at: Utc::now(),
            last_used_at: None,
            payload,
        }
    }

    pub fn with_binding(mut self, binding: ActionBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.usage_count as f64
    }

    /// Recorded outcome class: the dominant observed outcome, or the
    /// polarity for a pattern nobody has reported on yet.
    pub fn recorded_outcome(&self) -> OutcomeClass {
        if self.usage_count == 0 {
            return match self.polarity {
                Polarity::Positive => OutcomeClass::Success,
                Polarity::Negative => OutcomeClass::Failure,
            };
        }
        if self.success_count >= self.failure_count {
            OutcomeClass::Success
        } else {
            OutcomeClass::Failure
        }
    }

    pub fn is_retrievable(&self) -> bool {
        self.status != PatternStatus::Quarantined
    }

    /// Record a successful usage.
    ///
    /// A quarantined pattern returns to `short_term` once it has collected
    /// `rehabilitation_successes` consecutive successes.
    pub fn apply_success(&mut self, delta: f64, rehabilitation_successes: u32) -> Option<StatusTransition> {
        self.touch();
        self.success_count += 1;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
        self.confidence = (self.confidence + delta).clamp(0.0, 1.0);

        if self.status == PatternStatus::Quarantined
            && self.consecutive_successes >= rehabilitation_successes
        {
            self.status = PatternStatus::ShortTerm;
            return Some(StatusTransition {
                from: PatternStatus::Quarantined,
                to: PatternStatus::ShortTerm,
            });
        }
        None
    }

    /// Record a failed usage with an already ratio-scaled penalty.
    pub fn apply_failure(&mut self, penalty: f64, quarantine_threshold: f64) -> Option<StatusTransition> {
        self.touch();
        self.failure_count += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
        self.confidence = (self.confidence - penalty).clamp(0.0, 1.0);

        if self.status != PatternStatus::Quarantined && self.confidence < quarantine_threshold {
            let from = self.status;
            self.status = PatternStatus::Quarantined;
            return Some(StatusTransition {
                from,
                to: PatternStatus::Quarantined,
            });
        }
        None
    }

    fn touch(&mut self) {
        self.usage_count += 1;
        self.last_used_at = Some(Utc::now());
    }

    pub fn summary(&self, similarity: f64) -> PatternSummary {
        PatternSummary {
            id: self.id,
            domain: self.domain,
            similarity,
            confidence: self.confidence,
            status: self.status,
            polarity: self.polarity,
            usage_count: self.usage_count,
            success_rate: self.success_rate(),
            tags: self.tags.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Caller input for storing a pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPattern {
    pub domain: QeDomain,
    pub embedding: Vec<f32>,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub binding: Option<ActionBinding>,
    #[serde(default)]
    pub polarity: Polarity,
    /// Falls back to the configured initial confidence
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// What retrieval hands back to an in-flight task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSummary {
    pub id: PatternId,
    pub domain: QeDomain,
    pub similarity: f64,
    pub confidence: f64,
    pub status: PatternStatus,
    pub polarity: Polarity,
    pub usage_count: u64,
    pub success_rate: f64,
    pub tags: Vec<String>,
    pub payload: Vec<u8>,
}

/// Cosine similarity in [-1, 1]; zero for empty or mismatched vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(confidence: f64) -> Pattern {
        Pattern::new(QeDomain::TestGeneration, vec![1.0, 0.0], b"strategy".to_vec(), confidence)
    }

    #[test]
    fn test_new_pattern_is_short_term() {
        let p = pattern(0.5);
        assert_eq!(p.status, PatternStatus::ShortTerm);
        assert_eq!(p.usage_count, 0);
        assert_eq!(p.recorded_outcome(), OutcomeClass::Success);
    }

    #[test]
    fn test_initial_confidence_is_clamped() {
        assert_eq!(pattern(1.7).confidence, 1.0);
        assert_eq!(pattern(-0.2).confidence, 0.0);
    }

    #[test]
    fn test_failure_quarantines_below_threshold() {
        let mut p = pattern(0.5);
        let transition = p.apply_failure(1.0, 0.3);
        assert_eq!(p.confidence, 0.0);
        assert_eq!(
            transition,
            Some(StatusTransition { from: PatternStatus::ShortTerm, to: PatternStatus::Quarantined })
        );
        assert_eq!(p.usage_count, 1);
        assert_eq!(p.failure_count, 1);
    }

    #[test]
    fn test_rehabilitation_needs_consecutive_successes() {
        let mut p = pattern(0.5);
        p.apply_failure(1.0, 0.3);

        for _ in 0..9 {
            assert!(p.apply_success(0.1, 10).is_none());
        }
        // A failure resets the streak
        p.apply_failure(1.0, 0.3);
        assert_eq!(p.status, PatternStatus::Quarantined);
        assert_eq!(p.consecutive_successes, 0);

        for _ in 0..9 {
            p.apply_success(0.1, 10);
        }
        assert_eq!(p.status, PatternStatus::Quarantined);
        let t = p.apply_success(0.1, 10);
        assert_eq!(t.map(|t| t.to), Some(PatternStatus::ShortTerm));
    }

    #[test]
    fn test_counts_track_usage() {
        let mut p = pattern(0.5);
        p.apply_success(0.1, 10);
        p.apply_failure(0.1, 0.3);
        p.apply_success(0.1, 10);
        assert_eq!(p.usage_count, 3);
        assert_eq!(p.success_count + p.failure_count, p.usage_count);
        assert!((p.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_polarity_outcome_class() {
        let p = pattern(0.5).with_polarity(Polarity::Negative);
        assert_eq!(p.recorded_outcome(), OutcomeClass::Failure);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}
