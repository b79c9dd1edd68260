// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Learning Engine
//!
//! Asymmetric Q-learning and pattern confidence updates driven by sealed
//! experiences.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** The only path that mutates Q-values and pattern confidence
//!
//! # Update rules
//!
//! For every step `Q(s,a) ← Q(s,a) + α·(r + γ·max_a' Q(s',a') − Q(s,a))`,
//! where `s'` is the next step's state and the last step uses 0. On a
//! failed task, negative rewards are scaled by the domain's penalty ratio.
//!
//! Every pattern associated with the experience (reported as used, or bound
//! to one of its `(state, action)` pairs) is updated once: `+success_delta`
//! on success, `−failure_delta × ratio` on failure, clamped to [0,1].
//! `infra_error` experiences change nothing.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::config::LearningConfig;
use crate::domain::error::CortexError;
use crate::domain::events::CortexEvent;
use crate::domain::experience::{Experience, TaskOutcome};
use crate::domain::pattern::{ActionBinding, PatternId, PatternStatus};
use crate::domain::qe_domain::QeDomain;
use crate::domain::qvalue::{QKey, QValue};
use crate::domain::repository::{WriteBatch, WriteOp};
use crate::infrastructure::telemetry;

use super::knowledge::KnowledgeBase;

/// What one `record_outcome` changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearningReport {
    /// True when the experience was not learnable (open or `infra_error`)
    pub skipped: bool,
    pub qvalues_updated: usize,
    pub patterns_updated: Vec<PatternId>,
    pub quarantined: Vec<PatternId>,
    pub rehabilitated: Vec<PatternId>,
}

/// Greedy choice from the Q-table
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecommendation {
    pub action_key: String,
    pub value: f64,
    pub visits: u64,
}

pub struct LearningEngine {
    kb: Arc<KnowledgeBase>,
    config: LearningConfig,
}

impl LearningEngine {
    pub fn new(kb: Arc<KnowledgeBase>, config: LearningConfig) -> Self {
        Self { kb, config }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    /// Apply one sealed experience to the Q-table and its patterns.
    ///
    /// All Q-values, patterns and audit rows commit in a single batch.
    pub async fn record_outcome(&self, experience: &Experience) -> Result<LearningReport, CortexError> {
        let Some(outcome) = experience.outcome.as_ref() else {
            return Err(CortexError::InvalidState(format!(
                "trajectory {} is still open",
                experience.id
            )));
        };
        if !experience.is_learnable() {
            debug!(trajectory_id = %experience.id, "Infrastructure outcome, skipping learning");
            return Ok(LearningReport {
                skipped: true,
                ..LearningReport::default()
            });
        }
        let failed = matches!(outcome, TaskOutcome::Failure { .. });

        let _writer = self.kb.write_lock().await;

        let qvalues = self.update_qvalues(experience, failed).await?;

        let mut report = LearningReport {
            qvalues_updated: qvalues.len(),
            ..LearningReport::default()
        };
        let mut batch = WriteBatch::new();
        for qvalue in qvalues.into_values() {
            batch.push(WriteOp::PutQValue(qvalue));
        }

        let mut events = Vec::new();
        let mut touched = Vec::new();
        for pattern_id in self.associated_patterns(experience).await? {
            let mut pattern = match self.kb.get_pattern(pattern_id).await {
                Ok(p) => p,
                Err(CortexError::NotFound(_)) => {
                    warn!(pattern_id = %pattern_id, "Used pattern no longer exists, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let old_confidence = pattern.confidence;
            let transition = if failed {
                pattern.apply_failure(
                    self.config.failure_penalty(pattern.domain),
                    self.config.quarantine_threshold,
                )
            } else {
                pattern.apply_success(self.config.success_delta, self.config.rehabilitation_successes)
            };

            let recorded = CortexEvent::PatternOutcomeRecorded {
                pattern_id,
                trajectory_id: experience.id,
                outcome: outcome.label().to_string(),
                old_confidence,
                new_confidence: pattern.confidence,
                timestamp: Utc::now(),
            };
            events.push(recorded.clone());
            batch.put_pattern_audited(pattern.clone(), recorded);

            if let Some(transition) = transition {
                let event = match transition.to {
                    PatternStatus::Quarantined => {
                        report.quarantined.push(pattern_id);
                        CortexEvent::PatternQuarantined {
                            pattern_id,
                            domain: pattern.domain,
                            confidence: pattern.confidence,
                            consecutive_failures: pattern.consecutive_failures,
                            timestamp: Utc::now(),
                        }
                    }
                    _ => {
                        report.rehabilitated.push(pattern_id);
                        CortexEvent::PatternRehabilitated {
                            pattern_id,
                            domain: pattern.domain,
                            consecutive_successes: pattern.consecutive_successes,
                            timestamp: Utc::now(),
                        }
                    }
                };
                batch.push(WriteOp::Audit(event.clone()));
                events.push(event);
            }

            report.patterns_updated.push(pattern_id);
            touched.push(pattern);
        }

        self.kb.commit(batch, events).await?;

        for pattern in &touched {
            self.kb.refresh_index_meta(pattern);
            match pattern.status {
                PatternStatus::Quarantined if report.quarantined.contains(&pattern.id) => {
                    telemetry::record_quarantine(pattern.domain);
                    warn!(
                        pattern_id = %pattern.id,
                        domain = %pattern.domain,
                        confidence = pattern.confidence,
                        "Pattern quarantined"
                    );
                }
                PatternStatus::ShortTerm if report.rehabilitated.contains(&pattern.id) => {
                    telemetry::record_rehabilitation(pattern.domain);
                    info!(pattern_id = %pattern.id, domain = %pattern.domain, "Pattern rehabilitated");
                }
                _ => {}
            }
        }

        debug!(
            trajectory_id = %experience.id,
            outcome = outcome.label(),
            qvalues = report.qvalues_updated,
            patterns = report.patterns_updated.len(),
            "Outcome recorded"
        );
        Ok(report)
    }

    /// Bellman updates for every step, reading earlier updates from this
    /// same trajectory before falling back to the store.
    async fn update_qvalues(&self, experience: &Experience, failed: bool) -> Result<HashMap<QKey, QValue>, CortexError> {
        let ratio = self.config.penalty_ratio(experience.domain);
        let mut overlay: HashMap<QKey, QValue> = HashMap::new();

        for (i, step) in experience.trajectory.iter().enumerate() {
            let reward = if failed && step.reward < 0.0 {
                step.reward * ratio
            } else {
                step.reward
            };
            let next_max = match experience.trajectory.get(i + 1) {
                Some(next) => self.max_for_state(experience.domain, &next.state_key, &overlay).await?,
                None => 0.0,
            };

            let key = QKey::new(experience.domain, step.state_key.clone(), step.action_key.clone());
            let mut qvalue = match overlay.remove(&key) {
                Some(q) => q,
                None => {
                    let result = self.kb.store().get_qvalue(&key).await.map_err(CortexError::from);
                    self.kb
                        .observe(result)?
                        .unwrap_or_else(|| QValue::new(key.clone(), 0.0))
                }
            };
            qvalue.bellman_update(self.config.alpha, reward + self.config.gamma * next_max);
            overlay.insert(key, qvalue);
        }
        Ok(overlay)
    }

    async fn max_for_state(
        &self,
        domain: QeDomain,
        state_key: &str,
        overlay: &HashMap<QKey, QValue>,
    ) -> Result<f64, CortexError> {
        let result = self
            .kb
            .store()
            .get_qvalues_for_state(domain, state_key)
            .await
            .map_err(CortexError::from);
        let mut values: HashMap<String, f64> = self
            .kb
            .observe(result)?
            .into_iter()
            .map(|q| (q.key.action_key, q.value))
            .collect();
        for (key, q) in overlay {
            if key.domain == domain && key.state_key == state_key {
                values.insert(key.action_key.clone(), q.value);
            }
        }
        Ok(values.into_values().reduce(f64::max).unwrap_or(0.0))
    }

    /// Patterns reported as used plus those bound to a traversed pair,
    /// each once
    async fn associated_patterns(&self, experience: &Experience) -> Result<BTreeSet<PatternId>, CortexError> {
        let mut ids: BTreeSet<PatternId> = experience.used_patterns.iter().copied().collect();
        let bindings: BTreeSet<(&str, &str)> = experience
            .trajectory
            .iter()
            .map(|s| (s.state_key.as_str(), s.action_key.as_str()))
            .collect();

        for (state_key, action_key) in bindings {
            let binding = ActionBinding::new(state_key, action_key);
            let result = self
                .kb
                .store()
                .find_patterns_by_binding(experience.domain, &binding)
                .await
                .map_err(CortexError::from);
            ids.extend(self.kb.observe(result)?.into_iter().map(|p| p.id));
        }
        Ok(ids)
    }

    /// Highest-valued known action for a state; ties go to the
    /// lexicographically smallest action key
    pub async fn recommend_action(
        &self,
        domain: QeDomain,
        state_key: &str,
    ) -> Result<Option<ActionRecommendation>, CortexError> {
        let result = self
            .kb
            .store()
            .get_qvalues_for_state(domain, state_key)
            .await
            .map_err(CortexError::from);
        let best = self.kb.observe(result)?.into_iter().max_by(|a, b| {
            a.value
                .total_cmp(&b.value)
                .then_with(|| b.key.action_key.cmp(&a.key.action_key))
        });
        Ok(best.map(|q| ActionRecommendation {
            action_key: q.key.action_key,
            value: q.value,
            visits: q.visits,
        }))
    }
}
