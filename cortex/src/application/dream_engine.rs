// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Dream Engine
//!
//! Offline consolidation of recent experience into the pattern store.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Replay, merge, associate and promote outside the live path
//!
//! # Phases
//!
//! `Preparing → Replaying → Consolidating → Dreaming → ExtractingInsights`.
//! After each phase the [`DreamCheckpoint`] is persisted. Before starting
//! the next phase the engine yields if a live request is in flight or the
//! time box is spent; the cycle state is kept in memory and the next call
//! picks up at the checkpointed phase. Replaying also yields between chunks
//! and records its cursor. The first phase of every call always runs so a
//! busy system still makes progress.
//!
//! Applying an Optimization insight removes the absorbed twin from the
//! semantic index; it stays in the store, so a bootstrap rebuild re-admits it
//! until the next cycle folds it again. Insights are written in the same
//! batch that marks the replayed experiences and clears the checkpoint.
//!
//! The concept graph is not persisted. A checkpoint found in the store
//! without in-memory state (after a restart) resumes the same cycle from
//! `Preparing`.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::config::{DreamConfig, LearningConfig};
use crate::domain::dream::{ConsolidationTrigger, DreamCheckpoint, DreamPhase};
use crate::domain::error::CortexError;
use crate::domain::events::CortexEvent;
use crate::domain::experience::Experience;
use crate::domain::graph::{ConceptGraph, ConceptNode, NodeMerge};
use crate::domain::insight::{auto_apply_order, Insight, InsightKind};
use crate::domain::pattern::{OutcomeClass, Pattern, PatternId, PatternStatus, Polarity};
use crate::domain::repository::{PatternFilter, WriteBatch, WriteOp};
use crate::infrastructure::semantic_index::CompactionReport;
use crate::infrastructure::telemetry;

use super::knowledge::{InsertOutcome, KnowledgeBase};
use super::promotion::{PromotionDecision, PromotionGate};
use super::transfer::TransferService;

pub const CHECKPOINT_KEY: &str = "dream_checkpoint";
pub const LAST_CONSOLIDATION_KEY: &str = "last_consolidation_at";

/// Experiences replayed between yield checks
const REPLAY_CHUNK: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldReason {
    LiveTraffic,
    TimeBox,
}

impl YieldReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            YieldReason::LiveTraffic => "live_traffic",
            YieldReason::TimeBox => "time_box",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DreamReport {
    pub cycle_id: Uuid,
    pub trigger: ConsolidationTrigger,
    pub experiences: usize,
    pub nodes: usize,
    pub merged_nodes: usize,
    pub insights: Vec<Insight>,
    pub applied_insights: usize,
    pub promoted: Vec<PatternId>,
    pub transferred: usize,
    pub compaction: Option<CompactionReport>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(DreamReport),
    Yielded {
        cycle_id: Uuid,
        next_phase: DreamPhase,
        reason: YieldReason,
    },
}

struct CycleState {
    checkpoint: DreamCheckpoint,
    batch: Vec<Experience>,
    graph: ConceptGraph,
    nodes: usize,
    merges: Vec<NodeMerge>,
    insights: Vec<Insight>,
    compaction: Option<CompactionReport>,
}

/// What applying one insight did
enum Application {
    Applied(Option<PatternId>),
    Skipped(&'static str),
}

pub struct DreamEngine {
    kb: Arc<KnowledgeBase>,
    gate: Arc<PromotionGate>,
    transfer: Arc<TransferService>,
    config: DreamConfig,
    learning: LearningConfig,
    cycle: Mutex<Option<CycleState>>,
}

impl DreamEngine {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        gate: Arc<PromotionGate>,
        transfer: Arc<TransferService>,
        config: DreamConfig,
        learning: LearningConfig,
    ) -> Self {
        Self {
            kb,
            gate,
            transfer,
            config,
            learning,
            cycle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DreamConfig {
        &self.config
    }

    /// Advance the current cycle, starting one if none is in progress
    pub async fn run_cycle(&self, trigger: ConsolidationTrigger) -> Result<CycleOutcome, CortexError> {
        self.kb.ensure_running()?;
        let started = Instant::now();
        let mut slot = self.cycle.lock().await;

        if slot.is_none() {
            let fresh = self.begin(trigger).await?;
            *slot = Some(fresh);
        }
        let Some(state) = slot.as_mut() else {
            return Err(CortexError::InvalidState("dream cycle state missing".to_string()));
        };
        // A more urgent trigger takes over the running cycle
        if trigger.priority() > state.checkpoint.trigger.priority() {
            state.checkpoint.trigger = trigger;
        }

        let time_box = if state.checkpoint.trigger == ConsolidationTrigger::QualityGateFailure {
            self.config.quality_gate_time_box
        } else {
            self.config.time_box
        };
        let result = self.run_phases(state, started + time_box).await;

        match &result {
            Ok(CycleOutcome::Completed(_)) => *slot = None,
            Ok(CycleOutcome::Yielded { .. }) => {}
            Err(e) => {
                warn!(error = %e, "Dream cycle failed, in-memory state dropped");
                *slot = None;
            }
        }
        result
    }

    /// Run cycles until one completes, yielding as often as needed
    pub async fn run_to_completion(&self, trigger: ConsolidationTrigger) -> Result<DreamReport, CortexError> {
        loop {
            match self.run_cycle(trigger).await? {
                CycleOutcome::Completed(report) => return Ok(report),
                CycleOutcome::Yielded { next_phase, reason, .. } => {
                    debug!(next_phase = %next_phase, reason = reason.as_str(), "Cycle yielded, continuing");
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Whether a cycle is in progress, in memory or checkpointed
    pub async fn has_pending_cycle(&self) -> Result<bool, CortexError> {
        if self.cycle.lock().await.is_some() {
            return Ok(true);
        }
        Ok(self.checkpoint().await?.is_some())
    }

    pub async fn checkpoint(&self) -> Result<Option<DreamCheckpoint>, CortexError> {
        let value = self.read_state(CHECKPOINT_KEY).await?;
        match value {
            Some(value) => match serde_json::from_value::<Option<DreamCheckpoint>>(value) {
                Ok(checkpoint) => Ok(checkpoint),
                Err(e) => {
                    warn!(error = %e, "Unreadable dream checkpoint, ignoring");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn last_consolidation_at(&self) -> Result<Option<DateTime<Utc>>, CortexError> {
        let value = self.read_state(LAST_CONSOLIDATION_KEY).await?;
        Ok(value.and_then(|v| serde_json::from_value(v).ok()))
    }

    async fn read_state(&self, key: &str) -> Result<Option<Value>, CortexError> {
        let result = self.kb.store().get_state(key).await.map_err(CortexError::from);
        self.kb.observe(result)
    }

    async fn begin(&self, trigger: ConsolidationTrigger) -> Result<CycleState, CortexError> {
        let checkpoint = match self.checkpoint().await? {
            Some(mut stored) => {
                info!(
                    cycle_id = %stored.cycle_id,
                    phase = %stored.phase,
                    "Resuming checkpointed dream cycle from preparing"
                );
                stored.advance(DreamPhase::Preparing);
                stored.replay_cursor = 0;
                if trigger.priority() > stored.trigger.priority() {
                    stored.trigger = trigger;
                }
                stored
            }
            None => DreamCheckpoint::start(trigger),
        };

        let result = self
            .kb
            .store()
            .get_unconsolidated_experiences(self.config.replay_sample_size)
            .await
            .map_err(CortexError::from);
        let mut batch = self.kb.observe(result)?;
        if batch.is_empty() {
            // Nothing new; replay recent history so associations still form
            let result = self
                .kb
                .store()
                .get_recent_experiences(None, self.config.replay_sample_size)
                .await
                .map_err(CortexError::from);
            batch = self.kb.observe(result)?;
            batch.retain(Experience::is_sealed);
            batch.reverse();
        }

        info!(
            cycle_id = %checkpoint.cycle_id,
            trigger = %checkpoint.trigger,
            experiences = batch.len(),
            "Dream cycle started"
        );
        Ok(CycleState {
            checkpoint,
            batch,
            graph: ConceptGraph::default(),
            nodes: 0,
            merges: Vec::new(),
            insights: Vec::new(),
            compaction: None,
        })
    }

    async fn run_phases(&self, state: &mut CycleState, deadline: Instant) -> Result<CycleOutcome, CortexError> {
        let mut first = true;
        loop {
            let phase = state.checkpoint.phase;
            if !first {
                if let Some(reason) = self.should_yield(deadline) {
                    return self.yield_cycle(state, reason).await;
                }
            }
            first = false;

            let phase_started = Instant::now();
            let finished = match phase {
                DreamPhase::Idle | DreamPhase::Preparing => {
                    self.prepare(state).await?;
                    true
                }
                DreamPhase::Replaying => self.replay(state, deadline),
                DreamPhase::Consolidating => {
                    self.consolidate(state).await?;
                    true
                }
                DreamPhase::Dreaming => {
                    self.dream(state);
                    true
                }
                DreamPhase::ExtractingInsights => {
                    let report = self.extract_insights(state).await?;
                    telemetry::record_phase(phase, phase_started.elapsed());
                    return Ok(CycleOutcome::Completed(report));
                }
            };
            telemetry::record_phase(phase, phase_started.elapsed());

            if !finished {
                let reason = self.should_yield(deadline).unwrap_or(YieldReason::TimeBox);
                return self.yield_cycle(state, reason).await;
            }

            let next = match phase {
                DreamPhase::Idle => DreamPhase::Replaying,
                other => other.next(),
            };
            state.checkpoint.advance(next);
            self.save_checkpoint(&state.checkpoint).await?;
            debug!(cycle_id = %state.checkpoint.cycle_id, next_phase = %next, "Dream phase complete");
        }
    }

    fn should_yield(&self, deadline: Instant) -> Option<YieldReason> {
        if self.kb.activity().is_busy() {
            Some(YieldReason::LiveTraffic)
        } else if Instant::now() >= deadline {
            Some(YieldReason::TimeBox)
        } else {
            None
        }
    }

    async fn yield_cycle(&self, state: &mut CycleState, reason: YieldReason) -> Result<CycleOutcome, CortexError> {
        self.save_checkpoint(&state.checkpoint).await?;
        let checkpoint = &state.checkpoint;
        self.kb.events().publish(CortexEvent::ConsolidationYielded {
            cycle_id: checkpoint.cycle_id,
            next_phase: checkpoint.phase,
            reason: reason.as_str().to_string(),
            timestamp: Utc::now(),
        });
        telemetry::record_dream_cycle(checkpoint.trigger, "yielded");
        info!(
            cycle_id = %checkpoint.cycle_id,
            next_phase = %checkpoint.phase,
            reason = reason.as_str(),
            "Dream cycle yielded"
        );
        Ok(CycleOutcome::Yielded {
            cycle_id: checkpoint.cycle_id,
            next_phase: checkpoint.phase,
            reason,
        })
    }

    async fn save_checkpoint(&self, checkpoint: &DreamCheckpoint) -> Result<(), CortexError> {
        let value = serde_json::to_value(checkpoint).map_err(|e| CortexError::Storage(e.to_string()))?;
        let op = WriteOp::PutState {
            key: CHECKPOINT_KEY.to_string(),
            value,
        };
        self.kb.commit(WriteBatch::single(op), Vec::new()).await
    }

    async fn prepare(&self, state: &mut CycleState) -> Result<(), CortexError> {
        let filter = PatternFilter::default().with_min_confidence(self.config.min_node_confidence);
        let result = self.kb.store().query_patterns(&filter).await.map_err(CortexError::from);
        let patterns: Vec<Pattern> = self
            .kb
            .observe(result)?
            .into_iter()
            .filter(|p| p.status != PatternStatus::Quarantined)
            .collect();

        state.graph = ConceptGraph::build(patterns, &state.batch);
        state.nodes = state.graph.len();
        debug!(nodes = state.nodes, edges = state.graph.edge_count(), "Concept graph prepared");
        Ok(())
    }

    /// Returns false when it stopped early to yield
    fn replay(&self, state: &mut CycleState, deadline: Instant) -> bool {
        let total = state.batch.len();
        while state.checkpoint.replay_cursor < total {
            let start = state.checkpoint.replay_cursor;
            let end = (start + REPLAY_CHUNK).min(total);
            for experience in &state.batch[start..end] {
                state.graph.replay(experience, self.config.replay_activation);
            }
            state.checkpoint.replay_cursor = end;
            if end < total && self.should_yield(deadline).is_some() {
                return false;
            }
        }
        true
    }

    async fn consolidate(&self, state: &mut CycleState) -> Result<(), CortexError> {
        state.merges = state.graph.merge_near_duplicates(self.config.merge_similarity);
        if !state.merges.is_empty() {
            debug!(merged = state.merges.len(), nodes = state.graph.len(), "Near-duplicate nodes merged");
        }

        // Tombstones are only ever compacted here, off the live path
        if self.kb.index().tombstones() > 0 {
            let index = self.kb.index().clone();
            let report = tokio::task::spawn_blocking(move || index.compact())
                .await
                .map_err(|e| CortexError::Storage(format!("index compaction task failed: {}", e)))?;
            self.kb.events().publish(CortexEvent::IndexCompacted {
                removed: report.removed,
                remaining: report.remaining,
                timestamp: Utc::now(),
            });
            state.compaction = Some(report);
        }
        Ok(())
    }

    fn dream(&self, state: &mut CycleState) {
        let config = &self.config;
        let graph = &mut state.graph;
        graph.spread(config.iterations, config.spread_factor, config.decay);

        let mut insights = Vec::new();

        for pair in graph.novel_pairs(config.co_activation_threshold) {
            let (a, b) = (graph.node(pair.a), graph.node(pair.b));
            let confidence = pair.co_activation * (a.confidence + b.confidence) / 2.0;
            let insight = Insight::new(
                InsightKind::Novel {
                    co_activation: pair.co_activation,
                    cross_domain: a.domain != b.domain,
                },
                a.domain,
                vec![a.pattern_id, b.pattern_id],
                confidence,
                format!("{} and {} co-activate without ever co-occurring", a.pattern_id, b.pattern_id),
            )
            .with_derived_pattern(self.composite(a, b, "novel"));
            insights.push(insight);
        }

        for pair in graph.correlated_pairs(config.co_activation_threshold, config.correlation_edge_weight) {
            let (a, b) = (graph.node(pair.a), graph.node(pair.b));
            let Some(edge) = pair.edge else { continue };
            let insight = Insight::new(
                InsightKind::Correlation {
                    co_occurrences: edge.co_occurrences,
                    edge_weight: edge.weight,
                },
                a.domain,
                vec![a.pattern_id, b.pattern_id],
                pair.co_activation * edge.weight,
                format!("{} and {} co-occurred {} times", a.pattern_id, b.pattern_id, edge.co_occurrences),
            )
            .with_derived_pattern(self.composite(a, b, "correlation"));
            insights.push(insight);
        }

        for merge in &state.merges {
            insights.push(Insight::new(
                InsightKind::Optimization {
                    representative: merge.representative,
                    similarity: merge.similarity,
                },
                merge.domain,
                vec![merge.representative, merge.absorbed],
                merge.similarity,
                format!("{} folded into {}", merge.absorbed, merge.representative),
            ));
        }

        for (ix, z_score) in graph.anomalies(config.anomaly_z_score) {
            let node = graph.node(ix);
            insights.push(Insight::new(
                InsightKind::Anomaly {
                    activation: node.activation,
                    z_score,
                },
                node.domain,
                vec![node.pattern_id],
                1.0 - 1.0 / z_score.max(1.0),
                format!("{} activation {:.2} at z={:.2}", node.pattern_id, node.activation, z_score),
            ));
        }

        for ix in graph.anti_patterns(config.anti_pattern_failure_ratio, config.anti_pattern_min_observations) {
            let node = graph.node(ix);
            let observations = node.observations();
            let failure_ratio = node.failure_ratio();
            let confidence = failure_ratio * observations as f64 / (observations as f64 + 1.0);
            insights.push(
                Insight::new(
                    InsightKind::AntiPattern {
                        failure_ratio,
                        observations,
                    },
                    node.domain,
                    vec![node.pattern_id],
                    confidence,
                    format!(
                        "{} failed in {} of {} replayed experiences",
                        node.pattern_id, node.failures, observations
                    ),
                )
                .with_derived_pattern(self.avoidance(node, failure_ratio)),
            );
        }

        debug!(insights = insights.len(), "Dreaming produced insights");
        state.insights = insights;
    }

    /// Positive pattern combining two co-activated nodes
    fn composite(&self, a: &ConceptNode, b: &ConceptNode, kind: &str) -> Pattern {
        let mut embedding: Vec<f32> = a
            .embedding
            .iter()
            .zip(&b.embedding)
            .map(|(x, y)| (x + y) / 2.0)
            .collect();
        let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            embedding.iter_mut().for_each(|x| *x /= norm);
        }
        let payload = json!({
            "kind": "composite",
            "insight": kind,
            "sources": [a.pattern_id.to_string(), b.pattern_id.to_string()],
        });
        Pattern::new(a.domain, embedding, payload.to_string().into_bytes(), self.learning.initial_confidence)
            .with_tags(vec!["dream".to_string(), kind.to_string()])
    }

    /// Negative pattern recording that a strategy keeps failing
    fn avoidance(&self, node: &ConceptNode, failure_ratio: f64) -> Pattern {
        let payload = json!({
            "kind": "avoid",
            "source": node.pattern_id.to_string(),
            "failure_ratio": failure_ratio,
        });
        let mut pattern = Pattern::new(
            node.domain,
            node.embedding.clone(),
            payload.to_string().into_bytes(),
            self.learning.initial_confidence,
        )
        .with_polarity(Polarity::Negative)
        .with_tags(vec!["dream".to_string(), "anti_pattern".to_string()]);
        pattern.binding = node.binding.clone();
        pattern
    }

    async fn extract_insights(&self, state: &mut CycleState) -> Result<DreamReport, CortexError> {
        let mut insights = std::mem::take(&mut state.insights);
        let mut events: Vec<CortexEvent> = insights
            .iter()
            .map(|insight| CortexEvent::InsightGenerated {
                insight_id: insight.id,
                kind: insight.kind.label().to_string(),
                domain: insight.domain,
                confidence: insight.confidence,
                timestamp: Utc::now(),
            })
            .collect();

        let mut order: Vec<usize> = (0..insights.len())
            .filter(|&i| insights[i].confidence >= self.config.auto_apply_confidence)
            .collect();
        order.sort_by(|&a, &b| auto_apply_order(&insights[a], &insights[b]));

        let mut promoted = Vec::new();
        let mut transferred = 0;
        let mut applied_count = 0;
        for i in order {
            let application = self.apply_insight(&insights[i], &mut promoted, &mut transferred).await?;
            match application {
                Application::Applied(derived_pattern_id) => {
                    let insight = &mut insights[i];
                    insight.applied = true;
                    applied_count += 1;
                    events.push(CortexEvent::InsightApplied {
                        insight_id: insight.id,
                        kind: insight.kind.label().to_string(),
                        derived_pattern_id,
                        timestamp: Utc::now(),
                    });
                }
                Application::Skipped(reason) => {
                    debug!(insight_id = %insights[i].id, kind = insights[i].kind.label(), reason, "Insight not applied");
                }
            }
        }
        for insight in &insights {
            telemetry::record_insight(insight.kind.label(), insight.applied);
        }

        self.promotion_sweep(&mut promoted, &mut transferred).await?;

        let consolidated: Vec<_> = state.batch.iter().filter(|e| !e.consolidated).map(|e| e.id).collect();
        let now = Utc::now();
        // Insights commit atomically with the checkpoint clear
        let mut finish = WriteBatch::new();
        for insight in &insights {
            finish.push(WriteOp::PutInsight(insight.clone()));
        }
        finish
            .push(WriteOp::MarkConsolidated(consolidated))
            .push(WriteOp::PutState {
                key: LAST_CONSOLIDATION_KEY.to_string(),
                value: json!(now),
            })
            .push(WriteOp::PutState {
                key: CHECKPOINT_KEY.to_string(),
                value: Value::Null,
            });

        let checkpoint = &state.checkpoint;
        let duration = (now - checkpoint.started_at).to_std().unwrap_or_default();
        let report = DreamReport {
            cycle_id: checkpoint.cycle_id,
            trigger: checkpoint.trigger,
            experiences: state.batch.len(),
            nodes: state.nodes,
            merged_nodes: state.merges.len(),
            applied_insights: applied_count,
            insights,
            promoted,
            transferred,
            compaction: state.compaction,
            duration,
        };
        let completed = CortexEvent::ConsolidationCompleted {
            cycle_id: report.cycle_id,
            trigger: report.trigger,
            nodes: report.nodes,
            merged_nodes: report.merged_nodes,
            insights: report.insights.len(),
            applied_insights: report.applied_insights,
            promoted: report.promoted.len(),
            transferred: report.transferred,
            duration_ms: duration.as_millis() as u64,
            timestamp: now,
        };
        events.push(completed);
        self.kb.commit(finish, events).await?;

        telemetry::record_dream_cycle(report.trigger, "completed");
        if let Ok(counts) = self.kb.store().counts().await {
            telemetry::set_store_gauges(&counts);
        }
        info!(
            cycle_id = %report.cycle_id,
            trigger = %report.trigger,
            experiences = report.experiences,
            insights = report.insights.len(),
            applied = report.applied_insights,
            promoted = report.promoted.len(),
            transferred = report.transferred,
            duration_ms = duration.as_millis() as u64,
            "Dream cycle completed"
        );
        Ok(report)
    }

    async fn apply_insight(
        &self,
        insight: &Insight,
        promoted: &mut Vec<PatternId>,
        transferred: &mut usize,
    ) -> Result<Application, CortexError> {
        let _writer = self.kb.write_lock().await;
        match &insight.kind {
            InsightKind::Novel { .. } | InsightKind::Correlation { .. } => {
                let Some(derived) = insight.derived_pattern.clone() else {
                    return Ok(Application::Skipped("no derived pattern"));
                };
                let contradiction = self
                    .kb
                    .find_contradiction(
                        derived.domain,
                        &derived.embedding,
                        OutcomeClass::Success,
                        None,
                        self.gate.config().contradiction_similarity,
                    )
                    .await?;
                if contradiction.is_some() {
                    return Ok(Application::Skipped("contradicts long-term knowledge"));
                }
                self.insert_derived(derived).await
            }
            InsightKind::AntiPattern { .. } => match insight.derived_pattern.clone() {
                Some(derived) => self.insert_derived(derived).await,
                None => Ok(Application::Skipped("no derived pattern")),
            },
            InsightKind::Optimization { representative, .. } => {
                // Absorbed twins leave the index; the next Consolidating phase compacts their tombstones
                let mut retired = 0;
                for absorbed in insight.source_pattern_ids.iter().filter(|id| *id != representative) {
                    if self.kb.index().remove(*absorbed) {
                        retired += 1;
                    }
                }
                if retired > 0 {
                    debug!(representative = %representative, retired, "Absorbed near-duplicates retired from index");
                }
                match self.gate.try_promote_locked(*representative).await? {
                    PromotionDecision::Promoted(pattern) => {
                        promoted.push(pattern.id);
                        *transferred += self.transfer.propagate(&pattern).await?.len();
                        Ok(Application::Applied(None))
                    }
                    PromotionDecision::Blocked(_) if retired > 0 => Ok(Application::Applied(None)),
                    PromotionDecision::Blocked(_) => Ok(Application::Skipped("nothing to retire or promote")),
                }
            }
            InsightKind::Anomaly { .. } => Ok(Application::Skipped("anomalies are kept for review")),
        }
    }

    async fn insert_derived(&self, derived: Pattern) -> Result<Application, CortexError> {
        match self.kb.insert_pattern(derived, self.learning.dedup_similarity).await? {
            InsertOutcome::Inserted(id) => Ok(Application::Applied(Some(id))),
            InsertOutcome::Duplicate(_) => Ok(Application::Skipped("equivalent pattern already stored")),
        }
    }

    /// Gate every short-term pattern that meets the usage threshold and
    /// propagate whatever gets promoted
    async fn promotion_sweep(&self, promoted: &mut Vec<PatternId>, transferred: &mut usize) -> Result<(), CortexError> {
        let filter = PatternFilter::default().with_status(PatternStatus::ShortTerm);
        let result = self.kb.store().query_patterns(&filter).await.map_err(CortexError::from);
        let candidates: Vec<PatternId> = self
            .kb
            .observe(result)?
            .into_iter()
            .filter(|p| self.gate.check_thresholds(p).is_none())
            .map(|p| p.id)
            .collect();

        for id in candidates {
            let _writer = self.kb.write_lock().await;
            if let PromotionDecision::Promoted(pattern) = self.gate.try_promote_locked(id).await? {
                promoted.push(pattern.id);
                *transferred += self.transfer.propagate(&pattern).await?.len();
            }
        }
        Ok(())
    }
}
