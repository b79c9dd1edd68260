// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Consolidation Worker - Background task driving dream cycles
//!
//! Runs the "sleep cycle": a dream cycle every `interval`, or sooner when a
//! trigger arrives (buffer threshold, quality-gate failure, manual). A cycle
//! that yields to live traffic is resumed after `resume_delay`. Each timer
//! tick also sweeps orphaned trajectories.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** The single consolidation context next to the live path

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::config::DreamConfig;
use crate::domain::dream::ConsolidationTrigger;
use crate::domain::error::CortexError;

use super::dream_engine::{CycleOutcome, DreamEngine};
use super::experience_capture::ExperienceCapture;

/// Pending triggers beyond this are dropped; one queued run is enough
const TRIGGER_CAPACITY: usize = 16;

/// Something that can advance a dream cycle
#[async_trait]
pub trait DreamCycleRunner: Send + Sync {
    async fn run_cycle(&self, trigger: ConsolidationTrigger) -> Result<CycleOutcome, CortexError>;
}

#[async_trait]
impl DreamCycleRunner for DreamEngine {
    async fn run_cycle(&self, trigger: ConsolidationTrigger) -> Result<CycleOutcome, CortexError> {
        DreamEngine::run_cycle(self, trigger).await
    }
}

/// Cheap handle for requesting a consolidation run
#[derive(Debug, Clone)]
pub struct ConsolidationHandle {
    sender: mpsc::Sender<ConsolidationTrigger>,
}

impl ConsolidationHandle {
    pub fn new(sender: mpsc::Sender<ConsolidationTrigger>) -> Self {
        Self { sender }
    }

    /// A handle with no worker behind it; triggers are discarded
    pub fn detached() -> Self {
        let (sender, _) = mpsc::channel(1);
        Self { sender }
    }

    /// Request a run without waiting; returns whether it was queued
    pub fn trigger(&self, trigger: ConsolidationTrigger) -> bool {
        match self.sender.try_send(trigger) {
            Ok(()) => {
                debug!(trigger = %trigger, "Consolidation requested");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(trigger = %trigger, "Consolidation queue full, run already pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(trigger = %trigger, "No consolidation worker running");
                false
            }
        }
    }
}

pub struct ConsolidationWorker {
    dreamer: Arc<dyn DreamCycleRunner>,
    capture: Arc<ExperienceCapture>,
    config: DreamConfig,
    handle: ConsolidationHandle,
    triggers: Mutex<Option<mpsc::Receiver<ConsolidationTrigger>>>,
    shutdown_token: CancellationToken,
}

impl ConsolidationWorker {
    pub fn new(dreamer: Arc<dyn DreamCycleRunner>, capture: Arc<ExperienceCapture>, config: DreamConfig) -> Self {
        let (sender, receiver) = mpsc::channel(TRIGGER_CAPACITY);
        Self {
            dreamer,
            capture,
            config,
            handle: ConsolidationHandle::new(sender),
            triggers: Mutex::new(Some(receiver)),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> ConsolidationHandle {
        self.handle.clone()
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the worker background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        let Some(mut triggers) = self.triggers.lock().take() else {
            warn!("Consolidation worker already started");
            return;
        };

        info!(
            interval_secs = self.config.interval.as_secs(),
            buffer_threshold = self.config.buffer_threshold,
            "Starting consolidation worker"
        );

        let mut tick = interval_at(Instant::now() + self.config.interval, self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resume: Option<(Instant, ConsolidationTrigger)> = None;

        loop {
            let resume_at = resume.map_or_else(|| Instant::now() + self.config.interval, |(at, _)| at);
            let keep_going = tokio::select! {
                _ = tick.tick() => {
                    self.sweep_orphans().await && self.run_cycle(ConsolidationTrigger::Timer, &mut resume).await
                }
                Some(trigger) = triggers.recv() => {
                    self.run_cycle(trigger, &mut resume).await
                }
                _ = tokio::time::sleep_until(resume_at), if resume.is_some() => {
                    let trigger = resume.take().map_or(ConsolidationTrigger::Timer, |(_, t)| t);
                    self.run_cycle(trigger, &mut resume).await
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping consolidation worker");
                    false
                }
            };
            if !keep_going {
                break;
            }
        }

        info!("Consolidation worker stopped");
    }

    /// Returns false when the worker must stop
    async fn run_cycle(&self, trigger: ConsolidationTrigger, resume: &mut Option<(Instant, ConsolidationTrigger)>) -> bool {
        match self.dreamer.run_cycle(trigger).await {
            Ok(CycleOutcome::Completed(report)) => {
                *resume = None;
                debug!(cycle_id = %report.cycle_id, "Consolidation run finished");
                true
            }
            Ok(CycleOutcome::Yielded { next_phase, .. }) => {
                debug!(next_phase = %next_phase, delay_ms = self.config.resume_delay.as_millis() as u64, "Cycle will resume");
                *resume = Some((Instant::now() + self.config.resume_delay, trigger));
                true
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Consolidation halted");
                false
            }
            Err(e) => {
                warn!("Consolidation cycle failed: {}", e);
                true
            }
        }
    }

    async fn sweep_orphans(&self) -> bool {
        match self.capture.recover_orphans().await {
            Ok(sealed) => {
                if !sealed.is_empty() {
                    info!(count = sealed.len(), "Orphan sweep sealed trajectories");
                }
                true
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Orphan sweep halted");
                false
            }
            Err(e) => {
                warn!("Orphan sweep failed: {}", e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::dream_engine::DreamReport;
    use super::super::knowledge::test_support::knowledge_base;
    use super::*;
    use crate::domain::dream::DreamPhase;
    use crate::infrastructure::infra_classifier::NoopClassifier;
    use std::time::Duration;
    use uuid::Uuid;

    /// Yields `yields` times, then completes; or fails with `error`
    struct MockDreamer {
        calls: tokio::sync::Mutex<Vec<ConsolidationTrigger>>,
        yields: usize,
        fatal: bool,
    }

    impl MockDreamer {
        fn new(yields: usize) -> Self {
            Self {
                calls: tokio::sync::Mutex::new(Vec::new()),
                yields,
                fatal: false,
            }
        }
    }

    #[async_trait]
    impl DreamCycleRunner for MockDreamer {
        async fn run_cycle(&self, trigger: ConsolidationTrigger) -> Result<CycleOutcome, CortexError> {
            let mut calls = self.calls.lock().await;
            calls.push(trigger);
            if self.fatal {
                return Err(CortexError::Corruption("checksum mismatch".into()));
            }
            if calls.len() <= self.yields {
                return Ok(CycleOutcome::Yielded {
                    cycle_id: Uuid::nil(),
                    next_phase: DreamPhase::Replaying,
                    reason: super::super::dream_engine::YieldReason::LiveTraffic,
                });
            }
            Ok(CycleOutcome::Completed(DreamReport {
                cycle_id: Uuid::nil(),
                trigger,
                experiences: 0,
                nodes: 0,
                merged_nodes: 0,
                insights: Vec::new(),
                applied_insights: 0,
                promoted: Vec::new(),
                transferred: 0,
                compaction: None,
                duration: Duration::ZERO,
            }))
        }
    }

    fn worker(dreamer: Arc<MockDreamer>) -> Arc<ConsolidationWorker> {
        let capture = Arc::new(ExperienceCapture::new(
            knowledge_base(),
            Arc::new(NoopClassifier),
            Duration::from_secs(3600),
        ));
        let config = DreamConfig {
            resume_delay: Duration::from_millis(20),
            ..DreamConfig::default()
        };
        Arc::new(ConsolidationWorker::new(dreamer, capture, config))
    }

    #[tokio::test]
    async fn test_trigger_runs_a_cycle() {
        let dreamer = Arc::new(MockDreamer::new(0));
        let worker = worker(dreamer.clone());
        let handle = worker.handle();
        let task = worker.clone().start();

        assert!(handle.trigger(ConsolidationTrigger::Manual));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*dreamer.calls.lock().await, vec![ConsolidationTrigger::Manual]);
        worker.shutdown_token().cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_yielded_cycle_is_resumed() {
        let dreamer = Arc::new(MockDreamer::new(2));
        let worker = worker(dreamer.clone());
        let handle = worker.handle();
        let task = worker.clone().start();

        handle.trigger(ConsolidationTrigger::QualityGateFailure);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let calls = dreamer.calls.lock().await.clone();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|t| *t == ConsolidationTrigger::QualityGateFailure));
        worker.shutdown_token().cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_stops_worker() {
        let dreamer = Arc::new(MockDreamer {
            calls: tokio::sync::Mutex::new(Vec::new()),
            yields: 0,
            fatal: true,
        });
        let worker = worker(dreamer);
        let handle = worker.handle();
        let task = worker.clone().start();

        handle.trigger(ConsolidationTrigger::Manual);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("worker should stop on corruption")
            .unwrap();
    }

    #[tokio::test]
    async fn test_detached_handle_discards_triggers() {
        assert!(!ConsolidationHandle::detached().trigger(ConsolidationTrigger::Manual));
    }

    #[tokio::test]
    async fn test_second_start_is_a_no_op() {
        let worker = worker(Arc::new(MockDreamer::new(0)));
        let first = worker.clone().start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        worker.clone().start().await.unwrap();

        worker.shutdown_token().cancel();
        first.await.unwrap();
    }
}
