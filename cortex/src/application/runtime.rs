// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Cortex Runtime - Bootstrap and lifecycle
//!
//! Builds the whole learning loop from a validated manifest: opens the
//! store, rebuilds the semantic index from every stored pattern, persists
//! the transfer matrix, wires the services and seals trajectories orphaned
//! by a previous crash. The consolidation worker is started separately so
//! one-shot commands can use the runtime without background dreaming.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Composition root for the cortex

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::config::{CortexConfigManifest, CortexConfigSpec};
use crate::domain::experience::TrajectoryId;
use crate::domain::repository::{CortexStore, PatternFilter, WriteBatch, WriteOp};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::infra_classifier::SignatureClassifier;
use crate::infrastructure::memory_store::InMemoryCortexStore;
use crate::infrastructure::semantic_index::SemanticIndex;
use crate::infrastructure::sqlite_store::SqliteCortexStore;
use crate::infrastructure::telemetry;

use super::consolidation_worker::ConsolidationWorker;
use super::cortex_service::{CortexComponents, ServiceSettings, StandardCortexService};
use super::dream_engine::DreamEngine;
use super::experience_capture::ExperienceCapture;
use super::knowledge::{meta_of, KnowledgeBase, SearchRetry};
use super::learning::LearningEngine;
use super::promotion::PromotionGate;
use super::transfer::TransferService;

pub struct CortexRuntime {
    spec: CortexConfigSpec,
    service: Arc<StandardCortexService>,
    worker: Arc<ConsolidationWorker>,
    worker_task: Mutex<Option<JoinHandle<()>>>,
    sqlite: Option<Arc<SqliteCortexStore>>,
    recovered_at_startup: Vec<TrajectoryId>,
}

impl CortexRuntime {
    /// Validate the manifest and start on the configured SQLite database
    pub async fn bootstrap(manifest: &CortexConfigManifest) -> Result<Self> {
        manifest.validate().context("Invalid cortex configuration")?;
        let spec = manifest.spec.clone();

        let sqlite = SqliteCortexStore::connect(&spec.storage)
            .await
            .with_context(|| format!("Failed to open cortex database {}", spec.storage.database_path.display()))?;
        let sqlite = Arc::new(sqlite);
        let store: Arc<dyn CortexStore> = sqlite.clone();
        Self::assemble(spec, store, Some(sqlite)).await
    }

    /// Same wiring over a volatile in-memory store
    pub async fn in_memory(manifest: &CortexConfigManifest) -> Result<Self> {
        manifest.validate().context("Invalid cortex configuration")?;
        Self::assemble(manifest.spec.clone(), Arc::new(InMemoryCortexStore::new()), None).await
    }

    async fn assemble(
        spec: CortexConfigSpec,
        store: Arc<dyn CortexStore>,
        sqlite: Option<Arc<SqliteCortexStore>>,
    ) -> Result<Self> {
        telemetry::describe_metrics();

        let edges = spec.transfer.edges();
        store
            .apply(WriteBatch::single(WriteOp::ReplaceTransferEdges(edges.clone())))
            .await
            .context("Failed to persist transfer matrix")?;

        let index = Arc::new(SemanticIndex::new(spec.embedding.dimension, &spec.index));
        let patterns = store
            .query_patterns(&PatternFilter::default())
            .await
            .context("Failed to load patterns for index rebuild")?;
        let indexed = index
            .rebuild(patterns.iter().map(|p| (p.id, p.embedding.clone(), meta_of(p))))
            .context("Stored pattern does not match the configured embedding dimension")?;

        let knowledge = Arc::new(
            KnowledgeBase::new(store, index, EventBus::with_default_capacity()).with_search_retry(SearchRetry {
                attempts: spec.index.search_retries,
                backoff: spec.index.retry_backoff,
            }),
        );

        let classifier = SignatureClassifier::new(&spec.infra.failure_signatures)
            .context("Invalid infrastructure failure signature")?;
        let capture = Arc::new(ExperienceCapture::new(
            knowledge.clone(),
            Arc::new(classifier),
            spec.capture.orphan_timeout,
        ));
        let learning = Arc::new(LearningEngine::new(knowledge.clone(), spec.learning.clone()));
        let gate = Arc::new(PromotionGate::new(knowledge.clone(), spec.promotion.clone()));
        let transfer = Arc::new(TransferService::new(knowledge.clone(), edges));
        let dream = Arc::new(DreamEngine::new(
            knowledge.clone(),
            gate.clone(),
            transfer.clone(),
            spec.dream.clone(),
            spec.learning.clone(),
        ));

        let worker = Arc::new(ConsolidationWorker::new(dream.clone(), capture.clone(), spec.dream.clone()));
        let components = CortexComponents {
            knowledge,
            capture: capture.clone(),
            learning,
            gate,
            transfer,
            dream: dream.clone(),
        };
        let service = Arc::new(StandardCortexService::new(
            components,
            worker.handle(),
            ServiceSettings::from_spec(&spec),
        ));

        let orphans = capture.recover_orphans().await.context("Orphan recovery failed")?;
        if dream.has_pending_cycle().await? {
            info!("Interrupted dream cycle found; it resumes on the next run");
        }
        info!(
            patterns = indexed,
            orphans_sealed = orphans.len(),
            dimension = spec.embedding.dimension,
            "Cortex runtime ready"
        );

        Ok(Self {
            spec,
            service,
            worker,
            worker_task: Mutex::new(None),
            sqlite,
            recovered_at_startup: orphans,
        })
    }

    pub fn spec(&self) -> &CortexConfigSpec {
        &self.spec
    }

    pub fn service(&self) -> Arc<StandardCortexService> {
        self.service.clone()
    }

    pub fn components(&self) -> &CortexComponents {
        self.service.components()
    }

    pub fn events(&self) -> &EventBus {
        self.service.components().knowledge.events()
    }

    /// Trajectories sealed by the orphan sweep during bootstrap
    pub fn recovered_at_startup(&self) -> &[TrajectoryId] {
        &self.recovered_at_startup
    }

    pub fn is_halted(&self) -> bool {
        self.service.components().knowledge.halt().is_halted()
    }

    /// Start background consolidation; a second call is a no-op
    pub fn start_worker(&self) {
        let mut task = self.worker_task.lock();
        if task.is_none() {
            *task = Some(self.worker.clone().start());
        }
    }

    /// Whether the worker was started and has stopped on its own
    pub fn worker_finished(&self) -> bool {
        self.worker_task.lock().as_ref().is_some_and(|t| t.is_finished())
    }

    /// Stop the worker and close the database
    pub async fn shutdown(&self) {
        self.worker.shutdown_token().cancel();
        let task = self.worker_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Consolidation worker ended abnormally: {}", e);
            }
        }
        if let Some(sqlite) = &self.sqlite {
            sqlite.close().await;
        }
        info!("Cortex runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::cortex_service::CortexService;
    use crate::domain::experience::TaskOutcome;
    use crate::domain::pattern::NewPattern;
    use crate::domain::qe_domain::QeDomain;

    fn manifest(dimension: usize) -> CortexConfigManifest {
        let mut manifest = CortexConfigManifest::default();
        manifest.spec.embedding.dimension = dimension;
        manifest
    }

    #[tokio::test]
    async fn test_in_memory_runtime_serves_requests() {
        let runtime = CortexRuntime::in_memory(&manifest(4)).await.unwrap();
        let service = runtime.service();

        let id = service
            .store_pattern(NewPattern {
                domain: QeDomain::ContractTesting,
                embedding: vec![1.0, 0.0, 0.0, 0.0],
                payload: b"pin provider versions".to_vec(),
                tags: Vec::new(),
                binding: None,
                polarity: Default::default(),
                confidence: Some(0.8),
            })
            .await
            .unwrap();
        let hits = service
            .retrieve_patterns(QeDomain::ContractTesting, &[1.0, 0.0, 0.0, 0.0], 3, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);

        let edges = runtime.components().knowledge.store().load_transfer_edges().await.unwrap();
        assert_eq!(edges, runtime.spec().transfer.edges());
    }

    #[tokio::test]
    async fn test_invalid_manifest_is_rejected() {
        let mut bad = manifest(4);
        bad.kind = "NodeConfig".into();
        assert!(CortexRuntime::in_memory(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_worker_start_and_shutdown() {
        let runtime = CortexRuntime::in_memory(&manifest(4)).await.unwrap();
        runtime.start_worker();
        runtime.start_worker();

        let service = runtime.service();
        let handle = service.begin_task("t", QeDomain::TestExecution).await.unwrap();
        service.complete_task(handle, TaskOutcome::Success).await.unwrap();
        service.force_consolidation().await.unwrap();

        runtime.shutdown().await;
        assert!(!runtime.worker_finished());
    }
}
