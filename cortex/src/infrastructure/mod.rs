// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Infrastructure layer for the Cortex bounded context

pub mod event_bus;
pub mod hnsw;
pub mod infra_classifier;
pub mod memory_store;
pub mod semantic_index;
pub mod sqlite_store;
pub mod telemetry;

pub use event_bus::{EventBus, EventBusError, EventReceiver, PatternEventReceiver};
pub use hnsw::{HnswGraph, HnswParams};
pub use infra_classifier::{InfraErrorClassifier, NoopClassifier, SignatureClassifier};
pub use memory_store::InMemoryCortexStore;
pub use semantic_index::{CompactionReport, IndexEntryMeta, IndexError, IndexFilter, IndexHit, SemanticIndex};
pub use sqlite_store::SqliteCortexStore;
