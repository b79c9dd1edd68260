// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application services of the cortex
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Orchestrate domain types over the store and the semantic index

pub mod activity;
pub mod consolidation_worker;
pub mod cortex_service;
pub mod dream_engine;
pub mod experience_capture;
pub mod knowledge;
pub mod learning;
pub mod promotion;
pub mod runtime;
pub mod transfer;

pub use activity::{ActivityGuard, HaltLatch, LiveActivity};
pub use consolidation_worker::{ConsolidationHandle, ConsolidationWorker, DreamCycleRunner};
pub use cortex_service::{
    CortexComponents, CortexMetrics, CortexService, ServiceSettings, StandardCortexService, TaskCompletion,
};
pub use dream_engine::{CycleOutcome, DreamEngine, DreamReport, YieldReason};
pub use experience_capture::ExperienceCapture;
pub use knowledge::{InsertOutcome, KnowledgeBase, SearchRetry};
pub use learning::{ActionRecommendation, LearningEngine, LearningReport};
pub use promotion::{BlockReason, PromotionDecision, PromotionGate};
pub use runtime::CortexRuntime;
pub use transfer::TransferService;
