// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Cortex
//!
//! Self-improving knowledge store for quality-engineering agents. Captures
//! task trajectories, learns per-domain action values with asymmetric
//! penalties, serves patterns through an HNSW index and consolidates
//! experience offline in resumable dream cycles.
//!
//! # Architecture
//!
//! - **Layer:** Learning & Memory Layer
//! - **Purpose:** Durable, evidence-driven pattern memory for the agent fleet

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
pub use infrastructure::*;
