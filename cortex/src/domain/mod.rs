// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Aggregates, value objects, events and the persistence contract of the
//! cortex.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and invariants; no I/O

pub mod config;
pub mod dream;
pub mod error;
pub mod events;
pub mod experience;
pub mod graph;
pub mod insight;
pub mod pattern;
pub mod qe_domain;
pub mod qvalue;
pub mod repository;
pub mod transfer;

pub use config::*;
pub use dream::*;
pub use error::*;
pub use events::*;
pub use experience::*;
pub use graph::*;
pub use insight::*;
pub use pattern::*;
pub use qe_domain::*;
pub use qvalue::*;
pub use repository::*;
pub use transfer::*;
