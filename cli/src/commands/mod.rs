// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the cortex CLI

pub mod config;
pub mod consolidate;
pub mod inspect;
pub mod serve;

pub use self::config::ConfigCommand;
pub use self::inspect::{InsightsArgs, PatternsArgs};
pub use self::serve::ServeArgs;
