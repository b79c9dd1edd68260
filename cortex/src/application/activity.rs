// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Live-request tracking and the corruption halt latch.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::error;

use crate::domain::error::CortexError;

/// Counts live-path requests in flight; the dream engine yields while
/// this is non-zero.
#[derive(Debug, Clone, Default)]
pub struct LiveActivity {
    in_flight: Arc<AtomicUsize>,
}

impl LiveActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> ActivityGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight() > 0
    }
}

#[must_use = "the request counts as in flight only while the guard is alive"]
#[derive(Debug)]
pub struct ActivityGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Once tripped by a corruption error, every later operation fails with
/// [`CortexError::Halted`].
#[derive(Debug, Default)]
pub struct HaltLatch {
    halted: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl HaltLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn ensure_running(&self) -> Result<(), CortexError> {
        if self.is_halted() {
            return Err(CortexError::Halted);
        }
        Ok(())
    }

    pub fn trip(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!(%reason, "Persistence corruption detected, cortex halted");
            *self.reason.lock() = Some(reason);
        }
    }

    /// Pass a result through, tripping the latch on corruption
    pub fn observe<T>(&self, result: Result<T, CortexError>) -> Result<T, CortexError> {
        if let Err(CortexError::Corruption(reason)) = &result {
            self.trip(reason.clone());
        }
        result
    }
}
