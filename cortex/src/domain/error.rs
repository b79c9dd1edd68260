// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service-facing error taxonomy for the cortex.
//!
//! `NotFound`, `Conflict` and `InvalidState` are surfaced to callers as
//! explicit values. `Corruption` is fatal: once seen, the service latches
//! into the halted state and answers every later call with `Halted`.
//! Infrastructure failures of a *task* are not errors at all; they are the
//! `TaskOutcome::InfraError` classification.

use super::repository::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CortexError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Semantic index unavailable (compaction in progress)")]
    IndexUnavailable,

    #[error("Persistence corruption detected: {0}")]
    Corruption(String),

    #[error("Cortex halted after unrecoverable corruption")]
    Halted,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CortexError {
    /// Whether this error must stop the service
    pub fn is_fatal(&self) -> bool {
        matches!(self, CortexError::Corruption(_) | CortexError::Halted)
    }
}

impl From<StoreError> for CortexError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => CortexError::NotFound(what),
            StoreError::Conflict(what) => CortexError::Conflict(what),
            StoreError::Corruption(what) => CortexError::Corruption(what),
            StoreError::Busy(what) | StoreError::Database(what) | StoreError::Serialization(what) => {
                CortexError::Storage(what)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        assert!(matches!(
            CortexError::from(StoreError::NotFound("pattern x".into())),
            CortexError::NotFound(_)
        ));
        assert!(matches!(
            CortexError::from(StoreError::Conflict("dup".into())),
            CortexError::Conflict(_)
        ));
        assert!(CortexError::from(StoreError::Corruption("checksum".into())).is_fatal());
        assert!(!CortexError::from(StoreError::Busy("locked".into())).is_fatal());
    }
}
