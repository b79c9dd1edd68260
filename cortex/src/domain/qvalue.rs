// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Tabular Q-learning entries keyed by `(domain, state, action)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::qe_domain::QeDomain;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QKey {
    pub domain: QeDomain,
    pub state_key: String,
    pub action_key: String,
}

impl QKey {
    pub fn new(domain: QeDomain, state_key: impl Into<String>, action_key: impl Into<String>) -> Self {
        Self {
            domain,
            state_key: state_key.into(),
            action_key: action_key.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QValue {
    pub key: QKey,
    pub value: f64,
    pub visits: u64,
    pub updated_at: DateTime<Utc>,
}

impl QValue {
    pub fn new(key: QKey, value: f64) -> Self {
        Self {
            key,
            value,
            visits: 0,
            updated_at: Utc::now(),
        }
    }

    /// One Bellman step: `Q ← Q + α·(target − Q)`
    pub fn bellman_update(&mut self, alpha: f64, target: f64) -> f64 {
        let old = self.value;
        self.value = old + alpha * (target - old);
        self.visits += 1;
        self.updated_at = Utc::now();
        old
    }
}
