// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Cross-Domain Transfer
//!
//! Copies promoted patterns into compatible domains along the static
//! transfer matrix.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Share proven strategies between related QE domains
//!
//! Copies start `short_term` with `confidence × weight` and must earn their
//! own promotion in the target domain. Propagation is idempotent: a source
//! never gets a second copy in the same target, and a copy is never sent
//! back to the domain its source lives in.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::error::CortexError;
use crate::domain::events::CortexEvent;
use crate::domain::pattern::{Pattern, PatternStatus};
use crate::domain::qe_domain::QeDomain;
use crate::domain::repository::WriteBatch;
use crate::domain::transfer::DomainTransferEdge;
use crate::infrastructure::telemetry;

use super::knowledge::KnowledgeBase;

pub struct TransferService {
    kb: Arc<KnowledgeBase>,
    edges: Vec<DomainTransferEdge>,
}

impl TransferService {
    pub fn new(kb: Arc<KnowledgeBase>, edges: Vec<DomainTransferEdge>) -> Self {
        Self { kb, edges }
    }

    pub fn edges(&self) -> &[DomainTransferEdge] {
        &self.edges
    }

    pub fn targets_of(&self, source: QeDomain) -> impl Iterator<Item = &DomainTransferEdge> {
        self.edges.iter().filter(move |e| e.source == source && e.target != source)
    }

    /// Copy a long-term pattern into every compatible domain that has no
    /// copy yet. Callers hold the write lock. Returns the new copies.
    pub async fn propagate(&self, pattern: &Pattern) -> Result<Vec<Pattern>, CortexError> {
        if pattern.status != PatternStatus::LongTerm {
            debug!(pattern_id = %pattern.id, status = pattern.status.as_str(), "Only long-term patterns propagate");
            return Ok(Vec::new());
        }

        let result = self
            .kb
            .store()
            .find_transferred_copies(pattern.id)
            .await
            .map_err(CortexError::from);
        let existing = self.kb.observe(result)?;
        let origin_domain = match pattern.transferred_from {
            Some(source) => match self.kb.get_pattern(source).await {
                Ok(source) => Some(source.domain),
                Err(CortexError::NotFound(_)) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let mut copies = Vec::new();
        for edge in self.targets_of(pattern.domain) {
            if existing.iter().any(|c| c.domain == edge.target) || origin_domain == Some(edge.target) {
                continue;
            }

            let mut copy = Pattern::new(
                edge.target,
                pattern.embedding.clone(),
                pattern.payload.clone(),
                pattern.confidence * edge.weight,
            )
            .with_polarity(pattern.polarity)
            .with_tags(pattern.tags.clone());
            copy.binding = pattern.binding.clone();
            copy.transferred_from = Some(pattern.id);

            let event = CortexEvent::PatternTransferred {
                source_pattern_id: pattern.id,
                copy_pattern_id: copy.id,
                source_domain: pattern.domain,
                target_domain: edge.target,
                confidence: copy.confidence,
                timestamp: Utc::now(),
            };
            let mut batch = WriteBatch::new();
            batch.put_pattern_audited(copy.clone(), event.clone());

            match self.kb.commit(batch, vec![event]).await {
                Ok(()) => {}
                Err(CortexError::Conflict(reason)) => {
                    debug!(pattern_id = %pattern.id, target = %edge.target, %reason, "Copy already exists");
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.kb.index_pattern(&copy)?;
            telemetry::record_transfer(edge.target);
            copies.push(copy);
        }

        if !copies.is_empty() {
            info!(
                pattern_id = %pattern.id,
                source = %pattern.domain,
                copies = copies.len(),
                "Pattern transferred to compatible domains"
            );
        }
        Ok(copies)
    }
}
