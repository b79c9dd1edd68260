// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Static domain compatibility matrix for cross-domain transfer.

use serde::{Deserialize, Serialize};

use super::qe_domain::QeDomain;

pub const DEFAULT_TRANSFER_WEIGHT: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainTransferEdge {
    pub source: QeDomain,
    pub target: QeDomain,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    DEFAULT_TRANSFER_WEIGHT
}

impl DomainTransferEdge {
    pub fn new(source: QeDomain, target: QeDomain, weight: f64) -> Self {
        Self { source, target, weight }
    }
}

/// Compatibility matrix shipped with the cortex when the config has none.
pub fn default_transfer_matrix(weight: f64) -> Vec<DomainTransferEdge> {
    use QeDomain::*;

    let pairs: &[(QeDomain, QeDomain)] = &[
        (TestGeneration, TestExecution),
        (TestExecution, TestGeneration),
        (TestGeneration, CoverageAnalysis),
        (CoverageAnalysis, TestGeneration),
        (CoverageAnalysis, QualityAssessment),
        (DefectIntelligence, QualityAssessment),
        (QualityAssessment, DefectIntelligence),
        (CodeIntelligence, TestGeneration),
        (CodeIntelligence, DefectIntelligence),
        (RequirementsValidation, TestGeneration),
        (ContractTesting, TestExecution),
        (TestExecution, ContractTesting),
        (SecurityCompliance, ChaosResilience),
        (ChaosResilience, SecurityCompliance),
        (VisualAccessibility, QualityAssessment),
    ];

    pairs
        .iter()
        .map(|&(source, target)| DomainTransferEdge::new(source, target, weight))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matrix_has_no_self_edges() {
        let edges = default_transfer_matrix(DEFAULT_TRANSFER_WEIGHT);
        assert!(!edges.is_empty());
        assert!(edges.iter().all(|e| e.source != e.target));
        assert!(edges.iter().all(|e| e.weight == 0.8));
    }

    #[test]
    fn test_weight_defaults_when_omitted() {
        let edge: DomainTransferEdge =
            serde_yaml::from_str("source: test-generation\ntarget: test-execution\n").unwrap();
        assert_eq!(edge.weight, DEFAULT_TRANSFER_WEIGHT);
    }
}
