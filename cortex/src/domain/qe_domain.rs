// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Quality-engineering knowledge domains.
//!
//! Every pattern, experience and Q-value belongs to exactly one domain. The
//! set is closed: agents tag their work with one of these and the learning
//! loop keeps per-domain statistics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QeDomain {
    TestGeneration,
    TestExecution,
    CoverageAnalysis,
    QualityAssessment,
    DefectIntelligence,
    RequirementsValidation,
    CodeIntelligence,
    SecurityCompliance,
    ContractTesting,
    VisualAccessibility,
    ChaosResilience,
    LearningOptimization,
}

impl QeDomain {
    pub const ALL: [QeDomain; 12] = [
        QeDomain::TestGeneration,
        QeDomain::TestExecution,
        QeDomain::CoverageAnalysis,
        QeDomain::QualityAssessment,
        QeDomain::DefectIntelligence,
        QeDomain::RequirementsValidation,
        QeDomain::CodeIntelligence,
        QeDomain::SecurityCompliance,
        QeDomain::ContractTesting,
        QeDomain::VisualAccessibility,
        QeDomain::ChaosResilience,
        QeDomain::LearningOptimization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QeDomain::TestGeneration => "test-generation",
            QeDomain::TestExecution => "test-execution",
            QeDomain::CoverageAnalysis => "coverage-analysis",
            QeDomain::QualityAssessment => "quality-assessment",
            QeDomain::DefectIntelligence => "defect-intelligence",
            QeDomain::RequirementsValidation => "requirements-validation",
            QeDomain::CodeIntelligence => "code-intelligence",
            QeDomain::SecurityCompliance => "security-compliance",
            QeDomain::ContractTesting => "contract-testing",
            QeDomain::VisualAccessibility => "visual-accessibility",
            QeDomain::ChaosResilience => "chaos-resilience",
            QeDomain::LearningOptimization => "learning-optimization",
        }
    }
}

impl fmt::Display for QeDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown domain: '{0}'")]
pub struct UnknownDomain(pub String);

impl FromStr for QeDomain {
    type Err = UnknownDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QeDomain::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| UnknownDomain(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_round_trips_through_str() {
        for domain in QeDomain::ALL {
            assert_eq!(domain.as_str().parse::<QeDomain>().unwrap(), domain);
        }
    }

    #[test]
    fn test_unknown_domain() {
        let err = "fuzzing".parse::<QeDomain>().unwrap_err();
        assert_eq!(err.0, "fuzzing");
    }

    #[test]
    fn test_serde_matches_display() {
        let json = serde_json::to_string(&QeDomain::SecurityCompliance).unwrap();
        assert_eq!(json, "\"security-compliance\"");
    }
}
