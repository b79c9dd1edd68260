// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Infrastructure failure classification.
//!
//! A task that failed because its tooling broke (daemon down, disk full,
//! network timeout) says nothing about the strategy it ran. Callers plug an
//! [`InfraErrorClassifier`] into experience capture; a matching failure is
//! recorded as `infra_error` and stays out of learning.

use regex::RegexSet;

use crate::domain::experience::TaskOutcome;

pub trait InfraErrorClassifier: Send + Sync {
    /// Whether a failure reason describes broken tooling
    fn is_infrastructure_failure(&self, reason: &str) -> bool;

    fn classify(&self, outcome: TaskOutcome) -> TaskOutcome {
        match outcome {
            TaskOutcome::Failure { reason: Some(reason) } if self.is_infrastructure_failure(&reason) => {
                TaskOutcome::InfraError { reason: Some(reason) }
            }
            other => other,
        }
    }
}

/// Classifier matching failure reasons against a set of regex signatures
pub struct SignatureClassifier {
    signatures: RegexSet,
}

impl SignatureClassifier {
    pub fn new<I, S>(signatures: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            signatures: RegexSet::new(signatures)?,
        })
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

impl InfraErrorClassifier for SignatureClassifier {
    fn is_infrastructure_failure(&self, reason: &str) -> bool {
        self.signatures.is_match(reason)
    }
}

/// Never re-classifies anything
pub struct NoopClassifier;

impl InfraErrorClassifier for NoopClassifier {
    fn is_infrastructure_failure(&self, _reason: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::InfraConfig;

    #[test]
    fn test_default_signatures() {
        let classifier = SignatureClassifier::new(&InfraConfig::default().failure_signatures).unwrap();

        assert!(classifier.is_infrastructure_failure("Cannot connect: Connection refused (os error 111)"));
        assert!(classifier.is_infrastructure_failure("write failed: No space left on device"));
        assert!(classifier.is_infrastructure_failure("container OOMKilled"));
        assert!(!classifier.is_infrastructure_failure("assertion failed: expected 3, got 4"));
    }

    #[test]
    fn test_classify_only_touches_failures_with_reason() {
        let classifier = SignatureClassifier::new(["docker daemon"]).unwrap();

        assert_eq!(
            classifier.classify(TaskOutcome::failure("docker daemon not running")),
            TaskOutcome::infra_error("docker daemon not running")
        );
        assert_eq!(
            classifier.classify(TaskOutcome::failure("flaky assertion")),
            TaskOutcome::failure("flaky assertion")
        );
        assert_eq!(classifier.classify(TaskOutcome::Failure { reason: None }), TaskOutcome::Failure { reason: None });
        assert_eq!(classifier.classify(TaskOutcome::Success), TaskOutcome::Success);
    }

    #[test]
    fn test_noop_classifier() {
        assert_eq!(
            NoopClassifier.classify(TaskOutcome::failure("docker daemon not running")),
            TaskOutcome::failure("docker daemon not running")
        );
    }
}
