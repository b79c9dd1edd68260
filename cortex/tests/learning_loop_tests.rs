// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use aegis_cortex::application::cortex_service::{CortexService, StandardCortexService};
use aegis_cortex::application::runtime::CortexRuntime;
use aegis_cortex::domain::config::CortexConfigManifest;
use aegis_cortex::domain::experience::TaskOutcome;
use aegis_cortex::domain::pattern::{ActionBinding, NewPattern, PatternId, PatternStatus};
use aegis_cortex::domain::qe_domain::QeDomain;
use std::sync::Arc;

const DIM: usize = 16;

async fn runtime() -> CortexRuntime {
    let mut manifest = CortexConfigManifest::default();
    manifest.spec.embedding.dimension = DIM;
    CortexRuntime::in_memory(&manifest).await.unwrap()
}

/// Unit vector with cosine `similarity` to axis 0; distinct `slot`s are
/// mutually far apart
fn near_axis(similarity: f32, slot: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[0] = similarity;
    v[1 + slot % (DIM - 1)] = (1.0 - similarity * similarity).sqrt();
    v
}

fn axis() -> Vec<f32> {
    near_axis(1.0, 0)
}

async fn store_bound(
    service: &StandardCortexService,
    domain: QeDomain,
    embedding: Vec<f32>,
    action: &str,
    confidence: f64,
) -> PatternId {
    service
        .store_pattern(NewPattern {
            domain,
            embedding,
            payload: action.as_bytes().to_vec(),
            tags: Vec::new(),
            binding: Some(ActionBinding::new("uncovered-branch", action)),
            polarity: Default::default(),
            confidence: Some(confidence),
        })
        .await
        .unwrap()
}

async fn run_task(service: &StandardCortexService, domain: QeDomain, action: &str, outcome: TaskOutcome) {
    let reward = if outcome.is_success() { 1.0 } else { -1.0 };
    let handle = service.begin_task("task", domain).await.unwrap();
    service
        .record_step(handle, "uncovered-branch", action, reward)
        .await
        .unwrap();
    service.complete_task(handle, outcome).await.unwrap();
}

#[tokio::test]
async fn test_quarantine_excludes_until_ten_successes() {
    let runtime = runtime().await;
    let service = runtime.service();

    let mut ids = Vec::new();
    for i in 0..10 {
        let similarity = 0.95 - 0.02 * i as f32;
        let action = format!("strategy-{}", i);
        ids.push(store_bound(&service, QeDomain::TestGeneration, near_axis(similarity, i), &action, 0.8).await);
    }
    assert_eq!(ids.iter().collect::<std::collections::HashSet<_>>().len(), 10);

    for i in 0..3 {
        run_task(
            &service,
            QeDomain::TestGeneration,
            &format!("strategy-{}", i),
            TaskOutcome::failure("assertion failed"),
        )
        .await;
    }
    for id in &ids[..3] {
        let pattern = service.get_pattern(*id).await.unwrap();
        assert_eq!(pattern.status, PatternStatus::Quarantined);
        assert_eq!(pattern.confidence, 0.0);
    }

    let results = service
        .retrieve_patterns(QeDomain::TestGeneration, &axis(), 5, 0.6)
        .await
        .unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| !ids[..3].contains(&r.id)));
    assert!(results.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    assert_eq!(results[0].id, ids[3]);

    for _ in 0..9 {
        run_task(&service, QeDomain::TestGeneration, "strategy-0", TaskOutcome::Success).await;
    }
    assert_eq!(service.get_pattern(ids[0]).await.unwrap().status, PatternStatus::Quarantined);
    let results = service
        .retrieve_patterns(QeDomain::TestGeneration, &axis(), 5, 0.6)
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.id != ids[0]));

    run_task(&service, QeDomain::TestGeneration, "strategy-0", TaskOutcome::Success).await;
    let restored = service.get_pattern(ids[0]).await.unwrap();
    assert_eq!(restored.status, PatternStatus::ShortTerm);

    let results = service
        .retrieve_patterns(QeDomain::TestGeneration, &axis(), 5, 0.6)
        .await
        .unwrap();
    assert_eq!(results[0].id, ids[0]);
}

#[tokio::test]
async fn test_infra_failures_do_not_teach() {
    let runtime = runtime().await;
    let service = runtime.service();
    let id = store_bound(&service, QeDomain::TestExecution, axis(), "rerun-flaky", 0.5).await;

    let handle = service.begin_task("task", QeDomain::TestExecution).await.unwrap();
    service.use_pattern(handle, id).await.unwrap();
    service
        .record_step(handle, "uncovered-branch", "rerun-flaky", -1.0)
        .await
        .unwrap();
    let completion = service
        .complete_task(handle, TaskOutcome::failure("Connection refused by test database"))
        .await
        .unwrap();

    assert!(completion.outcome.is_infra_error());
    assert!(completion.learning.skipped);
    let pattern = service.get_pattern(id).await.unwrap();
    assert_eq!(pattern.confidence, 0.5);
    assert_eq!(pattern.usage_count, 0);
    assert!(service
        .recommend_action(QeDomain::TestExecution, "uncovered-branch")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_confidence_stays_in_unit_interval() {
    let runtime = runtime().await;
    let service = runtime.service();
    let id = store_bound(&service, QeDomain::SecurityCompliance, axis(), "scan-deps", 0.5).await;

    for _ in 0..150 {
        let outcome = if rand::random::<f64>() < 0.6 {
            TaskOutcome::Success
        } else {
            TaskOutcome::failure("vulnerable dependency missed")
        };
        run_task(&service, QeDomain::SecurityCompliance, "scan-deps", outcome).await;
        let confidence = service.get_pattern(id).await.unwrap().confidence;
        assert!((0.0..=1.0).contains(&confidence), "confidence {} escaped [0, 1]", confidence);
    }
}

#[tokio::test]
async fn test_safety_critical_failures_weigh_double() {
    let runtime = runtime().await;
    let service = runtime.service();

    for domain in [QeDomain::TestGeneration, QeDomain::ChaosResilience] {
        let handle = service.begin_task("q", domain).await.unwrap();
        service.record_step(handle, "pod-up", "kill-pod", -1.0).await.unwrap();
        service.complete_task(handle, TaskOutcome::failure("wrong")).await.unwrap();
    }

    let regular = service
        .recommend_action(QeDomain::TestGeneration, "pod-up")
        .await
        .unwrap()
        .unwrap();
    let critical = service
        .recommend_action(QeDomain::ChaosResilience, "pod-up")
        .await
        .unwrap()
        .unwrap();
    assert!((regular.value + 1.0).abs() < 1e-9);
    assert!((critical.value + 2.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_concurrent_tasks_share_one_store() {
    let runtime = runtime().await;
    let service = runtime.service();
    let id = store_bound(&service, QeDomain::CoverageAnalysis, axis(), "diff-coverage", 0.2).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service: Arc<StandardCortexService> = service.clone();
        tasks.push(tokio::spawn(async move {
            run_task(&service, QeDomain::CoverageAnalysis, "diff-coverage", TaskOutcome::Success).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let pattern = service.get_pattern(id).await.unwrap();
    assert_eq!(pattern.usage_count, 8);
    assert!((pattern.confidence - 1.0).abs() < 1e-9);
}
