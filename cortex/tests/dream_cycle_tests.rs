// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use aegis_cortex::application::cortex_service::CortexService;
use aegis_cortex::application::promotion::{BlockReason, PromotionDecision};
use aegis_cortex::application::runtime::CortexRuntime;
use aegis_cortex::domain::config::CortexConfigManifest;
use aegis_cortex::domain::dream::ConsolidationTrigger;
use aegis_cortex::domain::events::CortexEvent;
use aegis_cortex::domain::experience::TaskOutcome;
use aegis_cortex::domain::insight::InsightKind;
use aegis_cortex::domain::pattern::{Pattern, PatternStatus, Polarity};
use aegis_cortex::domain::qe_domain::QeDomain;
use aegis_cortex::domain::repository::PatternFilter;

async fn runtime() -> CortexRuntime {
    let mut manifest = CortexConfigManifest::default();
    manifest.spec.embedding.dimension = 4;
    CortexRuntime::in_memory(&manifest).await.unwrap()
}

/// Write a pattern straight to the store, bypassing deduplication
async fn plant(runtime: &CortexRuntime, pattern: Pattern) -> Pattern {
    let kb = &runtime.components().knowledge;
    kb.store().put_pattern(&pattern).await.unwrap();
    kb.index_pattern(&pattern).unwrap();
    pattern
}

#[tokio::test]
async fn test_near_duplicates_collapse_into_one_concept() {
    let runtime = runtime().await;
    let service = runtime.service();
    let a = plant(
        &runtime,
        Pattern::new(QeDomain::TestGeneration, vec![1.0, 0.0, 0.0, 0.0], b"a".to_vec(), 0.6),
    )
    .await;
    let b = plant(
        &runtime,
        Pattern::new(QeDomain::TestGeneration, vec![0.96, 0.28, 0.0, 0.0], b"b".to_vec(), 0.6),
    )
    .await;

    for _ in 0..3 {
        let handle = service.begin_task("pair", QeDomain::TestGeneration).await.unwrap();
        service.use_pattern(handle, a.id).await.unwrap();
        service.use_pattern(handle, b.id).await.unwrap();
        service.complete_task(handle, TaskOutcome::Success).await.unwrap();
    }

    let report = runtime
        .components()
        .dream
        .run_to_completion(ConsolidationTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(report.experiences, 3);
    assert_eq!(report.merged_nodes, 1);
    assert!(report
        .insights
        .iter()
        .any(|i| matches!(i.kind, InsightKind::Optimization { .. })));

    let metrics = service.get_metrics().await.unwrap();
    assert_eq!(metrics.counts.unconsolidated_experiences, 0);
    assert!(metrics.last_consolidation_at.is_some());
    assert!(!metrics.consolidation_pending);

    let insights = service.get_insights(Some(QeDomain::TestGeneration), None).await.unwrap();
    assert_eq!(insights.len(), report.insights.len());
}

#[tokio::test]
async fn test_promoted_pattern_transfers_as_short_term() {
    let runtime = runtime().await;
    let service = runtime.service();

    let mut proven = Pattern::new(QeDomain::CodeIntelligence, vec![0.0, 1.0, 0.0, 0.0], b"trace".to_vec(), 0.9);
    proven.usage_count = 6;
    proven.success_count = 6;
    let proven = plant(&runtime, proven).await;

    let decision = service.promote_pattern(proven.id).await.unwrap();
    assert!(decision.is_promoted());

    let copies = service
        .list_patterns(PatternFilter::default())
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.transferred_from == Some(proven.id))
        .collect::<Vec<_>>();
    let mut targets: Vec<_> = copies.iter().map(|c| c.domain).collect();
    targets.sort_by_key(|d| d.as_str());
    assert_eq!(targets, vec![QeDomain::DefectIntelligence, QeDomain::TestGeneration]);
    for copy in &copies {
        assert_eq!(copy.status, PatternStatus::ShortTerm);
        assert!((copy.confidence - 0.72).abs() < 1e-9);
        assert_eq!(copy.payload, proven.payload);
    }

    let history = service.pattern_history(copies[0].id).await.unwrap();
    assert!(matches!(history.first(), Some(CortexEvent::PatternTransferred { .. })));
}

#[tokio::test]
async fn test_contradiction_keeps_candidate_short_term() {
    let runtime = runtime().await;
    let service = runtime.service();

    let mut avoid = Pattern::new(QeDomain::QualityAssessment, vec![0.0, 0.0, 1.0, 0.0], Vec::new(), 0.9)
        .with_polarity(Polarity::Negative);
    avoid.status = PatternStatus::LongTerm;
    let avoid = plant(&runtime, avoid).await;

    let mut candidate = Pattern::new(QeDomain::QualityAssessment, vec![0.0, 0.1, 0.995, 0.0], Vec::new(), 0.9);
    candidate.usage_count = 5;
    candidate.success_count = 5;
    let candidate = plant(&runtime, candidate).await;

    match service.promote_pattern(candidate.id).await.unwrap() {
        PromotionDecision::Blocked(BlockReason::Contradiction { conflicting, .. }) => {
            assert_eq!(conflicting, avoid.id)
        }
        other => panic!("expected a contradiction, got {:?}", other),
    }
    assert_eq!(
        service.get_pattern(candidate.id).await.unwrap().status,
        PatternStatus::ShortTerm
    );
}

#[tokio::test]
async fn test_dream_cycle_with_no_experience_completes() {
    let runtime = runtime().await;
    let report = runtime
        .components()
        .dream
        .run_to_completion(ConsolidationTrigger::Timer)
        .await
        .unwrap();

    assert_eq!(report.experiences, 0);
    assert!(report.insights.is_empty());
    assert!(runtime.components().dream.checkpoint().await.unwrap().is_none());
}
