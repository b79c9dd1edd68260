// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use aegis_cortex::application::cortex_service::CortexService;
use aegis_cortex::application::runtime::CortexRuntime;
use aegis_cortex::domain::config::CortexConfigManifest;
use aegis_cortex::domain::error::CortexError;
use aegis_cortex::domain::experience::TaskOutcome;
use aegis_cortex::domain::pattern::NewPattern;
use aegis_cortex::domain::qe_domain::QeDomain;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

fn manifest(dir: &Path) -> CortexConfigManifest {
    let mut manifest = CortexConfigManifest::default();
    manifest.spec.storage.database_path = dir.join("cortex.db");
    manifest.spec.embedding.dimension = 3;
    manifest
}

fn new_pattern(embedding: Vec<f32>, payload: &[u8]) -> NewPattern {
    NewPattern {
        domain: QeDomain::RequirementsValidation,
        embedding,
        payload: payload.to_vec(),
        tags: vec!["acceptance".into()],
        binding: None,
        polarity: Default::default(),
        confidence: Some(0.75),
    }
}

#[tokio::test]
async fn test_pattern_survives_restart_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let embedding = vec![0.123_456_79_f32, -0.5, 0.333_333_34];
    let payload = vec![0u8, 255, 7, 42, 128];

    let id = {
        let runtime = CortexRuntime::bootstrap(&manifest(dir.path())).await.unwrap();
        let id = runtime
            .service()
            .store_pattern(new_pattern(embedding.clone(), &payload))
            .await
            .unwrap();
        runtime.shutdown().await;
        id
    };

    let runtime = CortexRuntime::bootstrap(&manifest(dir.path())).await.unwrap();
    let service = runtime.service();
    let stored = service.get_pattern(id).await.unwrap();
    assert_eq!(stored.payload, payload);
    assert_eq!(stored.embedding, embedding);
    assert_eq!(stored.tags, vec!["acceptance".to_string()]);

    let hits = service
        .retrieve_patterns(QeDomain::RequirementsValidation, &embedding, 1, 0.5)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, id);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_open_trajectory_completes_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let handle = {
        let runtime = CortexRuntime::bootstrap(&manifest(dir.path())).await.unwrap();
        let handle = runtime
            .service()
            .begin_task("long-running", QeDomain::TestExecution)
            .await
            .unwrap();
        runtime.shutdown().await;
        handle
    };

    let runtime = CortexRuntime::bootstrap(&manifest(dir.path())).await.unwrap();
    let service = runtime.service();
    let completion = service.complete_task(handle, TaskOutcome::Success).await.unwrap();
    assert_eq!(completion.outcome, TaskOutcome::Success);

    let metrics = service.get_metrics().await.unwrap();
    assert_eq!(metrics.counts.open_experiences, 0);
    assert_eq!(metrics.counts.unconsolidated_experiences, 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_orphans_are_sealed_on_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = manifest(dir.path());
    config.spec.capture.orphan_timeout = Duration::from_millis(1);

    let handle = {
        let runtime = CortexRuntime::bootstrap(&config).await.unwrap();
        let handle = runtime
            .service()
            .begin_task("abandoned", QeDomain::ContractTesting)
            .await
            .unwrap();
        runtime.shutdown().await;
        handle
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let runtime = CortexRuntime::bootstrap(&config).await.unwrap();
    let experience = runtime
        .components()
        .knowledge
        .store()
        .get_experience(handle)
        .await
        .unwrap();
    assert!(experience.outcome.is_some_and(|o| o.is_infra_error()));

    let metrics = runtime.service().get_metrics().await.unwrap();
    assert_eq!(metrics.counts.open_experiences, 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_dimension_change_is_rejected_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    {
        let runtime = CortexRuntime::bootstrap(&manifest(dir.path())).await.unwrap();
        runtime
            .service()
            .store_pattern(new_pattern(vec![1.0, 0.0, 0.0], b"x"))
            .await
            .unwrap();
        runtime.shutdown().await;
    }

    let mut wider = manifest(dir.path());
    wider.spec.embedding.dimension = 8;
    assert!(CortexRuntime::bootstrap(&wider).await.is_err());
}

#[tokio::test]
async fn test_tampered_payload_halts_the_service() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = CortexRuntime::bootstrap(&manifest(dir.path())).await.unwrap();
    let service = runtime.service();
    let id = service
        .store_pattern(new_pattern(vec![1.0, 0.0, 0.0], b"assert totals"))
        .await
        .unwrap();

    let raw = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(dir.path().join("cortex.db")))
        .await
        .unwrap();
    sqlx::query("UPDATE patterns SET payload = ? WHERE id = ?")
        .bind(b"assert nothing".to_vec())
        .bind(id.to_string())
        .execute(&raw)
        .await
        .unwrap();
    raw.close().await;

    assert!(matches!(service.get_pattern(id).await, Err(CortexError::Corruption(_))));
    assert!(runtime.is_halted());

    assert!(matches!(service.get_pattern(id).await, Err(CortexError::Halted)));
    assert!(matches!(
        service.begin_task("after tamper", QeDomain::RequirementsValidation).await,
        Err(CortexError::Halted)
    ));
    assert!(matches!(
        service
            .retrieve_patterns(QeDomain::RequirementsValidation, &[1.0, 0.0, 0.0], 1, 0.0)
            .await,
        Err(CortexError::Halted)
    ));
    assert!(matches!(
        service.store_pattern(new_pattern(vec![0.0, 1.0, 0.0], b"x")).await,
        Err(CortexError::Halted)
    ));
    runtime.shutdown().await;

    assert!(CortexRuntime::bootstrap(&manifest(dir.path())).await.is_err());
}
