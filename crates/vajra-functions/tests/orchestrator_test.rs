// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment orchestrator tests against a registry that can reject writes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use vajra_functions::artifact::{ArtifactStore, MemoryArtifactStore};
use vajra_functions::model::{FunctionRecordBuilder, FunctionStatus, Runtime};
use vajra_functions::orchestrator::{BundleBuilder, DeployJob, JobOutcome, Orchestrator};
use vajra_functions::registry::Registry;

async fn setup(name: &str) -> (Arc<FlakyRegistry>, Orchestrator, DeployJob) {
    let registry = Arc::new(FlakyRegistry::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let code_ref = artifacts
        .put(TENANT, name, 1, &wasm_bundle(ECHO_WAT))
        .await
        .unwrap();
    let record = FunctionRecordBuilder::new(TENANT, name, Runtime::Wasm, "main").build(code_ref);
    registry.put(&record).await.unwrap();

    let orchestrator = Orchestrator::new(
        registry.clone(),
        Arc::new(BundleBuilder::new(artifacts, Duration::ZERO)),
        "https://functions.vajra.local/",
    );
    (registry, orchestrator, DeployJob::for_record(&record))
}

#[tokio::test]
async fn test_registry_failure_abandons_job() {
    let (registry, orchestrator, job) = setup("flaky").await;

    registry.fail_writes(true);
    assert_eq!(orchestrator.process_job(&job).await, JobOutcome::Abandoned);

    let record = registry.get(TENANT, "flaky").await.unwrap().value.unwrap();
    assert_eq!(record.status, FunctionStatus::Deploying);
    assert!(record.endpoint.is_none());

    // Not retried on its own; a later job picks the record up again
    registry.fail_writes(false);
    assert_eq!(orchestrator.process_job(&job).await, JobOutcome::Deployed);

    let record = registry.get(TENANT, "flaky").await.unwrap().value.unwrap();
    assert_eq!(record.status, FunctionStatus::Deployed);
    assert_eq!(
        record.endpoint.as_deref(),
        Some("https://functions.vajra.local/tenant-a/flaky/v1")
    );
}

#[tokio::test]
async fn test_abandoned_job_recovered_on_restart() {
    let (registry, orchestrator, job) = setup("restart").await;

    registry.fail_writes(true);
    assert_eq!(orchestrator.process_job(&job).await, JobOutcome::Abandoned);
    registry.fail_writes(false);

    let orchestrator = Arc::new(orchestrator);
    assert_eq!(orchestrator.recover().await.unwrap(), 1);
    let workers = orchestrator.spawn_workers(1);

    let mut status = FunctionStatus::Deploying;
    for _ in 0..200 {
        status = registry
            .get(TENANT, "restart")
            .await
            .unwrap()
            .value
            .unwrap()
            .status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, FunctionStatus::Deployed);

    orchestrator.shutdown();
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test]
async fn test_deleted_function_job_is_skipped() {
    let (registry, orchestrator, job) = setup("gone").await;
    registry.delete(TENANT, "gone").await.unwrap();
    assert_eq!(orchestrator.process_job(&job).await, JobOutcome::Skipped);
}

#[tokio::test]
async fn test_dependents_written_during_deployment_keep_status() {
    let registry = Arc::new(FlakyRegistry::new());
    let ctx = TestContext::idle(registry.clone());
    ctx.service
        .create_function(TENANT, wasm_request("overlap", ECHO_WAT))
        .await
        .unwrap();
    let job = DeployJob {
        tenant_id: TENANT.to_string(),
        name: "overlap".to_string(),
        version: 1,
    };

    // Alias and trigger writers read the record while it is still deploying
    registry.delay_reads(Duration::from_millis(300));
    let alias = {
        let service = ctx.service.clone();
        tokio::spawn(async move { service.create_alias(TENANT, "overlap", "live", 1).await })
    };
    let trigger = {
        let service = ctx.service.clone();
        tokio::spawn(async move {
            service
                .create_trigger(TENANT, "overlap", "http", serde_json::json!({"path": "/hook"}))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.delay_reads(Duration::ZERO);

    assert_eq!(ctx.orchestrator.process_job(&job).await, JobOutcome::Deployed);
    alias.await.unwrap().unwrap();
    trigger.await.unwrap().unwrap();

    let record = registry.get(TENANT, "overlap").await.unwrap().value.unwrap();
    assert_eq!(record.status, FunctionStatus::Deployed);
    assert_eq!(
        record.endpoint.as_deref(),
        Some("https://functions.vajra.local/tenant-a/overlap/v1")
    );
    assert_eq!(record.aliases.get("live"), Some(&1));
    assert_eq!(record.dependents(), (1, 1));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_alias_added_mid_build_survives_transition() {
    let (registry, orchestrator, job) = setup("midbuild").await;

    // Record is building; an alias lands before the final transition
    let mut building = registry.get(TENANT, "midbuild").await.unwrap().value.unwrap();
    building.status = FunctionStatus::Building;
    registry.put(&building).await.unwrap();
    registry.set_alias(TENANT, "midbuild", "live", 1).await.unwrap();

    assert_eq!(orchestrator.process_job(&job).await, JobOutcome::Deployed);
    let record = registry.get(TENANT, "midbuild").await.unwrap().value.unwrap();
    assert_eq!(record.status, FunctionStatus::Deployed);
    assert_eq!(record.aliases.get("live"), Some(&1));
}
