//! Test: Cache invalidation - job results, failures and timeouts

use crate::helpers::*;
use sitepipe::collaborators::RecordingEdgeCache;
use sitepipe::core::{ActionState, FailureKind, RunStatus, StageStatus};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_rejected_invalidation_fails_run_after_deploy() {
    let h = harness(
        SITE_PIPELINE,
        Arc::new(CopyBuildRunner::default()),
        RecordingEdgeCache::new(DISTRIBUTION).failing("rate exceeded"),
    )
    .await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    assert_failed_at(&run, "InvalidateCDNCache", FailureKind::Execution);
    let failure = run.failure.unwrap();
    assert_eq!(failure.action.as_deref(), Some("CDNCacheBurst"));
    assert!(failure.reason.contains("rate exceeded"));

    // Deploy stays in place; nothing is rolled back
    assert_eq!(run.stages[2].status, StageStatus::Succeeded);
    assert!(h.publisher.object("index.html").await.is_some());
    assert_eq!(h.jobs.outstanding().await, 0);
}

#[tokio::test]
async fn test_late_job_result_does_not_revive_timed_out_run() {
    let h = harness(
        SITE_PIPELINE,
        Arc::new(CopyBuildRunner::default()),
        RecordingEdgeCache::new(DISTRIBUTION).with_delay(Duration::from_secs(2)),
    )
    .await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    assert_failed_at(&run, "InvalidateCDNCache", FailureKind::Timeout);
    assert!(matches!(
        run.action_state("InvalidateCDNCache", "CDNCacheBurst"),
        Some(ActionState::Failed { kind: FailureKind::Timeout, .. })
    ));
    assert_eq!(h.jobs.outstanding().await, 0);

    // The edge cache eventually answers and the task reports success
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.edge_cache.invalidations().await.len(), 1);

    let after = h.orchestrator.run(run.run_id).await.unwrap();
    assert_eq!(after.status, RunStatus::Failed);
    assert_eq!(after.failure.unwrap().kind, FailureKind::Timeout);
}

#[tokio::test]
async fn test_unregistered_function_fails_invoke() {
    let yaml = SITE_PIPELINE.replace("function: cache-invalidation", "function: purge-everything");
    let h = harness(
        &yaml,
        Arc::new(CopyBuildRunner::default()),
        RecordingEdgeCache::new(DISTRIBUTION),
    )
    .await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    assert_failed_at(&run, "InvalidateCDNCache", FailureKind::Execution);
    assert!(run.failure.unwrap().reason.contains("purge-everything"));
    assert!(h.edge_cache.invalidations().await.is_empty());
    assert_eq!(h.jobs.outstanding().await, 0);
}

#[tokio::test]
async fn test_each_run_uses_its_own_caller_reference() {
    let h = default_harness().await;

    h.run_to_end("c1", site_snapshot("v1")).await;
    h.run_to_end("c2", site_snapshot("v2")).await;

    let invalidations = h.edge_cache.invalidations().await;
    assert_eq!(invalidations.len(), 2);
    assert_ne!(
        invalidations[0].caller_reference,
        invalidations[1].caller_reference
    );
}
