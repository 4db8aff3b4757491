//! Test: Retention - artifacts kept or purged when a run ends

use crate::helpers::*;
use sitepipe::collaborators::RecordingEdgeCache;
use sitepipe::core::RunStatus;
use std::sync::Arc;
use std::time::Duration;

async fn stored_after_settle(h: &Harness, expected: usize) -> usize {
    for _ in 0..50 {
        let len = h.artifacts.len().await;
        if len == expected {
            return len;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.artifacts.len().await
}

#[tokio::test]
async fn test_artifacts_are_retained_by_default() {
    let h = default_harness().await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(stored_after_settle(&h, 2).await, 2);
}

#[tokio::test]
async fn test_purge_on_completion_drops_run_artifacts() {
    let yaml = format!("{}artifact_retention: purge_on_completion\n", SITE_PIPELINE);
    let h = harness(
        &yaml,
        Arc::new(CopyBuildRunner::default()),
        RecordingEdgeCache::new(DISTRIBUTION),
    )
    .await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(stored_after_settle(&h, 0).await, 0);
    // The run keeps its handles even though the bytes are gone
    assert_eq!(run.bindings.len(), 2);
}

#[tokio::test]
async fn test_failed_run_is_purged_too() {
    let yaml = format!("{}artifact_retention: purge_on_completion\n", SITE_PIPELINE);
    let h = harness(
        &yaml,
        Arc::new(FailingBuildRunner),
        RecordingEdgeCache::new(DISTRIBUTION),
    )
    .await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(stored_after_settle(&h, 0).await, 0);
}

#[tokio::test]
async fn test_superseded_run_build_output_is_purged() {
    let yaml = format!("{}artifact_retention: purge_on_completion\n", SITE_PIPELINE);
    let builder = Arc::new(GatedBuildRunner::default());
    let h = harness(&yaml, builder.clone(), RecordingEdgeCache::new(DISTRIBUTION)).await;

    let mut first = h.push_and_start("c1", site_snapshot("v1")).await;
    builder.first_build_started().await;
    let mut second = h.push_and_start("c2", site_snapshot("v2")).await;
    assert_eq!(first.wait().await, RunStatus::Superseded);

    // The old build stores its output after its run was already purged
    builder.release();
    assert_eq!(second.wait().await, RunStatus::Succeeded);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(stored_after_settle(&h, 0).await, 0);
}
