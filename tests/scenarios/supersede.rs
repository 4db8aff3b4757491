//! Test: Supersede - a newer commit replaces the in-flight run

use crate::helpers::*;
use sitepipe::collaborators::RecordingEdgeCache;
use sitepipe::core::{ActionState, RunStatus, StageStatus};
use sitepipe::execution::ExecutionEvent;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_newer_commit_supersedes_run_in_build() {
    let builder = Arc::new(GatedBuildRunner::default());
    let h = harness(
        SITE_PIPELINE,
        builder.clone(),
        RecordingEdgeCache::new(DISTRIBUTION),
    )
    .await;

    let mut first = h.push_and_start("c1", site_snapshot("v1")).await;
    builder.first_build_started().await;

    let mut second = h.push_and_start("c2", site_snapshot("v2")).await;

    assert_eq!(first.wait().await, RunStatus::Superseded);

    // Both builds now finish; only the newer one may be recorded
    builder.release();
    assert_eq!(second.wait().await, RunStatus::Succeeded);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let old = h.orchestrator.run(first.run_id()).await.unwrap();
    assert_eq!(old.status, RunStatus::Superseded);
    assert_eq!(old.superseded_by, Some(second.run_id()));
    assert_eq!(old.stages[0].status, StageStatus::Succeeded);
    assert_eq!(old.stages[1].status, StageStatus::Abandoned);
    assert_eq!(old.stages[2].status, StageStatus::Pending);
    assert!(matches!(
        old.action_state("Build", "SiteBuild"),
        Some(ActionState::Running { .. })
    ));
    assert!(!old.bindings.contains_key("build_output"));

    // Only the newer revision reached the publish target and the edge cache
    let index = h.publisher.object("index.html").await.unwrap();
    assert_eq!(index.body, b"<h1>v2</h1>".to_vec());
    assert_eq!(h.edge_cache.invalidations().await.len(), 1);
    assert!(h.orchestrator.active_run().await.is_none());

    let superseded = h.events.lock().unwrap().iter().any(|e| {
        matches!(
            e,
            ExecutionEvent::RunSuperseded { run_id, superseded_by }
                if *run_id == first.run_id() && *superseded_by == second.run_id()
        )
    });
    assert!(superseded);
}

#[tokio::test]
async fn test_at_most_one_run_in_progress() {
    let builder = Arc::new(GatedBuildRunner::default());
    let h = harness(
        SITE_PIPELINE,
        builder.clone(),
        RecordingEdgeCache::new(DISTRIBUTION),
    )
    .await;

    let first = h.push_and_start("c1", site_snapshot("v1")).await;
    builder.first_build_started().await;
    let second = h.push_and_start("c2", site_snapshot("v2")).await;
    let third = h.push_and_start("c3", site_snapshot("v3")).await;

    let in_progress = h
        .orchestrator
        .runs()
        .await
        .iter()
        .filter(|r| r.status == RunStatus::InProgress)
        .count();
    assert!(in_progress <= 1);

    assert_eq!(first.status(), RunStatus::Superseded);
    assert_eq!(second.status(), RunStatus::Superseded);
    let old = h.orchestrator.run(second.run_id()).await.unwrap();
    assert_eq!(old.superseded_by, Some(third.run_id()));

    builder.release();
}

#[tokio::test]
async fn test_finished_run_is_not_superseded() {
    let h = default_harness().await;

    let first = h.run_to_end("c1", site_snapshot("v1")).await;
    let second = h.run_to_end("c2", site_snapshot("v2")).await;

    assert_eq!(second.status, RunStatus::Succeeded);
    let first = h.orchestrator.run(first.run_id).await.unwrap();
    assert_eq!(first.status, RunStatus::Succeeded);
    assert!(first.superseded_by.is_none());
}
