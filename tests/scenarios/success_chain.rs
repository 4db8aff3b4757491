//! Test: Success Chain - a commit flows through all four stages

use crate::helpers::*;
use sitepipe::core::{RunStatus, StageStatus};
use sitepipe::persistence::RunStore;
use std::time::Duration;

#[tokio::test]
async fn test_commit_is_built_published_and_invalidated() {
    let h = default_harness().await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.failure.is_none());
    assert!(run.stages.iter().all(|s| s.status == StageStatus::Succeeded));

    // Stages ran in declared order
    assert_eq!(
        h.stages_started(),
        vec!["Source", "Build", "Deploy", "InvalidateCDNCache"]
    );

    // Build output was extracted into the publish target
    let index = h.publisher.object("index.html").await.unwrap();
    assert_eq!(index.body, b"<h1>v1</h1>".to_vec());
    assert_eq!(index.content_type, "text/html");
    let css = h.publisher.object("assets/app.css").await.unwrap();
    assert_eq!(css.content_type, "text/css");
    assert!(h.publisher.object("src/main.js").await.is_none());

    // Build variables reached the build
    let env = h.publisher.object("build.env").await.unwrap();
    assert_eq!(
        String::from_utf8(env.body).unwrap(),
        "VITE_AWS_USER_POOL_ID=pool-42"
    );

    // Exactly one invalidation of everything
    let invalidations = h.edge_cache.invalidations().await;
    assert_eq!(invalidations.len(), 1);
    assert_eq!(invalidations[0].distribution_id, DISTRIBUTION);
    assert_eq!(invalidations[0].paths, vec!["/*".to_string()]);
    assert_eq!(h.jobs.outstanding().await, 0);
}

#[tokio::test]
async fn test_bindings_carry_artifacts_between_stages() {
    let h = default_harness().await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    let source = run.bindings.get("source_output").unwrap();
    let build = run.bindings.get("build_output").unwrap();
    assert_eq!(source.run_id, run.run_id);
    assert_eq!(build.run_id, run.run_id);
    assert_eq!(run.bindings.len(), 2);
}

#[tokio::test]
async fn test_completed_run_is_recorded_in_history() {
    let h = default_harness().await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    // Persisting happens right after the status flips
    let mut saved = None;
    for _ in 0..50 {
        saved = h.store.load_run(run.run_id).await.unwrap();
        if saved.as_ref().is_some_and(|s| s.status == RunStatus::Succeeded) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let saved = saved.unwrap();
    assert_eq!(saved.status, RunStatus::Succeeded);
    assert_eq!(saved.revision, "c1");
    assert_eq!(saved.completed_stages, 4);
    assert_eq!(saved.total_stages, 4);
    assert!(saved.completed_at.is_some());
}
