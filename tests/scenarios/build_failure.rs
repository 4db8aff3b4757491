//! Test: Build Failure - a failed build stops the run before deploy

use crate::helpers::*;
use sitepipe::collaborators::RecordingEdgeCache;
use sitepipe::core::{ActionState, FailureKind, StageStatus};
use std::sync::Arc;

#[tokio::test]
async fn test_failed_build_skips_deploy_and_invalidation() {
    let h = harness(
        SITE_PIPELINE,
        Arc::new(FailingBuildRunner),
        RecordingEdgeCache::new(DISTRIBUTION),
    )
    .await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    assert_failed_at(&run, "Build", FailureKind::Execution);
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.action.as_deref(), Some("SiteBuild"));
    assert!(failure.reason.contains("Module not found"));

    assert_eq!(run.stages[1].status, StageStatus::Failed);
    assert_eq!(run.stages[2].status, StageStatus::Pending);
    assert_eq!(run.stages[3].status, StageStatus::Pending);
    assert!(matches!(
        run.action_state("Build", "SiteBuild"),
        Some(ActionState::Failed { kind: FailureKind::Execution, .. })
    ));

    assert_eq!(h.publisher.write_count().await, 0);
    assert!(h.edge_cache.invalidations().await.is_empty());
    assert_eq!(h.stages_started(), vec!["Source", "Build"]);
}

#[tokio::test]
async fn test_missing_buildspec_fails_build() {
    let h = default_harness().await;
    let snapshot = sitepipe::core::Bundle::new().with_file("public/index.html", "x");

    let run = h.run_to_end("c1", snapshot).await;

    assert_failed_at(&run, "Build", FailureKind::Execution);
    assert!(run.failure.unwrap().reason.contains("Buildspec.yml"));
}

#[tokio::test]
async fn test_unauthorized_connection_fails_source() {
    let yaml = SITE_PIPELINE.replace(
        "        output: source_output",
        "        output: source_output\n        connection: other-conn",
    );
    let h = harness(
        &yaml,
        Arc::new(CopyBuildRunner::default()),
        RecordingEdgeCache::new(DISTRIBUTION),
    )
    .await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    assert_failed_at(&run, "Source", FailureKind::Execution);
    assert!(run.failure.unwrap().reason.contains("other-conn"));
    assert!(run.bindings.is_empty());
}
