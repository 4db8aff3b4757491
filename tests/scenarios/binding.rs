//! Test: Binding - a stage whose input was never produced fails the run

use crate::helpers::*;
use sitepipe::collaborators::RecordingEdgeCache;
use sitepipe::core::{FailureKind, StageStatus};
use std::sync::Arc;

const REPORTING_PIPELINE: &str = r#"
name: reporting-site
source:
  owner: acme
  repo: web-app
  branch: main
  connection: conn-1
stages:
  - name: Source
    actions:
      - name: GitHub_Source
        type: source
        output: source_output
  - name: Build
    actions:
      - name: SiteBuild
        type: build
        buildspec: Buildspec.yml
        inputs: [source_output]
        output: build_output
  - name: Invalidate
    actions:
      - name: CDNCacheBurst
        type: invoke
        function: cache-invalidation
        output: invalidation_report
  - name: Archive
    actions:
      - name: StoreReport
        type: deploy
        inputs: [invalidation_report]
        extract: false
        object_key: reports/latest.json
"#;

#[tokio::test]
async fn test_unproduced_output_fails_consuming_stage() {
    let h = harness(
        REPORTING_PIPELINE,
        Arc::new(CopyBuildRunner::default()),
        RecordingEdgeCache::new(DISTRIBUTION),
    )
    .await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    // The invalidation reported success without an output bundle
    assert_eq!(run.stages[2].status, StageStatus::Succeeded);
    assert_eq!(h.edge_cache.invalidations().await.len(), 1);

    assert_failed_at(&run, "Archive", FailureKind::Binding);
    let failure = run.failure.as_ref().unwrap();
    assert!(failure.action.is_none());
    assert!(failure.reason.contains("invalidation_report"));
    assert_eq!(run.stages[3].status, StageStatus::Failed);
    assert!(h.publisher.object("reports/latest.json").await.is_none());
    assert!(!h.stages_started().contains(&"Archive".to_string()));
}
