//! Test: Deploy - publishing is an overwrite, repeatable for the same revision

use crate::helpers::*;
use sitepipe::collaborators::RecordingEdgeCache;
use sitepipe::core::{Bundle, RunStatus};
use std::sync::Arc;

#[tokio::test]
async fn test_redeploying_a_revision_leaves_same_objects() {
    let h = default_harness().await;

    let first = h.run_to_end("c1", site_snapshot("v1")).await;
    let after_first = h.publisher.snapshot().await;
    let writes = h.publisher.write_count().await;

    let second = h.run_to_end("c1", site_snapshot("v1")).await;
    let after_second = h.publisher.snapshot().await;

    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(after_first, after_second);
    assert_eq!(h.publisher.write_count().await, writes * 2);
}

#[tokio::test]
async fn test_newer_revision_overwrites_published_files() {
    let h = default_harness().await;

    h.run_to_end("c1", site_snapshot("v1")).await;
    h.run_to_end("c2", site_snapshot("v2")).await;

    let index = h.publisher.object("index.html").await.unwrap();
    assert_eq!(index.body, b"<h1>v2</h1>".to_vec());
}

#[tokio::test]
async fn test_unextracted_deploy_publishes_one_object() {
    let yaml = SITE_PIPELINE.replace(
        "        inputs: [build_output]\n",
        "        inputs: [build_output]\n        extract: false\n        object_key: releases/site.json\n",
    );
    let h = harness(
        &yaml,
        Arc::new(CopyBuildRunner::default()),
        RecordingEdgeCache::new(DISTRIBUTION),
    )
    .await;

    let run = h.run_to_end("c1", site_snapshot("v1")).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(h.publisher.write_count().await, 1);
    let object = h.publisher.object("releases/site.json").await.unwrap();
    assert_eq!(object.content_type, "application/json");
    let bundle: Bundle = serde_json::from_slice(&object.body).unwrap();
    assert_eq!(bundle.get("index.html"), Some(b"<h1>v1</h1>".as_slice()));
}
