//! Digest and update resolution tests

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use stackd::deploy::digest::DigestResolver;
use stackd::models::stack::{InstalledStack, StackStatus};

use crate::support::FakeEngine;

fn installed(app_id: &str) -> InstalledStack {
    InstalledStack {
        app_id: app_id.to_string(),
        template_name: app_id.to_string(),
        stack_name: app_id.to_string(),
        compose_path: PathBuf::from(format!("/tmp/{}/docker-compose.yml", app_id)),
        env_path: PathBuf::from(format!("/tmp/{}/.env", app_id)),
        status: StackStatus::Installed,
        web_ui_port: None,
        env: BTreeMap::new(),
        display_name: None,
        icon_url: None,
        installed_at: Some(Utc::now()),
        updated_at: Utc::now(),
        is_up_to_date: None,
        local_digest: None,
        remote_digest: None,
        last_update_check: None,
    }
}

fn set_local(engine: &FakeEngine, image: &str, digests: &[&str]) {
    engine.local_digests.lock().unwrap().insert(
        image.to_string(),
        digests.iter().map(|d| d.to_string()).collect(),
    );
}

fn set_remote(engine: &FakeEngine, image: &str, verbose: bool, manifest: serde_json::Value) {
    engine
        .remote_manifests
        .lock()
        .unwrap()
        .insert((image.to_string(), verbose), manifest);
}

#[tokio::test]
async fn test_pinned_reference_needs_no_engine_call() {
    let engine = Arc::new(FakeEngine::default());
    let resolver = DigestResolver::new(engine.clone());

    let digest = resolver.resolve_remote_image_digest("nginx@sha256:abc123").await;
    assert_eq!(digest.as_deref(), Some("sha256:abc123"));
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_local_digest_takes_first_and_is_cached() {
    let engine = Arc::new(FakeEngine::default());
    set_local(&engine, "nginx", &["nginx@sha256:local1", "nginx@sha256:local2"]);
    let resolver = DigestResolver::new(engine.clone());

    assert_eq!(
        resolver.resolve_local_image_digest("nginx").await.as_deref(),
        Some("sha256:local1")
    );
    assert_eq!(
        resolver.resolve_local_image_digest("nginx").await.as_deref(),
        Some("sha256:local1")
    );
    assert_eq!(engine.count("inspect_local"), 1);

    resolver.invalidate_local("nginx");
    resolver.resolve_local_image_digest("nginx").await;
    assert_eq!(engine.count("inspect_local"), 2);
}

#[tokio::test]
async fn test_local_digest_expires() {
    let engine = Arc::new(FakeEngine::default());
    set_local(&engine, "nginx", &["nginx@sha256:local1"]);
    let resolver =
        DigestResolver::with_ttls(engine.clone(), Duration::from_millis(20), Duration::from_secs(300));

    resolver.resolve_local_image_digest("nginx").await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    resolver.resolve_local_image_digest("nginx").await;
    assert_eq!(engine.count("inspect_local"), 2);
}

#[tokio::test]
async fn test_local_failure_degrades_to_none() {
    let engine = Arc::new(FakeEngine::default());
    let resolver = DigestResolver::new(engine.clone());
    assert!(resolver.resolve_local_image_digest("missing").await.is_none());
}

#[tokio::test]
async fn test_remote_falls_back_to_plain_manifest() {
    let engine = Arc::new(FakeEngine::default());
    set_remote(&engine, "nginx:latest", true, json!({ "SchemaV2Manifest": {} }));
    set_remote(
        &engine,
        "nginx:latest",
        false,
        json!({ "manifests": [{ "digest": "sha256:list1" }, { "digest": "sha256:list2" }] }),
    );
    let resolver = DigestResolver::new(engine.clone());

    let digest = resolver.resolve_remote_image_digest("nginx:latest").await;
    assert_eq!(digest.as_deref(), Some("sha256:list1"));
    assert_eq!(
        engine.calls(),
        vec![
            "inspect_remote nginx:latest verbose=true",
            "inspect_remote nginx:latest verbose=false"
        ]
    );

    // Cached
    resolver.resolve_remote_image_digest("nginx:latest").await;
    assert_eq!(engine.count("inspect_remote"), 2);
}

#[tokio::test]
async fn test_remote_failure_is_not_cached() {
    let engine = Arc::new(FakeEngine::default());
    let resolver = DigestResolver::new(engine.clone());

    assert!(resolver.resolve_remote_image_digest("nginx:latest").await.is_none());
    assert!(resolver.resolve_remote_image_digest("nginx:latest").await.is_none());
    assert_eq!(engine.count("inspect_remote"), 4);
}

#[tokio::test]
async fn test_digest_state() {
    let engine = Arc::new(FakeEngine::default());
    set_local(&engine, "nginx:latest", &["nginx@sha256:old"]);
    set_remote(&engine, "nginx:latest", true, json!({ "Descriptor": { "digest": "sha256:new" } }));
    set_local(&engine, "redis:7", &["redis@sha256:same"]);
    set_remote(&engine, "redis:7", true, json!({ "Descriptor": { "digest": "sha256:same" } }));
    let resolver = DigestResolver::new(engine.clone());

    let nginx = resolver.resolve_image_digest_state("nginx:latest").await;
    assert!(nginx.update_available);

    let redis = resolver.resolve_image_digest_state("redis:7").await;
    assert!(!redis.update_available);

    // Only one side known: no update
    let unknown = resolver.resolve_image_digest_state("postgres:16").await;
    assert!(unknown.local_digest.is_none());
    assert!(!unknown.update_available);
}

#[tokio::test]
async fn test_app_update_state_prefers_stale_image() {
    let engine = Arc::new(FakeEngine::with_images(&["redis:7", "nginx:latest"]));
    set_local(&engine, "redis:7", &["redis@sha256:same"]);
    set_remote(&engine, "redis:7", true, json!({ "Descriptor": { "digest": "sha256:same" } }));
    set_local(&engine, "nginx:latest", &["nginx@sha256:old"]);
    set_remote(&engine, "nginx:latest", true, json!({ "Descriptor": { "digest": "sha256:new" } }));
    let resolver = DigestResolver::new(engine.clone());

    let state = resolver
        .resolve_store_app_update_state(&installed("web"))
        .await
        .unwrap();
    assert_eq!(state.image, "nginx:latest");
    assert!(state.update_available);
}

#[tokio::test]
async fn test_app_update_state_falls_back_to_first_resolved() {
    let engine = Arc::new(FakeEngine::with_images(&["busybox", "redis:7"]));
    set_local(&engine, "redis:7", &["redis@sha256:same"]);
    let resolver = DigestResolver::new(engine.clone());

    let state = resolver
        .resolve_store_app_update_state(&installed("cache"))
        .await
        .unwrap();
    assert_eq!(state.image, "redis:7");
    assert!(!state.update_available);

    let empty = Arc::new(FakeEngine::with_images(&["busybox"]));
    let resolver = DigestResolver::new(empty);
    assert!(resolver.resolve_store_app_update_state(&installed("cache")).await.is_none());
}
