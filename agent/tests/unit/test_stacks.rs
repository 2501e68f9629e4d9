//! Stack repository tests

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;

use stackd::errors::StoreError;
use stackd::filesys::file::File;
use stackd::models::stack::{InstalledStack, StackStatus};
use stackd::storage::stacks::{JsonStackRepository, StackRepository};

fn stack(app_id: &str, status: StackStatus, port: Option<u16>) -> InstalledStack {
    InstalledStack {
        app_id: app_id.to_string(),
        template_name: app_id.to_string(),
        stack_name: app_id.to_string(),
        compose_path: PathBuf::from(format!("/stacks/{}/docker-compose.yml", app_id)),
        env_path: PathBuf::from(format!("/stacks/{}/.env", app_id)),
        status,
        web_ui_port: port,
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

#[tokio::test]
async fn test_upsert_persists_across_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let file = File::new(tmp.path().join("stacks.json"));

    let repo = JsonStackRepository::open(file.clone()).await.unwrap();
    repo.upsert(stack("whoami", StackStatus::Installed, Some(8000)))
        .await
        .unwrap();
    repo.upsert(stack("adguard-home", StackStatus::Installed, Some(3001)))
        .await
        .unwrap();

    let reopened = JsonStackRepository::open(file).await.unwrap();
    let list = reopened.list().await.unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(
        reopened.find("whoami").await.unwrap().unwrap().web_ui_port,
        Some(8000)
    );
    assert!(reopened.find("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_port_uniqueness_among_active_stacks() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = JsonStackRepository::open(File::new(tmp.path().join("stacks.json")))
        .await
        .unwrap();

    repo.upsert(stack("a", StackStatus::Installed, Some(3001)))
        .await
        .unwrap();

    let err = repo
        .upsert(stack("b", StackStatus::Installed, Some(3001)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert!(repo.find("b").await.unwrap().is_none());

    // Inactive rows do not hold their port
    repo.upsert(stack("c", StackStatus::NotInstalled, Some(3001)))
        .await
        .unwrap();

    // Re-saving the holder itself is fine
    repo.upsert(stack("a", StackStatus::Updating, Some(3001)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_find_by_web_ui_port() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = JsonStackRepository::open(File::new(tmp.path().join("stacks.json")))
        .await
        .unwrap();
    repo.upsert(stack("a", StackStatus::Installed, Some(3001)))
        .await
        .unwrap();
    repo.upsert(stack("old", StackStatus::NotInstalled, Some(3002)))
        .await
        .unwrap();

    let holder = repo.find_by_web_ui_port(3001, None).await.unwrap().unwrap();
    assert_eq!(holder.app_id, "a");
    assert!(repo.find_by_web_ui_port(3001, Some("a")).await.unwrap().is_none());
    assert!(repo.find_by_web_ui_port(3002, None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = JsonStackRepository::open(File::new(tmp.path().join("stacks.json")))
        .await
        .unwrap();
    repo.upsert(stack("a", StackStatus::Installed, Some(3001)))
        .await
        .unwrap();

    let updated = repo
        .update(
            "a",
            Box::new(|s: &mut InstalledStack| s.status = StackStatus::NotInstalled),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.status, StackStatus::NotInstalled);
    assert_eq!(
        repo.find("a").await.unwrap().unwrap().status,
        StackStatus::NotInstalled
    );

    let missing = repo
        .update("b", Box::new(|s: &mut InstalledStack| s.status = StackStatus::Error))
        .await
        .unwrap();
    assert!(missing.is_none());
}
