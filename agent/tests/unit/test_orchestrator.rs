//! Orchestrator workflow tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use stackd::app::options::AppOptions;
use stackd::app::state::AppState;
use stackd::deploy::engine::PullEvent;
use stackd::deploy::fsm::OperationTransition;
use stackd::deploy::orchestrator::INTERRUPTED_MESSAGE;
use stackd::models::operation::{
    Operation, OperationAction, OperationRequest, OperationStatus, OperationStep, ProgressDetail,
};
use stackd::models::stack::{InstalledStack, StackStatus};
use stackd::models::template::AppTemplate;
use stackd::storage::operations::OperationStore;
use stackd::storage::stacks::StackRepository;

use crate::support::{custom_template, request_with_env, FakeEngine, Harness, WEB_COMPOSE};

const ADGUARD_COMPOSE: &str = "\
services:
  adguardhome:
    image: adguard/adguardhome:latest
    ports:
      - 3000:3000/tcp
      - 53:53/udp
";

fn adguard() -> AppTemplate {
    custom_template(
        "adguard-home",
        ADGUARD_COMPOSE,
        &[("TZ", Some("UTC")), ("WEBPASSWORD", None)],
    )
}

#[tokio::test]
async fn test_install_success() {
    let harness = Harness::new(vec![adguard()]).await;
    *harness.engine.pull_events.lock().unwrap() = vec![PullEvent {
        id: Some("3f4ca61aafcd".to_string()),
        status: "Downloading".to_string(),
        progress_detail: Some(ProgressDetail::from_bytes(10, 20)),
    }];

    let op = harness
        .run(
            "adguard-home",
            "install",
            request_with_env(&[("TZ", "Africa/Tunis")], Some(3001)),
        )
        .await;

    assert_eq!(op.status, OperationStatus::Success);
    assert_eq!(op.progress_percent, 100);
    assert_eq!(op.current_step, OperationStep::Complete);
    assert!(op.error_message.is_none());
    assert!(op.started_at.is_some() && op.finished_at.is_some());

    let stack = harness.stacks.find("adguard-home").await.unwrap().unwrap();
    assert_eq!(stack.status, StackStatus::Installed);
    assert_eq!(stack.web_ui_port, Some(3001));
    assert_eq!(stack.stack_name, "adguard-home");
    assert_eq!(stack.env.get("TZ").map(String::as_str), Some("Africa/Tunis"));
    assert_eq!(stack.env.get("WEBPASSWORD").map(String::as_str), Some(""));
    assert!(stack.installed_at.is_some());

    let compose = tokio::fs::read_to_string(&stack.compose_path).await.unwrap();
    assert!(compose.contains("- 3001:3000/tcp"));
    assert!(compose.contains("- 53:53/udp"));
    let env = tokio::fs::read_to_string(&stack.env_path).await.unwrap();
    assert_eq!(env, "TZ=Africa/Tunis\nWEBPASSWORD=\n");

    assert!(harness.engine.called("pull nginx:latest"));
    assert_eq!(harness.engine.count("compose_up adguard-home"), 1);
}

#[tokio::test]
async fn test_install_action_log_skips_pull_progress() {
    let harness = Harness::new(vec![adguard()]).await;
    *harness.engine.pull_events.lock().unwrap() = vec![PullEvent {
        id: Some("3f4ca61aafcd".to_string()),
        status: "Downloading".to_string(),
        progress_detail: Some(ProgressDetail::from_bytes(10, 20)),
    }];

    harness
        .run("adguard-home", "install", OperationRequest::default())
        .await;

    let types = harness.action_log_types().await;
    assert_eq!(types.first().map(String::as_str), Some("started"));
    assert_eq!(types.last().map(String::as_str), Some("completed"));
    assert!(types.iter().all(|t| t != "pull.progress"));
    assert_eq!(types.iter().filter(|t| *t == "step").count(), 6);
}

#[tokio::test]
async fn test_install_progress_is_monotonic() {
    let harness = Harness::new(vec![adguard()]).await;
    *harness.engine.pull_delay.lock().unwrap() = Some(Duration::from_millis(50));
    *harness.engine.pull_events.lock().unwrap() = vec![
        PullEvent {
            id: Some("3f4ca61aafcd".to_string()),
            status: "Downloading".to_string(),
            progress_detail: Some(ProgressDetail::from_bytes(10, 20)),
        },
        PullEvent {
            id: Some("3f4ca61aafcd".to_string()),
            status: "Downloading".to_string(),
            progress_detail: Some(ProgressDetail::from_bytes(5, 20)),
        },
    ];

    let id = harness
        .orchestrator
        .start_operation("adguard-home", OperationAction::Install, OperationRequest::default())
        .await
        .unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = harness.orchestrator.subscribe(&id, move |event| {
        sink.lock()
            .unwrap()
            .push((event.event_type.as_str().to_string(), event.progress_percent));
    });
    harness.wait_for_terminal(&id).await;

    let seen = seen.lock().unwrap().clone();
    let progress: Vec<u8> = seen.iter().map(|(_, p)| *p).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
    assert_eq!(seen.last(), Some(&("completed".to_string(), 100)));

    // Half of the only image is 15 + 50 * 0.65
    assert!(seen.contains(&("pull.progress".to_string(), 48)), "{:?}", seen);
    assert!(seen.contains(&("step".to_string(), 85)), "{:?}", seen);
}

#[tokio::test]
async fn test_pull_failure_stops_before_compose_up() {
    let harness = Harness::new(vec![adguard()]).await;
    *harness.engine.pull_error.lock().unwrap() =
        Some("unauthorized: authentication required".to_string());

    let op = harness
        .run("adguard-home", "install", OperationRequest::default())
        .await;

    assert_eq!(op.status, OperationStatus::Error);
    assert!(op.error_message.as_deref().unwrap().contains("unauthorized"));
    assert_eq!(op.current_step, OperationStep::PullImages);
    assert!(op.progress_percent >= 15 && op.progress_percent < 100);
    assert!(!harness.engine.called("compose_up"));
    assert!(harness.stacks.find("adguard-home").await.unwrap().is_none());

    let types = harness.action_log_types().await;
    assert_eq!(types.last().map(String::as_str), Some("failed"));
}

#[tokio::test]
async fn test_missing_template_fails_at_resolve() {
    let harness = Harness::new(vec![]).await;

    let op = harness
        .run("ghost", "install", OperationRequest::default())
        .await;

    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(op.current_step, OperationStep::Resolve);
    assert!(op.error_message.unwrap().contains("ghost"));
    assert!(harness.engine.calls().is_empty());
}

#[tokio::test]
async fn test_redeploy_without_stack_fails() {
    let harness = Harness::new(vec![adguard()]).await;

    let op = harness
        .run("adguard-home", "redeploy", OperationRequest::default())
        .await;

    assert_eq!(op.status, OperationStatus::Error);
    assert!(op.error_message.unwrap().contains("not installed"));
    assert!(!harness.engine.called("compose_up"));
    assert!(harness.engine.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_env_key_fails_before_any_write() {
    let harness = Harness::new(vec![adguard()]).await;

    let op = harness
        .run(
            "adguard-home",
            "install",
            request_with_env(&[("TZ", "UTC"), ("ROOT_PASSWORD", "x")], None),
        )
        .await;

    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(op.current_step, OperationStep::Validate);
    assert!(op.error_message.unwrap().contains("ROOT_PASSWORD"));
    assert!(harness.engine.calls().is_empty());
    assert!(!harness.layout.stacks_dir().subdir("adguard-home").exists().await);
}

#[tokio::test]
async fn test_invalid_port_fails_validation() {
    let harness = Harness::new(vec![adguard()]).await;

    let op = harness
        .run("adguard-home", "install", request_with_env(&[], Some(70000)))
        .await;

    assert_eq!(op.status, OperationStatus::Error);
    assert!(op.error_message.unwrap().contains("70000"));
    assert!(harness.engine.calls().is_empty());
}

#[tokio::test]
async fn test_port_taken_by_other_app() {
    let harness = Harness::new(vec![
        adguard(),
        custom_template("whoami", WEB_COMPOSE, &[]),
    ])
    .await;

    let first = harness
        .run("adguard-home", "install", request_with_env(&[], Some(3001)))
        .await;
    assert_eq!(first.status, OperationStatus::Success);

    let second = harness
        .run("whoami", "install", request_with_env(&[], Some(3001)))
        .await;
    assert_eq!(second.status, OperationStatus::Error);
    assert!(second.error_message.unwrap().contains("3001"));
    assert_eq!(harness.engine.count("compose_up"), 1);

    let stacks = harness.orchestrator.list_stacks().await.unwrap();
    let ports: Vec<Option<u16>> = stacks.iter().map(|s| s.web_ui_port).collect();
    assert_eq!(ports, vec![Some(3001)]);
}

#[tokio::test]
async fn test_detected_port_is_recorded() {
    let harness = Harness::new(vec![custom_template("whoami", WEB_COMPOSE, &[])]).await;

    let op = harness
        .run("whoami", "install", OperationRequest::default())
        .await;
    assert_eq!(op.status, OperationStatus::Success);

    let stack = harness.stacks.find("whoami").await.unwrap().unwrap();
    assert_eq!(stack.web_ui_port, Some(3000));
}

#[tokio::test]
async fn test_redeploy_keeps_env_and_port() {
    let harness = Harness::new(vec![adguard()]).await;

    harness
        .run(
            "adguard-home",
            "install",
            request_with_env(&[("TZ", "Africa/Tunis"), ("WEBPASSWORD", "secret")], Some(3001)),
        )
        .await;

    let op = harness
        .run(
            "adguard-home",
            "redeploy",
            request_with_env(&[("WEBPASSWORD", "changed")], None),
        )
        .await;
    assert_eq!(op.status, OperationStatus::Success);

    let stack = harness.stacks.find("adguard-home").await.unwrap().unwrap();
    assert_eq!(stack.status, StackStatus::Installed);
    assert_eq!(stack.web_ui_port, Some(3001));
    assert_eq!(stack.env.get("TZ").map(String::as_str), Some("Africa/Tunis"));
    assert_eq!(stack.env.get("WEBPASSWORD").map(String::as_str), Some("changed"));
    assert_eq!(harness.engine.count("compose_up"), 2);
}

#[tokio::test]
async fn test_failed_redeploy_marks_stack_error() {
    let harness = Harness::new(vec![adguard()]).await;
    harness
        .run("adguard-home", "install", OperationRequest::default())
        .await;

    *harness.engine.up_error.lock().unwrap() = Some("port is already allocated".to_string());
    let op = harness
        .run("adguard-home", "redeploy", OperationRequest::default())
        .await;

    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(op.current_step, OperationStep::ComposeUp);
    assert_eq!(op.progress_percent, 85);
    let stack = harness.stacks.find("adguard-home").await.unwrap().unwrap();
    assert_eq!(stack.status, StackStatus::Error);
}

#[tokio::test]
async fn test_uninstall_absent_is_noop_success() {
    let harness = Harness::new(vec![adguard()]).await;

    let op = harness
        .run("adguard-home", "uninstall", OperationRequest::default())
        .await;

    assert_eq!(op.status, OperationStatus::Success);
    assert_eq!(op.progress_percent, 100);
    assert!(!harness.engine.called("compose_down"));
}

#[tokio::test]
async fn test_uninstall_retains_row() {
    let harness = Harness::new(vec![adguard()]).await;
    harness
        .run("adguard-home", "install", request_with_env(&[], Some(3001)))
        .await;

    let op = harness
        .run(
            "adguard-home",
            "uninstall",
            OperationRequest {
                remove_volumes: true,
                ..Default::default()
            },
        )
        .await;
    assert_eq!(op.status, OperationStatus::Success);
    assert!(harness
        .engine
        .called("compose_down adguard-home env=true volumes=true"));

    let stack = harness.stacks.find("adguard-home").await.unwrap().unwrap();
    assert_eq!(stack.status, StackStatus::NotInstalled);

    // Second uninstall has nothing to do
    harness
        .run("adguard-home", "uninstall", OperationRequest::default())
        .await;
    assert_eq!(harness.engine.count("compose_down"), 1);

    // The port is free again
    assert!(harness
        .stacks
        .find_by_web_ui_port(3001, None)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_same_app_operations_run_in_order() {
    let harness = Harness::new(vec![adguard()]).await;
    *harness.engine.pull_delay.lock().unwrap() = Some(Duration::from_millis(50));

    let install = harness
        .orchestrator
        .start_operation("adguard-home", OperationAction::Install, OperationRequest::default())
        .await
        .unwrap();
    let uninstall = harness
        .orchestrator
        .start_operation("adguard-home", OperationAction::Uninstall, OperationRequest::default())
        .await
        .unwrap();

    // The uninstall waits for the install instead of seeing no stack
    assert_eq!(
        harness.orchestrator.get_operation(&uninstall).unwrap().status,
        OperationStatus::Queued
    );

    let install = harness.wait_for_terminal(&install).await;
    let uninstall = harness.wait_for_terminal(&uninstall).await;
    assert_eq!(install.status, OperationStatus::Success);
    assert_eq!(uninstall.status, OperationStatus::Success);
    assert!(install.finished_at <= uninstall.started_at);
    assert_eq!(harness.engine.count("compose_down"), 1);

    let stack = harness.stacks.find("adguard-home").await.unwrap().unwrap();
    assert_eq!(stack.status, StackStatus::NotInstalled);
}

#[tokio::test]
async fn test_start_operation_rejects_blank_app_id() {
    let harness = Harness::new(vec![]).await;
    let result = harness
        .orchestrator
        .start_operation("  ", OperationAction::Install, OperationRequest::default())
        .await;
    assert!(result.unwrap_err().is_validation());
}

#[tokio::test]
async fn test_check_app_update_stores_result() {
    let harness = Harness::new(vec![adguard()]).await;
    harness
        .run("adguard-home", "install", OperationRequest::default())
        .await;

    harness
        .engine
        .local_digests
        .lock()
        .unwrap()
        .insert("nginx:latest".to_string(), vec!["nginx@sha256:old".to_string()]);
    harness.engine.remote_manifests.lock().unwrap().insert(
        ("nginx:latest".to_string(), true),
        json!({ "Descriptor": { "digest": "sha256:new" } }),
    );

    let check = harness.orchestrator.check_app_update("adguard-home").await.unwrap();
    let image = check.image.unwrap();
    assert!(image.update_available);
    assert_eq!(image.local_digest.as_deref(), Some("sha256:old"));

    let stack = harness.stacks.find("adguard-home").await.unwrap().unwrap();
    assert_eq!(stack.is_up_to_date, Some(false));
    assert_eq!(stack.remote_digest.as_deref(), Some("sha256:new"));
    assert_eq!(stack.last_update_check, Some(check.checked_at));

    assert!(harness.orchestrator.check_app_update("other").await.is_err());
}

#[tokio::test]
async fn test_startup_recovery() {
    let harness = Harness::new(vec![adguard()]).await;
    harness
        .run("adguard-home", "install", OperationRequest::default())
        .await;

    // State left behind by a process that died mid-redeploy
    let mut running = Operation::new(
        "op-running".to_string(),
        "adguard-home",
        OperationAction::Redeploy,
        &OperationRequest::default(),
    );
    running.process(OperationTransition::Start).unwrap();
    harness.operations.save(&running).await.unwrap();
    harness
        .stacks
        .update(
            "adguard-home",
            Box::new(|stack: &mut InstalledStack| stack.status = StackStatus::Updating),
        )
        .await
        .unwrap();

    let options = AppOptions {
        layout: harness.layout.clone(),
        enable_server: false,
        ..Default::default()
    };
    let state = AppState::init_with_engine(&options, Arc::new(FakeEngine::default()))
        .await
        .unwrap();

    let recovered = state.orchestrator.get_operation("op-running").unwrap();
    assert_eq!(recovered.status, OperationStatus::Error);
    assert_eq!(recovered.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));

    let stacks = state.orchestrator.list_stacks().await.unwrap();
    assert_eq!(stacks.len(), 1);
    assert_eq!(stacks[0].status, StackStatus::Error);

    // Finished operations are left alone and the failure is persisted
    let reloaded = OperationStore::load(harness.layout.operations_dir()).await.unwrap();
    assert_eq!(reloaded.list().len(), 2);
    assert_eq!(reloaded.get("op-running").unwrap().status, OperationStatus::Error);
    assert!(reloaded
        .list()
        .iter()
        .any(|op| op.id != "op-running" && op.status == OperationStatus::Success));
}
