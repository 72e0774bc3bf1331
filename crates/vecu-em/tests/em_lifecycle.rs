//! End-to-end lifecycle tests for the Execution Manager building blocks:
//! manifest-driven boot order, bounded restart, and graceful termination.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use vecu_em::deps::startup_order;
use vecu_em::manifest::load_manifests;
use vecu_em::runtime::{AppRuntime, MAX_RESTARTS, reap_and_restart, shutdown_children, spawn_app};

#[test]
fn test_boot_order_from_manifest_directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("client.json"),
        r#"{
            "app_id": "client",
            "executable": "/opt/apps/client",
            "start_on_boot": true,
            "dependencies": ["provider"]
        }"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("provider.json"),
        r#"{
            "app_id": "provider",
            "executable": "/opt/apps/provider",
            "start_on_boot": true
        }"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("tool.json"),
        r#"{"app_id": "tool", "executable": "/opt/apps/tool"}"#,
    )
    .unwrap();

    let apps = load_manifests(dir.path());
    assert_eq!(apps.len(), 3);

    // The on-demand tool is not part of the boot set; the provider starts
    // before its client.
    assert_eq!(startup_order(&apps), vec!["provider", "client"]);
}

#[tokio::test]
async fn test_graceful_shutdown_reaps_children_within_grace() {
    let mut children = HashMap::new();
    for name in ["one", "two"] {
        let config = serde_json::from_str(&format!(
            r#"{{"app_id":{name:?},"executable":"/bin/sleep","start_on_boot":true}}"#
        ))
        .unwrap();
        // sleep(30) outlives the test unless SIGTERM ends it.
        let mut command = tokio::process::Command::new("/bin/sleep");
        command.arg("30");
        let child = command.spawn().unwrap();
        children.insert(
            name.to_string(),
            AppRuntime {
                config,
                child: Some(child),
                restart_count: 0,
            },
        );
    }

    shutdown_children(
        &mut children,
        Duration::from_secs(2),
        Duration::from_millis(100),
    )
    .await;
    assert!(children.is_empty());
}

#[tokio::test]
async fn test_on_failure_restart_is_bounded() {
    let config = serde_json::from_str(
        r#"{
            "app_id": "flaky",
            "executable": "/bin/false",
            "start_on_boot": true,
            "restart_policy": "on-failure"
        }"#,
    )
    .unwrap();

    let child = spawn_app(&config).unwrap();
    let mut children = HashMap::new();
    children.insert(
        "flaky".to_string(),
        AppRuntime {
            config,
            child: Some(child),
            restart_count: 0,
        },
    );

    // Each reap observes the failure and respawns until the cap is hit.
    let mut max_seen = 0;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        reap_and_restart(&mut children);
        if let Some(runtime) = children.get("flaky") {
            max_seen = max_seen.max(runtime.restart_count);
        } else {
            break;
        }
    }

    assert!(children.is_empty(), "app should be given up on");
    assert_eq!(max_seen, MAX_RESTARTS);
}

#[tokio::test]
async fn test_normal_exit_is_not_restarted() {
    let config = serde_json::from_str(
        r#"{
            "app_id": "oneshot",
            "executable": "/bin/true",
            "start_on_boot": true,
            "restart_policy": "on-failure"
        }"#,
    )
    .unwrap();

    let child = spawn_app(&config).unwrap();
    let mut children = HashMap::new();
    children.insert(
        "oneshot".to_string(),
        AppRuntime {
            config,
            child: Some(child),
            restart_count: 0,
        },
    );

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        reap_and_restart(&mut children);
        if children.is_empty() {
            break;
        }
    }
    assert!(children.is_empty());
}
