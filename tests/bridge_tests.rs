// ABOUTME: Facade-level tests - validation, backend fallback chains, and reconfiguration.
// ABOUTME: Agents are fake scripts or deliberately broken binaries; every path ends in a response.

#![cfg(unix)]

mod common;

use common::{non_executable, write_script};
use std::path::Path;
use switchboard::{AgentBridge, Backend, BackendMode, BridgeConfig, CodexConfig, TraeConfig};

/// A bridge whose every backend points at a file that cannot run.
fn fully_broken_bridge(dir: &Path) -> AgentBridge {
    let broken = non_executable(dir, "broken");
    AgentBridge::new(BridgeConfig {
        backend: Backend::Codex,
        codex: CodexConfig {
            binary: Some(broken.clone()),
            args: vec![],
            ..CodexConfig::default()
        },
        trae: TraeConfig {
            python: broken.display().to_string(),
            server_args: vec![],
            connect_timeout_secs: 5,
            cli_binary: Some(broken),
            ..TraeConfig::default()
        },
    })
}

#[tokio::test]
async fn missing_working_directory_is_reported_before_any_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = fully_broken_bridge(dir.path());

    let response = bridge.send_message("hi", Path::new(""), None).await;
    assert!(!response.success);
    assert!(response
        .error
        .unwrap()
        .contains("working directory is required"));

    let response = bridge
        .send_message("hi", Path::new("/no/such/dir"), None)
        .await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("does not exist"));
}

#[tokio::test]
async fn both_backends_unavailable_yields_typed_failure() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = fully_broken_bridge(dir.path());

    let response = bridge.send_message("hi", dir.path(), None).await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("agent unavailable"));
}

#[tokio::test]
async fn codex_failure_falls_back_to_cli() {
    let dir = tempfile::tempdir().unwrap();
    let broken = non_executable(dir.path(), "broken");
    let cli = write_script(
        dir.path(),
        "cli.sh",
        "#!/bin/sh\necho \"cli handled it\"\nexit 0\n",
    );

    let bridge = AgentBridge::new(BridgeConfig {
        backend: Backend::Codex,
        codex: CodexConfig {
            binary: Some(broken.clone()),
            args: vec![],
            ..CodexConfig::default()
        },
        trae: TraeConfig {
            python: broken.display().to_string(),
            server_args: vec![],
            connect_timeout_secs: 5,
            cli_binary: Some(cli),
            ..TraeConfig::default()
        },
    });

    let response = bridge.send_message("hi", dir.path(), None).await;
    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(response.mode, BackendMode::TraeCli);
    assert!(response.content.contains("cli handled it"));
}

#[tokio::test]
async fn session_variant_reaches_the_cli_when_tools_are_down() {
    let dir = tempfile::tempdir().unwrap();
    let broken = non_executable(dir.path(), "broken");
    let cli = write_script(
        dir.path(),
        "cli.sh",
        "#!/bin/sh\necho \"session via cli\"\nexit 0\n",
    );

    let bridge = AgentBridge::new(BridgeConfig {
        backend: Backend::Trae,
        codex: CodexConfig {
            binary: Some(broken.clone()),
            args: vec![],
            ..CodexConfig::default()
        },
        trae: TraeConfig {
            python: broken.display().to_string(),
            server_args: vec![],
            connect_timeout_secs: 5,
            cli_binary: Some(cli),
            ..TraeConfig::default()
        },
    });

    let response = bridge.send_message_session("continue", dir.path(), None).await;
    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(response.mode, BackendMode::TraeCli);
}

#[tokio::test]
async fn set_backend_switches_and_resets_transports() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = fully_broken_bridge(dir.path());
    assert_eq!(bridge.backend(), Backend::Codex);

    bridge.set_backend(Backend::Trae).await;
    assert_eq!(bridge.backend(), Backend::Trae);

    let info = bridge.get_info().await;
    assert_eq!(info.backend, Backend::Trae);
    assert!(!info.codex_ready);
    assert!(!info.trae_connected);
}

#[tokio::test]
async fn dispose_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = fully_broken_bridge(dir.path());
    bridge.dispose().await;
    bridge.dispose().await;
}

#[tokio::test]
async fn stop_without_anything_running_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = fully_broken_bridge(dir.path());
    bridge.stop().await;

    // A run after a stray stop still works end to end
    let cli = write_script(dir.path(), "cli.sh", "#!/bin/sh\necho ok\nexit 0\n");
    let bridge = AgentBridge::new(BridgeConfig {
        backend: Backend::Trae,
        codex: CodexConfig::default(),
        trae: TraeConfig {
            python: non_executable(dir.path(), "broken2").display().to_string(),
            server_args: vec![],
            connect_timeout_secs: 5,
            cli_binary: Some(cli),
            ..TraeConfig::default()
        },
    });
    bridge.stop().await;
    let response = bridge.send_message("hi", dir.path(), None).await;
    assert!(response.success, "error: {:?}", response.error);
}
