// ABOUTME: Exercises the tool-invocation client against fake tool-server scripts.
// ABOUTME: Covers handshake verification, tool calls, empty results, and the session variant.

#![cfg(unix)]

mod common;

use common::write_script;
use std::time::Duration;
use switchboard::backends::trae::TraeToolsClient;
use switchboard::{BridgeError, TraeConfig};

fn config_for(server: std::path::PathBuf) -> TraeConfig {
    TraeConfig {
        python: server.display().to_string(),
        server_args: vec![],
        connect_timeout_secs: 5,
        tool_timeout_secs: 5,
        ..TraeConfig::default()
    }
}

const FULL_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"serverInfo":{"name":"fake"}}}\n' "$id" ;;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"run_task"},{"name":"task_status"},{"name":"send_observation"}]}}\n' "$id" ;;
    *'"task_status"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"{\\"state\\":\\"waiting_for_input\\"}"}]}}\n' "$id" ;;
    *'"send_observation"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"observed"}]}}\n' "$id" ;;
    *'"run_task"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"task "},{"type":"text","text":"finished"}]}}\n' "$id" ;;
  esac
done
"#;

#[tokio::test]
async fn run_task_concatenates_text_segments() {
    let dir = tempfile::tempdir().unwrap();
    let server = write_script(dir.path(), "server.sh", FULL_SERVER);
    let client = TraeToolsClient::new(config_for(server));

    let text = client.run_task("build it", dir.path()).await.unwrap();
    assert_eq!(text, "task finished");
    assert!(client.is_connected().await);
    assert!(client.last_failure().is_none());
}

#[tokio::test]
async fn missing_expected_tool_is_a_connection_failure() {
    let server = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"something_else"}]}}\n' "$id" ;;
  esac
done
"#;
    let dir = tempfile::tempdir().unwrap();
    let server = write_script(dir.path(), "server.sh", server);
    let client = TraeToolsClient::new(config_for(server));

    let err = client.run_task("build it", dir.path()).await.unwrap_err();
    assert!(matches!(err, BridgeError::AgentUnavailable(_)), "got {err}");
    assert!(err.to_string().contains("run_task"));
    // The failed connection is not cached, and the reason is recorded
    assert!(!client.is_connected().await);
    assert!(client.last_failure().is_some());
}

#[tokio::test]
async fn empty_tool_text_is_empty_result_not_success() {
    let server = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"run_task"}]}}\n' "$id" ;;
    *'"tools/call"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[]}}\n' "$id" ;;
  esac
done
"#;
    let dir = tempfile::tempdir().unwrap();
    let server = write_script(dir.path(), "server.sh", server);
    let client = TraeToolsClient::new(config_for(server));

    let err = client.run_task("build it", dir.path()).await.unwrap_err();
    assert!(matches!(err, BridgeError::EmptyResult), "got {err}");
}

#[tokio::test]
async fn waiting_session_receives_an_observation() {
    let dir = tempfile::tempdir().unwrap();
    let server = write_script(dir.path(), "server.sh", FULL_SERVER);
    let client = TraeToolsClient::new(config_for(server));

    // FULL_SERVER reports a session waiting for input, so the text goes in
    // as an observation instead of starting a new task.
    let text = client
        .run_task_session("looks good, continue", dir.path())
        .await
        .unwrap();
    assert_eq!(text, "observed");
}

#[tokio::test]
async fn slow_tool_call_times_out() {
    let server = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"run_task"}]}}\n' "$id" ;;
    *'"tools/call"'*) sleep 5 ;;
  esac
done
"#;
    let dir = tempfile::tempdir().unwrap();
    let server = write_script(dir.path(), "server.sh", server);
    let client = TraeToolsClient::new(config_for(server));

    let err = client
        .call_tool(
            "run_task",
            serde_json::json!({"task": "x"}),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(_)), "got {err}");
}

#[tokio::test]
async fn dead_server_binary_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let broken = common::non_executable(dir.path(), "server");
    let client = TraeToolsClient::new(config_for(broken));

    let err = client.run_task("build it", dir.path()).await.unwrap_err();
    assert!(err.is_unavailability(), "got {err}");
}
