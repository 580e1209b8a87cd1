// ABOUTME: Interactive REPL for driving the bridge against real agent backends.
// ABOUTME: Usage: bridge-repl [codex|trae]; approvals are answered from the keyboard.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use switchboard::{
    AgentBridge, ApprovalDecision, Backend, BridgeConfig, BridgeEvent,
};
use tokio::sync::mpsc;

fn print_help() {
    println!();
    println!("Commands:");
    println!("  /backend codex|trae  - Switch the preferred backend");
    println!("  /approve <id>        - Approve a pending request");
    println!("  /deny <id>           - Deny a pending request");
    println!("  /stop                - Interrupt the in-flight run");
    println!("  /info                - Show bridge state");
    println!("  /quit                - Exit");
    println!();
    println!("Type anything else to send as a task.");
    println!();
}

async fn print_events(mut rx: mpsc::Receiver<BridgeEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            BridgeEvent::Text(text) => {
                print!("{}", text);
                io::stdout().flush().ok();
            }
            BridgeEvent::ToolStart { name, .. } => {
                println!("\n[tool] {name}");
            }
            BridgeEvent::ToolEnd { name, success, .. } => {
                println!("[tool] {name} {}", if success { "done" } else { "failed" });
            }
            BridgeEvent::ApprovalRequested {
                request_id,
                kind,
                command,
                cwd,
            } => {
                println!();
                println!(
                    "[approval #{request_id}] {kind:?}: {command} (in {})",
                    cwd.display()
                );
                println!("  reply with /approve {request_id} or /deny {request_id}");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = BridgeConfig::find_and_load()?.unwrap_or_default();
    if let Some(arg) = std::env::args().nth(1) {
        config.backend = match arg.as_str() {
            "codex" => Backend::Codex,
            "trae" => Backend::Trae,
            other => anyhow::bail!("Unknown backend: {other}"),
        };
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let bridge = Arc::new(AgentBridge::new(config));

    println!("switchboard bridge REPL");
    println!("Backend: {}", bridge.backend());
    println!("Working directory: {}", cwd.display());
    print_help();

    let stdin = io::stdin();
    loop {
        print!(">>> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim().to_string();
        if input.is_empty() {
            continue;
        }

        match input.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["/quit"] | ["/exit"] | ["/q"] => break,
            ["/help"] | ["/?"] => print_help(),
            ["/info"] => {
                let info = bridge.get_info().await;
                println!(
                    "backend={} codex_ready={} trae_connected={}",
                    info.backend, info.codex_ready, info.trae_connected
                );
                if let Some(reason) = info.trae_last_failure {
                    println!("last tool-server failure: {reason}");
                }
            }
            ["/stop"] => {
                bridge.stop().await;
                println!("stop requested");
            }
            ["/backend", name] => {
                let backend = match *name {
                    "codex" => Backend::Codex,
                    "trae" => Backend::Trae,
                    other => {
                        println!("Unknown backend: {other}");
                        continue;
                    }
                };
                bridge.set_backend(backend).await;
                println!("Backend: {backend}");
            }
            ["/approve", id] | ["/deny", id] => {
                let Ok(request_id) = id.parse::<u64>() else {
                    println!("Bad request id: {id}");
                    continue;
                };
                let decision = if input.starts_with("/approve") {
                    ApprovalDecision::Approved
                } else {
                    ApprovalDecision::Denied
                };
                if let Err(e) = bridge.respond_to_approval(request_id, decision).await {
                    println!("Failed to send decision: {e}");
                }
            }
            _ => {
                let (tx, rx) = mpsc::channel(2048);
                let printer = tokio::spawn(print_events(rx));
                let task_bridge = Arc::clone(&bridge);
                let task_cwd = cwd.clone();
                let prompt = input.clone();
                tokio::spawn(async move {
                    let response = task_bridge
                        .send_message(&prompt, &task_cwd, Some(tx))
                        .await;
                    println!();
                    if response.success {
                        println!("[{}] {}", response.mode, response.content);
                    } else {
                        println!(
                            "[{}] error: {}",
                            response.mode,
                            response.error.unwrap_or_else(|| "unknown".into())
                        );
                    }
                    for call in &response.tool_calls {
                        println!(
                            "  tool {} ({}){}",
                            call.name,
                            call.call_id,
                            call.result
                                .as_deref()
                                .map(|r| format!(" -> {r}"))
                                .unwrap_or_default()
                        );
                    }
                    let _ = printer.await;
                });
            }
        }
    }

    bridge.dispose().await;
    Ok(())
}
