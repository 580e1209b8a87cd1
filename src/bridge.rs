// ABOUTME: The facade the rest of the system talks to - one object, whichever backend is active.
// ABOUTME: Owns backend selection, lazy connections, fallback, and the approval callback path.

use crate::backends::codex::CodexClient;
use crate::backends::trae::TraeToolsClient;
use crate::backends::trae_cli::CliExecutor;
use crate::config::{Backend, BridgeConfig};
use crate::error::BridgeError;
use crate::event::{ApprovalDecision, BridgeEvent};
use crate::response::{AgentResponse, BackendMode};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Snapshot of the bridge's state for status surfaces.
#[derive(Debug, Clone)]
pub struct BridgeInfo {
    pub backend: Backend,
    pub codex_ready: bool,
    pub trae_connected: bool,
    /// Why the last tool-server connection attempt failed, if it did
    pub trae_last_failure: Option<String>,
}

/// The single entry point for delegating tasks to coding agents.
///
/// Owns one client per backend; no other component writes to an agent
/// process's stdin. Connections are created lazily and torn down on
/// `set_backend` or `dispose`.
pub struct AgentBridge {
    backend: Mutex<Backend>,
    codex: CodexClient,
    trae: TraeToolsClient,
    cli: CliExecutor,
}

impl AgentBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            backend: Mutex::new(config.backend),
            codex: CodexClient::new(config.codex),
            trae: TraeToolsClient::new(config.trae.clone()),
            cli: CliExecutor::new(config.trae),
        }
    }

    pub fn backend(&self) -> Backend {
        *self.backend.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delegate one message. Always resolves to an `AgentResponse`; every
    /// failure becomes readable error text, never a panic or a hang past the
    /// configured ceilings.
    pub async fn send_message(
        &self,
        text: &str,
        cwd: &Path,
        events: Option<mpsc::Sender<BridgeEvent>>,
    ) -> AgentResponse {
        let preferred = self.backend();
        if let Err(message) = validate_working_dir(cwd) {
            return AgentResponse::failure(nominal_mode(preferred), message);
        }
        match preferred {
            Backend::Codex => self.send_via_codex(text, cwd, events, true).await,
            Backend::Trae => self.send_via_trae(text, cwd, events, true, false).await,
        }
    }

    /// Session-aware variant: consults the tool server's session status and
    /// either starts a new task or injects an observation into a waiting one.
    pub async fn send_message_session(
        &self,
        text: &str,
        cwd: &Path,
        events: Option<mpsc::Sender<BridgeEvent>>,
    ) -> AgentResponse {
        if let Err(message) = validate_working_dir(cwd) {
            return AgentResponse::failure(BackendMode::TraeTools, message);
        }
        self.send_via_trae(text, cwd, events, true, true).await
    }

    async fn send_via_codex(
        &self,
        text: &str,
        cwd: &Path,
        events: Option<mpsc::Sender<BridgeEvent>>,
        allow_fallback: bool,
    ) -> AgentResponse {
        match self.codex.send_message(text, cwd, events.clone()).await {
            Ok(content) => AgentResponse::ok(BackendMode::CodexRpc, content),
            Err(e) if allow_fallback && e.is_unavailability() => {
                tracing::warn!(error = %e, "Codex unavailable, falling back to trae");
                self.send_via_trae(text, cwd, events, false, false).await
            }
            Err(e) => AgentResponse::failure(BackendMode::CodexRpc, e.to_string()),
        }
    }

    async fn send_via_trae(
        &self,
        text: &str,
        cwd: &Path,
        events: Option<mpsc::Sender<BridgeEvent>>,
        allow_codex_fallback: bool,
        session: bool,
    ) -> AgentResponse {
        let tools_result = if session {
            self.trae.run_task_session(text, cwd).await
        } else {
            self.trae.run_task(text, cwd).await
        };

        let tools_error = match tools_result {
            Ok(content) => return AgentResponse::ok(BackendMode::TraeTools, content),
            Err(e) => e,
        };
        tracing::info!(error = %tools_error, "Tool server path failed, using CLI fallback");

        match self.cli.run(text, cwd, events.clone()).await {
            Ok(outcome) => outcome.into_response(),
            Err(spawn_error) if allow_codex_fallback => {
                tracing::warn!(error = %spawn_error, "CLI fallback unavailable, trying codex");
                match self.codex.send_message(text, cwd, events).await {
                    Ok(content) => AgentResponse::ok(BackendMode::CodexRpc, content),
                    Err(codex_error) => AgentResponse::failure(
                        BackendMode::TraeCli,
                        unavailable_text(&tools_error, &spawn_error, Some(&codex_error)),
                    ),
                }
            }
            Err(spawn_error) => AgentResponse::failure(
                BackendMode::TraeCli,
                unavailable_text(&tools_error, &spawn_error, None),
            ),
        }
    }

    /// Advisory stop of whatever is in flight. Callers must still let
    /// pending operations settle; termination is not synchronous.
    pub async fn stop(&self) {
        self.codex.interrupt_current_turn().await;
        self.cli.stop();
    }

    /// Forward an approval decision back to the agent that asked.
    pub async fn respond_to_approval(
        &self,
        request_id: u64,
        decision: ApprovalDecision,
    ) -> Result<(), BridgeError> {
        self.codex.respond_to_approval(request_id, decision).await
    }

    /// Switch the preferred backend, tearing down both transports. They
    /// re-initialize lazily on next use.
    pub async fn set_backend(&self, backend: Backend) {
        {
            let mut current = self.backend.lock().unwrap_or_else(|e| e.into_inner());
            *current = backend;
        }
        self.codex.dispose().await;
        self.trae.dispose().await;
        tracing::info!(%backend, "Backend switched, transports reset");
    }

    pub async fn get_info(&self) -> BridgeInfo {
        BridgeInfo {
            backend: self.backend(),
            codex_ready: self.codex.is_ready().await,
            trae_connected: self.trae.is_connected().await,
            trae_last_failure: self.trae.last_failure(),
        }
    }

    /// Tear everything down. Idempotent.
    pub async fn dispose(&self) {
        self.codex.dispose().await;
        self.trae.dispose().await;
    }
}

fn nominal_mode(backend: Backend) -> BackendMode {
    match backend {
        Backend::Codex => BackendMode::CodexRpc,
        Backend::Trae => BackendMode::TraeTools,
    }
}

/// No agent operation is meaningful without a working directory, so its
/// absence is reported before any process is spawned.
fn validate_working_dir(cwd: &Path) -> Result<(), String> {
    if cwd.as_os_str().is_empty() {
        return Err(
            "A working directory is required. Open a folder before delegating a task.".to_string(),
        );
    }
    if !cwd.is_dir() {
        return Err(format!(
            "Working directory does not exist: {}",
            cwd.display()
        ));
    }
    Ok(())
}

fn unavailable_text(
    tools: &BridgeError,
    cli: &BridgeError,
    codex: Option<&BridgeError>,
) -> String {
    let mut text = format!("agent unavailable: tool server: {tools}; cli: {cli}");
    if let Some(codex) = codex {
        text.push_str(&format!("; codex: {codex}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_working_dir_is_rejected() {
        let err = validate_working_dir(Path::new("")).unwrap_err();
        assert!(err.contains("working directory is required"));
    }

    #[test]
    fn missing_working_dir_is_rejected() {
        let err = validate_working_dir(Path::new("/definitely/not/here")).unwrap_err();
        assert!(err.contains("does not exist"));
    }

    #[test]
    fn existing_dir_is_accepted() {
        assert!(validate_working_dir(std::env::temp_dir().as_path()).is_ok());
    }
}
