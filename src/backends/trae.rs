// ABOUTME: Trae tool-server backend - capability handshake and named tool invocation over stdio.
// ABOUTME: Connection is lazy and cached; a server missing the expected tool is a connection failure.

use crate::config::TraeConfig;
use crate::error::BridgeError;
use crate::launcher;
use crate::transport::{write_json_line, JsonLineReader, RequestLedger};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex as AsyncMutex;

/// The tool a usable server must expose.
pub(crate) const RUN_TOOL: &str = "run_task";
const STATUS_TOOL: &str = "task_status";
const OBSERVE_TOOL: &str = "send_observation";

const ENV_OVERRIDE: &str = "SWITCHBOARD_TRAE_PYTHON";
const PROTOCOL_VERSION: &str = "2024-11-05";
/// Bounded diagnostic memory: only the last few stderr lines are kept.
const STDERR_TAIL_LINES: usize = 6;
const STATUS_TIMEOUT: Duration = Duration::from_secs(30);

struct ToolConnection {
    child: Mutex<Child>,
    stdin: AsyncMutex<ChildStdin>,
    ledger: RequestLedger,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    disposed: AtomicBool,
}

impl ToolConnection {
    async fn open(config: &TraeConfig) -> Result<Arc<Self>, BridgeError> {
        let program = launcher::resolve_program(&config.python, None, ENV_OVERRIDE);
        let mut child = launcher::spawn_agent(&program, &config.server_args, None)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Transport("tool server stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Transport("tool server stdout unavailable".into()))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.is_empty() {
                        continue;
                    }
                    tracing::debug!(stderr = %line, "Tool server stderr");
                    let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        let conn = Arc::new(ToolConnection {
            child: Mutex::new(child),
            stdin: AsyncMutex::new(stdin),
            ledger: RequestLedger::new(),
            stderr_tail,
            disposed: AtomicBool::new(false),
        });

        let reader_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            let mut reader = JsonLineReader::new(stdout);
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(value) => reader_conn.dispatch(value),
                    Err(e) => tracing::warn!(error = %e, "Discarding bad frame"),
                }
            }
            tracing::debug!("Tool server stdout closed");
            reader_conn.dispose();
        });

        Ok(conn)
    }

    fn dispatch(&self, value: Value) {
        let Some(obj) = value.as_object() else {
            tracing::warn!("Discarding non-object frame");
            return;
        };
        match (obj.get("method").and_then(Value::as_str), obj.get("id").and_then(Value::as_u64)) {
            (None, Some(id)) => {
                let result = if let Some(error) = obj.get("error") {
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string();
                    Err(BridgeError::Agent(message))
                } else {
                    Ok(obj.get("result").cloned().unwrap_or(Value::Null))
                };
                if !self.ledger.fulfill(id, result) {
                    tracing::debug!(id, "Response for unknown request id, ignoring");
                }
            }
            (Some(method), _) => {
                // The tool server's own notifications/requests carry no
                // meaning for the bridge.
                tracing::debug!(%method, "Ignoring tool server message");
            }
            (None, None) => tracing::warn!("Discarding frame with neither method nor id"),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        if self.is_disposed() {
            return Err(BridgeError::Disposed);
        }
        let (id, rx) = self.ledger.register();
        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = write_json_line(&mut *stdin, &frame).await {
                self.ledger.forget(id);
                return Err(e);
            }
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Disposed),
        }
    }

    async fn notify(&self, method: &str) -> Result<(), BridgeError> {
        let frame = json!({"jsonrpc": "2.0", "method": method});
        let mut stdin = self.stdin.lock().await;
        write_json_line(&mut *stdin, &frame).await
    }

    fn tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join(" | ")
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Disposing tool server connection");
        if let Err(e) = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .start_kill()
        {
            tracing::debug!(error = %e, "Tool server process already gone");
        }
        self.ledger.fail_all(|| BridgeError::Disposed);
    }
}

/// Client for the tool-invocation protocol. Failed connections are not
/// cached; each describes why in `last_failure` for the fallback path's
/// diagnostics.
pub struct TraeToolsClient {
    config: TraeConfig,
    conn: AsyncMutex<Option<Arc<ToolConnection>>>,
    last_failure: Mutex<Option<String>>,
}

impl TraeToolsClient {
    pub fn new(config: TraeConfig) -> Self {
        Self {
            config,
            conn: AsyncMutex::new(None),
            last_failure: Mutex::new(None),
        }
    }

    /// Reuse the cached connection or establish one. Concurrent callers
    /// serialize behind the mutex, so only one connection attempt runs.
    async fn ensure_connected(&self) -> Result<Arc<ToolConnection>, BridgeError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.is_disposed() {
                return Ok(Arc::clone(conn));
            }
        }
        if let Some(old) = guard.take() {
            old.dispose();
        }

        match self.connect().await {
            Ok(conn) => {
                *guard = Some(Arc::clone(&conn));
                *self.last_failure.lock().unwrap_or_else(|e| e.into_inner()) = None;
                Ok(conn)
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(error = %reason, "Tool server connection failed");
                *self.last_failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<Arc<ToolConnection>, BridgeError> {
        let conn = ToolConnection::open(&self.config).await?;
        let limit = Duration::from_secs(self.config.connect_timeout_secs);

        match tokio::time::timeout(limit, handshake(&conn)).await {
            Ok(Ok(())) => {
                tracing::info!("Tool server connection ready");
                Ok(conn)
            }
            Ok(Err(e)) => {
                let tail = conn.tail();
                conn.dispose();
                Err(BridgeError::AgentUnavailable(format!(
                    "tool server handshake failed: {e} (stderr: {tail})"
                )))
            }
            Err(_) => {
                let tail = conn.tail();
                conn.dispose();
                Err(BridgeError::AgentUnavailable(format!(
                    "tool server handshake timed out after {limit:?} (stderr: {tail})"
                )))
            }
        }
    }

    /// Invoke a named tool and concatenate the text segments of its result.
    /// Empty text is not success - it is `EmptyResult`, which sends the
    /// caller down the fallback path.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        limit: Duration,
    ) -> Result<String, BridgeError> {
        let conn = self.ensure_connected().await?;
        let params = json!({"name": name, "arguments": arguments});
        let result = tokio::time::timeout(limit, conn.request("tools/call", params))
            .await
            .map_err(|_| BridgeError::Timeout(limit))??;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let text = concat_text(&result);
            let detail = if text.is_empty() {
                format!("tool '{name}' failed (stderr: {})", conn.tail())
            } else {
                text
            };
            return Err(BridgeError::Agent(detail));
        }

        let text = concat_text(&result);
        if text.trim().is_empty() {
            return Err(BridgeError::EmptyResult);
        }
        Ok(text)
    }

    /// Run a fresh task.
    pub async fn run_task(&self, text: &str, cwd: &Path) -> Result<String, BridgeError> {
        self.call_tool(
            RUN_TOOL,
            json!({"task": text, "working_dir": cwd}),
            Duration::from_secs(self.config.tool_timeout_secs),
        )
        .await
    }

    /// Session-aware variant: a session waiting for input gets the text as
    /// an observation; anything else starts a new task.
    pub async fn run_task_session(&self, text: &str, cwd: &Path) -> Result<String, BridgeError> {
        let state = match self.call_tool(STATUS_TOOL, json!({}), STATUS_TIMEOUT).await {
            Ok(status) => serde_json::from_str::<Value>(&status)
                .ok()
                .and_then(|v| v.get("state").and_then(Value::as_str).map(str::to_string)),
            Err(BridgeError::EmptyResult) => None,
            Err(e) => return Err(e),
        };

        if state.as_deref() == Some("waiting_for_input") {
            tracing::debug!("Session waiting for input, sending observation");
            self.call_tool(
                OBSERVE_TOOL,
                json!({"observation": text}),
                Duration::from_secs(self.config.tool_timeout_secs),
            )
            .await
        } else {
            self.run_task(text, cwd).await
        }
    }

    /// The reason the most recent connection attempt failed, if any.
    pub fn last_failure(&self) -> Option<String> {
        self.last_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .await
            .as_ref()
            .map(|c| !c.is_disposed())
            .unwrap_or(false)
    }

    pub async fn dispose(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.dispose();
        }
    }
}

async fn handshake(conn: &Arc<ToolConnection>) -> Result<(), BridgeError> {
    conn.request(
        "initialize",
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "switchboard",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
    )
    .await?;
    conn.notify("notifications/initialized").await?;

    let listing = conn.request("tools/list", json!({})).await?;
    let has_tool = listing
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .any(|name| name == RUN_TOOL)
        })
        .unwrap_or(false);
    if !has_tool {
        return Err(BridgeError::AgentUnavailable(format!(
            "tool server does not expose '{RUN_TOOL}'"
        )));
    }
    Ok(())
}

/// Concatenate every text segment of a tools/call result.
fn concat_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|segments| {
            segments
                .iter()
                .filter(|s| s.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|s| s.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_joins_text_segments_only() {
        let result = json!({"content": [
            {"type": "text", "text": "hello "},
            {"type": "image", "data": "..."},
            {"type": "text", "text": "world"},
        ]});
        assert_eq!(concat_text(&result), "hello world");
    }

    #[test]
    fn concat_of_missing_content_is_empty() {
        assert_eq!(concat_text(&json!({})), "");
    }
}
