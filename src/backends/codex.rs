// ABOUTME: Codex backend - a long-lived JSON-RPC agent process over line-framed stdio.
// ABOUTME: Threads bound to working directories, turns with buffered completions, server-initiated approvals.

use crate::config::CodexConfig;
use crate::error::BridgeError;
use crate::event::{ApprovalDecision, ApprovalKind, BridgeEvent};
use crate::launcher;
use crate::transport::{write_json_line, JsonLineReader, RequestLedger};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

pub(crate) const COMMAND: &str = "codex";
const ENV_OVERRIDE: &str = "SWITCHBOARD_CODEX_BIN";

/// How long a best-effort interrupt waits for its acknowledgement.
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Ceiling on the initialize handshake.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the agent can send us, decoded once at the transport boundary.
#[derive(Debug)]
enum Inbound {
    Response {
        id: u64,
        result: Result<Value, RpcError>,
    },
    ServerRequest {
        id: u64,
        request: ServerRequest,
    },
    Notification(Notification),
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug)]
enum ServerRequest {
    ExecApproval { command: String, cwd: PathBuf },
    PatchApproval { summary: String, cwd: PathBuf },
    Other { method: String },
}

#[derive(Debug)]
enum Notification {
    TurnStarted { turn_id: String },
    TurnCompleted { turn_id: String, params: Value },
    AgentMessageDelta { text: String },
    Other { method: String },
}

/// Decode one frame. A message with both `method` and `id` is a server
/// request; `method` without `id` is a notification; `id` without `method`
/// is a response.
fn parse_inbound(value: Value) -> Result<Inbound, BridgeError> {
    let obj = value
        .as_object()
        .ok_or_else(|| BridgeError::Protocol("frame is not an object".into()))?;
    let id = obj.get("id").and_then(Value::as_u64);
    let method = obj.get("method").and_then(Value::as_str);
    let params = obj.get("params").cloned().unwrap_or(Value::Null);

    match (method, id) {
        (Some(method), Some(id)) => {
            let request = match method {
                "execCommandApproval" => ServerRequest::ExecApproval {
                    command: command_string(&params),
                    cwd: param_cwd(&params),
                },
                "applyPatchApproval" => ServerRequest::PatchApproval {
                    summary: params
                        .get("summary")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    cwd: param_cwd(&params),
                },
                other => ServerRequest::Other {
                    method: other.to_string(),
                },
            };
            Ok(Inbound::ServerRequest { id, request })
        }
        (Some(method), None) => {
            let notification = match method {
                "turn/started" => Notification::TurnStarted {
                    turn_id: require_turn_id(&params)?,
                },
                "turn/completed" => Notification::TurnCompleted {
                    turn_id: require_turn_id(&params)?,
                    params,
                },
                "item/agent_message_delta" => Notification::AgentMessageDelta {
                    text: params
                        .get("delta")
                        .or_else(|| params.get("text"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
                other => Notification::Other {
                    method: other.to_string(),
                },
            };
            Ok(Inbound::Notification(notification))
        }
        (None, Some(id)) => {
            let result = if let Some(error) = obj.get("error") {
                Err(RpcError {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                })
            } else {
                Ok(obj.get("result").cloned().unwrap_or(Value::Null))
            };
            Ok(Inbound::Response { id, result })
        }
        (None, None) => Err(BridgeError::Protocol(
            "frame has neither method nor id".into(),
        )),
    }
}

fn require_turn_id(params: &Value) -> Result<String, BridgeError> {
    params
        .get("turn_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::Protocol("turn notification missing turn_id".into()))
}

fn command_string(params: &Value) -> String {
    match params.get("command") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

fn param_cwd(params: &Value) -> PathBuf {
    params
        .get("cwd")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .unwrap_or_default()
}

/// The last agent-authored message in a completed turn's item list.
fn last_agent_message(completed: &Value) -> Option<String> {
    let items = completed.get("items")?.as_array()?;
    items.iter().rev().find_map(|item| {
        if item.get("type")?.as_str()? != "agent_message" {
            return None;
        }
        Some(item.get("text")?.as_str()?.to_string())
    })
}

#[derive(Default)]
struct TurnState {
    /// Completions that arrived before anyone waited for them, by turn id.
    /// Consumed at most once.
    completions: HashMap<String, Value>,
    waiters: HashMap<String, oneshot::Sender<Value>>,
    current_turn: Option<String>,
    /// The live thread and the working directory it is bound to
    thread: Option<(String, PathBuf)>,
    /// Outstanding server-initiated approvals awaiting a decision
    approvals: HashMap<u64, ApprovalKind>,
}

/// One live connection to the agent process. At most one exists per client;
/// re-initialization disposes the old connection before spawning anew.
struct Connection {
    child: Mutex<Child>,
    stdin: AsyncMutex<ChildStdin>,
    ledger: RequestLedger,
    state: Mutex<TurnState>,
    events: Mutex<Option<mpsc::Sender<BridgeEvent>>>,
    disposed: AtomicBool,
    auto_approve_unrecognized: bool,
}

impl Connection {
    async fn open(config: &CodexConfig) -> Result<Arc<Self>, BridgeError> {
        let program = launcher::resolve_program(COMMAND, config.binary.as_deref(), ENV_OVERRIDE);
        let mut child = launcher::spawn_agent(&program, &config.args, None)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Transport("agent stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Transport("agent stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        tracing::warn!(stderr = %line, "Agent stderr");
                    }
                }
            });
        }

        let conn = Arc::new(Connection {
            child: Mutex::new(child),
            stdin: AsyncMutex::new(stdin),
            ledger: RequestLedger::new(),
            state: Mutex::new(TurnState::default()),
            events: Mutex::new(None),
            disposed: AtomicBool::new(false),
            auto_approve_unrecognized: config.auto_approve_unrecognized,
        });

        let reader_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            let mut reader = JsonLineReader::new(stdout);
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(value) => reader_conn.dispatch(value).await,
                    // Malformed frames are reported but do not end the channel
                    Err(e) => tracing::warn!(error = %e, "Discarding bad frame"),
                }
            }
            tracing::debug!("Agent stdout closed");
            reader_conn.dispose();
        });

        let init = tokio::time::timeout(
            INIT_TIMEOUT,
            conn.request(
                "initialize",
                json!({
                    "client_info": {
                        "name": "switchboard",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
        )
        .await
        .unwrap_or(Err(BridgeError::Timeout(INIT_TIMEOUT)));
        if let Err(e) = init {
            conn.dispose();
            return Err(BridgeError::AgentUnavailable(format!(
                "initialize failed: {e}"
            )));
        }

        tracing::info!(program = %program.display(), "Agent connection ready");
        Ok(conn)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Idempotent teardown: kill the process, fail pending requests, drop
    /// waiters so in-flight callers settle with Disposed.
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Disposing agent connection");
        if let Err(e) = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .start_kill()
        {
            tracing::debug!(error = %e, "Agent process already gone");
        }
        self.ledger.fail_all(|| BridgeError::Disposed);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiters.clear();
        state.approvals.clear();
    }

    fn set_events(&self, tx: Option<mpsc::Sender<BridgeEvent>>) {
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }

    /// Returns whether the event was actually handed to a listener.
    fn emit(&self, event: BridgeEvent) -> bool {
        let guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(event = ?dropped, "Event channel full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Event channel closed, receiver dropped");
                false
            }
        }
    }

    /// Issue a client-to-server request and await its correlated response.
    async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        if self.is_disposed() {
            return Err(BridgeError::Disposed);
        }
        let (id, rx) = self.ledger.register();
        let frame = json!({"id": id, "method": method, "params": params});
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

    /// Answer a server-initiated request.
    async fn respond(&self, id: u64, result: Value) -> Result<(), BridgeError> {
        let frame = json!({"id": id, "result": result});
        let mut stdin = self.stdin.lock().await;
        write_json_line(&mut *stdin, &frame).await
    }

    async fn dispatch(&self, value: Value) {
        match parse_inbound(value) {
            Err(e) => tracing::warn!(error = %e, "Discarding unrecognizable frame"),
            Ok(Inbound::Response { id, result }) => {
                let delivered = self.ledger.fulfill(
                    id,
                    result.map_err(|e| {
                        BridgeError::Agent(format!("{} (code {})", e.message, e.code))
                    }),
                );
                if !delivered {
                    tracing::debug!(id, "Response for unknown request id, ignoring");
                }
            }
            Ok(Inbound::ServerRequest { id, request }) => {
                self.handle_server_request(id, request).await;
            }
            Ok(Inbound::Notification(notification)) => self.handle_notification(notification),
        }
    }

    async fn handle_server_request(&self, id: u64, request: ServerRequest) {
        match request {
            ServerRequest::ExecApproval { command, cwd } => {
                self.queue_approval(id, ApprovalKind::ExecCommand, command, cwd)
                    .await;
            }
            ServerRequest::PatchApproval { summary, cwd } => {
                self.queue_approval(id, ApprovalKind::ApplyPatch, summary, cwd)
                    .await;
            }
            ServerRequest::Other { method } => {
                // Liveness policy: answering something beats stalling the
                // agent. Which answer is configurable.
                let decision = if self.auto_approve_unrecognized {
                    ApprovalDecision::Approved
                } else {
                    ApprovalDecision::Denied
                };
                tracing::warn!(%method, decision = decision.wire_str(), "Unrecognized server request");
                self.send_decision(id, decision).await;
            }
        }
    }

    async fn queue_approval(&self, id: u64, kind: ApprovalKind, command: String, cwd: PathBuf) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.approvals.insert(id, kind);
        }
        let delivered = self.emit(BridgeEvent::ApprovalRequested {
            request_id: id,
            kind,
            command,
            cwd,
        });
        if !delivered {
            // No surface to ask. Approving keeps the agent from stalling;
            // patch approvals additionally have no meaningful deny path here.
            tracing::warn!(request_id = id, ?kind, "No approval listener attached, approving");
            let known = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.approvals.remove(&id).is_some()
            };
            if known {
                self.send_decision(id, ApprovalDecision::Approved).await;
            }
        }
    }

    async fn send_decision(&self, id: u64, decision: ApprovalDecision) {
        if let Err(e) = self
            .respond(id, json!({"decision": decision.wire_str()}))
            .await
        {
            tracing::warn!(error = %e, request_id = id, "Failed to send approval decision");
        }
    }

    /// Exactly one decision per request id; later calls are no-ops.
    async fn respond_approval(
        &self,
        request_id: u64,
        decision: ApprovalDecision,
    ) -> Result<(), BridgeError> {
        let known = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.approvals.remove(&request_id).is_some()
        };
        if !known {
            tracing::debug!(request_id, "Decision for unknown or already-answered approval");
            return Ok(());
        }
        self.respond(request_id, json!({"decision": decision.wire_str()}))
            .await
    }

    fn handle_notification(&self, notification: Notification) {
        match notification {
            Notification::TurnStarted { turn_id } => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.current_turn = Some(turn_id);
            }
            Notification::TurnCompleted { turn_id, params } => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.current_turn.as_deref() == Some(turn_id.as_str()) {
                    state.current_turn = None;
                }
                // Deliver to the waiter if one is registered; otherwise
                // buffer so a waiter that attaches later still sees it.
                match state.waiters.remove(&turn_id) {
                    Some(tx) => {
                        let _ = tx.send(params);
                    }
                    None => {
                        state.completions.insert(turn_id, params);
                    }
                }
            }
            Notification::AgentMessageDelta { text } => {
                if !text.is_empty() {
                    let _ = self.emit(BridgeEvent::Text(text));
                }
            }
            Notification::Other { method } => {
                tracing::debug!(%method, "Ignoring notification");
            }
        }
    }

    /// Await the completion notification for a turn. A completion buffered
    /// before the waiter attached is consumed here, exactly once.
    async fn await_completion(&self, turn_id: &str, limit: Duration) -> Result<Value, BridgeError> {
        let rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(params) = state.completions.remove(turn_id) {
                return Ok(params);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(turn_id.to_string(), tx);
            rx
        };
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(params)) => Ok(params),
            Ok(Err(_)) => Err(BridgeError::Disposed),
            Err(_) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.waiters.remove(turn_id);
                Err(BridgeError::Timeout(limit))
            }
        }
    }

    /// A thread is bound to one working directory; a different directory
    /// means a new thread.
    async fn ensure_thread(&self, cwd: &Path) -> Result<String, BridgeError> {
        let existing = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.thread.clone()
        };
        if let Some((id, bound)) = existing {
            if bound == cwd {
                return Ok(id);
            }
            tracing::debug!(old = %bound.display(), new = %cwd.display(), "Working directory changed, starting new thread");
        }

        let resp = self.request("thread/start", json!({"cwd": cwd})).await?;
        let id = resp
            .get("thread_id")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Protocol("thread/start response missing thread_id".into()))?
            .to_string();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.thread = Some((id.clone(), cwd.to_path_buf()));
        }
        tracing::info!(thread_id = %id, cwd = %cwd.display(), "Thread ready");
        Ok(id)
    }

    async fn run_turn(&self, text: &str, cwd: &Path, limit: Duration) -> Result<String, BridgeError> {
        let thread_id = self.ensure_thread(cwd).await?;
        let resp = self
            .request(
                "turn/start",
                json!({
                    "thread_id": thread_id,
                    "input": [{"type": "text", "text": text}],
                }),
            )
            .await?;
        let turn_id = resp
            .get("turn_id")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Protocol("turn/start response missing turn_id".into()))?
            .to_string();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.current_turn = Some(turn_id.clone());
        }

        let completed = self.await_completion(&turn_id, limit).await?;
        // An empty item list is a degenerate answer, not an error.
        Ok(last_agent_message(&completed).unwrap_or_else(|| "(no response)".to_string()))
    }

    async fn interrupt(&self) {
        let turn_id = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.current_turn.clone()
        };
        let Some(turn_id) = turn_id else {
            return;
        };
        match tokio::time::timeout(
            INTERRUPT_TIMEOUT,
            self.request("turn/interrupt", json!({"turn_id": turn_id})),
        )
        .await
        {
            Ok(Ok(_)) => tracing::debug!("Turn interrupted"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Turn interrupt failed"),
            Err(_) => tracing::warn!("Turn interrupt unacknowledged"),
        }
    }
}

/// Client for the long-lived JSON-RPC agent. Lazily connects; concurrent
/// callers share one in-flight initialization (serialized behind the
/// connection mutex, so exactly one process is ever spawned).
pub struct CodexClient {
    config: CodexConfig,
    conn: AsyncMutex<Option<Arc<Connection>>>,
}

impl CodexClient {
    pub fn new(config: CodexConfig) -> Self {
        Self {
            config,
            conn: AsyncMutex::new(None),
        }
    }

    async fn ensure_ready(&self) -> Result<Arc<Connection>, BridgeError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.is_disposed() {
                return Ok(Arc::clone(conn));
            }
            tracing::info!("Agent connection lost, reconnecting");
        }
        // Fully dispose the previous connection before spawning a new one.
        if let Some(old) = guard.take() {
            old.dispose();
        }
        let conn = Connection::open(&self.config).await.map_err(|e| match e {
            e @ BridgeError::AgentUnavailable(_) => e,
            other => BridgeError::AgentUnavailable(other.to_string()),
        })?;
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Send one message and await the agent's final text for the turn.
    pub async fn send_message(
        &self,
        text: &str,
        cwd: &Path,
        events: Option<mpsc::Sender<BridgeEvent>>,
    ) -> Result<String, BridgeError> {
        let conn = self.ensure_ready().await?;
        conn.set_events(events);
        let limit = Duration::from_secs(self.config.turn_timeout_secs);
        // The outer ceiling also covers the thread/turn request phase, so a
        // mute agent cannot hang the caller.
        let result = match tokio::time::timeout(limit, conn.run_turn(text, cwd, limit)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(limit)),
        };
        conn.set_events(None);
        result
    }

    /// Best-effort interrupt of the current turn; a no-op without one.
    pub async fn interrupt_current_turn(&self) {
        let conn = { self.conn.lock().await.as_ref().cloned() };
        if let Some(conn) = conn {
            if !conn.is_disposed() {
                conn.interrupt().await;
            }
        }
    }

    /// Forward a UI decision for a server-initiated approval request.
    pub async fn respond_to_approval(
        &self,
        request_id: u64,
        decision: ApprovalDecision,
    ) -> Result<(), BridgeError> {
        let conn = { self.conn.lock().await.as_ref().cloned() };
        match conn {
            Some(conn) if !conn.is_disposed() => conn.respond_approval(request_id, decision).await,
            _ => {
                tracing::debug!(request_id, "No live connection for approval decision");
                Ok(())
            }
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.conn
            .lock()
            .await
            .as_ref()
            .map(|c| !c.is_disposed())
            .unwrap_or(false)
    }

    /// Tear down the connection. Safe to call repeatedly.
    pub async fn dispose(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_response_frames() {
        let inbound = parse_inbound(json!({"id": 3, "result": {"ok": true}})).unwrap();
        match inbound {
            Inbound::Response { id, result } => {
                assert_eq!(id, 3);
                assert_eq!(result.unwrap(), json!({"ok": true}));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_error_responses() {
        let inbound = parse_inbound(json!({"id": 4, "error": {"code": -1, "message": "nope"}}))
            .unwrap();
        match inbound {
            Inbound::Response { result, .. } => {
                let err = result.unwrap_err();
                assert_eq!(err.message, "nope");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn method_with_id_is_server_request() {
        let inbound = parse_inbound(json!({
            "id": 9,
            "method": "execCommandApproval",
            "params": {"command": ["rm", "-rf", "build"], "cwd": "/tmp/w"},
        }))
        .unwrap();
        match inbound {
            Inbound::ServerRequest {
                id,
                request: ServerRequest::ExecApproval { command, cwd },
            } => {
                assert_eq!(id, 9);
                assert_eq!(command, "rm -rf build");
                assert_eq!(cwd, PathBuf::from("/tmp/w"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn method_without_id_is_notification() {
        let inbound = parse_inbound(json!({
            "method": "turn/completed",
            "params": {"turn_id": "t-1", "items": []},
        }))
        .unwrap();
        assert!(matches!(
            inbound,
            Inbound::Notification(Notification::TurnCompleted { .. })
        ));
    }

    #[test]
    fn frame_without_method_or_id_is_protocol_error() {
        assert!(parse_inbound(json!({"params": {}})).is_err());
    }

    #[test]
    fn last_agent_message_takes_the_last_one() {
        let completed = json!({"items": [
            {"type": "agent_message", "text": "first"},
            {"type": "tool_call", "name": "bash"},
            {"type": "agent_message", "text": "second"},
        ]});
        assert_eq!(last_agent_message(&completed).as_deref(), Some("second"));
    }

    #[test]
    fn empty_item_list_has_no_message() {
        assert!(last_agent_message(&json!({"items": []})).is_none());
    }
}
