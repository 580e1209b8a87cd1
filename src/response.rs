// ABOUTME: The uniform result type callers get back, whichever backend produced it.
// ABOUTME: Every failure path yields a textual error here, never an unhandled panic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which backend and transport produced a response, for observability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// The long-lived JSON-RPC agent process
    CodexRpc,
    /// The trae tool server
    TraeTools,
    /// The trae CLI fallback
    TraeCli,
}

impl BackendMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendMode::CodexRpc => "codex_rpc",
            BackendMode::TraeTools => "trae_tools",
            BackendMode::TraeCli => "trae_cli",
        }
    }
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named tool call the agent made, with its correlated result when known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    /// Correlation id shared between the call and its result
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    /// Result text, if a matching result record was found
    pub result: Option<String>,
}

/// The uniform response returned by the facade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResponse {
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
    pub mode: BackendMode,
}

impl AgentResponse {
    pub fn ok(mode: BackendMode, content: String) -> Self {
        Self {
            success: true,
            content,
            error: None,
            tool_calls: Vec::new(),
            mode,
        }
    }

    pub fn failure(mode: BackendMode, error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            error: Some(error.into()),
            tool_calls: Vec::new(),
            mode,
        }
    }
}
