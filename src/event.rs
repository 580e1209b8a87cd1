// ABOUTME: Progress events streamed to the chat surface while a message is in flight.
// ABOUTME: Includes approval requests, which the UI answers via AgentBridge::respond_to_approval.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Events emitted while the bridge works on a message.
///
/// Delivered over a `tokio::sync::mpsc` channel supplied by the caller;
/// a caller that passes no channel simply gets the final `AgentResponse`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BridgeEvent {
    /// Incremental agent-authored text, shown as it arrives.
    Text(String),

    /// Tool started execution.
    ToolStart {
        /// Identifier correlating start and end
        id: String,
        /// Tool name
        name: String,
        /// Input passed to the tool
        input: Value,
    },

    /// Tool finished execution.
    ToolEnd {
        /// Matches the id from ToolStart
        id: String,
        name: String,
        output: Value,
        success: bool,
    },

    /// The remote agent asked for authorization before acting. The UI renders
    /// an approve/deny affordance and calls back with the request id.
    ApprovalRequested {
        request_id: u64,
        kind: ApprovalKind,
        /// The proposed command (empty for patch approvals)
        command: String,
        cwd: PathBuf,
    },
}

/// What the remote agent is asking permission for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApprovalKind {
    /// Run a shell command
    ExecCommand,
    /// Apply a file patch
    ApplyPatch,
}

/// The closed set of decisions a caller may return for an approval request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    ApprovedForSession,
    Denied,
    Abort,
}

impl ApprovalDecision {
    /// The string the wire protocol expects inside `result.decision`.
    pub fn wire_str(self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::ApprovedForSession => "approved_for_session",
            ApprovalDecision::Denied => "denied",
            ApprovalDecision::Abort => "abort",
        }
    }
}
