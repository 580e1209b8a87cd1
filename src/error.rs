// ABOUTME: Typed error taxonomy shared by every bridge component.
// ABOUTME: Callers match on variants; the facade flattens them into AgentResponse.error text.

use std::time::Duration;
use thiserror::Error;

/// Failures the bridge can produce.
///
/// Resolution failure is deliberately absent: executable resolution never
/// fails (the launcher falls back to the bare command name and the failure
/// surfaces at spawn time as `Spawn`).
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The agent process could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A frame on the wire was malformed or had an unrecognized shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reading from or writing to a dead process stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// The agent failed to reach readiness (spawn, handshake, or required
    /// capability missing).
    #[error("agent unavailable: {0}")]
    AgentUnavailable(String),

    /// The remote agent reported an error for a request we sent.
    #[error("agent error: {0}")]
    Agent(String),

    /// The protocol completed but returned no usable text. Triggers the
    /// caller's fallback path rather than surfacing as a user error.
    #[error("agent returned no usable result")]
    EmptyResult,

    /// An operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An operation was attempted on, or interrupted by, a torn-down
    /// connection.
    #[error("connection disposed")]
    Disposed,
}

impl BridgeError {
    /// Whether this failure means the backend cannot serve requests at all,
    /// as opposed to one request going wrong. Unavailability is what makes
    /// the facade try the other backend.
    pub fn is_unavailability(&self) -> bool {
        matches!(
            self,
            BridgeError::Spawn { .. } | BridgeError::AgentUnavailable(_) | BridgeError::Disposed
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
