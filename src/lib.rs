// ABOUTME: Bridges an editor chat surface to external coding-agent processes.
// ABOUTME: One facade over a JSON-RPC agent and a tool-server/CLI agent with layered fallback.

pub mod backends;
pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod launcher;
pub mod response;
pub mod sanitize;
pub mod trace;
pub mod transport;

pub use bridge::{AgentBridge, BridgeInfo};
pub use config::{Backend, BridgeConfig, CodexConfig, TraeConfig};
pub use error::BridgeError;
pub use event::{ApprovalDecision, ApprovalKind, BridgeEvent};
pub use response::{AgentResponse, BackendMode, ToolInvocation};
