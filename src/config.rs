// ABOUTME: Configuration for the bridge - backend selection and per-backend settings.
// ABOUTME: Loads from TOML; every field has a default so an empty file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The two interchangeable agent backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Codex,
    Trae,
}

impl Backend {
    pub fn other(self) -> Backend {
        match self {
            Backend::Codex => Backend::Trae,
            Backend::Trae => Backend::Codex,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Codex => "codex",
            Backend::Trae => "trae",
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Codex
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for the long-lived JSON-RPC agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexConfig {
    /// Explicit path to the agent binary; falls back through the resolution
    /// chain when absent
    pub binary: Option<PathBuf>,
    /// Arguments the agent process is started with
    #[serde(default = "default_codex_args")]
    pub args: Vec<String>,
    /// Ceiling on a single turn, seconds
    #[serde(default = "default_turn_timeout")]
    pub turn_timeout_secs: u64,
    /// Whether unrecognized server-initiated requests are approved to keep
    /// the agent moving. The historical behavior; set false to deny them.
    #[serde(default = "default_true")]
    pub auto_approve_unrecognized: bool,
}

fn default_codex_args() -> Vec<String> {
    vec!["app-server".to_string()]
}

fn default_turn_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            binary: None,
            args: default_codex_args(),
            turn_timeout_secs: default_turn_timeout(),
            auto_approve_unrecognized: true,
        }
    }
}

/// Settings for the trae tool server and its CLI fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraeConfig {
    /// Interpreter that runs the tool-server entrypoint
    #[serde(default = "default_python")]
    pub python: String,
    /// Arguments handed to the interpreter to start the server
    #[serde(default = "default_server_args")]
    pub server_args: Vec<String>,
    /// Tool-server connection handshake ceiling, seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Ceiling on one tool invocation, seconds
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Explicit path to the CLI binary used for fallback
    pub cli_binary: Option<PathBuf>,
    /// Agent config file forwarded to the CLI with --config-file
    pub config_file: Option<PathBuf>,
    /// CLI run fails if no output arrives for this long, seconds
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    /// CLI run fails after this long regardless of activity, seconds
    #[serde(default = "default_overall_timeout")]
    pub overall_timeout_secs: u64,
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_server_args() -> Vec<String> {
    vec!["-m".to_string(), "trae_agent.server".to_string()]
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_tool_timeout() -> u64 {
    600
}

fn default_inactivity_timeout() -> u64 {
    300
}

fn default_overall_timeout() -> u64 {
    900
}

impl Default for TraeConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            server_args: default_server_args(),
            connect_timeout_secs: default_connect_timeout(),
            tool_timeout_secs: default_tool_timeout(),
            cli_binary: None,
            config_file: None,
            inactivity_timeout_secs: default_inactivity_timeout(),
            overall_timeout_secs: default_overall_timeout(),
        }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Preferred backend; the other is the runtime fallback
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub codex: CodexConfig,
    #[serde(default)]
    pub trae: TraeConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config TOML")
    }

    /// Find config in standard locations.
    /// Searches: ./switchboard.toml, ~/.config/switchboard/config.toml
    pub fn find_and_load() -> Result<Option<Self>> {
        let candidates = [
            std::env::current_dir()
                .ok()
                .map(|p| p.join("switchboard.toml")),
            config_dir().map(|p| p.join("switchboard/config.toml")),
        ];

        for candidate in candidates.into_iter().flatten() {
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "Found config file");
                return Ok(Some(Self::from_file(&candidate)?));
            }
        }

        Ok(None)
    }
}

fn config_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config"))
}
