// ABOUTME: One-shot CLI fallback for the trae backend, used when the tool server is unreachable.
// ABOUTME: Streams sanitized output under two timeouts; the trajectory file wins over raw capture.

use crate::config::TraeConfig;
use crate::error::BridgeError;
use crate::event::BridgeEvent;
use crate::launcher;
use crate::response::{AgentResponse, BackendMode, ToolInvocation};
use crate::sanitize::scrub;
use crate::trace::TraceRecord;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

pub(crate) const COMMAND: &str = "trae-cli";
const ENV_OVERRIDE: &str = "SWITCHBOARD_TRAE_BIN";

/// What ended the streaming loop, beyond both pipes closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Inactivity,
    Overall,
    Stopped,
}

/// The result of one CLI run. Always produced: CLI failures and
/// trace-parsing failures are tolerated independently.
#[derive(Debug, Clone, PartialEq)]
pub struct CliOutcome {
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
    pub tool_calls: Vec<ToolInvocation>,
    pub timed_out: bool,
}

impl CliOutcome {
    pub fn into_response(self) -> AgentResponse {
        AgentResponse {
            success: self.success,
            content: self.content,
            error: self.error,
            tool_calls: self.tool_calls,
            mode: BackendMode::TraeCli,
        }
    }
}

/// Runs the trae CLI as a one-shot subprocess.
pub struct CliExecutor {
    config: TraeConfig,
    stop_tx: watch::Sender<u64>,
}

impl CliExecutor {
    pub fn new(config: TraeConfig) -> Self {
        let (stop_tx, _) = watch::channel(0);
        Self { config, stop_tx }
    }

    /// Advisory stop: the in-flight run (if any) kills its process and
    /// resolves with whatever was captured.
    pub fn stop(&self) {
        self.stop_tx.send_modify(|generation| *generation += 1);
    }

    /// Run one task. `Err` only when the CLI cannot be spawned at all -
    /// that is backend unavailability, which the facade may answer with the
    /// other backend. Everything after a successful spawn resolves as a
    /// `CliOutcome`.
    pub async fn run(
        &self,
        message: &str,
        cwd: &Path,
        events: Option<mpsc::Sender<BridgeEvent>>,
    ) -> Result<CliOutcome, BridgeError> {
        let trace_path = fresh_trace_path();
        let program =
            launcher::resolve_program(COMMAND, self.config.cli_binary.as_deref(), ENV_OVERRIDE);

        let mut args: Vec<String> = vec!["run".to_string(), message.to_string()];
        if let Some(config_file) = &self.config.config_file {
            args.push("--config-file".to_string());
            args.push(config_file.display().to_string());
        }
        args.extend([
            "--console-type".to_string(),
            "simple".to_string(),
            "--trajectory-file".to_string(),
            trace_path.display().to_string(),
            "--working-dir".to_string(),
            cwd.display().to_string(),
        ]);

        let mut child = launcher::spawn_agent(&program, &args, Some(cwd))?;
        tracing::info!(program = %program.display(), trace = %trace_path.display(), "CLI run started");

        let mut out_lines = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut err_lines = child.stderr.take().map(|s| BufReader::new(s).lines());

        let inactivity = Duration::from_secs(self.config.inactivity_timeout_secs);
        let overall_deadline =
            Instant::now() + Duration::from_secs(self.config.overall_timeout_secs);
        let mut inactivity_deadline = Instant::now() + inactivity;
        let mut stop_rx = self.stop_tx.subscribe();

        let mut captured = String::new();
        let mut out_open = out_lines.is_some();
        let mut err_open = err_lines.is_some();

        let interruption: Option<Interruption> = loop {
            if !out_open && !err_open {
                break None;
            }
            tokio::select! {
                line = next_line(&mut out_lines), if out_open => match line {
                    Some(line) => {
                        ingest(&mut captured, &line, events.as_ref());
                        inactivity_deadline = Instant::now() + inactivity;
                    }
                    None => out_open = false,
                },
                line = next_line(&mut err_lines), if err_open => match line {
                    Some(line) => {
                        ingest(&mut captured, &line, events.as_ref());
                        inactivity_deadline = Instant::now() + inactivity;
                    }
                    None => err_open = false,
                },
                _ = tokio::time::sleep_until(inactivity_deadline) => break Some(Interruption::Inactivity),
                _ = tokio::time::sleep_until(overall_deadline) => break Some(Interruption::Overall),
                _ = stop_rx.changed() => break Some(Interruption::Stopped),
            }
        };

        if let Some(why) = interruption {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill CLI process");
            }
            let _ = std::fs::remove_file(&trace_path);
            let (error, timed_out) = match why {
                Interruption::Inactivity => (
                    format!(
                        "no output for {}s, process terminated",
                        self.config.inactivity_timeout_secs
                    ),
                    true,
                ),
                Interruption::Overall => (
                    format!(
                        "run exceeded {}s, process terminated",
                        self.config.overall_timeout_secs
                    ),
                    true,
                ),
                Interruption::Stopped => ("run stopped".to_string(), false),
            };
            tracing::warn!(%error, "CLI run interrupted");
            return Ok(CliOutcome {
                success: false,
                tool_calls: extract_tool_calls(&captured),
                content: captured,
                error: Some(error),
                timed_out,
            });
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                let _ = std::fs::remove_file(&trace_path);
                return Ok(CliOutcome {
                    success: false,
                    tool_calls: extract_tool_calls(&captured),
                    content: captured,
                    error: Some(format!("failed to reap CLI process: {e}")),
                    timed_out: false,
                });
            }
        };

        let record = TraceRecord::from_file(&trace_path);
        let _ = std::fs::remove_file(&trace_path);

        // Exit code is authoritative; the trace enriches content but an
        // explicit success flag in it cannot overturn a failed exit.
        let exit_ok = status.success();
        let outcome = match record {
            Some(record) => {
                let trace_failed = record.success == Some(false);
                let success = exit_ok && !trace_failed;
                let error = if !exit_ok {
                    Some(format!("agent exited with status {:?}", status.code()))
                } else if trace_failed {
                    Some("agent reported failure in its trajectory".to_string())
                } else {
                    None
                };
                CliOutcome {
                    success,
                    content: record.final_result.unwrap_or_else(|| captured.clone()),
                    error,
                    tool_calls: record.tool_calls,
                    timed_out: false,
                }
            }
            None => CliOutcome {
                success: exit_ok,
                tool_calls: extract_tool_calls(&captured),
                error: (!exit_ok)
                    .then(|| format!("agent exited with status {:?}", status.code())),
                content: captured,
                timed_out: false,
            },
        };

        tracing::info!(success = outcome.success, "CLI run finished");
        Ok(outcome)
    }
}

async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>>,
) -> Option<String> {
    match lines {
        Some(lines) => match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "CLI pipe read failed");
                None
            }
        },
        None => None,
    }
}

fn ingest(captured: &mut String, line: &str, events: Option<&mpsc::Sender<BridgeEvent>>) {
    let clean = scrub(line);
    captured.push_str(&clean);
    captured.push('\n');
    if let Some(tx) = events {
        let mut chunk = clean;
        chunk.push('\n');
        let _ = tx.try_send(BridgeEvent::Text(chunk));
    }
}

fn fresh_trace_path() -> PathBuf {
    std::env::temp_dir().join(format!("trae-trajectory-{}.json", uuid::Uuid::new_v4()))
}

fn tool_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:Calling tool|Tool call|\[tool\])[:\s]+([A-Za-z0-9_\-]+)")
            .expect("tool line regex")
    })
}

/// Best-effort extraction of tool-call-looking lines from raw output, used
/// only when no trajectory file is available.
fn extract_tool_calls(captured: &str) -> Vec<ToolInvocation> {
    tool_line_re()
        .captures_iter(captured)
        .enumerate()
        .map(|(i, caps)| ToolInvocation {
            call_id: format!("raw-{i}"),
            name: caps[1].to_string(),
            arguments: serde_json::Value::Null,
            result: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tool_looking_lines() {
        let captured = "starting\nCalling tool: bash\nsome output\nTool call: edit_file\n";
        let calls = extract_tool_calls(captured);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "bash");
        assert_eq!(calls[1].name, "edit_file");
    }

    #[test]
    fn plain_output_extracts_nothing() {
        assert!(extract_tool_calls("just some text\nno tools here\n").is_empty());
    }

    #[test]
    fn trace_paths_do_not_collide() {
        assert_ne!(fresh_trace_path(), fresh_trace_path());
    }
}
