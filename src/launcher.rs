// ABOUTME: Resolves agent executables and spawns them with piped stdio.
// ABOUTME: Resolution never fails; a missing binary surfaces at spawn time instead.

use crate::error::BridgeError;
use std::path::{Path, PathBuf};
use tokio::process::{Child, Command};

/// Resolve a concrete executable path for an agent command.
///
/// Tried in order: the explicit override, the env-var override, a bundled
/// platform/arch binary discovered in known install directories, and finally
/// the bare command name (deferring failure to spawn time).
pub fn resolve_program(command: &str, override_path: Option<&Path>, env_var: &str) -> PathBuf {
    if let Some(path) = override_path {
        if path.exists() {
            return path.to_path_buf();
        }
        tracing::warn!(path = %path.display(), "Configured binary override does not exist, ignoring");
    }

    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            let path = PathBuf::from(&value);
            if path.exists() {
                return path;
            }
            tracing::warn!(%env_var, path = %value, "Env override does not exist, ignoring");
        }
    }

    if let Some(bundled) = find_bundled(command) {
        return bundled;
    }

    PathBuf::from(command)
}

/// Directories where a bundled agent binary may have been installed.
fn install_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(home) = std::env::var("HOME") {
        dirs.push(PathBuf::from(&home).join(".local/share/switchboard/bin"));
    }
    dirs.push(PathBuf::from("/usr/local/lib/switchboard/bin"));
    // Alongside our own executable, for packaged installs.
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            dirs.push(parent.to_path_buf());
        }
    }
    dirs
}

fn find_bundled(command: &str) -> Option<PathBuf> {
    let qualified = format!(
        "{}-{}-{}",
        command,
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    for dir in install_dirs() {
        for name in [qualified.as_str(), command] {
            for candidate in platform_candidates(&dir, name) {
                if candidate.is_file() {
                    tracing::debug!(path = %candidate.display(), "Found bundled agent binary");
                    return Some(candidate);
                }
            }
        }
    }
    None
}

#[cfg(windows)]
fn platform_candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![
        dir.join(format!("{name}.exe")),
        dir.join(format!("{name}.cmd")),
        dir.join(name),
    ]
}

#[cfg(not(windows))]
fn platform_candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![dir.join(name)]
}

/// Spawn an agent process with piped stdio.
///
/// Merges the parent environment with the fixed variables agents need for
/// correct text encoding and for identifying the bridge as their caller.
pub fn spawn_agent(
    program: &Path,
    args: &[String],
    cwd: Option<&Path>,
) -> Result<Child, BridgeError> {
    let display_name = program.display().to_string();

    if display_name.contains("..") || display_name.contains('\0') {
        return Err(BridgeError::Spawn {
            program: display_name,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "suspicious program path"),
        });
    }
    if let Some(dir) = cwd {
        if !dir.is_dir() {
            return Err(BridgeError::Spawn {
                program: display_name,
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("working directory does not exist: {}", dir.display()),
                ),
            });
        }
    }

    tracing::debug!(program = %display_name, ?args, cwd = ?cwd, "Spawning agent process");

    let mut cmd = base_command(program);
    cmd.args(args)
        .env("LANG", "C.UTF-8")
        .env("LC_ALL", "C.UTF-8")
        .env("PYTHONIOENCODING", "utf-8")
        .env("SWITCHBOARD_BRIDGE", "1")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    cmd.spawn().map_err(|source| BridgeError::Spawn {
        program: display_name,
        source,
    })
}

/// `.cmd`/`.bat` wrappers cannot be executed directly on Windows; everything
/// else runs as-is.
#[cfg(windows)]
fn base_command(program: &Path) -> Command {
    let needs_shell = program
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("cmd") || e.eq_ignore_ascii_case("bat"))
        .unwrap_or(false);
    if needs_shell {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(program);
        cmd
    } else {
        Command::new(program)
    }
}

#[cfg(not(windows))]
fn base_command(program: &Path) -> Command {
    Command::new(program)
}
