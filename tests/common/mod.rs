// ABOUTME: Shared helpers for integration tests - fake agent scripts on disk.
// ABOUTME: Scripts speak the wire protocols over stdio so no real agent is needed.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

/// Write an executable shell script into `dir` and return its path.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// A file that exists but cannot be executed; spawning it fails
/// deterministically.
pub fn non_executable(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, "not a program").expect("write file");
    path
}
