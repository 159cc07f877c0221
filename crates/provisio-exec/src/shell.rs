//! Shell selection for bounded commands.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ExecError;

/// How a command string is handed to the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShellKind {
    /// Direct exec: the command is a program path, arguments are passed separately.
    None,
    /// `sh -c "<command>"`
    Sh,
    /// `bash -c "<command>"`
    Bash,
}

impl ShellKind {
    /// Pick the best available shell: bash, then sh, else direct exec.
    pub fn detect() -> Self {
        if find_in_path("bash").is_some() {
            ShellKind::Bash
        } else if find_in_path("sh").is_some() {
            ShellKind::Sh
        } else {
            ShellKind::None
        }
    }

    /// Executable used to interpret the command, if any.
    pub fn program(&self) -> Option<&'static str> {
        match self {
            ShellKind::None => None,
            ShellKind::Sh => Some("sh"),
            ShellKind::Bash => Some("bash"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShellKind::None => "none",
            ShellKind::Sh => "sh",
            ShellKind::Bash => "bash",
        }
    }
}

impl FromStr for ShellKind {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "exec" => Ok(ShellKind::None),
            "sh" | "/bin/sh" => Ok(ShellKind::Sh),
            "bash" | "/bin/bash" => Ok(ShellKind::Bash),
            other => Err(ExecError::UnsupportedShell(other.to_string())),
        }
    }
}

impl std::fmt::Display for ShellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Locate an executable by name on `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
