//! Error types for provisio-exec

use std::time::Duration;

use thiserror::Error;

/// Marker carried by every timeout that ended in a forced kill.
///
/// Callers that only see the rendered message use it to tell "timed out"
/// apart from "exited with error".
pub const KILLED_MARKER: &str = "signal: killed";

/// Errors that can occur while running a bounded command
#[derive(Error, Debug)]
pub enum ExecError {
    /// Shell name not recognised
    #[error("unsupported shell type: {0}")]
    UnsupportedShell(String),

    /// Nothing to run
    #[error("command is empty")]
    EmptyCommand,

    /// The process could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the process failed
    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The timeout fired and the process group was killed
    #[error("{command} timed out after {}s: signal: killed", timeout.as_secs_f64())]
    TimedOutKilled { command: String, timeout: Duration },

    /// The timeout fired but force-kill was disabled; the process keeps running
    #[error("{command} timed out after {}s (process left running)", timeout.as_secs_f64())]
    TimedOut { command: String, timeout: Duration },

    /// The process exited unsuccessfully
    #[error("{command} exited with {status}: {message}")]
    Failed {
        command: String,
        status: String,
        /// Captured stderr, or the joined stdout+stderr when stderr was empty.
        message: String,
        /// Joined stdout+stderr, kept for diagnostics.
        output: String,
    },

    /// Sending the kill signal to the process group failed
    #[error("failed to kill process group {pgid}: {source}")]
    Kill {
        pgid: u32,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    /// `true` for both timeout variants.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ExecError::TimedOutKilled { .. } | ExecError::TimedOut { .. }
        )
    }

    /// Configuration errors are never retried.
    pub fn is_config(&self) -> bool {
        matches!(self, ExecError::UnsupportedShell(_) | ExecError::EmptyCommand)
    }

    /// Joined stdout+stderr of a failed run, if the process produced any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecError::Failed { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

/// Result type for command execution
pub type ExecResult<T> = std::result::Result<T, ExecError>;
