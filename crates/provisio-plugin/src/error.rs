//! Error types for plugin supervision and driver calls.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the plugin layer.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The resolved plugin binary does not exist.
    #[error("plugin binary not found for driver {name}: {}", path.display())]
    BinaryNotFound { name: String, path: PathBuf },

    /// The plugin path could not be made absolute.
    #[error("cannot resolve plugin path for driver {name}: {source}")]
    PathResolution {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The running executable could not be located for self re-invocation.
    #[error("cannot locate current executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("failed to start plugin {identity}: {source}")]
    Spawn {
        identity: String,
        #[source]
        source: std::io::Error,
    },

    /// `serve` was called twice on the same handle.
    #[error("plugin {identity} was already started")]
    AlreadyStarted { identity: String },

    #[error("plugin {identity} has not been started")]
    NotStarted { identity: String },

    #[error("failed waiting for plugin {identity}: {source}")]
    Wait {
        identity: String,
        #[source]
        source: std::io::Error,
    },

    /// The plugin process ended unsuccessfully.
    #[error("plugin {identity} exited with {status}")]
    Exited { identity: String, status: String },

    #[error("plugin {identity} did not report an address within {}s", timeout.as_secs_f64())]
    HandshakeTimeout { identity: String, timeout: Duration },

    /// Standard output closed before the handshake line arrived.
    #[error("plugin {identity} closed its output before reporting an address")]
    HandshakeAborted { identity: String },

    /// The handshake line was consumed by an earlier, failed discovery.
    #[error("plugin {identity} handshake already consumed without a usable address")]
    HandshakeConsumed { identity: String },

    #[error("invalid plugin address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("plugin address {address} is not reachable: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to driver at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to driver at {address} after {}s", timeout.as_secs_f64())]
    ConnectTimeout { address: String, timeout: Duration },

    /// The driver answered with an error.
    #[error("driver call {method} failed: {message}")]
    Remote { method: String, message: String },

    /// Raised by a driver implementation while serving a call.
    #[error("driver error: {0}")]
    Driver(String),

    /// A frame violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("driver connection closed")]
    ConnectionClosed,

    /// The session holds a client for a different driver category.
    #[error("expected a {expected} driver client, session holds a {actual} client")]
    WrongDriverKind {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    /// Deadline-related failures, distinguished from process or protocol faults.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PluginError::HandshakeTimeout { .. } | PluginError::ConnectTimeout { .. }
        )
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = std::result::Result<T, PluginError>;
