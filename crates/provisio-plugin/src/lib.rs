//! Provisio-Plugin: out-of-process driver plugins
//!
//! - [`PluginResolver`] maps a driver identity to a binary (external or the
//!   running executable itself)
//! - [`PluginProcess`] spawns it with the handshake environment
//! - [`PluginHandle`] reads the address handshake, relays output into
//!   `tracing` and tears the process down gracefully or forcefully
//! - [`open_session`] connects a typed [`DriverClient`] to the address
//! - [`serve_plugin`] is the other end, run inside the plugin binary

pub mod address;
pub mod client;
pub mod controller;
pub mod error;
pub mod identity;
pub mod resolve;
pub mod serve;
pub mod signals;
pub mod supervisor;
pub mod wire;

pub use address::{parse_address, validate_address, DEFAULT_DIAL_TIMEOUT};
pub use client::{
    open_session, ChainDriverClient, DriverClient, DriverKind, DriverSession, MachineDriverClient,
    RpcConnection,
};
pub use controller::{
    attach_stream, ControllerOptions, PluginHandle, DEFAULT_DISCOVERY_TIMEOUT,
    DEFAULT_SHUTDOWN_GRACE,
};
pub use error::{PluginError, PluginResult};
pub use identity::{is_builtin_invocation, PluginEnv, PluginIdentity};
pub use resolve::{PluginKind, PluginResolver};
pub use serve::{serve_listener, serve_plugin, ChainDriver, DriverService, MachineDriver};
pub use signals::wait_for_shutdown_signal;
pub use supervisor::PluginProcess;
pub use wire::{Draft, HealthReply, HealthRequest, InitRequest, PhaseReply, RecordRequest};
