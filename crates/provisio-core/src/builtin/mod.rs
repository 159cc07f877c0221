//! Drivers compiled into the provisio binary and served through self
//! re-invocation.

mod shell;

use std::sync::Arc;

use provisio_plugin::DriverService;
use provisio_state::DriverCategory;

pub use shell::{ShellChainDriver, ShellMachineDriver};

/// Built-in driver names and what they provision.
pub const BUILTIN_DRIVERS: &[(&str, DriverCategory)] = &[
    ("shell", DriverCategory::Machine),
    ("shell-chain", DriverCategory::Chain),
];

/// The service a built-in plugin process should run, by driver name.
pub fn service_for(name: &str) -> Option<DriverService> {
    match name {
        "shell" => Some(DriverService::Machine(Arc::new(ShellMachineDriver::new()))),
        "shell-chain" => Some(DriverService::Chain(Arc::new(ShellChainDriver::new()))),
        _ => None,
    }
}
