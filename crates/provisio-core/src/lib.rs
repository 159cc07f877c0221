//! Provisio-Core: provisioning sequences over driver plugins
//!
//! - [`Sequencer`] runs the machine/chain phase sequence against a plugin
//! - [`launcher`] is the seam between the sequencer and plugin processes
//! - [`builtin`] holds the drivers the provisio binary serves itself
//! - [`config`], [`telemetry`] and [`obs`] are the ambient pieces shared by
//!   the binary and tests

pub mod builtin;
pub mod config;
pub mod error;
pub mod launcher;
pub mod obs;
pub mod phase;
pub mod sequencer;
pub mod telemetry;

pub use config::{ConfigError, ProvisioConfig};
pub use error::{PhaseFailure, ProvisionError, ProvisionResult};
pub use launcher::{PluginLauncher, ProcessLauncher, RunningPlugin};
pub use phase::LifecyclePhase;
pub use sequencer::{
    driver_kind, ProvisionOutcome, ProvisionRequest, Sequencer, SequencerOptions,
};
pub use telemetry::init_tracing;
