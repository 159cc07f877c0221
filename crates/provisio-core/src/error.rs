//! Error types for provisioning sequences.

use provisio_plugin::PluginError;
use provisio_state::{DriverCategory, StoreError};
use thiserror::Error;

use crate::phase::LifecyclePhase;

/// What went wrong inside a phase.
#[derive(Debug, Error)]
pub enum PhaseFailure {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Every health poll reported unhealthy (or timed out).
    #[error("not healthy after {attempts} attempts: {message}")]
    Unhealthy { attempts: u32, message: String },

    #[error("cancelled")]
    Cancelled,
}

/// Errors produced by the sequencer.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The driver does not provision the requested kind of resource.
    #[error("driver {driver_id} is a {actual} driver, expected a {expected} driver")]
    CategoryMismatch {
        driver_id: i64,
        expected: DriverCategory,
        actual: DriverCategory,
    },

    /// A phase failed; `operation` names the step within it.
    #[error("{operation} failed in phase {phase}: {source}")]
    Phase {
        phase: LifecyclePhase,
        operation: String,
        #[source]
        source: PhaseFailure,
    },
}

impl ProvisionError {
    pub fn phase(&self) -> Option<LifecyclePhase> {
        match self {
            ProvisionError::Phase { phase, .. } => Some(*phase),
            ProvisionError::CategoryMismatch { .. } => Some(LifecyclePhase::Init),
        }
    }

    pub fn operation(&self) -> Option<&str> {
        match self {
            ProvisionError::Phase { operation, .. } => Some(operation),
            ProvisionError::CategoryMismatch { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ProvisionError::Phase {
                source: PhaseFailure::Cancelled,
                ..
            }
        )
    }

    /// Configuration faults are never worth retrying.
    pub fn is_config(&self) -> bool {
        matches!(self, ProvisionError::CategoryMismatch { .. })
    }
}

/// Result type for provisioning operations.
pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;
