//! Error types for provisio-state

use thiserror::Error;

/// Errors returned by a [`RecordStore`](crate::RecordStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("driver {id} not found")]
    DriverNotFound { id: i64 },

    #[error("machine {id} not found")]
    MachineNotFound { id: i64 },

    #[error("chain {id} not found")]
    ChainNotFound { id: i64 },

    /// A driver with the same name and version is already registered.
    #[error("driver {name}@{version} already registered")]
    DuplicateDriver { name: String, version: String },
}

/// Result type for record store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
