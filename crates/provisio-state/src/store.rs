//! The record store seam.
//!
//! The sequencer only needs three things from persistence: look up a
//! driver, persist a reported record and obtain its id, and update that
//! record's status. Listing and registration serve the CLI.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::records::{
    ChainRecord, DriverCategory, DriverRecord, MachineRecord, NewChain, NewMachine, RecordStatus,
};

/// Backend-agnostic persistence for provisioning records.
///
/// Guarantees:
/// - Ids are assigned by the store, positive and never reused.
/// - Records are never deleted by the sequencer; a failed sequence leaves
///   its record in place with a `Failed` status.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns `StoreError::DriverNotFound` if absent.
    async fn get_driver(&self, id: i64) -> StoreResult<DriverRecord>;

    async fn list_drivers(&self) -> StoreResult<Vec<DriverRecord>>;

    /// Register a driver; `(name, version)` must be unique.
    async fn register_driver(
        &self,
        name: &str,
        version: &str,
        category: DriverCategory,
    ) -> StoreResult<DriverRecord>;

    /// Persist a reported machine with status `Reported` and return its id.
    async fn insert_machine(&self, machine: NewMachine) -> StoreResult<i64>;

    async fn set_machine_status(&self, id: i64, status: RecordStatus) -> StoreResult<()>;

    async fn get_machine(&self, id: i64) -> StoreResult<MachineRecord>;

    async fn list_machines(&self) -> StoreResult<Vec<MachineRecord>>;

    /// Persist a reported chain with status `Reported` and return its id.
    async fn insert_chain(&self, chain: NewChain) -> StoreResult<i64>;

    async fn set_chain_status(&self, id: i64, status: RecordStatus) -> StoreResult<()>;

    async fn get_chain(&self, id: i64) -> StoreResult<ChainRecord>;

    async fn list_chains(&self) -> StoreResult<Vec<ChainRecord>>;
}
