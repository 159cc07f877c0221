//! Provisio-State: provisioning records
//!
//! Driver, machine and chain records behind the [`RecordStore`] trait, with
//! an in-memory implementation in [`memory`].

mod error;
pub mod memory;
mod records;
mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryRecordStore;
pub use records::{
    ChainRecord, DriverCategory, DriverRecord, MachineRecord, NewChain, NewMachine, RecordStatus,
};
pub use store::RecordStore;
