//! In-memory record store.
//!
//! Backs the CLI (records live for one invocation) and every test.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::records::*;
use crate::store::RecordStore;

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    drivers: BTreeMap<i64, DriverRecord>,
    machines: BTreeMap<i64, MachineRecord>,
    chains: BTreeMap<i64, ChainRecord>,
}

impl Tables {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Record store backed by ordered maps behind one lock.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Mutex<Tables>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_driver(&self, id: i64) -> StoreResult<DriverRecord> {
        let tables = self.tables.lock().await;
        tables
            .drivers
            .get(&id)
            .cloned()
            .ok_or(StoreError::DriverNotFound { id })
    }

    async fn list_drivers(&self) -> StoreResult<Vec<DriverRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables.drivers.values().cloned().collect())
    }

    async fn register_driver(
        &self,
        name: &str,
        version: &str,
        category: DriverCategory,
    ) -> StoreResult<DriverRecord> {
        let mut tables = self.tables.lock().await;
        if tables
            .drivers
            .values()
            .any(|d| d.name == name && d.version == version)
        {
            return Err(StoreError::DuplicateDriver {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        let record = DriverRecord {
            id: tables.allocate(),
            name: name.to_string(),
            version: version.to_string(),
            category,
            created_at: Utc::now(),
        };
        debug!(id = record.id, name, version, %category, "driver registered");
        tables.drivers.insert(record.id, record.clone());
        Ok(record)
    }

    async fn insert_machine(&self, machine: NewMachine) -> StoreResult<i64> {
        let mut tables = self.tables.lock().await;
        let id = tables.allocate();
        let now = Utc::now();
        tables.machines.insert(
            id,
            MachineRecord {
                id,
                driver_id: machine.driver_id,
                name: machine.name,
                host: machine.host,
                labels: machine.labels,
                status: RecordStatus::Reported,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn set_machine_status(&self, id: i64, status: RecordStatus) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .machines
            .get_mut(&id)
            .ok_or(StoreError::MachineNotFound { id })?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_machine(&self, id: i64) -> StoreResult<MachineRecord> {
        let tables = self.tables.lock().await;
        tables
            .machines
            .get(&id)
            .cloned()
            .ok_or(StoreError::MachineNotFound { id })
    }

    async fn list_machines(&self) -> StoreResult<Vec<MachineRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables.machines.values().cloned().collect())
    }

    async fn insert_chain(&self, chain: NewChain) -> StoreResult<i64> {
        let mut tables = self.tables.lock().await;
        let id = tables.allocate();
        let now = Utc::now();
        tables.chains.insert(
            id,
            ChainRecord {
                id,
                driver_id: chain.driver_id,
                name: chain.name,
                labels: chain.labels,
                status: RecordStatus::Reported,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn set_chain_status(&self, id: i64, status: RecordStatus) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .chains
            .get_mut(&id)
            .ok_or(StoreError::ChainNotFound { id })?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_chain(&self, id: i64) -> StoreResult<ChainRecord> {
        let tables = self.tables.lock().await;
        tables
            .chains
            .get(&id)
            .cloned()
            .ok_or(StoreError::ChainNotFound { id })
    }

    async fn list_chains(&self) -> StoreResult<Vec<ChainRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables.chains.values().cloned().collect())
    }
}
