use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;
use imbl::OrdMap;
use tracing::debug;

use crate::error::StoreError;
use crate::store::Store;

use super::transaction::MemoryTransaction;

pub(crate) type TableData = OrdMap<Vec<u8>, Vec<u8>>;

/// Tables are persistent ordered maps published through `ArcSwap`, so a
/// snapshot is a reference count bump and readers never block writers.
/// Write transactions are serialized by a single mutex.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Arc<ArcSwap<TableData>>>>,
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents of one table.
    pub(crate) fn snapshot_table(&self, name: &str) -> Result<Arc<TableData>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::poisoned("table map"))?;
        tables
            .get(name)
            .map(|table| table.load_full())
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    /// Publish the tables a write transaction changed.
    pub(crate) fn publish(&self, dirty: HashMap<String, Arc<TableData>>) -> Result<(), StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::poisoned("table map"))?;
        for (name, data) in dirty {
            // a table dropped while the transaction ran stays dropped
            if let Some(table) = tables.get(&name) {
                table.store(data);
            }
        }
        Ok(())
    }

    /// Number of rows in `name`, outside any transaction.
    pub fn row_count(&self, name: &str) -> Result<usize, StoreError> {
        Ok(self.snapshot_table(name)?.len())
    }
}

impl Store for MemoryStore {
    type Txn<'a> = MemoryTransaction<'a>;

    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError> {
        if read_only {
            return Ok(MemoryTransaction::new_read_only(self));
        }
        let guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::poisoned("write"))?;
        Ok(MemoryTransaction::new_writable(self, guard))
    }

    fn create_table(&self, name: &str) -> Result<(), StoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::poisoned("table map"))?;
        tables.entry(name.to_string()).or_insert_with(|| {
            debug!(table = name, "created table");
            Arc::new(ArcSwap::from_pointee(OrdMap::new()))
        });
        Ok(())
    }

    fn drop_table(&self, name: &str) -> Result<(), StoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::poisoned("table map"))?;
        tables.remove(name);
        Ok(())
    }

    fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::poisoned("table map"))?;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
