use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::StoreError;
use crate::store::Transaction;

use super::store::{MemoryStore, TableData};

/// Table handle for the memory backend.
///
/// A name token only; reads go through the transaction's snapshot so its
/// own writes are visible.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    pub(crate) name: String,
}

/// Tables loaded on first use.
#[derive(Default)]
struct Snapshot {
    data: HashMap<String, Arc<TableData>>,
}

impl Snapshot {
    fn ensure(&mut self, store: &MemoryStore, name: &str) -> Result<(), StoreError> {
        if !self.data.contains_key(name) {
            let data = store.snapshot_table(name)?;
            self.data.insert(name.to_string(), data);
        }
        Ok(())
    }

    fn table(&self, name: &str) -> Result<&Arc<TableData>, StoreError> {
        self.data
            .get(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableData, StoreError> {
        let arc = self
            .data
            .get_mut(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))?;
        Ok(Arc::make_mut(arc))
    }
}

pub struct MemoryTransaction<'a> {
    snapshot: RefCell<Option<Snapshot>>,
    /// Tables that have been written to.
    dirty: RefCell<HashSet<String>>,
    store: &'a MemoryStore,
    read_only: bool,
    deadline: Cell<Option<Instant>>,
    /// Held for the lifetime of a write transaction.
    _write_guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> MemoryTransaction<'a> {
    pub(crate) fn new_read_only(store: &'a MemoryStore) -> Self {
        Self {
            snapshot: RefCell::new(Some(Snapshot::default())),
            dirty: RefCell::new(HashSet::new()),
            store,
            read_only: true,
            deadline: Cell::new(None),
            _write_guard: None,
        }
    }

    pub(crate) fn new_writable(store: &'a MemoryStore, guard: MutexGuard<'a, ()>) -> Self {
        Self {
            snapshot: RefCell::new(Some(Snapshot::default())),
            dirty: RefCell::new(HashSet::new()),
            store,
            read_only: false,
            deadline: Cell::new(None),
            _write_guard: Some(guard),
        }
    }

    fn check_deadline(&self) -> Result<(), StoreError> {
        match self.deadline.get() {
            Some(deadline) if Instant::now() >= deadline => Err(StoreError::StatementTimeout),
            _ => Ok(()),
        }
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.check_deadline()
    }

    fn write<R>(
        &self,
        table: &MemoryTable,
        f: impl FnOnce(&mut TableData) -> R,
    ) -> Result<R, StoreError> {
        self.check_writable()?;
        let mut snap = self.snapshot.borrow_mut();
        let snap = snap.as_mut().ok_or(StoreError::TransactionConsumed)?;
        let data = snap.table_mut(&table.name)?;
        let out = f(data);
        self.dirty.borrow_mut().insert(table.name.clone());
        Ok(out)
    }
}

impl Transaction for MemoryTransaction<'_> {
    type Table = MemoryTable;

    fn table(&self, name: &str) -> Result<Self::Table, StoreError> {
        let mut snap = self.snapshot.borrow_mut();
        let snap = snap.as_mut().ok_or(StoreError::TransactionConsumed)?;
        snap.ensure(self.store, name)?;
        Ok(MemoryTable {
            name: name.to_string(),
        })
    }

    fn set_statement_timeout(&self, timeout: Duration) {
        self.deadline.set(Instant::now().checked_add(timeout));
    }

    fn get(&self, table: &Self::Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_deadline()?;
        let snap = self.snapshot.borrow();
        let snap = snap.as_ref().ok_or(StoreError::TransactionConsumed)?;
        Ok(snap.table(&table.name)?.get(key).cloned())
    }

    fn scan_prefix<'b>(
        &'b self,
        table: &Self::Table,
        prefix: &[u8],
    ) -> Result<Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + 'b>, StoreError>
    {
        self.check_deadline()?;
        let snap = self.snapshot.borrow();
        let snap = snap.as_ref().ok_or(StoreError::TransactionConsumed)?;
        let data = snap.table(&table.name)?;
        let prefix = prefix.to_vec();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = data
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn put(&self, table: &Self::Table, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write(table, |data| {
            data.insert(key.to_vec(), value.to_vec());
        })
    }

    fn put_batch(&self, table: &Self::Table, entries: &[(&[u8], &[u8])]) -> Result<(), StoreError> {
        self.write(table, |data| {
            for (key, value) in entries {
                data.insert(key.to_vec(), value.to_vec());
            }
        })
    }

    fn delete(&self, table: &Self::Table, key: &[u8]) -> Result<(), StoreError> {
        self.write(table, |data| {
            data.remove(key);
        })
    }

    fn commit(self) -> Result<(), StoreError> {
        let snapshot = self
            .snapshot
            .into_inner()
            .ok_or(StoreError::TransactionConsumed)?;
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        if let Some(deadline) = self.deadline.get() {
            if Instant::now() >= deadline {
                return Err(StoreError::StatementTimeout);
            }
        }

        let dirty_set = self.dirty.into_inner();
        let dirty: HashMap<String, Arc<TableData>> = snapshot
            .data
            .into_iter()
            .filter(|(name, _)| dirty_set.contains(name))
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        self.store.publish(dirty)
    }

    fn rollback(self) -> Result<(), StoreError> {
        if self.snapshot.into_inner().is_none() {
            return Err(StoreError::TransactionConsumed);
        }
        Ok(())
    }
}
