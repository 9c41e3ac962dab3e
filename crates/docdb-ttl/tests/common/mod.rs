#![allow(dead_code)]

use std::sync::Arc;

use bson::{DateTime, Document, doc};
use docdb_store::{LockManager, MemoryStore, Store, Transaction};
use docdb_ttl::{TtlConfig, TtlIndex, TtlPurger, TtlRegistry, row};

pub const NOW_MS: i64 = 1_700_000_000_000;

pub fn now() -> DateTime {
    DateTime::from_millis(NOW_MS)
}

/// `secs` seconds before [`now`].
pub fn ago(secs: i64) -> DateTime {
    DateTime::from_millis(NOW_MS - secs * 1000)
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub locks: Arc<LockManager>,
    pub registry: Arc<TtlRegistry>,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture {
            store: Arc::new(MemoryStore::new()),
            locks: Arc::new(LockManager::new()),
            registry: Arc::new(TtlRegistry::new()),
        }
    }

    /// Registers `index` and creates its shard tables.
    pub fn index(&self, index: TtlIndex) {
        for table in &index.shard_tables {
            self.store.create_table(table).unwrap();
        }
        self.registry.register(index);
    }

    pub fn purger(&self, config: TtlConfig) -> TtlPurger<MemoryStore> {
        TtlPurger::new(
            Arc::clone(&self.store),
            Arc::clone(&self.locks),
            Arc::clone(&self.registry),
            config,
        )
    }

    pub fn insert(&self, table: &str, docs: &[Document]) {
        let txn = self.store.begin(false).unwrap();
        let handle = txn.table(table).unwrap();
        for doc in docs {
            let id = doc.get_i32("_id").unwrap();
            txn.put(&handle, &id.to_be_bytes(), &row::encode(doc).unwrap())
                .unwrap();
        }
        txn.commit().unwrap();
    }

    pub fn insert_raw(&self, table: &str, key: &[u8], value: &[u8]) {
        let txn = self.store.begin(false).unwrap();
        let handle = txn.table(table).unwrap();
        txn.put(&handle, key, value).unwrap();
        txn.commit().unwrap();
    }

    pub fn ids(&self, table: &str) -> Vec<i32> {
        let txn = self.store.begin(true).unwrap();
        let handle = txn.table(table).unwrap();
        txn.scan_prefix(&handle, b"")
            .unwrap()
            .map(|r| {
                let (key, value) = r.unwrap();
                row::decode(&key, &value).unwrap().get_i32("_id").unwrap()
            })
            .collect()
    }

    pub fn count(&self, table: &str) -> usize {
        self.store.row_count(table).unwrap()
    }
}

pub fn dated(ids: std::ops::Range<i32>, at: DateTime) -> Vec<Document> {
    ids.map(|id| doc! { "_id": id, "at": at }).collect()
}

pub fn small_batches(batch_size: usize) -> TtlConfig {
    TtlConfig {
        batch_size,
        ..TtlConfig::default()
    }
}
