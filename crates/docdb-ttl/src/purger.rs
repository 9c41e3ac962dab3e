use std::sync::Arc;
use std::time::Instant;

use bson::DateTime;
use docdb_query::{Expression, matches};
use docdb_store::{LockManager, LockMode, Store, Transaction};
use tracing::{debug, info, warn};

use crate::config::TtlConfig;
use crate::error::TtlError;
use crate::index::{TtlIndex, TtlRegistry};
use crate::row;

/// Outcome of one purge task.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted: u64,
    /// Committed subtransactions.
    pub batches: u64,
    /// Collections passed over because someone else held their lock.
    pub skipped_collections: Vec<i64>,
    pub failed_tables: Vec<String>,
    /// The task hit `max_task_runtime_ms` before visiting every table.
    pub timed_out: bool,
}

/// How a table drain ended.
enum Drain {
    Done,
    OutOfTime,
}

/// Deletes expired documents in bounded subtransactions.
pub struct TtlPurger<S: Store> {
    store: Arc<S>,
    locks: Arc<LockManager>,
    registry: Arc<TtlRegistry>,
    config: TtlConfig,
}

impl<S: Store> TtlPurger<S> {
    pub fn new(
        store: Arc<S>,
        locks: Arc<LockManager>,
        registry: Arc<TtlRegistry>,
        config: TtlConfig,
    ) -> Self {
        TtlPurger {
            store,
            locks,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &TtlConfig {
        &self.config
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    pub fn purge(&self) -> PurgeReport {
        self.purge_at(DateTime::now())
    }

    /// Run one task with `now` as the expiry reference point.
    pub fn purge_at(&self, now: DateTime) -> PurgeReport {
        let started = Instant::now();
        let mut report = PurgeReport::default();

        'indexes: for index in self.registry.list() {
            if index.expire_after_seconds < 0 {
                debug!(collection_id = index.collection_id, index_id = index.index_id, "negative expiry, skipping");
                continue;
            }
            let filter = match index.expiry_filter(now) {
                Ok(filter) => filter,
                Err(err) => {
                    warn!(collection_id = index.collection_id, index_id = index.index_id, %err, "unusable TTL index");
                    report.failed_tables.extend(index.shard_tables.iter().cloned());
                    continue;
                }
            };

            let _collection = match self.locks.try_lock(&index.lock_name(), LockMode::RowShare) {
                Ok(guard) => guard,
                Err(_) => {
                    info!(collection_id = index.collection_id, "collection is locked, skipping TTL purge");
                    report.skipped_collections.push(index.collection_id);
                    continue;
                }
            };

            for table in &index.shard_tables {
                match self.drain_table(&index, table, &filter, started, &mut report) {
                    Ok(Drain::Done) => {}
                    Ok(Drain::OutOfTime) => {
                        report.timed_out = true;
                        break 'indexes;
                    }
                    Err(err) => {
                        warn!(table = table.as_str(), index_id = index.index_id, %err, "TTL batch failed");
                        report.failed_tables.push(table.clone());
                    }
                }
            }
        }

        info!(
            deleted = report.deleted,
            batches = report.batches,
            skipped = report.skipped_collections.len(),
            failed = report.failed_tables.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "TTL task finished"
        );
        report
    }

    fn drain_table(
        &self,
        index: &TtlIndex,
        table: &str,
        filter: &Expression,
        task_started: Instant,
        report: &mut PurgeReport,
    ) -> Result<Drain, TtlError> {
        let _table_lock = self
            .locks
            .lock_timeout(table, LockMode::RowShare, self.config.lock_timeout())?;
        let table_started = Instant::now();
        loop {
            if task_started.elapsed() >= self.config.max_task_runtime() {
                return Ok(Drain::OutOfTime);
            }
            let deleted = self.delete_batch(table, filter)?;
            report.batches += 1;
            report.deleted += deleted as u64;
            debug!(table, index_id = index.index_id, deleted, "TTL batch committed");

            if deleted < self.batch_size() || !self.config.repeat_purge_until_drained {
                return Ok(Drain::Done);
            }
            if table_started.elapsed() >= self.config.single_task_budget() {
                debug!(table, "TTL budget spent, moving on");
                return Ok(Drain::Done);
            }
        }
    }

    /// One subtransaction: committed when every delete succeeds, rolled back
    /// otherwise.
    fn delete_batch(&self, table: &str, filter: &Expression) -> Result<usize, TtlError> {
        let txn = self.store.begin(false)?;
        txn.set_statement_timeout(self.config.statement_timeout());
        match self.delete_expired(&txn, table, filter) {
            Ok(deleted) => {
                txn.commit()?;
                Ok(deleted)
            }
            Err(err) => {
                if let Err(rollback) = txn.rollback() {
                    warn!(table, %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    fn delete_expired(
        &self,
        txn: &S::Txn<'_>,
        table: &str,
        filter: &Expression,
    ) -> Result<usize, TtlError> {
        let handle = txn.table(table)?;
        let mut doomed = Vec::new();
        for entry in txn.scan_prefix(&handle, b"")? {
            let (key, value) = entry?;
            let doc = row::decode(&key, &value)?;
            if matches(filter, &doc) {
                doomed.push(key);
                if doomed.len() >= self.batch_size() {
                    break;
                }
            }
        }
        for key in &doomed {
            txn.delete(&handle, key)?;
        }
        Ok(doomed.len())
    }
}
