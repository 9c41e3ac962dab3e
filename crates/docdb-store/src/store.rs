use std::time::Duration;

use crate::error::StoreError;

pub trait Store {
    type Txn<'a>: Transaction
    where
        Self: 'a;

    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError>;
    fn create_table(&self, name: &str) -> Result<(), StoreError>;
    fn drop_table(&self, name: &str) -> Result<(), StoreError>;
    fn table_names(&self) -> Result<Vec<String>, StoreError>;
}

pub trait Transaction {
    /// Backend-specific table handle. Must be cheaply cloneable.
    type Table: Clone;

    /// Resolve a table by name. Must be called before any reads on it.
    fn table(&self, name: &str) -> Result<Self::Table, StoreError>;

    /// Every later operation fails with [`StoreError::StatementTimeout`]
    /// once `timeout` has elapsed.
    fn set_statement_timeout(&self, timeout: Duration);

    // Reads
    fn get(&self, table: &Self::Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn scan_prefix<'a>(
        &'a self,
        table: &Self::Table,
        prefix: &[u8],
    ) -> Result<
        Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + 'a>,
        StoreError,
    >;

    // Writes
    fn put(&self, table: &Self::Table, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn put_batch(&self, table: &Self::Table, entries: &[(&[u8], &[u8])]) -> Result<(), StoreError>;
    fn delete(&self, table: &Self::Table, key: &[u8]) -> Result<(), StoreError>;

    // Lifecycle
    fn commit(self) -> Result<(), StoreError>;
    fn rollback(self) -> Result<(), StoreError>;
}
