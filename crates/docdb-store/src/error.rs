use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction already consumed")]
    TransactionConsumed,
    #[error("cannot write in a read-only transaction")]
    ReadOnly,
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("could not obtain lock on {0}")]
    LockNotAvailable(String),
    #[error("canceling statement due to statement timeout")]
    StatementTimeout,
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub(crate) fn poisoned(what: &str) -> Self {
        StoreError::Storage(format!("{what} lock poisoned"))
    }
}
