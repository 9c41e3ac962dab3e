use docdb_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TtlError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid TTL filter: {0}")]
    Filter(#[from] docdb_query::Error),
    #[error("corrupt document {key:?}: {message}")]
    Decode { key: Vec<u8>, message: String },
    #[error("encode error: {0}")]
    Encode(String),
}
