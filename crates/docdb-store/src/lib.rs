//! Snapshot-isolated in-memory tables plus the conditional table locks
//! background jobs use to stay out of the way of foreground traffic.

mod error;
mod lock;
mod memory;
mod store;

pub use error::StoreError;
pub use lock::{LockGuard, LockManager, LockMode};
pub use memory::{MemoryStore, MemoryTable, MemoryTransaction};
pub use store::{Store, Transaction};
