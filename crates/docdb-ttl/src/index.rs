use std::sync::RwLock;

use bson::{Bson, DateTime, Document, doc};
use docdb_query::{Expression, parse_filter};

use crate::error::TtlError;

/// A TTL index on one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlIndex {
    pub collection_id: i64,
    pub index_id: i64,
    /// Tables holding the collection's shards on this node.
    pub shard_tables: Vec<String>,
    pub key_path: String,
    pub expire_after_seconds: i64,
    pub partial_filter: Option<Document>,
}

impl TtlIndex {
    pub fn new(collection_id: i64, index_id: i64, key_path: &str, expire_after_seconds: i64) -> Self {
        TtlIndex {
            collection_id,
            index_id,
            shard_tables: vec![format!("documents_{collection_id}")],
            key_path: key_path.to_string(),
            expire_after_seconds,
            partial_filter: None,
        }
    }

    pub fn with_shard_tables(mut self, tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.shard_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_partial_filter(mut self, filter: Document) -> Self {
        self.partial_filter = Some(filter);
        self
    }

    /// Name of the collection-level lock foreground DDL takes.
    pub fn lock_name(&self) -> String {
        format!("collection_{}", self.collection_id)
    }

    /// Documents whose key is a date older than `now - expire_after_seconds`.
    pub fn expiry_filter(&self, now: DateTime) -> Result<Expression, TtlError> {
        let cutoff = now
            .timestamp_millis()
            .saturating_sub(self.expire_after_seconds.saturating_mul(1000));
        let expired = doc! { self.key_path.as_str(): { "$lt": DateTime::from_millis(cutoff) } };
        let filter = match &self.partial_filter {
            Some(partial) => doc! { "$and": [expired, Bson::Document(partial.clone())] },
            None => expired,
        };
        Ok(parse_filter(&filter)?)
    }
}

/// The TTL indexes the purger walks.
#[derive(Debug, Default)]
pub struct TtlRegistry {
    indexes: RwLock<Vec<TtlIndex>>,
}

impl TtlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any index with the same collection and index id.
    pub fn register(&self, index: TtlIndex) {
        let Ok(mut indexes) = self.indexes.write() else {
            return;
        };
        indexes.retain(|i| (i.collection_id, i.index_id) != (index.collection_id, index.index_id));
        indexes.push(index);
    }

    pub fn unregister(&self, collection_id: i64, index_id: i64) -> bool {
        let Ok(mut indexes) = self.indexes.write() else {
            return false;
        };
        let before = indexes.len();
        indexes.retain(|i| (i.collection_id, i.index_id) != (collection_id, index_id));
        indexes.len() != before
    }

    /// Ordered by collection then index id.
    pub fn list(&self) -> Vec<TtlIndex> {
        let mut out = match self.indexes.read() {
            Ok(indexes) => indexes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        out.sort_by_key(|i| (i.collection_id, i.index_id));
        out
    }
}
