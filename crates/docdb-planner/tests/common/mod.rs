#![allow(dead_code)]

use std::sync::Arc;

use bson::{Document, doc};
use docdb_planner::{
    CollectionInfo, Command, EngineConfig, MemoryCatalog, Planner, QueryPlan,
};
use docdb_query::Result;
use docdb_shard::ShardKey;

pub const DB: &str = "db";
pub const COLLECTION_ID: u64 = 17;

/// A catalog holding `db.c` (id 17) sharded on `key`, plus `db.other`
/// (id 18) unsharded.
pub fn catalog(key: Option<Document>) -> MemoryCatalog {
    let catalog = MemoryCatalog::default();
    let shard_key = match key {
        Some(key) => ShardKey::parse(&key).expect("valid shard key"),
        None => ShardKey::none(),
    };
    catalog.add(CollectionInfo::new(DB, "c", COLLECTION_ID).with_shard_key(shard_key));
    catalog.add(CollectionInfo::new(DB, "other", COLLECTION_ID + 1));
    catalog
}

pub fn config(catalog: MemoryCatalog) -> EngineConfig {
    EngineConfig::with_hooks(Arc::new(catalog))
}

pub fn default_config() -> EngineConfig {
    config(catalog(None))
}

pub fn try_plan(config: &EngineConfig, spec: Document) -> Result<QueryPlan> {
    let command = Command::parse(&spec, Some(DB))?;
    Planner::new(config).plan(&command)
}

pub fn plan(config: &EngineConfig, spec: Document) -> QueryPlan {
    try_plan(config, spec).expect("command plans")
}

pub fn aggregate(config: &EngineConfig, pipeline: Vec<Document>) -> QueryPlan {
    plan(
        config,
        doc! { "aggregate": "c", "pipeline": pipeline, "cursor": {} },
    )
}
