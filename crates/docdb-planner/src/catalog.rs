use std::collections::HashMap;
use std::sync::RwLock;

use bson::{Bson, Document};
use docdb_query::{Error, Result};
use docdb_shard::ShardKey;

/// What the planner knows about a collection or view.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionInfo {
    pub database: String,
    pub name: String,
    pub collection_id: u64,
    pub shard_key: ShardKey,
    pub uuid: Option<String>,
    /// Present when the name refers to a view.
    pub view: Option<ViewDefinition>,
}

impl CollectionInfo {
    pub fn new(database: impl Into<String>, name: impl Into<String>, collection_id: u64) -> Self {
        CollectionInfo {
            database: database.into(),
            name: name.into(),
            collection_id,
            shard_key: ShardKey::none(),
            uuid: None,
            view: None,
        }
    }

    pub fn with_shard_key(mut self, key: ShardKey) -> Self {
        self.shard_key = key;
        self
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn view(
        database: impl Into<String>,
        name: impl Into<String>,
        view_on: impl Into<String>,
        pipeline: Vec<Document>,
    ) -> Self {
        CollectionInfo {
            view: Some(ViewDefinition {
                view_on: view_on.into(),
                pipeline,
            }),
            ..CollectionInfo::new(database, name, 0)
        }
    }

    pub fn is_view(&self) -> bool {
        self.view.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewDefinition {
    pub view_on: String,
    pub pipeline: Vec<Document>,
}

impl ViewDefinition {
    pub fn pipeline_values(&self) -> Vec<Bson> {
        self.pipeline.iter().cloned().map(Bson::Document).collect()
    }
}

/// Engine callbacks consulted while planning.
pub trait HookTable: Send + Sync {
    fn resolve_collection(&self, database: &str, collection: &str)
    -> Result<Option<CollectionInfo>>;

    /// Stages can be switched off per deployment.
    fn is_stage_enabled(&self, _stage: &str) -> bool {
        true
    }
}

/// A [`HookTable`] backed by an in-process map.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    collections: RwLock<HashMap<(String, String), CollectionInfo>>,
    disabled_stages: RwLock<Vec<String>>,
}

impl MemoryCatalog {
    pub fn add(&self, info: CollectionInfo) {
        if let Ok(mut map) = self.collections.write() {
            map.insert((info.database.clone(), info.name.clone()), info);
        }
    }

    pub fn disable_stage(&self, stage: &str) {
        if let Ok(mut stages) = self.disabled_stages.write() {
            stages.push(stage.to_string());
        }
    }
}

impl HookTable for MemoryCatalog {
    fn resolve_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<Option<CollectionInfo>> {
        let map = self
            .collections
            .read()
            .map_err(|_| Error::internal("collection catalog lock poisoned"))?;
        Ok(map
            .get(&(database.to_string(), collection.to_string()))
            .cloned())
    }

    fn is_stage_enabled(&self, stage: &str) -> bool {
        self.disabled_stages
            .read()
            .map(|stages| !stages.iter().any(|s| s == stage))
            .unwrap_or(true)
    }
}
