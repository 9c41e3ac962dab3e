use bson::Document;
use docdb_planner::{CollectionInfo, MemoryCatalog};
use docdb_shard::ShardKey;
use serde::Deserialize;

use crate::error::CliError;

/// One collection or view in a catalog file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub database: String,
    pub name: String,
    #[serde(default)]
    pub collection_id: u64,
    pub shard_key: Option<Document>,
    pub uuid: Option<String>,
    /// Makes the entry a view.
    pub view_on: Option<String>,
    #[serde(default)]
    pub pipeline: Vec<Document>,
}

impl CatalogEntry {
    fn into_info(self) -> Result<CollectionInfo, CliError> {
        if let Some(view_on) = self.view_on {
            return Ok(CollectionInfo::view(self.database, self.name, view_on, self.pipeline));
        }
        let mut info = CollectionInfo::new(self.database, self.name, self.collection_id);
        if let Some(definition) = &self.shard_key {
            let key = ShardKey::parse(definition).map_err(|source| CliError::Catalog {
                name: info.name.clone(),
                source,
            })?;
            info = info.with_shard_key(key);
        }
        if let Some(uuid) = self.uuid {
            info = info.with_uuid(uuid);
        }
        Ok(info)
    }
}

/// Parse a JSON array of [`CatalogEntry`].
pub fn load_catalog(json: &str) -> Result<MemoryCatalog, CliError> {
    let entries: Vec<CatalogEntry> =
        serde_json::from_str(json).map_err(|source| CliError::Json {
            what: "catalog",
            source,
        })?;
    let catalog = MemoryCatalog::default();
    for entry in entries {
        catalog.add(entry.into_info()?);
    }
    Ok(catalog)
}
