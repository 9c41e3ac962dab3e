use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use docdb_query::Interrupt;
use serde::Deserialize;

use crate::catalog::{HookTable, MemoryCatalog};

/// Views may point at views at most this many times.
pub const MAX_VIEW_DEPTH: usize = 20;

/// Planner knobs. Hooks are swappable while plans are being built.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    pub max_pipeline_stages: usize,
    /// Limit on `$lookup`/`$facet`/`$unionWith` sub-pipelines nested in
    /// one another.
    pub max_nested_pipeline_depth: usize,
    pub enable_change_streams: bool,
    /// Attach a full-scan qual to `$sort` on an unfiltered base table so an
    /// ordered index can serve the sort.
    pub enable_sort_pushdown_to_index: bool,
    pub enable_native_tailable: bool,
    /// Pull leading `$lookup` sub-pipeline stages into the joined relation.
    pub enable_lookup_inlining: bool,
    pub use_point_read: bool,
    pub batch_size: i64,
    #[serde(skip)]
    pub hooks: Hooks,
    /// Cancels planning in progress. Each command narrows it further by
    /// its `maxTimeMS`.
    #[serde(skip)]
    pub interrupt: Interrupt,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_pipeline_stages: 1000,
            max_nested_pipeline_depth: 20,
            enable_change_streams: false,
            enable_sort_pushdown_to_index: true,
            enable_native_tailable: false,
            enable_lookup_inlining: true,
            use_point_read: true,
            batch_size: 101,
            hooks: Hooks::default(),
            interrupt: Interrupt::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_hooks(hooks: Arc<dyn HookTable>) -> Self {
        EngineConfig {
            hooks: Hooks::new(hooks),
            ..EngineConfig::default()
        }
    }
}

/// Shared slot holding the active [`HookTable`]. Clones observe swaps.
#[derive(Clone)]
pub struct Hooks(Arc<ArcSwap<Arc<dyn HookTable>>>);

impl Hooks {
    pub fn new(table: Arc<dyn HookTable>) -> Self {
        Hooks(Arc::new(ArcSwap::from_pointee(table)))
    }

    pub fn load(&self) -> Arc<dyn HookTable> {
        let current = self.0.load();
        Arc::clone(&**current)
    }

    pub fn swap(&self, table: Arc<dyn HookTable>) {
        self.0.store(Arc::new(table));
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Hooks::new(Arc::new(MemoryCatalog::default()))
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hooks(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CollectionInfo;

    #[test]
    fn swapped_hooks_are_visible_to_clones() {
        let config = EngineConfig::default();
        let clone = config.clone();
        assert!(
            clone
                .hooks
                .load()
                .resolve_collection("db", "c")
                .unwrap()
                .is_none()
        );

        let catalog = MemoryCatalog::default();
        catalog.add(CollectionInfo::new("db", "c", 7));
        config.hooks.swap(Arc::new(catalog));

        let info = clone.hooks.load().resolve_collection("db", "c").unwrap();
        assert_eq!(info.map(|i| i.collection_id), Some(7));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig = bson::deserialize_from_document(bson::doc! {
            "max_pipeline_stages": 3,
            "enable_change_streams": true,
        })
        .unwrap();
        assert_eq!(config.max_pipeline_stages, 3);
        assert!(config.enable_change_streams);
        assert_eq!(config.batch_size, 101);
    }
}
