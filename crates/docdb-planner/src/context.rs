use std::sync::Arc;

use bson::{Bson, Document};
use docdb_query::{Error, Interrupt, Result};

use crate::catalog::{CollectionInfo, HookTable};
use crate::config::EngineConfig;

/// The stage that owns a nested pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentStage {
    Lookup,
    Facet,
    UnionWith,
}

/// What the planner observed after one stage ran.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTrace {
    pub stage: &'static str,
    pub sort_spec: Option<Document>,
    pub requires_persistent_cursor: bool,
    pub requires_subquery: bool,
}

/// State threaded through the stages of one pipeline.
pub struct PipelineContext<'a> {
    pub config: &'a EngineConfig,
    pub hooks: Arc<dyn HookTable>,
    pub database: String,
    /// Name the pipeline was issued against (a view name for views).
    pub collection_name: Option<String>,
    /// The resolved base collection, `None` when it does not exist.
    pub collection: Option<CollectionInfo>,
    pub is_agnostic: bool,
    pub stage_num: usize,
    pub requires_subquery: bool,
    pub requires_subquery_after_project: bool,
    pub requires_persistent_cursor: bool,
    pub requires_tailable_cursor: bool,
    /// Sort order the current rows are known to follow.
    pub sort_spec: Option<Document>,
    pub collation: Option<Document>,
    /// `let` variables of the command.
    pub variable_spec: Option<Document>,
    /// Cleared by stages that must not run against shard tables directly.
    pub allow_shard_base_table: bool,
    /// `_id` of a point lookup found by `$match` on the base table.
    pub point_read_id: Option<Bson>,
    /// Hashes the base-table shard filter admits.
    pub shard_key_values: Option<Vec<i64>>,
    pub has_output_stage: bool,
    /// Subquery promotions made so far.
    pub num_nested_levels: usize,
    pub nested_pipeline_level: usize,
    pub parent_stage: Option<ParentStage>,
    pub trace: Vec<StageTrace>,
    pub interrupt: Interrupt,
}

impl std::fmt::Debug for PipelineContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("database", &self.database)
            .field("collection_name", &self.collection_name)
            .field("stage_num", &self.stage_num)
            .field("nested_pipeline_level", &self.nested_pipeline_level)
            .finish_non_exhaustive()
    }
}

impl<'a> PipelineContext<'a> {
    pub fn new(config: &'a EngineConfig, database: impl Into<String>) -> Self {
        PipelineContext {
            config,
            hooks: config.hooks.load(),
            database: database.into(),
            collection_name: None,
            collection: None,
            is_agnostic: false,
            stage_num: 0,
            requires_subquery: false,
            requires_subquery_after_project: false,
            requires_persistent_cursor: false,
            requires_tailable_cursor: false,
            sort_spec: None,
            collation: None,
            variable_spec: None,
            allow_shard_base_table: true,
            point_read_id: None,
            shard_key_values: None,
            has_output_stage: false,
            num_nested_levels: 0,
            nested_pipeline_level: 0,
            parent_stage: None,
            trace: Vec::new(),
            interrupt: config.interrupt.clone(),
        }
    }

    /// Context for a sub-pipeline owned by `parent`. Command-level settings
    /// carry over; per-pipeline state starts fresh.
    pub fn nested(&self, parent: ParentStage) -> Result<PipelineContext<'a>> {
        self.interrupt.check()?;
        let level = self.nested_pipeline_level + 1;
        if level > self.config.max_nested_pipeline_depth {
            return Err(Error::location(
                15962,
                format!(
                    "Maximum number of nested sub-pipelines exceeded. Limit is {}",
                    self.config.max_nested_pipeline_depth
                ),
            ));
        }
        let mut child = PipelineContext::new(self.config, self.database.clone());
        child.hooks = Arc::clone(&self.hooks);
        child.collation = self.collation.clone();
        child.variable_spec = self.variable_spec.clone();
        child.nested_pipeline_level = level;
        child.parent_stage = Some(parent);
        child.interrupt = self.interrupt.clone();
        Ok(child)
    }

    pub fn collation_applicable(&self) -> bool {
        self.collation.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn collection_id(&self) -> Option<u64> {
        self.collection.as_ref().map(|c| c.collection_id)
    }

    /// Alias for the subquery created by the next promotion.
    pub fn stage_alias(&self) -> String {
        if self.nested_pipeline_level > 0 {
            format!(
                "agg_stage_sub_{}_{}",
                self.nested_pipeline_level, self.stage_num
            )
        } else {
            format!("agg_stage_{}", self.stage_num)
        }
    }

    /// Alias of the base relation.
    pub fn collection_alias(&self) -> String {
        if self.num_nested_levels > 0 || self.nested_pipeline_level > 0 {
            format!(
                "collection_{}_{}",
                self.num_nested_levels, self.nested_pipeline_level
            )
        } else {
            "collection".to_string()
        }
    }
}
