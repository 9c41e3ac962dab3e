//! Aggregation pipeline planner: turns `aggregate`, `find`, `count` and
//! `distinct` commands into relational plans and picks the cursor that
//! serves them.

mod catalog;
mod command;
mod config;
mod context;
mod cursor;
mod planner;
pub mod stage;
pub mod stages;
pub mod tree;

pub use catalog::{CollectionInfo, HookTable, MemoryCatalog, ViewDefinition};
pub use command::{
    AggregateRequest, Command, CountRequest, DistinctRequest, FindRequest, GetMoreRequest,
};
pub use config::{EngineConfig, Hooks, MAX_VIEW_DEPTH};
pub use context::{ParentStage, PipelineContext, StageTrace};
pub use cursor::{CursorKind, attach_cursor, classify_aggregate, classify_find};
pub use planner::{Planner, QueryPlan, promote_to_subquery};
pub use stage::{Stage, StageDefinition, extract_stages, find_stage, optimize_stages};
pub use tree::{Expr, QueryNode, QueryTree, Relation};
