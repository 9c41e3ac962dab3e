use std::sync::Arc;

use bson::{Bson, Document, doc};
use docdb_query::{Error, ErrorCode, Result};
use tracing::{debug, trace};

use crate::command::{
    AggregateRequest, Command, CountRequest, DistinctRequest, FindRequest,
};
use crate::config::{EngineConfig, MAX_VIEW_DEPTH};
use crate::context::{PipelineContext, StageTrace};
use crate::cursor::{CursorKind, attach_cursor, classify_aggregate, classify_find};
use crate::stage::{Stage, extract_stages, find_stage, optimize_stages};
use crate::stages;
use crate::tree::{Expr, QueryTree, Relation};

/// A planned command: the relational tree plus how its rows are returned.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// `db.collection`
    pub namespace: String,
    pub tree: QueryTree,
    pub cursor: CursorKind,
    pub batch_size: i64,
    /// `_id` of a point read, when the cursor is [`CursorKind::PointRead`].
    pub point_read_id: Option<Bson>,
    /// Shard-key hashes the base-table filter admits.
    pub shard_key_values: Option<Vec<i64>>,
    pub allow_shard_base_table: bool,
    pub explain: bool,
    pub max_time_ms: Option<i64>,
    /// One entry per top-level stage, in the order they ran.
    pub stages: Vec<StageTrace>,
}

impl QueryPlan {
    pub fn to_document(&self) -> Document {
        let mut out = doc! {
            "namespace": self.namespace.clone(),
            "cursorKind": self.cursor.as_str(),
            "batchSize": self.batch_size,
            "plan": self.tree.explain(),
        };
        if let Some(values) = &self.shard_key_values {
            out.insert(
                "shardKeyValues",
                values.iter().map(|v| Bson::Int64(*v)).collect::<Vec<_>>(),
            );
        }
        if let Some(id) = &self.point_read_id {
            out.insert("pointReadId", id.clone());
        }
        out.insert(
            "stages",
            self.stages
                .iter()
                .map(|s| Bson::String(s.stage.to_string()))
                .collect::<Vec<_>>(),
        );
        out
    }
}

// ── Pipeline walking ───────────────────────────────────────────

/// Wrap the current root in a subquery so the next stage sees its output
/// as plain rows.
pub fn promote_to_subquery(tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) {
    let alias = ctx.stage_alias();
    trace!(alias = %alias, stage_num = ctx.stage_num, "promoting plan to subquery");
    tree.wrap_root(alias);
    ctx.requires_subquery = false;
    ctx.num_nested_levels += 1;
}

/// Base relation for `collection`, following views to the collection they
/// read. Also returns the view stages, innermost view first.
pub(crate) fn resolve_base(
    ctx: &mut PipelineContext<'_>,
    collection: &str,
) -> Result<(QueryTree, Vec<Bson>)> {
    resolve_base_checked(ctx, collection, None)
}

fn resolve_base_checked(
    ctx: &mut PipelineContext<'_>,
    collection: &str,
    expected_uuid: Option<&str>,
) -> Result<(QueryTree, Vec<Bson>)> {
    ctx.collection_name = Some(collection.to_string());
    let hooks = Arc::clone(&ctx.hooks);
    let mut current = hooks.resolve_collection(&ctx.database, collection)?;

    if let Some(expected) = expected_uuid {
        let namespace = format!("{}.{}", ctx.database, collection);
        match &current {
            None => {
                return Err(Error::new(
                    ErrorCode::CollectionUUIDMismatch,
                    format!(
                        "Namespace {namespace} contains a mismatch in the collectionUUID identifier: Collection does not exist"
                    ),
                ));
            }
            Some(info) if info.uuid.as_deref() != Some(expected) => {
                return Err(Error::new(
                    ErrorCode::CollectionUUIDMismatch,
                    format!("Namespace {namespace} contains a mismatch in the collectionUUID identifier"),
                ));
            }
            Some(_) => {}
        }
    }

    let mut view_pipelines = Vec::new();
    while let Some(view) = current.as_ref().and_then(|info| info.view.clone()) {
        if view_pipelines.len() >= MAX_VIEW_DEPTH {
            return Err(Error::new(
                ErrorCode::ViewDepthLimitExceeded,
                format!("View depth exceeded limit {MAX_VIEW_DEPTH}"),
            ));
        }
        view_pipelines.push(view.pipeline_values());
        current = hooks.resolve_collection(&ctx.database, &view.view_on)?;
    }
    if !view_pipelines.is_empty() {
        debug!(view = collection, depth = view_pipelines.len(), "resolved view");
    }

    let alias = ctx.collection_alias();
    let source = match &current {
        Some(info) => Relation::Collection {
            database: info.database.clone(),
            name: info.name.clone(),
            collection_id: info.collection_id,
            alias,
            sample_rows: None,
        },
        None => Relation::Empty { alias },
    };
    ctx.collection = current;
    let view_stages = view_pipelines.into_iter().rev().flatten().collect();
    Ok((QueryTree::new(source), view_stages))
}

/// Parse `pipeline` and apply its stages to `tree`.
pub(crate) fn apply_pipeline(
    pipeline: &[Bson],
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let stages = extract_stages(pipeline, ctx.config)?;
    let (stages, allow_shard_base_table) = optimize_stages(stages);
    ctx.allow_shard_base_table &= allow_shard_base_table;
    apply_stages(&stages, tree, ctx)
}

pub(crate) fn apply_stages(
    stages: &[Stage],
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    for stage in stages {
        ctx.interrupt.check()?;
        let definition = stage.definition;
        let name = definition.name;
        if !ctx.hooks.is_stage_enabled(name) {
            return Err(Error::not_supported(format!(
                "Stage {name} is not enabled"
            )));
        }
        let Some(mutate) = definition.mutate else {
            return Err(Error::not_supported(format!(
                "Stage {name} is not supported yet in native pipeline"
            )));
        };

        if matches!(tree.root_node().source, Relation::Agnostic)
            && !definition.can_handle_collectionless
        {
            return Err(Error::new(
                ErrorCode::InvalidNamespace,
                format!(
                    "The value '{{aggregate: 1}}' is invalid for the '{name}'; a collection input is necessary."
                ),
            ));
        }

        if ctx.requires_subquery {
            promote_to_subquery(tree, ctx);
        }
        if ctx.requires_subquery_after_project {
            ctx.requires_subquery_after_project = false;
            if definition.is_project_transform {
                ctx.requires_subquery = true;
            } else if ctx.requires_tailable_cursor {
                return Err(Error::not_supported(format!(
                    "Cannot use tailable cursor with stage {name}"
                )));
            } else {
                promote_to_subquery(tree, ctx);
            }
        }

        debug!(
            stage = name,
            stage_num = ctx.stage_num,
            nested_level = ctx.nested_pipeline_level,
            requires_subquery = ctx.requires_subquery,
            "applying stage"
        );
        mutate(&stage.value, tree, ctx)?;

        ctx.requires_persistent_cursor |= (definition.requires_persistent_cursor)(&stage.value);
        if !definition.preserves_sort_order {
            ctx.sort_spec = None;
        }
        ctx.trace.push(StageTrace {
            stage: name,
            sort_spec: ctx.sort_spec.clone(),
            requires_persistent_cursor: ctx.requires_persistent_cursor,
            requires_subquery: ctx.requires_subquery,
        });
        ctx.stage_num += 1;
    }
    Ok(())
}

/// `aggregate: 1` with nothing to run returns no rows.
fn finish_agnostic(tree: &mut QueryTree, ctx: &PipelineContext<'_>) {
    if ctx.stage_num == 0 && matches!(tree.root_node().source, Relation::Agnostic) {
        let node = tree.root_node_mut();
        node.set_document(Expr::Const(Bson::Null));
        node.limit = Some(0);
    }
}

/// Plan a sub-pipeline read from `from`, or from nothing when `from` is
/// absent.
pub(crate) fn plan_sub_pipeline(
    ctx: &mut PipelineContext<'_>,
    from: Option<&str>,
    pipeline: &[Bson],
) -> Result<QueryTree> {
    ctx.interrupt.check()?;
    let mut tree = match from {
        Some(collection) => {
            let (mut tree, view_stages) = resolve_base(ctx, collection)?;
            apply_pipeline(&view_stages, &mut tree, ctx)?;
            tree
        }
        None => {
            ctx.is_agnostic = true;
            QueryTree::new(Relation::Agnostic)
        }
    };
    apply_pipeline(pipeline, &mut tree, ctx)?;
    finish_agnostic(&mut tree, ctx);
    Ok(tree)
}

/// Apply one stage outside the walking loop, as the command front-ends do.
fn apply_direct(
    name: &str,
    value: Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    ctx.interrupt.check()?;
    let stage = Stage::of(name, value)?;
    // a view's last stage may leave the root unable to take more clauses
    if ctx.requires_subquery {
        promote_to_subquery(tree, ctx);
    }
    if let Some(mutate) = stage.definition.mutate {
        mutate(&stage.value, tree, ctx)?;
    }
    ctx.trace.push(StageTrace {
        stage: stage.name(),
        sort_spec: ctx.sort_spec.clone(),
        requires_persistent_cursor: ctx.requires_persistent_cursor,
        requires_subquery: ctx.requires_subquery,
    });
    ctx.stage_num += 1;
    Ok(())
}

fn stage_requires_persistence(name: &str, value: &Bson) -> bool {
    find_stage(name).is_none_or(|definition| (definition.requires_persistent_cursor)(value))
}

fn is_natural_hint(value: &Bson) -> bool {
    matches!(value, Bson::Document(spec) if spec.contains_key("$natural"))
}

// ── Planner ────────────────────────────────────────────────────

pub struct Planner<'a> {
    config: &'a EngineConfig,
}

impl<'a> Planner<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn plan(&self, command: &Command) -> Result<QueryPlan> {
        match command {
            Command::Aggregate(request) => self.plan_aggregate(request),
            Command::Find(request) => self.plan_find(request),
            Command::Count(request) => self.plan_count(request),
            Command::Distinct(request) => self.plan_distinct(request),
            Command::GetMore(request) => Err(Error::new(
                ErrorCode::IllegalOperation,
                format!(
                    "getMore on {} resumes an existing cursor and has no plan",
                    request.namespace()
                ),
            )),
        }
    }

    fn context(
        &self,
        database: &str,
        collation: Option<&Document>,
        let_spec: Option<&Document>,
        max_time_ms: Option<i64>,
    ) -> PipelineContext<'a> {
        let mut ctx = PipelineContext::new(self.config, database);
        ctx.collation = collation.cloned();
        ctx.variable_spec = let_spec.cloned();
        ctx.interrupt = ctx.interrupt.with_max_time_ms(max_time_ms);
        ctx
    }

    fn finish(
        &self,
        namespace: String,
        tree: QueryTree,
        cursor: CursorKind,
        batch_size: Option<i64>,
        ctx: PipelineContext<'_>,
    ) -> QueryPlan {
        QueryPlan {
            namespace,
            tree,
            cursor,
            batch_size: batch_size.unwrap_or(self.config.batch_size),
            point_read_id: if cursor == CursorKind::PointRead {
                ctx.point_read_id
            } else {
                None
            },
            shard_key_values: ctx.shard_key_values,
            allow_shard_base_table: ctx.allow_shard_base_table,
            explain: false,
            max_time_ms: None,
            stages: ctx.trace,
        }
    }

    // ── Aggregate ───────────────────────────────────────────────

    fn plan_aggregate(&self, request: &AggregateRequest) -> Result<QueryPlan> {
        let mut ctx = self.context(
            &request.database,
            request.collation.as_ref(),
            request.let_spec.as_ref(),
            request.max_time_ms,
        );

        let (mut tree, namespace) = match &request.collection {
            Some(collection) => {
                let (mut tree, view_stages) =
                    resolve_base_checked(&mut ctx, collection, request.collection_uuid.as_deref())?;
                apply_pipeline(&view_stages, &mut tree, &mut ctx)?;
                (tree, format!("{}.{collection}", request.database))
            }
            None => {
                ctx.is_agnostic = true;
                (
                    QueryTree::new(Relation::Agnostic),
                    format!("{}.$cmd.aggregate", request.database),
                )
            }
        };
        apply_pipeline(&request.pipeline, &mut tree, &mut ctx)?;
        finish_agnostic(&mut tree, &ctx);

        let requested = request.single_batch.then_some(CursorKind::SingleBatch);
        let kind = classify_aggregate(&ctx, requested);
        if !request.has_cursor && !request.explain && kind != CursorKind::Tailable {
            return Err(Error::failed_to_parse(
                "The 'cursor' option is required, except for aggregate with explain",
            ));
        }
        let kind = attach_cursor(kind, &mut tree)?;

        let mut plan = self.finish(namespace, tree, kind, request.batch_size, ctx);
        plan.explain = request.explain;
        plan.max_time_ms = request.max_time_ms;
        Ok(plan)
    }

    // ── Find ────────────────────────────────────────────────────

    fn plan_find(&self, request: &FindRequest) -> Result<QueryPlan> {
        let mut ctx = self.context(
            &request.database,
            request.collation.as_ref(),
            request.let_spec.as_ref(),
            request.max_time_ms,
        );

        if request.sort.is_some() {
            ctx.requires_persistent_cursor = true;
        }
        if let Some(skip) = &request.skip {
            ctx.requires_persistent_cursor |= stage_requires_persistence("$skip", skip);
        }
        if let Some(limit) = &request.limit {
            ctx.requires_persistent_cursor |= stage_requires_persistence("$limit", limit);
        }
        if let Some(hint) = &request.hint {
            let natural_sort = request
                .sort
                .as_ref()
                .is_some_and(|sort| sort.contains_key("$natural"));
            if natural_sort && !is_natural_hint(hint) {
                return Err(Error::bad_value(
                    "Cannot provide natural sort with a non-natural index hint",
                ));
            }
        }

        let (mut tree, view_stages) = resolve_base(&mut ctx, &request.collection)?;
        apply_pipeline(&view_stages, &mut tree, &mut ctx)?;

        if let Some(filter) = &request.filter {
            apply_direct("$match", Bson::Document(filter.clone()), &mut tree, &mut ctx)?;
        }
        if let Some(sort) = &request.sort {
            apply_direct("$sort", Bson::Document(sort.clone()), &mut tree, &mut ctx)?;
        }
        if let Some(skip) = &request.skip {
            apply_direct("$skip", skip.clone(), &mut tree, &mut ctx)?;
        }
        if let Some(limit) = &request.limit {
            apply_direct("$limit", limit.clone(), &mut tree, &mut ctx)?;
        }
        if let Some(projection) = &request.projection {
            stages::project::apply_find_projection(
                projection,
                request.filter.as_ref(),
                &mut tree,
                &ctx,
            );
        }
        if !tree.root_node().sort.is_empty() {
            ctx.requires_persistent_cursor = true;
        }

        let requested = request.single_batch.then_some(CursorKind::SingleBatch);
        let kind = classify_find(&ctx, &tree, requested, request.batch_size);
        let kind = attach_cursor(kind, &mut tree)?;

        let namespace = format!("{}.{}", request.database, request.collection);
        let mut plan = self.finish(namespace, tree, kind, request.batch_size, ctx);
        plan.max_time_ms = request.max_time_ms;
        Ok(plan)
    }

    // ── Count ───────────────────────────────────────────────────

    fn plan_count(&self, request: &CountRequest) -> Result<QueryPlan> {
        let mut ctx = self.context(
            &request.database,
            request.collation.as_ref(),
            None,
            request.max_time_ms,
        );
        let (mut tree, view_stages) = resolve_base(&mut ctx, &request.collection)?;
        let is_view = !view_stages.is_empty();
        apply_pipeline(&view_stages, &mut tree, &mut ctx)?;

        if !request.has_modifier && ctx.collection.is_some() && !is_view {
            // estimated count from collection statistics
            apply_direct(
                "$collStats",
                Bson::Document(doc! { "count": {} }),
                &mut tree,
                &mut ctx,
            )?;
            apply_direct("$project", Bson::Document(doc! { "n": "$count" }), &mut tree, &mut ctx)?;
        } else {
            if let Some(query) = &request.query {
                apply_direct("$match", Bson::Document(query.clone()), &mut tree, &mut ctx)?;
            }
            if let Some(skip) = &request.skip {
                if !matches!(skip, Bson::Null) {
                    apply_direct("$skip", skip.clone(), &mut tree, &mut ctx)?;
                }
                ctx.requires_persistent_cursor = true;
            }
            if let Some(limit) = &request.limit {
                apply_direct("$limit", limit.clone(), &mut tree, &mut ctx)?;
                ctx.requires_persistent_cursor |= stage_requires_persistence("$limit", limit);
            }
            apply_direct("$count", Bson::String("n".into()), &mut tree, &mut ctx)?;
        }

        let current = tree.root_node().document().clone();
        tree.root_node_mut().set_document(Expr::func(
            "bson_dollar_merge_documents",
            vec![current, Expr::document(doc! { "ok": 1.0 })],
        ));

        let namespace = format!("{}.{}", request.database, request.collection);
        let mut plan = self.finish(namespace, tree, CursorKind::SingleBatch, None, ctx);
        plan.max_time_ms = request.max_time_ms;
        Ok(plan)
    }

    // ── Distinct ────────────────────────────────────────────────

    fn plan_distinct(&self, request: &DistinctRequest) -> Result<QueryPlan> {
        let mut ctx = self.context(&request.database, None, None, request.max_time_ms);
        let (mut tree, view_stages) = resolve_base(&mut ctx, &request.collection)?;
        apply_pipeline(&view_stages, &mut tree, &mut ctx)?;

        if let Some(query) = &request.query {
            apply_direct("$match", Bson::Document(query.clone()), &mut tree, &mut ctx)?;
        }
        if !tree.root_node().sort.is_empty() {
            promote_to_subquery(&mut tree, &mut ctx);
        }

        // one row per distinct value, arrays expanded
        let current = tree.root_node().document().clone();
        let node = tree.root_node_mut();
        node.set_document(Expr::func(
            "bson_distinct_unwind",
            vec![current, Expr::konst(request.key.clone())],
        ));
        node.distinct = true;

        promote_to_subquery(&mut tree, &mut ctx);
        tree.root_node_mut()
            .set_document(Expr::aggregate("bson_distinct_agg", vec![Expr::Document]));

        let namespace = format!("{}.{}", request.database, request.collection);
        let mut plan = self.finish(namespace, tree, CursorKind::SingleBatch, None, ctx);
        plan.max_time_ms = request.max_time_ms;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CollectionInfo, MemoryCatalog};
    use crate::context::ParentStage;

    fn config_with(catalog: MemoryCatalog) -> EngineConfig {
        EngineConfig::with_hooks(Arc::new(catalog))
    }

    #[test]
    fn views_apply_innermost_first() {
        let catalog = MemoryCatalog::default();
        catalog.add(CollectionInfo::new("db", "base", 9));
        catalog.add(CollectionInfo::view(
            "db",
            "inner",
            "base",
            vec![doc! { "$match": { "a": 1 } }],
        ));
        catalog.add(CollectionInfo::view(
            "db",
            "outer",
            "inner",
            vec![doc! { "$project": { "a": 1 } }],
        ));
        let config = config_with(catalog);
        let mut ctx = PipelineContext::new(&config, "db");
        let (_, stages) = resolve_base(&mut ctx, "outer").unwrap();
        assert_eq!(
            stages,
            vec![
                Bson::Document(doc! { "$match": { "a": 1 } }),
                Bson::Document(doc! { "$project": { "a": 1 } }),
            ]
        );
        assert_eq!(ctx.collection_id(), Some(9));
        assert_eq!(ctx.collection_name.as_deref(), Some("outer"));
    }

    #[test]
    fn view_chains_are_bounded() {
        let catalog = MemoryCatalog::default();
        for i in 0..=MAX_VIEW_DEPTH {
            catalog.add(CollectionInfo::view(
                "db",
                format!("v{i}"),
                format!("v{}", i + 1),
                Vec::new(),
            ));
        }
        let config = config_with(catalog);
        let mut ctx = PipelineContext::new(&config, "db");
        let err = resolve_base(&mut ctx, "v0").unwrap_err();
        assert_eq!(err.code, ErrorCode::ViewDepthLimitExceeded);

        let mut ctx = PipelineContext::new(&config, "db");
        assert!(resolve_base(&mut ctx, "v1").is_ok());
    }

    #[test]
    fn collection_uuid_must_match() {
        let catalog = MemoryCatalog::default();
        catalog.add(CollectionInfo::new("db", "c", 1).with_uuid("u-1"));
        let config = config_with(catalog);

        let mut ctx = PipelineContext::new(&config, "db");
        assert!(resolve_base_checked(&mut ctx, "c", Some("u-1")).is_ok());
        let mut ctx = PipelineContext::new(&config, "db");
        let err = resolve_base_checked(&mut ctx, "c", Some("u-2")).unwrap_err();
        assert_eq!(err.code, ErrorCode::CollectionUUIDMismatch);
        let mut ctx = PipelineContext::new(&config, "db");
        let err = resolve_base_checked(&mut ctx, "missing", Some("u-1")).unwrap_err();
        assert!(err.message.contains("Collection does not exist"));
    }

    #[test]
    fn empty_agnostic_pipeline_returns_nothing() {
        let config = EngineConfig::default();
        let mut ctx = PipelineContext::new(&config, "db");
        let tree = plan_sub_pipeline(&mut ctx, None, &[]).unwrap();
        assert_eq!(tree.root_node().limit, Some(0));
    }

    #[test]
    fn agnostic_rejects_collection_stages() {
        let config = EngineConfig::default();
        let mut ctx = PipelineContext::new(&config, "db");
        let err = plan_sub_pipeline(
            &mut ctx,
            None,
            &[Bson::Document(doc! { "$match": { "a": 1 } })],
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidNamespace);
    }

    #[test]
    fn cancelled_context_stops_before_nested_pipelines() {
        let catalog = MemoryCatalog::default();
        catalog.add(CollectionInfo::new("db", "c", 1));
        let config = config_with(catalog);
        let mut ctx = PipelineContext::new(&config, "db");
        assert!(ctx.nested(ParentStage::Facet).is_ok());

        config.interrupt.cancel();
        let err = ctx.nested(ParentStage::Facet).unwrap_err();
        assert_eq!(err.code, ErrorCode::Interrupted);
        let err = plan_sub_pipeline(&mut ctx, Some("c"), &[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::Interrupted);
    }

    #[test]
    fn disabled_stage_is_rejected() {
        let catalog = MemoryCatalog::default();
        catalog.add(CollectionInfo::new("db", "c", 1));
        catalog.disable_stage("$sample");
        let config = config_with(catalog);
        let mut ctx = PipelineContext::new(&config, "db");
        let err = plan_sub_pipeline(
            &mut ctx,
            Some("c"),
            &[Bson::Document(doc! { "$sample": { "size": 3 } })],
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandNotSupported);
    }
}
