//! Stages that plan a second pipeline and combine it with the current rows:
//! `$lookup`, its fused `$lookupUnwind` form, `$unionWith` and `$facet`.

use bson::{Bson, Document};
use docdb_query::{Error, ErrorCode, Result};
use tracing::trace;

use super::{promote_to_subquery, type_name};
use crate::context::{ParentStage, PipelineContext};
use crate::planner::{apply_pipeline, plan_sub_pipeline, resolve_base};
use crate::stage::split_inlinable;
use crate::tree::{Expr, Join, JoinKind, QueryNode, QueryTree, Relation};

/// Stages that may not appear inside a `$facet` sub-pipeline.
const FACET_FORBIDDEN: [&str; 6] = [
    "$changeStream",
    "$collStats",
    "$facet",
    "$indexStats",
    "$merge",
    "$out",
];

// ── $lookup ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct LookupSpec {
    database: Option<String>,
    from: Option<String>,
    local_field: Option<String>,
    foreign_field: Option<String>,
    as_field: String,
    let_spec: Option<Document>,
    pipeline: Vec<Bson>,
}

impl LookupSpec {
    fn parse(value: &Bson) -> Result<LookupSpec> {
        let Bson::Document(spec) = value else {
            return Err(Error::location(
                40319,
                format!(
                    "the $lookup stage specification must be an object, but found {}",
                    type_name(value)
                ),
            ));
        };

        let string_arg = |key: &str, v: &Bson| match v {
            Bson::String(s) => Ok(s.clone()),
            other => Err(Error::location(
                40321,
                format!(
                    "$lookup argument '{key}' must be a string, found {}",
                    type_name(other)
                ),
            )),
        };

        let mut parsed = LookupSpec {
            database: None,
            from: None,
            local_field: None,
            foreign_field: None,
            as_field: String::new(),
            let_spec: None,
            pipeline: Vec::new(),
        };
        let mut as_field = None;
        for (key, v) in spec {
            match key.as_str() {
                "from" => match v {
                    Bson::String(s) => parsed.from = Some(s.clone()),
                    Bson::Document(ns) => {
                        let (Ok(db), Ok(coll)) = (ns.get_str("db"), ns.get_str("coll")) else {
                            return Err(Error::failed_to_parse(
                                "$lookup 'from' must have both 'db' and 'coll' string fields",
                            ));
                        };
                        parsed.database = Some(db.to_string());
                        parsed.from = Some(coll.to_string());
                    }
                    other => {
                        return Err(Error::location(
                            40321,
                            format!(
                                "$lookup argument 'from' must be a string or an object, found {}",
                                type_name(other)
                            ),
                        ));
                    }
                },
                "localField" => parsed.local_field = Some(string_arg(key, v)?),
                "foreignField" => parsed.foreign_field = Some(string_arg(key, v)?),
                "as" => as_field = Some(string_arg(key, v)?),
                "let" => match v {
                    Bson::Document(vars) => parsed.let_spec = Some(vars.clone()),
                    other => {
                        return Err(Error::failed_to_parse(format!(
                            "$lookup argument 'let' must be an object, is type {}",
                            type_name(other)
                        )));
                    }
                },
                "pipeline" => match v {
                    Bson::Array(stages) => parsed.pipeline = stages.clone(),
                    other => {
                        return Err(Error::failed_to_parse(format!(
                            "$lookup argument 'pipeline' must be an array, is type {}",
                            type_name(other)
                        )));
                    }
                },
                other => {
                    return Err(Error::location(
                        40320,
                        format!("unknown argument to $lookup: {other}"),
                    ));
                }
            }
        }

        let Some(as_field) = as_field else {
            return Err(Error::failed_to_parse("must specify 'as' field for a $lookup"));
        };
        if as_field.is_empty() {
            return Err(Error::location(
                40352,
                "FieldPath cannot be constructed with empty string",
            ));
        }
        if as_field.starts_with('$') {
            return Err(Error::location(
                16410,
                "FieldPath field names may not start with '$'.",
            ));
        }
        parsed.as_field = as_field;

        if parsed.local_field.is_some() != parsed.foreign_field.is_some() {
            return Err(Error::failed_to_parse(
                "$lookup requires either 'pipeline' or both 'localField' and 'foreignField' to be specified",
            ));
        }
        let has_join = parsed.local_field.is_some();
        if !has_join && !spec.contains_key("pipeline") {
            return Err(Error::failed_to_parse(
                "$lookup requires either 'pipeline' or both 'localField' and 'foreignField' to be specified",
            ));
        }
        if parsed.from.is_none() {
            let starts_with_documents = matches!(
                parsed.pipeline.first(),
                Some(Bson::Document(first)) if first.contains_key("$documents")
            );
            if !starts_with_documents || has_join {
                return Err(Error::failed_to_parse("must specify 'from' field for a $lookup"));
            }
        }
        Ok(parsed)
    }
}

/// Promote the outer rows until the root reads a plain, aliased document
/// the joined side can refer to.
fn prepare_outer(tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> String {
    let needs_wrap = {
        let node = tree.root_node();
        *node.document() != Expr::Document
            || node.targets.len() > 1
            || node.limit.is_some()
            || node.offset.is_some()
            || !node.group_by.is_empty()
            || node.window.is_some()
            || node.source.alias().is_none()
    };
    if needs_wrap {
        promote_to_subquery(tree, ctx);
    }
    tree.root_node()
        .source
        .alias()
        .map(str::to_string)
        .unwrap_or_else(|| ctx.stage_alias())
}

/// Plan the joined side: the inlinable prefix of the sub-pipeline on the
/// foreign collection, then the join filter, then the remaining stages.
fn plan_joined(spec: &LookupSpec, outer_alias: &str, ctx: &PipelineContext<'_>) -> Result<QueryTree> {
    let mut inner_ctx = ctx.nested(ParentStage::Lookup)?;
    if let Some(database) = &spec.database {
        inner_ctx.database = database.clone();
    }
    if let Some(vars) = &spec.let_spec {
        let mut merged = inner_ctx.variable_spec.take().unwrap_or_default();
        for (name, expr) in vars {
            merged.insert(name.clone(), expr.clone());
        }
        inner_ctx.variable_spec = Some(merged);
    }

    let (Some(local), Some(foreign), Some(from)) =
        (&spec.local_field, &spec.foreign_field, &spec.from)
    else {
        return plan_sub_pipeline(&mut inner_ctx, spec.from.as_deref(), &spec.pipeline);
    };

    let (mut inner, view_stages) = resolve_base(&mut inner_ctx, from)?;
    apply_pipeline(&view_stages, &mut inner, &mut inner_ctx)?;

    let has_let = spec.let_spec.is_some();
    let (inlined, rest) = if ctx.config.enable_lookup_inlining {
        split_inlinable(&spec.pipeline, foreign, has_let)
    } else {
        (Vec::new(), spec.pipeline.clone())
    };
    trace!(
        inlined = inlined.len(),
        remaining = rest.len(),
        "split $lookup sub-pipeline"
    );
    apply_pipeline(&inlined, &mut inner, &mut inner_ctx)?;

    let paged_or_grouped = {
        let node = inner.root_node();
        node.limit.is_some() || node.offset.is_some() || node.has_aggregates()
    };
    if inner_ctx.requires_subquery || paged_or_grouped {
        promote_to_subquery(&mut inner, &mut inner_ctx);
    }
    let join_document = inner.root_node().document().clone();
    inner.root_node_mut().quals.push(Expr::func(
        "bson_dollar_lookup_join_filter",
        vec![
            join_document,
            Expr::konst(foreign.clone()),
            Expr::func(
                "bson_dollar_lookup_extract_filter_array",
                vec![
                    Expr::JoinDocument(outer_alias.to_string()),
                    Expr::konst(local.clone()),
                ],
            ),
        ],
    ));
    apply_pipeline(&rest, &mut inner, &mut inner_ctx)?;
    Ok(inner)
}

/// `$lookup`
pub fn handle_lookup(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let spec = LookupSpec::parse(value)?;
    let outer_alias = prepare_outer(tree, ctx);
    let mut inner = plan_joined(&spec, &outer_alias, ctx)?;

    // one array per outer row
    inner.wrap_root(format!("lookup_inner_{}", ctx.stage_num));
    inner.root_node_mut().set_document(Expr::aggregate(
        "bson_array_agg",
        vec![Expr::Document, Expr::konst(spec.as_field.clone())],
    ));

    let alias = format!("lookup_right_{}", ctx.stage_num);
    let right = tree.graft(inner);
    let current = tree.root_node().document().clone();
    let node = tree.root_node_mut();
    node.joins.push(Join {
        kind: JoinKind::LeftOuter,
        right,
        alias: alias.clone(),
        lateral: true,
        condition: None,
    });
    node.set_document(Expr::func(
        "bson_dollar_lookup_project",
        vec![
            current,
            Expr::JoinDocument(alias),
            Expr::konst(spec.as_field),
        ],
    ));
    ctx.requires_subquery = true;
    Ok(())
}

/// `$lookup` immediately followed by an `$unwind` of its output field:
/// one row per joined document instead of an array.
pub fn handle_lookup_unwind(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let Bson::Document(fused) = value else {
        return Err(Error::internal("$lookupUnwind expects a document"));
    };
    let preserve = fused
        .get_bool("preserveNullAndEmptyArrays")
        .unwrap_or(false);
    let lookup = fused
        .get("lookup")
        .ok_or_else(|| Error::internal("$lookupUnwind is missing its lookup"))?;
    let spec = LookupSpec::parse(lookup)?;
    let outer_alias = prepare_outer(tree, ctx);
    let mut inner = plan_joined(&spec, &outer_alias, ctx)?;
    inner.wrap_root(format!("lookup_inner_{}", ctx.stage_num));

    let alias = format!("lookup_unwind_{}", ctx.stage_num);
    let right = tree.graft(inner);
    let current = tree.root_node().document().clone();
    let node = tree.root_node_mut();
    node.joins.push(Join {
        kind: if preserve {
            JoinKind::LeftOuter
        } else {
            JoinKind::Inner
        },
        right,
        alias: alias.clone(),
        lateral: true,
        condition: None,
    });
    node.set_document(Expr::func(
        "bson_dollar_lookup_unwind",
        vec![
            current,
            Expr::JoinDocument(alias),
            Expr::konst(spec.as_field),
        ],
    ));
    ctx.requires_subquery = true;
    Ok(())
}

// ── $unionWith ─────────────────────────────────────────────────

fn parse_union_with(value: &Bson) -> Result<(Option<String>, Vec<Bson>)> {
    match value {
        Bson::String(coll) => Ok((Some(coll.clone()), Vec::new())),
        Bson::Document(spec) => {
            let mut coll = None;
            let mut pipeline = None;
            for (key, v) in spec {
                match (key.as_str(), v) {
                    ("coll", Bson::String(name)) => coll = Some(name.clone()),
                    ("coll", other) => {
                        return Err(Error::type_mismatch(format!(
                            "BSON field '$unionWith.coll' is the wrong type '{}', expected type 'string'",
                            type_name(other)
                        )));
                    }
                    ("pipeline", Bson::Array(stages)) => pipeline = Some(stages.clone()),
                    ("pipeline", other) => {
                        return Err(Error::type_mismatch(format!(
                            "BSON field '$unionWith.pipeline' is the wrong type '{}', expected type 'array'",
                            type_name(other)
                        )));
                    }
                    (other, _) => {
                        return Err(Error::new(
                            ErrorCode::UnknownBsonField,
                            format!("BSON field '$unionWith.{other}' is an unknown field."),
                        ));
                    }
                }
            }
            let pipeline = pipeline.unwrap_or_default();
            if coll.is_none() {
                let starts_with_documents = matches!(
                    pipeline.first(),
                    Some(Bson::Document(first)) if first.contains_key("$documents")
                );
                if !starts_with_documents {
                    return Err(Error::failed_to_parse(
                        "$unionWith stage without explicit collection must have a pipeline with $documents as first stage",
                    ));
                }
            }
            Ok((coll, pipeline))
        }
        other => Err(Error::failed_to_parse(format!(
            "the $unionWith stage specification must be an object or string, but found {}",
            type_name(other)
        ))),
    }
}

/// `$unionWith`
pub fn handle_union_with(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let (coll, pipeline) = parse_union_with(value)?;
    let mut inner_ctx = ctx.nested(ParentStage::UnionWith)?;
    let mut right = plan_sub_pipeline(&mut inner_ctx, coll.as_deref(), &pipeline)?;

    // both inputs must expose the document alone
    promote_to_subquery(tree, ctx);
    promote_to_subquery(&mut right, &mut inner_ctx);

    let left = tree.root();
    let right = tree.graft(right);
    let union = tree.push(QueryNode::new(Relation::UnionAll {
        left,
        right,
        alias: format!("union_{}", ctx.stage_num),
    }));
    tree.set_root(union);
    ctx.requires_subquery = false;
    Ok(())
}

// ── $facet ─────────────────────────────────────────────────────

fn parse_facet(value: &Bson) -> Result<Vec<(String, Vec<Bson>)>> {
    let Bson::Document(spec) = value else {
        return Err(Error::location(
            15947,
            "a facet's fields must be specified in an object",
        ));
    };
    if spec.is_empty() {
        return Err(Error::location(
            40169,
            "the $facet specification must be a non-empty object",
        ));
    }
    let mut facets = Vec::with_capacity(spec.len());
    for (name, v) in spec {
        if name.is_empty() {
            return Err(Error::location(
                40352,
                "FieldPath cannot be constructed with empty string",
            ));
        }
        if name.starts_with('$') {
            return Err(Error::location(
                40236,
                format!("facet output field name cannot start with '$': {name}"),
            ));
        }
        let Bson::Array(stages) = v else {
            return Err(Error::location(
                40170,
                format!(
                    "arguments to $facet must be arrays, {name} is type {}",
                    type_name(v)
                ),
            ));
        };
        for stage in stages {
            if let Bson::Document(stage) = stage {
                if let Some(forbidden) = stage.keys().find(|k| FACET_FORBIDDEN.contains(&k.as_str())) {
                    return Err(Error::location(
                        40600,
                        format!("{forbidden} is not allowed to be used within a $facet stage"),
                    ));
                }
            }
        }
        facets.push((name.clone(), stages.clone()));
    }
    Ok(facets)
}

/// `$facet`: every sub-pipeline runs over the same input; each collapses
/// into one array and the arrays merge into a single document.
pub fn handle_facet(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let facets = parse_facet(value)?;
    promote_to_subquery(tree, ctx);

    let mut combined: Option<QueryTree> = None;
    for (index, (name, pipeline)) in facets.into_iter().enumerate() {
        let mut facet_ctx = ctx.nested(ParentStage::Facet)?;
        facet_ctx.collection = ctx.collection.clone();
        facet_ctx.collection_name = ctx.collection_name.clone();
        facet_ctx.is_agnostic = ctx.is_agnostic;

        let mut branch = tree.clone();
        apply_pipeline(&pipeline, &mut branch, &mut facet_ctx)?;
        branch.wrap_root(format!("facet_{}_{index}", ctx.stage_num));
        branch.root_node_mut().set_document(Expr::aggregate(
            "bson_array_agg",
            vec![Expr::Document, Expr::konst(name)],
        ));

        combined = Some(match combined {
            None => branch,
            Some(mut acc) => {
                let left = acc.root();
                let right = acc.graft(branch);
                let union = acc.push(QueryNode::new(Relation::UnionAll {
                    left,
                    right,
                    alias: format!("facet_union_{}_{index}", ctx.stage_num),
                }));
                acc.set_root(union);
                acc
            }
        });
    }

    let Some(mut combined) = combined else {
        return Err(Error::internal("$facet produced no branches"));
    };
    combined.wrap_root(format!("facet_{}", ctx.stage_num));
    combined
        .root_node_mut()
        .set_document(Expr::aggregate("bson_object_agg", vec![Expr::Document]));
    *tree = combined;
    ctx.requires_subquery = true;
    Ok(())
}
