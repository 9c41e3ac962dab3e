//! Stages that replace the input relation (`$changeStream`, `$documents`,
//! the stats stages) and the output stages `$merge` and `$out`.

use bson::{Bson, Document, doc};
use docdb_query::{Error, ErrorCode, Result};

use super::{expect_document, promote_to_subquery};
use crate::config::EngineConfig;
use crate::context::PipelineContext;
use crate::tree::{Expr, QueryTree, Relation, Target};

fn unknown_field(stage: &str, key: &str) -> Error {
    Error::new(
        ErrorCode::UnknownBsonField,
        format!("BSON field '{stage}.{key}' is an unknown field."),
    )
}

fn ensure_first(stage: &str, ctx: &PipelineContext<'_>) -> Result<()> {
    if ctx.stage_num != 0 {
        return Err(Error::location(
            40602,
            format!("{stage} can only be used as the initial stage in the pipeline."),
        ));
    }
    Ok(())
}

fn replace_source(tree: &mut QueryTree, name: &'static str, args: Vec<Expr>, alias: &str) {
    *tree = QueryTree::new(Relation::Function {
        name,
        args,
        alias: alias.to_string(),
    });
}

/// Issued by name; a view's resolved collection has a different one.
fn is_view(ctx: &PipelineContext<'_>) -> bool {
    match (&ctx.collection, &ctx.collection_name) {
        (Some(collection), Some(name)) => collection.name != *name,
        _ => false,
    }
}

// ── $changeStream ──────────────────────────────────────────────

pub fn precheck_change_stream(_value: &Bson, config: &EngineConfig) -> Result<()> {
    if !config.enable_change_streams {
        return Err(Error::not_supported(
            "Stage $changeStream is not supported yet in native pipeline",
        ));
    }
    Ok(())
}

/// `$changeStream`: the whole input becomes the change feed function.
pub fn handle_change_stream(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let Bson::Document(spec) = value else {
        return Err(Error::type_mismatch(format!(
            "$changeStream must be an object, found {:?}",
            value.element_type()
        )));
    };
    if is_view(ctx) {
        return Err(Error::new(
            ErrorCode::CommandNotSupportedOnView,
            "$changeStream cannot be used on views.",
        ));
    }
    ensure_first("$changeStream", ctx)?;

    let collection = ctx.collection_name.clone().unwrap_or_default();
    replace_source(
        tree,
        "change_stream_aggregation",
        vec![
            Expr::konst(ctx.database.clone()),
            Expr::konst(collection),
            Expr::document(spec.clone()),
        ],
        "change_stream",
    );
    tree.root_node_mut().targets.push(Target::new(
        "continuation",
        Expr::column("continuation"),
    ));
    ctx.requires_tailable_cursor = true;
    Ok(())
}

// ── $documents ─────────────────────────────────────────────────

/// `$documents`: literal rows for a collection-agnostic pipeline.
pub fn handle_documents(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    if !ctx.is_agnostic {
        return Err(Error::new(
            ErrorCode::InvalidNamespace,
            "$documents' is only valid as the first stage in a collectionless pipeline",
        ));
    }
    ensure_first("$documents", ctx)?;
    let Bson::Array(rows) = value else {
        return Err(Error::location(
            5858203,
            "error during aggregation :: caused by :: an array is expected",
        ));
    };
    if rows.iter().any(|row| !matches!(row, Bson::Document(_))) {
        return Err(Error::location(
            40228,
            "'documents' elements must be objects",
        ));
    }
    replace_source(
        tree,
        "bson_documents",
        vec![Expr::Const(value.clone())],
        "documents",
    );
    ctx.requires_subquery = true;
    Ok(())
}

// ── Stats stages ───────────────────────────────────────────────

/// `$collStats`
pub fn handle_coll_stats(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let spec = expect_document(value, 5447000, || {
        "$collStats must take a nested object but found a non-object".to_string()
    })?;
    for key in spec.keys() {
        if !matches!(
            key.as_str(),
            "latencyStats" | "storageStats" | "count" | "queryExecStats"
        ) {
            return Err(unknown_field("$collStats", key));
        }
    }
    ensure_first("$collStats", ctx)?;
    let collection = ctx.collection_name.clone().unwrap_or_default();
    replace_source(
        tree,
        "coll_stats_aggregation",
        vec![
            Expr::konst(ctx.database.clone()),
            Expr::konst(collection),
            Expr::document(spec.clone()),
        ],
        "coll_stats",
    );
    ctx.requires_subquery = true;
    Ok(())
}

/// `$indexStats`
pub fn handle_index_stats(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    match value {
        Bson::Document(spec) if spec.is_empty() => {}
        _ => {
            return Err(Error::location(28803, "The $indexStats stage specification must be an empty object"));
        }
    }
    ensure_first("$indexStats", ctx)?;
    let collection = ctx.collection_name.clone().unwrap_or_default();
    replace_source(
        tree,
        "index_stats_aggregation",
        vec![
            Expr::konst(ctx.database.clone()),
            Expr::konst(collection),
        ],
        "index_stats",
    );
    ctx.requires_subquery = true;
    Ok(())
}

/// `$currentOp`
pub fn handle_current_op(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let spec = match value {
        Bson::Document(spec) => spec,
        other => {
            return Err(Error::type_mismatch(format!(
                "$currentOp options must be specified in an object, but found: {:?}",
                other.element_type()
            )));
        }
    };
    for (key, option) in spec {
        match key.as_str() {
            "allUsers" | "idleConnections" | "idleCursors" | "idleSessions" | "localOps"
            | "backtrace" | "truncateOps" => {
                if !matches!(option, Bson::Boolean(_)) {
                    return Err(Error::failed_to_parse(format!(
                        "The '{key}' parameter of the $currentOp stage must be a boolean value, but found: {:?}",
                        option.element_type()
                    )));
                }
            }
            other => return Err(unknown_field("$currentOp", other)),
        }
    }
    if !ctx.is_agnostic || ctx.database != "admin" {
        return Err(Error::new(
            ErrorCode::InvalidNamespace,
            "$currentOp must be run against the 'admin' database with {aggregate: 1}",
        ));
    }
    ensure_first("$currentOp", ctx)?;
    replace_source(
        tree,
        "current_op_aggregation",
        vec![Expr::document(spec.clone())],
        "current_op",
    );
    ctx.requires_subquery = true;
    Ok(())
}

// ── Output stages ──────────────────────────────────────────────

/// Target namespace of an output stage as `(db, coll)`.
fn output_namespace(stage: &str, value: &Bson, default_db: &str) -> Result<(String, String)> {
    match value {
        Bson::String(coll) if !coll.is_empty() => Ok((default_db.to_string(), coll.clone())),
        Bson::Document(ns) => {
            let coll = ns.get_str("coll").map_err(|_| {
                Error::location(
                    40414,
                    format!("BSON field '{stage}.coll' is missing but a required field"),
                )
            })?;
            let db = ns.get_str("db").unwrap_or(default_db);
            Ok((db.to_string(), coll.to_string()))
        }
        _ => Err(Error::new(
            ErrorCode::InvalidNamespace,
            format!("Invalid {stage} target namespace"),
        )),
    }
}

fn write_into(
    function: &'static str,
    target: (String, String),
    options: Document,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) {
    // the writer consumes the finished rows of everything before it
    promote_to_subquery(tree, ctx);
    tree.root_node_mut().set_document(Expr::func(
        function,
        vec![
            Expr::Document,
            Expr::konst(target.0),
            Expr::konst(target.1),
            Expr::document(options),
        ],
    ));
    ctx.has_output_stage = true;
}

/// `$out`
pub fn handle_out(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    if !matches!(value, Bson::String(_) | Bson::Document(_)) {
        return Err(Error::location(
            16990,
            format!(
                "$out only supports a string or object argument, but found {:?}",
                value.element_type()
            ),
        ));
    }
    if let Bson::Document(spec) = value {
        if let Some(key) = spec.keys().find(|k| !matches!(k.as_str(), "db" | "coll" | "timeseries")) {
            return Err(unknown_field("$out", key));
        }
    }
    let target = output_namespace("$out", value, &ctx.database)?;
    write_into("bson_dollar_out", target, Document::new(), tree, ctx);
    Ok(())
}

/// `$merge`
pub fn handle_merge(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let (into, options) = match value {
        Bson::String(_) => (value.clone(), Document::new()),
        Bson::Document(spec) => {
            let mut into = None;
            let mut options = Document::new();
            for (key, option) in spec {
                match key.as_str() {
                    "into" => into = Some(option.clone()),
                    "on" => {
                        let valid = match option {
                            Bson::String(_) => true,
                            Bson::Array(fields) => {
                                !fields.is_empty() && fields.iter().all(|f| matches!(f, Bson::String(_)))
                            }
                            _ => false,
                        };
                        if !valid {
                            return Err(Error::location(
                                51186,
                                "$merge 'on' field must be either a string or an array of strings",
                            ));
                        }
                        options.insert(key.clone(), option.clone());
                    }
                    "whenMatched" => {
                        let valid = matches!(option, Bson::Array(_))
                            || matches!(option, Bson::String(mode) if matches!(mode.as_str(), "replace" | "keepExisting" | "merge" | "fail"));
                        if !valid {
                            return Err(Error::bad_value(format!(
                                "Enumeration value '{option}' for field '$merge.whenMatched' is not a valid value."
                            )));
                        }
                        options.insert(key.clone(), option.clone());
                    }
                    "whenNotMatched" => {
                        let valid = matches!(option, Bson::String(mode) if matches!(mode.as_str(), "insert" | "discard" | "fail"));
                        if !valid {
                            return Err(Error::bad_value(format!(
                                "Enumeration value '{option}' for field '$merge.whenNotMatched' is not a valid value."
                            )));
                        }
                        options.insert(key.clone(), option.clone());
                    }
                    "let" => {
                        options.insert(key.clone(), option.clone());
                    }
                    other => return Err(unknown_field("$merge", other)),
                }
            }
            let Some(into) = into else {
                return Err(Error::location(
                    40414,
                    "BSON field '$merge.into' is missing but a required field",
                ));
            };
            (into, options)
        }
        other => {
            return Err(Error::location(
                51182,
                format!(
                    "$merge only supports a string or object argument, not {:?}",
                    other.element_type()
                ),
            ));
        }
    };
    let target = output_namespace("$merge", &into, &ctx.database)?;
    let options = if options.is_empty() {
        doc! { "whenMatched": "merge", "whenNotMatched": "insert" }
    } else {
        options
    };
    write_into("bson_dollar_merge", target, options, tree, ctx);
    Ok(())
}
