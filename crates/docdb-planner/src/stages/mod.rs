//! Per-stage plan rewrites. Each handler edits the root node of the tree,
//! promoting it to a subquery first when the stage cannot share a
//! `SELECT` with what came before.

pub mod filter;
pub mod group;
pub mod nested;
pub mod paging;
pub mod project;
pub mod sort;
pub mod source;
pub mod unwind;
pub mod window;

use bson::{Bson, Document};
use docdb_query::{Error, Result};

use crate::context::PipelineContext;
use crate::tree::{Expr, QueryTree};

pub use crate::planner::promote_to_subquery;

/// The variables argument for expression evaluators: `let` or `{}`.
pub(crate) fn variable_spec(ctx: &PipelineContext<'_>) -> Expr {
    Expr::document(ctx.variable_spec.clone().unwrap_or_default())
}

pub(crate) fn collation_arg(ctx: &PipelineContext<'_>) -> Option<Expr> {
    ctx.collation
        .as_ref()
        .filter(|c| !c.is_empty())
        .map(|c| Expr::document(c.clone()))
}

pub(crate) fn expect_document<'v>(
    value: &'v Bson,
    location: u32,
    message: impl FnOnce() -> String,
) -> Result<&'v Document> {
    match value {
        Bson::Document(doc) => Ok(doc),
        _ => Err(Error::location(location, message())),
    }
}

/// Promote when the root already limits or skips rows; later stages must
/// see only the rows that survive them.
pub(crate) fn promote_if_paged(tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) {
    let node = tree.root_node();
    if node.limit.is_some() || node.offset.is_some() {
        promote_to_subquery(tree, ctx);
    }
}

/// `bson_expression_get(document, {"": expr}, true, let)`
pub(crate) fn expression_get(document: Expr, expression: &Bson, ctx: &PipelineContext<'_>) -> Expr {
    let mut spec = Document::new();
    spec.insert("", expression.clone());
    let mut args = vec![document, Expr::document(spec), Expr::konst(true)];
    if ctx.variable_spec.is_some() {
        args.push(variable_spec(ctx));
    }
    Expr::func("bson_expression_get", args)
}

/// Type alias used in error messages (`$type` names).
pub(crate) fn type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::Undefined => "undefined",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::DbPointer(_) => "dbPointer",
        Bson::JavaScriptCode(_) => "javascript",
        Bson::Symbol(_) => "symbol",
        Bson::JavaScriptCodeWithScope(_) => "javascriptWithScope",
        Bson::Int32(_) => "int",
        Bson::Timestamp(_) => "timestamp",
        Bson::Int64(_) => "long",
        Bson::Decimal128(_) => "decimal",
        Bson::MinKey => "minKey",
        Bson::MaxKey => "maxKey",
    }
}

/// A `$`-prefixed field path used as an expression.
pub(crate) fn is_field_path(value: &Bson) -> bool {
    matches!(value, Bson::String(s) if s.starts_with('$') && !s.starts_with("$$"))
}
