use bson::Bson;
use docdb_query::{Error, Result};

use super::{expect_document, promote_to_subquery};
use crate::context::PipelineContext;
use crate::stage::as_number;
use crate::tree::{Expr, QueryTree, Relation, SortClause, Target};

/// Integral value that fits in 64 bits, or `None`.
fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        other => {
            let n = as_number(other)?;
            (n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64).then_some(n as i64)
        }
    }
}

/// `$skip`
pub fn handle_skip(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let Some(number) = as_number(value) else {
        return Err(Error::location(15972, "$skip requires a numeric argument"));
    };
    let Some(skip) = as_i64(value) else {
        return Err(Error::location(
            5107200,
            format!(
                "Invalid parameter provided to $skip stage: value cannot be expressed as a 64-bit integer $skip: {number}"
            ),
        ));
    };
    if skip < 0 {
        return Err(Error::location(
            5107200,
            format!(
                "Invalid argument provided to $skip stage: A non-negative numerical value was expected in $skip, but received {skip}."
            ),
        ));
    }
    if skip == 0 {
        return Ok(());
    }
    apply_skip(skip, tree, ctx);
    // offsets apply after projection otherwise
    ctx.requires_subquery = true;
    Ok(())
}

pub(crate) fn apply_skip(skip: i64, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) {
    if tree.root_node().limit.is_some() {
        promote_to_subquery(tree, ctx);
    }
    let node = tree.root_node_mut();
    node.offset = Some(node.offset.unwrap_or(0).saturating_add(skip));
}

/// `$limit`
pub fn handle_limit(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let Some(number) = as_number(value) else {
        return Err(Error::location(15957, "the limit must be specified as a number"));
    };
    let Some(limit) = as_i64(value) else {
        return Err(Error::location(
            5107201,
            format!(
                "Invalid argument provided to $limit stage: value cannot be expressed as a 64-bit integer: $limit: {number}"
            ),
        ));
    };
    if limit < 0 {
        return Err(Error::location(
            5107201,
            format!(
                "Invalid argument provided to $limit stage: A non-negative number was expected in $limit, but received {limit}"
            ),
        ));
    }
    if limit == 0 {
        return Err(Error::location(
            15958,
            "The specified limit value must always be positive",
        ));
    }
    apply_limit(limit, tree);
    ctx.requires_subquery = true;
    Ok(())
}

pub(crate) fn apply_limit(limit: i64, tree: &mut QueryTree) {
    let node = tree.root_node_mut();
    node.limit = Some(node.limit.map_or(limit, |existing| existing.min(limit)));
}

/// `$sample`
pub fn handle_sample(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let spec = expect_document(value, 28745, || {
        "The $sample stage specification is required to be provided as an object.".to_string()
    })?;
    let mut size = None;
    for (key, v) in spec {
        if key == "size" {
            size = Some(v);
        } else {
            return Err(Error::location(28748, "Option not recognized for $sample"));
        }
    }
    let Some(size) = size else {
        return Err(Error::location(
            28749,
            "The $sample stage must explicitly define a size value",
        ));
    };
    let Some(size) = as_number(size) else {
        return Err(Error::location(
            28746,
            "The size parameter provided to $sample must be a valid numeric value",
        ));
    };
    if size < 0.0 {
        return Err(Error::location(
            28747,
            "The size parameter provided to $sample must be a valid numeric value",
        ));
    }
    let rows = size as i64;

    // promoted rows carry any prior limit; sample the result of those
    if tree.root_node().limit.is_some() || tree.root_node().offset.is_some() {
        promote_to_subquery(tree, ctx);
    }

    let untouched = {
        let node = tree.root_node();
        node.quals.iter().all(Expr::is_shard_key_equality)
            && node.joins.is_empty()
            && node.group_by.is_empty()
    };
    if untouched {
        if let Relation::Collection { sample_rows, .. } = &mut tree.root_node_mut().source {
            *sample_rows = Some(sample_rows.map_or(rows, |existing| existing.min(rows)));
        }
    }

    let node = tree.root_node_mut();
    node.targets.push(Target::new("?sort?", Expr::Random));
    node.sort = vec![SortClause {
        expr: Expr::Random,
        descending: false,
    }];
    node.limit = Some(rows);
    ctx.requires_subquery = true;
    Ok(())
}
