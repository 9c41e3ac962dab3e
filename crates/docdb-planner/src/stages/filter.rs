use bson::{Bson, Document};
use docdb_query::{Error, Result, parse_filter};
use docdb_shard::{extract_shard_key_filter, is_collation_aware};
use tracing::debug;

use super::{expect_document, promote_if_paged, variable_spec};
use crate::context::PipelineContext;
use crate::tree::{Expr, QueryTree};

/// `$match`
pub fn handle_match(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let filter = expect_document(value, 15959, || {
        "The match filter must always be provided as an expression within a object.".to_string()
    })?;
    // limit and skip run before the filter in pipeline order
    promote_if_paged(tree, ctx);

    let parsed = parse_filter(filter)?;
    let document = tree.root_node().document().clone();
    let qual = if ctx.variable_spec.is_some() {
        Expr::func(
            "bson_dollar_match_with_let",
            vec![document, Expr::document(filter.clone()), variable_spec(ctx)],
        )
    } else {
        Expr::func(
            "bson_dollar_match",
            vec![document, Expr::document(filter.clone())],
        )
    };

    if !parsed.is_true() {
        tree.root_node_mut().quals.push(qual);
    }

    if tree.on_base_table() {
        add_base_table_filters(filter, tree, ctx)?;
    }
    Ok(())
}

/// Shard-key and `_id` predicates that let the storage layer prune.
fn add_base_table_filters(
    filter: &Document,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let Some(collection) = ctx.collection.as_ref() else {
        return Ok(());
    };
    let already_routed = tree.root_node().quals.iter().any(Expr::is_shard_key_equality);

    let extraction =
        extract_shard_key_filter(&collection.shard_key, collection.collection_id, filter, 1)?;
    if let Some(extraction) = extraction {
        if extraction.collation_aware && ctx.collation_applicable() {
            debug!(
                collection = %collection.name,
                "dropping shard key filter that depends on collation"
            );
        } else if !already_routed {
            ctx.shard_key_values = extraction.filter.values();
            tree.root_node_mut()
                .quals
                .push(Expr::from_shard_filter(&extraction.filter));
        }
    }

    if let Some(id) = id_equality(filter) {
        if is_collation_aware(&id) && ctx.collation_applicable() {
            debug!(
                collection = %collection.name,
                "dropping _id filter that depends on collation"
            );
            return Ok(());
        }
        tree.root_node_mut()
            .quals
            .push(Expr::eq(Expr::column("object_id"), Expr::Const(id.clone())));
        let single_shard = ctx.shard_key_values.as_ref().is_some_and(|v| v.len() == 1);
        if single_shard {
            ctx.point_read_id = Some(id);
        }
    }
    Ok(())
}

/// The `_id` value pinned by a top-level (or `$and`) equality.
pub fn id_equality(filter: &Document) -> Option<Bson> {
    for (key, value) in filter {
        if key == "_id" {
            match value {
                Bson::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    if ops.len() == 1 {
                        if let Some(v) = ops.get("$eq") {
                            if is_point_value(v) {
                                return Some(v.clone());
                            }
                        }
                    }
                }
                v if is_point_value(v) => return Some(v.clone()),
                _ => {}
            }
        } else if key == "$and" {
            if let Bson::Array(items) = value {
                let found = items.iter().find_map(|item| match item {
                    Bson::Document(inner) => id_equality(inner),
                    _ => None,
                });
                if found.is_some() {
                    return found;
                }
            }
        }
    }
    None
}

fn is_point_value(value: &Bson) -> bool {
    !matches!(
        value,
        Bson::Array(_) | Bson::RegularExpression(_) | Bson::Null | Bson::Undefined
    )
}

/// `$inverseMatch`: keep rows whose stored query matches the given input.
pub fn handle_inverse_match(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let spec = expect_document(value, 40272, || {
        "$inverseMatch requires a document as an input".to_string()
    })?;
    if !spec.contains_key("path") || !spec.contains_key("input") {
        return Err(Error::failed_to_parse(
            "$inverseMatch requires 'path' and 'input' to be specified",
        ));
    }
    promote_if_paged(tree, ctx);
    let document = tree.root_node().document().clone();
    tree.root_node_mut().quals.push(Expr::func(
        "bson_dollar_inverse_match",
        vec![document, Expr::document(spec.clone())],
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn id_equality_forms() {
        assert_eq!(id_equality(&doc! { "_id": 4 }), Some(Bson::Int32(4)));
        assert_eq!(
            id_equality(&doc! { "_id": { "$eq": "k" } }),
            Some(Bson::String("k".into()))
        );
        assert_eq!(
            id_equality(&doc! { "$and": [{ "a": 1 }, { "_id": 9 }] }),
            Some(Bson::Int32(9))
        );
        assert_eq!(id_equality(&doc! { "_id": { "$gt": 1 } }), None);
        assert_eq!(id_equality(&doc! { "_id": [1, 2] }), None);
        assert_eq!(
            id_equality(&doc! { "_id": { "a": 1 } }),
            Some(Bson::Document(doc! { "a": 1 }))
        );
    }
}
