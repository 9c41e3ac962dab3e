use bson::{Bson, Document, doc};
use docdb_query::{Error, Result};

use super::{expect_document, is_field_path, promote_to_subquery};
use crate::context::PipelineContext;
use crate::stage::as_number;
use crate::stages::group;
use crate::tree::{Expr, QueryTree, SortClause};

#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Field { path: String, descending: bool },
    Meta { path: String, kind: String },
    Natural { descending: bool },
}

fn parse_sort(spec: &Document) -> Result<Vec<SortKey>> {
    if spec.is_empty() {
        return Err(Error::location(
            15976,
            "The $sort stage requires specifying at least one sorting key to proceed",
        ));
    }
    let mut keys = Vec::with_capacity(spec.len());
    for (path, value) in spec {
        if path.is_empty() {
            return Err(Error::location(40352, "FieldPath cannot be constructed with empty string"));
        }
        if let Bson::Document(meta) = value {
            match meta.get("$meta") {
                Some(Bson::String(kind)) if meta.len() == 1 => {
                    if !matches!(kind.as_str(), "textScore" | "searchScore" | "randVal") {
                        return Err(Error::location(
                            31138,
                            format!("Illegal $meta sort: {kind}"),
                        ));
                    }
                    keys.push(SortKey::Meta {
                        path: path.clone(),
                        kind: kind.clone(),
                    });
                    continue;
                }
                _ => {
                    return Err(Error::location(
                        17312,
                        "$meta is the only expression supported by $sort right now",
                    ));
                }
            }
        }
        let direction = match as_number(value) {
            Some(n) if n == 1.0 => false,
            Some(n) if n == -1.0 => true,
            Some(_) => {
                return Err(Error::location(
                    15975,
                    "$sort key ordering must be 1 (for ascending) or -1 (for descending)",
                ));
            }
            None => {
                return Err(Error::location(
                    15974,
                    format!(
                        "Illegal key in $sort specification: {path}: {}",
                        crate::tree::render_bson(value)
                    ),
                ));
            }
        };
        if path == "$natural" {
            keys.push(SortKey::Natural {
                descending: direction,
            });
        } else {
            keys.push(SortKey::Field {
                path: path.clone(),
                descending: direction,
            });
        }
    }
    if keys.len() > 1 && keys.iter().any(|k| matches!(k, SortKey::Natural { .. })) {
        return Err(Error::bad_value("$natural sort cannot be set with other keys"));
    }
    Ok(keys)
}

/// `$sort`
pub fn handle_sort(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let spec = expect_document(value, 15973, || {
        "the $sort key specification must be an object".to_string()
    })?;
    {
        let node = tree.root_node();
        if node.limit.is_some() || node.offset.is_some() || !node.sort.is_empty() {
            promote_to_subquery(tree, ctx);
        }
    }
    apply_sort(spec, tree, ctx)
}

/// Attach `spec` as the root's ordering. Shared with `find`.
pub(crate) fn apply_sort(
    spec: &Document,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let keys = parse_sort(spec)?;
    ctx.sort_spec = Some(spec.clone());

    let on_base = tree.on_base_table();
    let document = tree.root_node().document().clone();
    let mut clauses = Vec::with_capacity(keys.len());
    for key in &keys {
        match key {
            SortKey::Natural { descending } => clauses.push(SortClause {
                expr: Expr::column("ctid"),
                descending: *descending,
            }),
            SortKey::Meta { path, kind } => {
                if !on_base {
                    return Err(Error::location(
                        40218,
                        format!("query requires {kind} metadata, but it is not available"),
                    ));
                }
                let mut single = Document::new();
                single.insert(path.clone(), doc! { "$meta": kind.clone() });
                clauses.push(SortClause {
                    expr: Expr::func(
                        "bson_orderby_meta",
                        vec![document.clone(), Expr::document(single)],
                    ),
                    descending: kind != "randVal",
                });
            }
            SortKey::Field { path, descending } => {
                let mut single = Document::new();
                single.insert(path.clone(), if *descending { -1 } else { 1 });
                clauses.push(SortClause {
                    expr: Expr::func("bson_orderby", vec![document.clone(), Expr::document(single)]),
                    descending: *descending,
                });
            }
        }
    }

    let node = tree.root_node_mut();
    let only_routing = node.quals.iter().all(Expr::is_shard_key_equality);
    let natural = keys.iter().any(|k| matches!(k, SortKey::Natural { .. }));
    if ctx.config.enable_sort_pushdown_to_index && on_base && only_routing && !natural {
        node.quals.push(Expr::func(
            "bson_full_scan",
            vec![Expr::Document, Expr::document(spec.clone())],
        ));
    }
    node.sort = clauses;
    Ok(())
}

/// `$sortByCount`: a `$group` counting each value followed by a
/// descending sort on the count.
pub fn handle_sort_by_count(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    if ctx.collation_applicable() {
        return Err(Error::feature_not_supported(
            "Collation is currently unsupported in the $sortByCount stage.",
        ));
    }
    let valid = is_field_path(value)
        || matches!(value, Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')));
    if !valid {
        return Err(Error::location(
            40148,
            "the sortByCount field must be defined as a $-prefixed path or an expression",
        ));
    }
    let group_spec = Bson::Document(doc! {
        "_id": value.clone(),
        "count": { "$sum": 1 },
    });
    group::handle_group(&group_spec, tree, ctx)?;
    promote_to_subquery(tree, ctx);
    let sort = doc! { "count": -1 };
    apply_sort(&sort, tree, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_cannot_be_mixed() {
        assert!(parse_sort(&doc! { "$natural": 1 }).is_ok());
        let err = parse_sort(&doc! { "$natural": 1, "a": 1 }).unwrap_err();
        assert_eq!(err.code, docdb_query::ErrorCode::BadValue);
    }

    #[test]
    fn directions_must_be_unit() {
        let err = parse_sort(&doc! { "a": 2 }).unwrap_err();
        assert_eq!(err.code, docdb_query::ErrorCode::Location(15975));
        let err = parse_sort(&doc! {}).unwrap_err();
        assert_eq!(err.code, docdb_query::ErrorCode::Location(15976));
        assert_eq!(
            parse_sort(&doc! { "a": -1.0 }).unwrap(),
            vec![SortKey::Field {
                path: "a".into(),
                descending: true
            }]
        );
    }
}
