//! `$group` and the stages planned through it.

use std::cmp::Ordering;

use bson::{Bson, Document, doc};
use docdb_bson::{TypeRank, compare_values};
use docdb_query::{Error, Result};

use super::{expect_document, expression_get, is_field_path, promote_to_subquery};
use crate::context::PipelineContext;
use crate::tree::{Expr, QueryTree, SortClause, Target};

/// Aggregating over the current root would change what earlier stages
/// produced.
pub(crate) fn needs_promotion(tree: &QueryTree) -> bool {
    let node = tree.root_node();
    node.targets.len() > 1
        || node.has_aggregates()
        || !node.group_by.is_empty()
        || !node.sort.is_empty()
        || node.limit.is_some()
        || node.offset.is_some()
        || node.window.is_some()
}

/// Clauses ordering rows the way `spec` sorts documents.
pub(crate) fn order_by_from_spec(spec: &Document, document: &Expr) -> Vec<SortClause> {
    spec.iter()
        .map(|(path, direction)| {
            let descending = matches!(direction, Bson::Int32(d) if *d < 0)
                || matches!(direction, Bson::Int64(d) if *d < 0)
                || matches!(direction, Bson::Double(d) if *d < 0.0);
            let mut single = Document::new();
            single.insert(path.clone(), direction.clone());
            SortClause {
                expr: Expr::func("bson_orderby", vec![document.clone(), Expr::document(single)]),
                descending,
            }
        })
        .collect()
}

pub(crate) fn repath(pairs: Vec<(String, Expr)>) -> Expr {
    let mut args = Vec::with_capacity(pairs.len() * 2);
    for (name, expr) in pairs {
        args.push(Expr::konst(name));
        args.push(expr);
    }
    Expr::func("bson_repath_and_build", args)
}

/// `$group`
pub fn handle_group(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    if ctx.collation_applicable() {
        return Err(Error::feature_not_supported(
            "collation is not supported in $group stage yet.",
        ));
    }
    let spec = expect_document(value, 15947, || {
        "a group's fields must be specified in an object".to_string()
    })?;
    if needs_promotion(tree) {
        promote_to_subquery(tree, ctx);
    }
    let Some(id) = spec.get("_id") else {
        return Err(Error::location(15955, "_id is missing from group specification"));
    };

    let document = tree.root_node().document().clone();

    if let Bson::String(path) = id {
        let only_routing = tree.root_node().quals.iter().all(Expr::is_shard_key_equality);
        if is_field_path(id)
            && ctx.config.enable_sort_pushdown_to_index
            && tree.on_base_table()
            && only_routing
        {
            let mut order = Document::new();
            order.insert(&path[1..], 1);
            tree.root_node_mut().quals.push(Expr::func(
                "bson_full_scan",
                vec![Expr::Document, Expr::document(order)],
            ));
        }
    }

    let mut key_spec = Document::new();
    key_spec.insert("_id", id.clone());
    let mut key_args = vec![document.clone(), Expr::document(key_spec), Expr::konst(true)];
    if ctx.variable_spec.is_some() {
        key_args.push(super::variable_spec(ctx));
    }
    let group_key = Expr::func("bson_expression_get", key_args);

    let mut targets = vec![Target::new("c1", group_key.clone())];
    let mut output = vec![("_id".to_string(), Expr::column("c1"))];
    for (field, accumulator) in spec {
        if field == "_id" {
            continue;
        }
        if field.contains('.') {
            return Err(Error::location(
                40235,
                format!("The field name '{field}' cannot contain '.'"),
            ));
        }
        let Bson::Document(accumulator) = accumulator else {
            return Err(Error::location(
                40234,
                format!("The field '{field}' must be an accumulator object"),
            ));
        };
        let mut ops = accumulator.iter();
        let (Some((op, arg)), None) = (ops.next(), ops.next()) else {
            return Err(Error::location(
                40238,
                format!("The field '{field}' must specify one accumulator"),
            ));
        };
        let column = format!("c{}", targets.len() + 1);
        targets.push(Target::new(
            column.clone(),
            accumulator_expr(op, arg, &document, ctx)?,
        ));
        output.push((field.clone(), Expr::column(column)));
    }

    let node = tree.root_node_mut();
    node.targets = targets;
    node.group_by = vec![group_key];

    promote_to_subquery(tree, ctx);
    tree.root_node_mut().set_document(repath(output));
    ctx.requires_subquery = true;
    Ok(())
}

fn accumulator_expr(
    op: &str,
    arg: &Bson,
    document: &Expr,
    ctx: &PipelineContext<'_>,
) -> Result<Expr> {
    let input = |value: &Bson| expression_get(document.clone(), value, ctx);
    let sorted = |name_on_sorted: &'static str, name: &'static str, args: Vec<Expr>| match &ctx
        .sort_spec
    {
        Some(spec) => Expr::Aggregate {
            name,
            args,
            order_by: order_by_from_spec(spec, document),
        },
        None => Expr::aggregate(name_on_sorted, args),
    };

    let expr = match op {
        "$sum" => Expr::aggregate("bson_sum", vec![input(arg)]),
        "$avg" => Expr::aggregate("bson_avg", vec![input(arg)]),
        "$min" => Expr::aggregate("bson_min", vec![input(arg)]),
        "$max" => Expr::aggregate("bson_max", vec![input(arg)]),
        "$count" => {
            if !matches!(arg, Bson::Document(d) if d.is_empty()) {
                return Err(Error::type_mismatch(
                    "$count takes no arguments, i.e. $count:{}",
                ));
            }
            Expr::aggregate("bson_sum", vec![Expr::document(doc! { "": 1 })])
        }
        "$first" => sorted("bson_first_on_sorted", "bson_first", vec![input(arg)]),
        "$last" => sorted("bson_last_on_sorted", "bson_last", vec![input(arg)]),
        "$firstN" | "$lastN" => {
            let spec = n_spec(op, arg, &["input", "n"])?;
            let args = vec![input(field(spec, "input")), input(field(spec, "n"))];
            if op == "$firstN" {
                sorted("bson_firstn_on_sorted", "bson_firstn", args)
            } else {
                sorted("bson_lastn_on_sorted", "bson_lastn", args)
            }
        }
        "$maxN" | "$minN" => {
            let spec = n_spec(op, arg, &["input", "n"])?;
            let name = if op == "$maxN" { "bson_maxn" } else { "bson_minn" };
            Expr::aggregate(name, vec![input(field(spec, "input")), input(field(spec, "n"))])
        }
        "$push" => sorted("bson_array_agg", "bson_array_agg", vec![input(arg)]),
        "$addToSet" => Expr::aggregate("bson_distinct_array_agg", vec![input(arg)]),
        "$mergeObjects" => sorted(
            "bson_merge_objects_on_sorted",
            "bson_merge_objects",
            vec![input(arg)],
        ),
        "$stdDevSamp" => Expr::aggregate("bson_std_dev_samp", vec![input(arg)]),
        "$stdDevPop" => Expr::aggregate("bson_std_dev_pop", vec![input(arg)]),
        "$top" | "$bottom" => {
            let spec = n_spec(op, arg, &["sortBy", "output"])?;
            let sort_by = sort_by_spec(op, field(spec, "sortBy"))?;
            let name = if op == "$top" { "bson_top" } else { "bson_bottom" };
            Expr::aggregate(name, vec![input(field(spec, "output")), Expr::document(sort_by)])
        }
        "$topN" | "$bottomN" => {
            let spec = n_spec(op, arg, &["sortBy", "output", "n"])?;
            let sort_by = sort_by_spec(op, field(spec, "sortBy"))?;
            let name = if op == "$topN" { "bson_topn" } else { "bson_bottomn" };
            Expr::aggregate(
                name,
                vec![
                    input(field(spec, "output")),
                    input(field(spec, "n")),
                    Expr::document(sort_by),
                ],
            )
        }
        "$median" => {
            let spec = n_spec(op, arg, &["input", "method"])?;
            Expr::aggregate(
                "bson_median",
                vec![input(field(spec, "input")), Expr::Const(field(spec, "method").clone())],
            )
        }
        "$percentile" => {
            let spec = n_spec(op, arg, &["input", "p", "method"])?;
            Expr::aggregate(
                "bson_percentile",
                vec![
                    input(field(spec, "input")),
                    Expr::Const(field(spec, "p").clone()),
                    Expr::Const(field(spec, "method").clone()),
                ],
            )
        }
        other => {
            return Err(Error::location(
                15952,
                format!("Unrecognized group operator {other}"),
            ));
        }
    };
    Ok(expr)
}

/// Accumulators taking an options document with exactly `fields`.
fn n_spec<'a>(op: &str, arg: &'a Bson, fields: &[&str]) -> Result<&'a Document> {
    let Bson::Document(spec) = arg else {
        return Err(Error::location(
            5787801,
            format!("specification must be an object; found {op}: {arg}"),
        ));
    };
    for field in fields {
        if !spec.contains_key(field) {
            return Err(Error::location(
                5787906,
                format!("{op} requires '{field}' to be specified"),
            ));
        }
    }
    if let Some(extra) = spec.keys().find(|k| !fields.contains(&k.as_str())) {
        return Err(Error::location(
            5787901,
            format!("Unknown argument for {op}: {extra}"),
        ));
    }
    Ok(spec)
}

fn sort_by_spec(op: &str, value: &Bson) -> Result<Document> {
    match value {
        Bson::Document(spec) if !spec.is_empty() => Ok(spec.clone()),
        _ => Err(Error::location(
            5788604,
            format!("{op} expects 'sortBy' to be a non-empty object"),
        )),
    }
}

/// `$count`
pub fn handle_count(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let field = match value {
        Bson::String(s) if !s.is_empty() => s,
        _ => {
            return Err(Error::location(
                40156,
                "the count field must be a non-empty string",
            ));
        }
    };
    if field.starts_with('$') {
        return Err(Error::location(
            40158,
            "the count field cannot be a $-prefixed path",
        ));
    }
    if field.contains('.') {
        return Err(Error::location(40160, "the count field cannot contain '.'"));
    }
    if needs_promotion(tree) {
        promote_to_subquery(tree, ctx);
    }
    let total = Expr::aggregate("bson_sum", vec![Expr::document(doc! { "": 1 })]);
    tree.root_node_mut()
        .set_document(repath(vec![(field.clone(), total)]));
    ctx.requires_subquery = true;
    Ok(())
}

/// `$bucket`: grouped by the boundary range each value falls in.
pub fn handle_bucket(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    if ctx.collation_applicable() {
        return Err(Error::feature_not_supported(
            "Collation is currently unsupported in the $bucket stage.",
        ));
    }
    let spec = expect_document(value, 40201, || {
        format!("Argument to $bucket stage must be an object, but found type: {value}")
    })?;

    let mut group_by = None;
    let mut boundaries = None;
    let mut default = None;
    let mut output = None;
    for (key, v) in spec {
        match key.as_str() {
            "groupBy" => group_by = Some(v),
            "boundaries" => boundaries = Some(v),
            "default" => default = Some(v),
            "output" => output = Some(v),
            other => {
                return Err(Error::location(
                    40197,
                    format!("Unrecognized option to $bucket: {other}."),
                ));
            }
        }
    }
    let (Some(group_by), Some(boundaries)) = (group_by, boundaries) else {
        return Err(Error::location(
            40198,
            "$bucket requires 'groupBy' and 'boundaries' to be specified.",
        ));
    };
    let expression = is_field_path(group_by)
        || matches!(group_by, Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')));
    if !expression {
        return Err(Error::location(
            40202,
            format!(
                "The $bucket 'groupBy' field must be defined as a $-prefixed path or an expression, but found: {group_by}"
            ),
        ));
    }
    let bounds = match boundaries {
        Bson::Array(items) if items.len() >= 2 => items,
        _ => {
            return Err(Error::location(
                40192,
                "The $bucket 'boundaries' field must be an array of values. At least two boundaries are required",
            ));
        }
    };
    let rank = TypeRank::of(&bounds[0]);
    for pair in bounds.windows(2) {
        if TypeRank::of(&pair[1]) != rank {
            return Err(Error::location(
                40193,
                "All values in the 'boundaries' option to $bucket must have the same type",
            ));
        }
        if compare_values(&pair[0], &pair[1]) != Ordering::Less {
            return Err(Error::location(
                40194,
                "The 'boundaries' option to $bucket must be sorted in ascending order",
            ));
        }
    }
    if let Some(default) = default {
        let (lowest, highest) = (&bounds[0], &bounds[bounds.len() - 1]);
        let inside = TypeRank::of(default) == rank
            && compare_values(default, lowest) != Ordering::Less
            && compare_values(default, highest) == Ordering::Less;
        if inside {
            return Err(Error::location(
                40199,
                "The $bucket 'default' field must be less than the lowest boundary or greater than or equal to the highest boundary.",
            ));
        }
    }
    let output = match output {
        None => doc! { "count": { "$sum": 1 } },
        Some(Bson::Document(d)) => d.clone(),
        Some(_) => {
            return Err(Error::location(
                40196,
                "The $bucket 'output' field must be an object",
            ));
        }
    };

    let mut internal = doc! {
        "groupBy": group_by.clone(),
        "boundaries": boundaries.clone(),
    };
    if let Some(default) = default {
        internal.insert("default", default.clone());
    }
    let mut group = doc! { "_id": { "$_bucketInternal": internal } };
    for (k, v) in output {
        group.insert(k, v);
    }
    handle_group(&Bson::Document(group), tree, ctx)
}

fn field<'a>(spec: &'a Document, name: &str) -> &'a Bson {
    spec.get(name).unwrap_or(&Bson::Null)
}

#[cfg(test)]
mod tests {
    use docdb_query::ErrorCode;

    use super::*;
    use crate::config::EngineConfig;
    use crate::tree::Relation;

    fn is_code(err: &Error, code: u32) -> bool {
        err.code == ErrorCode::Location(code)
    }

    fn base() -> QueryTree {
        QueryTree::new(Relation::Collection {
            database: "db".into(),
            name: "c".into(),
            collection_id: 1,
            alias: "collection".into(),
            sample_rows: None,
        })
    }

    #[test]
    fn group_errors() {
        let config = EngineConfig::default();
        let cases = [
            (doc! { "n": { "$sum": 1 } }, 15955),
            (doc! { "_id": null, "a.b": { "$sum": 1 } }, 40235),
            (doc! { "_id": null, "n": 1 }, 40234),
            (doc! { "_id": null, "n": { "$sum": 1, "$avg": 1 } }, 40238),
            (doc! { "_id": null, "n": { "$bogus": 1 } }, 15952),
        ];
        for (spec, code) in cases {
            let mut ctx = PipelineContext::new(&config, "db");
            let err = handle_group(&Bson::Document(spec), &mut base(), &mut ctx).unwrap_err();
            assert!(is_code(&err, code), "{err:?} expected {code}");
        }
    }

    #[test]
    fn first_uses_known_sort_order() {
        let config = EngineConfig::default();
        let mut ctx = PipelineContext::new(&config, "db");
        let document = Expr::Document;

        let unsorted = accumulator_expr("$first", &Bson::String("$a".into()), &document, &ctx).unwrap();
        assert_eq!(unsorted.function_name(), Some("bson_first_on_sorted"));

        ctx.sort_spec = Some(doc! { "b": -1 });
        let sorted = accumulator_expr("$first", &Bson::String("$a".into()), &document, &ctx).unwrap();
        match sorted {
            Expr::Aggregate { name, order_by, .. } => {
                assert_eq!(name, "bson_first");
                assert_eq!(order_by.len(), 1);
                assert!(order_by[0].descending);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bucket_validates_boundaries() {
        let config = EngineConfig::default();
        let cases = [
            (doc! { "groupBy": "$a", "boundaries": [1] }, 40192),
            (doc! { "groupBy": "$a", "boundaries": [3, 1] }, 40194),
            (doc! { "groupBy": "$a", "boundaries": [1, "x"] }, 40193),
            (doc! { "groupBy": "$a", "boundaries": [1, 5], "default": 2 }, 40199),
            (doc! { "groupBy": "a", "boundaries": [1, 5] }, 40202),
            (doc! { "boundaries": [1, 5] }, 40198),
        ];
        for (spec, code) in cases {
            let mut ctx = PipelineContext::new(&config, "db");
            let err = handle_bucket(&Bson::Document(spec), &mut base(), &mut ctx).unwrap_err();
            assert!(is_code(&err, code), "{err:?} expected {code}");
        }

        let mut ctx = PipelineContext::new(&config, "db");
        let mut tree = base();
        handle_bucket(
            &Bson::Document(doc! { "groupBy": "$a", "boundaries": [0, 10, 20], "default": "other" }),
            &mut tree,
            &mut ctx,
        )
        .unwrap();
        assert!(tree.explain().contains("$_bucketInternal"));
    }
}
