use bson::{Bson, Document, doc};
use docdb_query::{Error, ErrorCode, Result};

use super::group::{needs_promotion, order_by_from_spec, repath};
use super::promote_to_subquery;
use crate::context::PipelineContext;
use crate::stages::{project, sort};
use crate::tree::{Expr, QueryTree, Relation, Target, WindowSpec};

/// Window operators and whether they need `sortBy`.
const WINDOW_OPERATORS: &[(&str, bool)] = &[
    ("$_internal_constFill", false),
    ("$addToSet", false),
    ("$avg", false),
    ("$bottom", false),
    ("$bottomN", false),
    ("$count", false),
    ("$covariancePop", false),
    ("$covarianceSamp", false),
    ("$denseRank", true),
    ("$derivative", true),
    ("$documentNumber", true),
    ("$expMovingAvg", true),
    ("$first", false),
    ("$firstN", false),
    ("$integral", true),
    ("$last", false),
    ("$lastN", false),
    ("$linearFill", true),
    ("$locf", true),
    ("$max", false),
    ("$maxN", false),
    ("$median", false),
    ("$min", false),
    ("$minN", false),
    ("$percentile", false),
    ("$push", false),
    ("$rank", true),
    ("$shift", true),
    ("$stdDevPop", false),
    ("$stdDevSamp", false),
    ("$sum", false),
    ("$top", false),
    ("$topN", false),
];

fn unknown_field(stage: &str, key: &str) -> Error {
    Error::new(
        ErrorCode::UnknownBsonField,
        format!("BSON field '{stage}.{key}' is an unknown field."),
    )
}

/// `$setWindowFields`
pub fn handle_set_window_fields(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    apply_set_window_fields(value, None, tree, ctx)
}

fn apply_set_window_fields(
    value: &Bson,
    partition_override: Option<Expr>,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let Bson::Document(spec) = value else {
        return Err(Error::failed_to_parse(
            "the $setWindowFields stage specification must be an object",
        ));
    };
    let mut partition_by = None;
    let mut sort_by = None;
    let mut output = None;
    for (key, v) in spec {
        match key.as_str() {
            "partitionBy" => partition_by = Some(v),
            "sortBy" => match v {
                Bson::Document(s) => sort_by = Some(s),
                _ => {
                    return Err(Error::type_mismatch(
                        "'sortBy' field of $setWindowFields must be an object",
                    ));
                }
            },
            "output" => match v {
                Bson::Document(o) => output = Some(o),
                _ => {
                    return Err(Error::type_mismatch(
                        "'output' field of $setWindowFields must be an object",
                    ));
                }
            },
            other => return Err(unknown_field("$setWindowFields", other)),
        }
    }
    let Some(output) = output else {
        return Err(Error::location(
            40414,
            "BSON field '$setWindowFields.output' is missing but a required field",
        ));
    };
    if let Some(Bson::Document(p)) = partition_by {
        if p.keys().next().is_some_and(|k| !k.starts_with('$')) {
            return Err(Error::type_mismatch(
                "An expression of type object was expected as the value of 'partitionBy' in $setWindowFields",
            ));
        }
    }

    let operators = output
        .iter()
        .map(|(field, spec)| window_operator(field, spec, sort_by.is_some()))
        .collect::<Result<Vec<_>>>()?;

    if needs_promotion(tree) {
        promote_to_subquery(tree, ctx);
    }

    let document = tree.root_node().document().clone();
    let partition = match (partition_override, partition_by) {
        (Some(expr), _) => vec![expr],
        (None, Some(partition)) => {
            let mut spec = Document::new();
            spec.insert("", partition.clone());
            vec![Expr::func(
                "bson_expression_partition_get",
                vec![document.clone(), Expr::document(spec)],
            )]
        }
        (None, None) => Vec::new(),
    };
    let order_by = sort_by
        .map(|s| order_by_from_spec(s, &document))
        .unwrap_or_default();

    let node = tree.root_node_mut();
    node.window = Some(WindowSpec {
        partition_by: partition,
        order_by,
    });
    let mut columns = Vec::with_capacity(operators.len());
    for (index, (field, operator)) in operators.into_iter().enumerate() {
        let column = format!("w{}", index + 1);
        let mut single = Document::new();
        single.insert(field.clone(), operator);
        let mut args = vec![document.clone(), Expr::document(single)];
        if let Some(sort) = sort_by {
            args.push(Expr::document(sort.clone()));
        }
        node.targets.push(Target::new(
            column.clone(),
            Expr::Window {
                name: "bson_window_agg",
                args,
            },
        ));
        columns.push((field, Expr::column(column)));
    }

    promote_to_subquery(tree, ctx);
    tree.root_node_mut().set_document(Expr::func(
        "bson_dollar_merge_documents",
        vec![Expr::Document, repath(columns)],
    ));
    ctx.requires_subquery = true;
    Ok(())
}

fn window_operator(field: &str, spec: &Bson, has_sort: bool) -> Result<(String, Bson)> {
    let Bson::Document(spec) = spec else {
        return Err(Error::failed_to_parse(format!(
            "The field '{field}' must be an object"
        )));
    };
    let mut operator = None;
    for (key, _) in spec {
        if key == "window" {
            continue;
        }
        if !key.starts_with('$') || operator.is_some() {
            return Err(Error::failed_to_parse(format!(
                "Window function found an unknown argument: {key}"
            )));
        }
        operator = Some(key.as_str());
    }
    let Some(operator) = operator else {
        return Err(Error::failed_to_parse(format!(
            "Expected a $-prefixed window function, {field}"
        )));
    };
    let Some((_, requires_sort)) = WINDOW_OPERATORS.iter().find(|(name, _)| *name == operator)
    else {
        return Err(Error::failed_to_parse(format!(
            "Unrecognized window function, {operator}"
        )));
    };
    if *requires_sort && !has_sort {
        return Err(Error::location(
            5371602,
            format!("{operator} must be specified with a top level sortBy expression with exactly one element"),
        ));
    }
    if let Some(window) = spec.get("window") {
        validate_window(window)?;
    }
    Ok((field.to_string(), Bson::Document(spec.clone())))
}

fn validate_window(window: &Bson) -> Result<()> {
    let Bson::Document(window) = window else {
        return Err(Error::failed_to_parse("'window' field must be an object"));
    };
    for (key, bounds) in window {
        match key.as_str() {
            "documents" | "range" => {
                let valid = matches!(bounds, Bson::Array(b) if b.len() == 2);
                if !valid {
                    return Err(Error::failed_to_parse(format!(
                        "Window bounds must be a 2-element array: {key}"
                    )));
                }
            }
            "unit" => {}
            other => {
                return Err(Error::failed_to_parse(format!(
                    "'window' field can only contain 'documents' as the only argument or 'range' with an optional 'unit' field, found {other}"
                )));
            }
        }
    }
    if window.contains_key("documents") && window.contains_key("range") {
        return Err(Error::failed_to_parse(
            "Window bounds can specify either 'documents' or 'unit', not both",
        ));
    }
    Ok(())
}

// ── $fill ──────────────────────────────────────────────────────

/// `$fill` rewritten into window or projection stages.
#[derive(Debug, Clone, PartialEq)]
struct FillRewrite {
    sort: Option<Document>,
    add_fields: Document,
    set_window_fields: Document,
    partition_by_fields: Option<Vec<String>>,
    only_value_fill: bool,
}

fn rewrite_fill(value: &Bson) -> Result<FillRewrite> {
    let Bson::Document(spec) = value else {
        return Err(Error::location(
            40201,
            format!(
                "The operator $fill requires an object as its argument, but a value of type {:?} was provided instead.",
                value.element_type()
            ),
        ));
    };
    let mut partition_by = None;
    let mut partition_by_fields = None;
    let mut sort_by = None;
    let mut output = None;
    for (key, v) in spec {
        match key.as_str() {
            "partitionBy" => partition_by = Some(v.clone()),
            "partitionByFields" => partition_by_fields = Some(v),
            "sortBy" => sort_by = Some(v.clone()),
            "output" => output = Some(v),
            other => {
                return Err(Error::new(
                    ErrorCode::UnknownBsonField,
                    format!("The BSON field named '$fill.{other}' is not recognized as a valid field."),
                ));
            }
        }
    }
    if partition_by.is_some() && partition_by_fields.is_some() {
        return Err(Error::location(
            6050204,
            "Only one of 'partitionBy' or 'partitionByFields' is allowed when using the '$fill'.",
        ));
    }
    let Some(output) = output else {
        return Err(Error::location(40414, "Required field '$fill.output' is missing"));
    };

    let partition_by_fields = match partition_by_fields {
        None => None,
        Some(Bson::Array(fields)) => Some(
            fields
                .iter()
                .map(|f| match f {
                    Bson::String(s) if s.starts_with('$') => Err(Error::location(
                        16410,
                        "FieldPath field names may not start with '$'.",
                    )),
                    Bson::String(s) => Ok(s.clone()),
                    _ => Err(Error::type_mismatch(
                        "BSON field 'partitionByFields' is the wrong type, expected type 'string'",
                    )),
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        Some(_) => {
            return Err(Error::type_mismatch(
                "BSON field '$fill.partitionByFields' is the wrong type, expected type 'array'",
            ));
        }
    };

    let Bson::Document(output) = output else {
        return Err(Error::type_mismatch(
            "BSON field '$fill.output' is the wrong type, expected type 'object'",
        ));
    };

    let mut only_value_fill = true;
    let mut window_output = Document::new();
    let mut add_fields = Document::new();
    for (field, field_spec) in output {
        let path = format!("${field}");
        let Bson::Document(field_spec) = field_spec else {
            return Err(Error::type_mismatch(format!(
                "BSON field '$fill.output.{field}' is the wrong type, expected type 'object'"
            )));
        };
        for (key, expr) in field_spec {
            match key.as_str() {
                "method" => {
                    only_value_fill = false;
                    let method = match expr {
                        Bson::String(m) => m.as_str(),
                        _ => {
                            return Err(Error::type_mismatch(
                                "BSON field 'method' is the wrong type, expected type 'string'",
                            ));
                        }
                    };
                    let operator = match method {
                        "linear" => "$linearFill",
                        "locf" => "$locf",
                        _ => {
                            return Err(Error::location(
                                6050202,
                                "The method must be specified as either locf or linear",
                            ));
                        }
                    };
                    window_output.insert(field.clone(), doc! { operator: path.clone() });
                }
                "value" => {
                    window_output.insert(
                        field.clone(),
                        doc! { "$_internal_constFill": { "path": path.clone(), "value": expr.clone() } },
                    );
                    add_fields.insert(field.clone(), doc! { "$ifNull": [path.clone(), expr.clone()] });
                }
                other => {
                    return Err(Error::new(
                        ErrorCode::UnknownBsonField,
                        format!("The BSON field named '$fill.{other}' is not recognized as a valid field."),
                    ));
                }
            }
        }
    }

    let mut set_window_fields = Document::new();
    if let Some(partition) = partition_by {
        set_window_fields.insert("partitionBy", partition);
    }
    let sort = match &sort_by {
        Some(Bson::Document(s)) => Some(s.clone()),
        Some(_) => {
            return Err(Error::type_mismatch(
                "BSON field '$fill.sortBy' is the wrong type, expected type 'object'",
            ));
        }
        None => None,
    };
    if let Some(s) = &sort {
        set_window_fields.insert("sortBy", s.clone());
    }
    set_window_fields.insert("output", window_output);

    Ok(FillRewrite {
        sort,
        add_fields,
        set_window_fields,
        partition_by_fields,
        only_value_fill,
    })
}

/// `$fill`
pub fn handle_fill(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    if ctx.collation_applicable() {
        return Err(Error::feature_not_supported(
            "collation is not supported in the $fill stage yet.",
        ));
    }
    let rewrite = rewrite_fill(value)?;

    if rewrite.only_value_fill {
        if let Some(sort_spec) = &rewrite.sort {
            sort::handle_sort(&Bson::Document(sort_spec.clone()), tree, ctx)?;
        }
        return project::handle_add_fields(&Bson::Document(rewrite.add_fields), tree, ctx);
    }

    let partition = match &rewrite.partition_by_fields {
        None => None,
        Some(fields) if partitions_on_shard_key(fields, tree, ctx) => {
            Some(Expr::column("shard_key_value"))
        }
        Some(fields) => {
            let mut spec = Document::new();
            for field in fields {
                spec.insert(field.clone(), format!("${field}"));
            }
            Some(Expr::func(
                "bson_expression_partition_by_fields_get",
                vec![tree.root_node().document().clone(), Expr::document(spec)],
            ))
        }
    };
    apply_set_window_fields(
        &Bson::Document(rewrite.set_window_fields),
        partition,
        tree,
        ctx,
    )
}

/// Whether partitioning by `fields` is exactly partitioning by shard.
fn partitions_on_shard_key(fields: &[String], tree: &QueryTree, ctx: &PipelineContext<'_>) -> bool {
    let Some(collection) = &ctx.collection else {
        return false;
    };
    let key = &collection.shard_key;
    let node = tree.root_node();
    let reads_table = matches!(node.source, Relation::Collection { .. })
        && *node.document() == Expr::Document
        && node.joins.is_empty();
    reads_table
        && !key.is_empty()
        && key.fields().len() == fields.len()
        && key.fields().iter().all(|f| fields.contains(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_only_fill_becomes_add_fields() {
        let rewrite = rewrite_fill(&Bson::Document(doc! {
            "sortBy": { "t": 1 },
            "output": { "a": { "value": 0 } },
        }))
        .unwrap();
        assert!(rewrite.only_value_fill);
        assert_eq!(rewrite.sort, Some(doc! { "t": 1 }));
        assert_eq!(rewrite.add_fields, doc! { "a": { "$ifNull": ["$a", 0] } });
    }

    #[test]
    fn method_fill_becomes_window() {
        let rewrite = rewrite_fill(&Bson::Document(doc! {
            "sortBy": { "t": 1 },
            "partitionByFields": ["p"],
            "output": { "a": { "method": "locf" } },
        }))
        .unwrap();
        assert!(!rewrite.only_value_fill);
        assert_eq!(
            rewrite.set_window_fields,
            doc! { "sortBy": { "t": 1 }, "output": { "a": { "$locf": "$a" } } }
        );
        assert_eq!(rewrite.partition_by_fields, Some(vec!["p".to_string()]));
    }

    #[test]
    fn fill_errors() {
        let code = |spec: Document| rewrite_fill(&Bson::Document(spec)).unwrap_err().code;
        assert_eq!(code(doc! {}), ErrorCode::Location(40414));
        assert_eq!(
            code(doc! { "partitionBy": "$a", "partitionByFields": ["a"], "output": {} }),
            ErrorCode::Location(6050204)
        );
        assert_eq!(
            code(doc! { "output": { "a": { "method": "cubic" } } }),
            ErrorCode::Location(6050202)
        );
        assert_eq!(code(doc! { "bogus": 1 }), ErrorCode::UnknownBsonField);
    }

    #[test]
    fn ranking_needs_sort() {
        let err = window_operator("r", &Bson::Document(doc! { "$rank": {} }), false).unwrap_err();
        assert_eq!(err.code, ErrorCode::Location(5371602));
        assert!(window_operator("r", &Bson::Document(doc! { "$rank": {} }), true).is_ok());
        let err = window_operator("r", &Bson::Document(doc! { "$nope": 1 }), true).unwrap_err();
        assert_eq!(err.code, ErrorCode::FailedToParse);
    }
}
