//! Stages that only rewrite the document expression of the root.

use bson::{Bson, Document, doc};
use docdb_query::{Error, ErrorCode, Result};

use super::{collation_arg, promote_to_subquery, type_name, variable_spec};
use crate::context::{ParentStage, PipelineContext};
use crate::tree::{Expr, QueryTree};

struct ProjectionFunctions {
    stage: &'static str,
    plain: &'static str,
    with_let: &'static str,
    with_let_and_collation: &'static str,
}

const PROJECT: ProjectionFunctions = ProjectionFunctions {
    stage: "$project",
    plain: "bson_dollar_project",
    with_let: "bson_dollar_project_with_let",
    with_let_and_collation: "bson_dollar_project_with_let_and_collation",
};

const ADD_FIELDS: ProjectionFunctions = ProjectionFunctions {
    stage: "$addFields",
    plain: "bson_dollar_add_fields",
    with_let: "bson_dollar_add_fields_with_let",
    with_let_and_collation: "bson_dollar_add_fields_with_let_and_collation",
};

const REPLACE_ROOT: ProjectionFunctions = ProjectionFunctions {
    stage: "$replaceRoot",
    plain: "bson_dollar_replace_root",
    with_let: "bson_dollar_replace_root_with_let",
    with_let_and_collation: "bson_dollar_replace_root_with_let_and_collation",
};

fn apply_projection(
    spec: &Document,
    functions: &ProjectionFunctions,
    tree: &mut QueryTree,
    ctx: &PipelineContext<'_>,
) {
    let current = tree.root_node().document().clone();
    let spec = Expr::document(spec.clone());
    let expr = match (collation_arg(ctx), ctx.variable_spec.is_some()) {
        (Some(collation), _) => Expr::func(
            functions.with_let_and_collation,
            vec![current, spec, variable_spec(ctx), collation],
        ),
        (None, true) => Expr::func(functions.with_let, vec![current, spec, variable_spec(ctx)]),
        (None, false) => Expr::func(functions.plain, vec![current, spec]),
    };
    tree.root_node_mut().set_document(expr);
}

fn projection_spec<'v>(value: &'v Bson, stage: &str) -> Result<&'v Document> {
    match value {
        Bson::Document(spec) => Ok(spec),
        _ => Err(Error::location(
            40272,
            format!("The {stage} specification stage must correspond to an object"),
        )),
    }
}

/// `$project`
pub fn handle_project(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let spec = projection_spec(value, PROJECT.stage)?;
    if spec.is_empty() {
        return Err(Error::location(
            51272,
            "projection specification must have at least one field",
        ));
    }
    apply_projection(spec, &PROJECT, tree, ctx);
    Ok(())
}

/// `$addFields` and its alias `$set`.
pub fn handle_add_fields(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let spec = projection_spec(value, ADD_FIELDS.stage)?;
    if spec.is_empty() {
        return Ok(());
    }
    apply_projection(spec, &ADD_FIELDS, tree, ctx);
    Ok(())
}

/// `$unset`: an exclusion projection.
pub fn handle_unset(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let fields: Vec<&str> = match value {
        Bson::String(s) => vec![s.as_str()],
        Bson::Array(items) => {
            if items.is_empty() {
                return Err(Error::location(
                    31119,
                    "$unset specification must be a string or an array with at least one field",
                ));
            }
            items
                .iter()
                .map(|item| match item {
                    Bson::String(s) => Ok(s.as_str()),
                    _ => Err(Error::location(
                        31120,
                        "$unset specification must be a string or an array containing only string values",
                    )),
                })
                .collect::<Result<_>>()?
        }
        other => {
            return Err(Error::location(
                31002,
                format!(
                    "Expected 'string' or 'array' type for $unset but found '{}' type",
                    type_name(other)
                ),
            ));
        }
    };
    let mut exclusion = Document::new();
    for field in fields {
        if field.is_empty() {
            return Err(Error::location(
                40352,
                "FieldPath cannot be created from an empty string",
            ));
        }
        if field.starts_with('$') {
            return Err(Error::location(
                16410,
                "FieldPath field names cannot begin with the operators symbol '$'.",
            ));
        }
        exclusion.insert(field, 0);
    }
    apply_projection(&exclusion, &PROJECT, tree, ctx);
    Ok(())
}

/// `$replaceRoot`
pub fn handle_replace_root(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let spec = projection_spec(value, REPLACE_ROOT.stage)?;
    if let Some(unknown) = spec.keys().find(|k| *k != "newRoot") {
        return Err(Error::new(
            ErrorCode::UnknownBsonField,
            format!("BSON field '$replaceRoot.{unknown}' is an unknown field."),
        ));
    }
    if !spec.contains_key("newRoot") {
        return Err(Error::location(
            40231,
            "no newRoot specified for the $replaceRoot stage",
        ));
    }
    apply_projection(spec, &REPLACE_ROOT, tree, ctx);
    ctx.requires_subquery_after_project = true;
    Ok(())
}

/// `$replaceWith`: `$replaceRoot` with the expression given directly.
pub fn handle_replace_with(
    value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    let spec = doc! { "newRoot": value.clone() };
    apply_projection(&spec, &REPLACE_ROOT, tree, ctx);
    ctx.requires_subquery_after_project = true;
    Ok(())
}

/// `$redact`
pub fn handle_redact(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    let (spec, text) = match value {
        Bson::Document(spec) => (spec.clone(), String::new()),
        Bson::String(s) => (Document::new(), s.clone()),
        other => {
            return Err(Error::location(
                17053,
                format!(
                    "$redact's parameter must be an expression or string valued as $$KEEP, $$DESCEND, and $$PRUNE, but input as '{other}'."
                ),
            ));
        }
    };
    let current = tree.root_node().document().clone();
    let mut args = vec![
        current,
        Expr::document(spec),
        Expr::konst(text),
        variable_spec(ctx),
    ];
    let name = match collation_arg(ctx) {
        Some(collation) => {
            args.push(collation);
            "bson_dollar_redact_with_let_and_collation"
        }
        None => "bson_dollar_redact",
    };
    let mut expr = Expr::func(name, args);

    // pruned rows come back null; nested $lookup/$facet output must stay an object
    if ctx.nested_pipeline_level > 0 && ctx.parent_stage != Some(ParentStage::UnionWith) {
        expr = Expr::Coalesce(vec![expr, Expr::document(Document::new())]);
    }
    tree.root_node_mut().set_document(expr);
    Ok(())
}

/// `$_internalInhibitOptimization`: a hard subquery boundary.
pub fn handle_inhibit_optimization(
    _value: &Bson,
    tree: &mut QueryTree,
    ctx: &mut PipelineContext<'_>,
) -> Result<()> {
    promote_to_subquery(tree, ctx);
    ctx.requires_subquery = true;
    Ok(())
}

/// The `projection` of `find`, which may refer to the filter for
/// positional (`a.$`) projections.
pub(crate) fn apply_find_projection(
    spec: &Document,
    filter: Option<&Document>,
    tree: &mut QueryTree,
    ctx: &PipelineContext<'_>,
) {
    if spec.is_empty() {
        return;
    }
    let current = tree.root_node().document().clone();
    let mut args = vec![
        current,
        Expr::document(spec.clone()),
        Expr::document(filter.cloned().unwrap_or_default()),
    ];
    if ctx.variable_spec.is_some() {
        args.push(variable_spec(ctx));
    }
    tree.root_node_mut()
        .set_document(Expr::func("bson_dollar_project_find", args));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::tree::Relation;

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
    fn projections_nest_on_the_document() {
        let config = EngineConfig::default();
        let mut ctx = PipelineContext::new(&config, "db");
        let mut tree = base();
        handle_project(&Bson::Document(doc! { "a": 1 }), &mut tree, &mut ctx).unwrap();
        handle_unset(&Bson::String("b".into()), &mut tree, &mut ctx).unwrap();
        let document = tree.root_node().document().to_string();
        assert_eq!(
            document,
            "bson_dollar_project(bson_dollar_project(document, {\"a\": 1}), {\"b\": 0})"
        );
        assert!(!tree.on_base_table());
    }

    #[test]
    fn let_and_collation_pick_variants() {
        let config = EngineConfig::default();
        let mut ctx = PipelineContext::new(&config, "db");
        ctx.variable_spec = Some(doc! { "x": 1 });
        let mut tree = base();
        handle_add_fields(&Bson::Document(doc! { "y": "$$x" }), &mut tree, &mut ctx).unwrap();
        assert_eq!(
            tree.root_node().document().function_name(),
            Some("bson_dollar_add_fields_with_let")
        );

        ctx.collation = Some(doc! { "locale": "fr" });
        handle_replace_with(&Bson::String("$y".into()), &mut tree, &mut ctx).unwrap();
        assert_eq!(
            tree.root_node().document().function_name(),
            Some("bson_dollar_replace_root_with_let_and_collation")
        );
        assert!(ctx.requires_subquery_after_project);
    }

    #[test]
    fn unset_rejects_bad_paths() {
        let config = EngineConfig::default();
        let mut ctx = PipelineContext::new(&config, "db");
        for (value, code) in [
            (Bson::Int32(1), 31002),
            (Bson::Array(vec![]), 31119),
            (Bson::String(String::new()), 40352),
            (Bson::String("$a".into()), 16410),
        ] {
            let err = handle_unset(&value, &mut base(), &mut ctx).unwrap_err();
            assert_eq!(err.code, ErrorCode::Location(code));
        }
    }

    #[test]
    fn nested_redact_keeps_object_shape() {
        let config = EngineConfig::default();
        let top = PipelineContext::new(&config, "db");
        let mut nested = top.nested(ParentStage::Lookup).unwrap();
        let mut tree = base();
        handle_redact(&Bson::String("$$PRUNE".into()), &mut tree, &mut nested).unwrap();
        assert!(matches!(tree.root_node().document(), Expr::Coalesce(_)));

        let mut union = top.nested(ParentStage::UnionWith).unwrap();
        let mut tree = base();
        handle_redact(&Bson::String("$$PRUNE".into()), &mut tree, &mut union).unwrap();
        assert_eq!(
            tree.root_node().document().function_name(),
            Some("bson_dollar_redact")
        );
    }
}
