use bson::Bson;
use docdb_query::{Error, Result};

use super::{promote_if_paged, type_name};
use crate::context::PipelineContext;
use crate::tree::{Expr, QueryTree};

/// Validates the `$unwind` operand and returns its path.
pub(crate) fn unwind_path(value: &Bson) -> Result<&str> {
    let path = match value {
        Bson::String(path) => Some(path),
        Bson::Document(options) => {
            let mut path = None;
            for (key, option) in options {
                match key.as_str() {
                    "path" => path = Some(option),
                    "includeArrayIndex" => match option {
                        Bson::String(name) if name.starts_with('$') => {
                            return Err(Error::location(
                                28822,
                                format!(
                                    "The includeArrayIndex option used in the $unwind stage must not have a '$' operator at the beginning: {name}"
                                ),
                            ));
                        }
                        Bson::String(name) if !name.is_empty() => {}
                        _ => {
                            return Err(Error::location(
                                28810,
                                "A non-empty string value was expected for the includeArrayIndex option in the $unwind stage.",
                            ));
                        }
                    },
                    "preserveNullAndEmptyArrays" => {
                        if !matches!(option, Bson::Boolean(_)) {
                            return Err(Error::location(
                                28809,
                                "A boolean value was expected for the preserveNullAndEmptyArrays option used in the $unwind stage.",
                            ));
                        }
                    }
                    _ => {
                        return Err(Error::location(
                            28811,
                            "Invalid option specified for $unwind stage",
                        ));
                    }
                }
            }
            match path {
                None => None,
                Some(Bson::String(path)) => Some(path),
                Some(other) => {
                    return Err(Error::location(
                        28808,
                        format!(
                            "A string value was expected as the path in the $unwind stage, but received {}.",
                            type_name(other)
                        ),
                    ));
                }
            }
        }
        other => {
            return Err(Error::location(
                15981,
                format!(
                    "A string or an object was expected as the specification for the $unwind stage, but instead received {}.",
                    type_name(other)
                ),
            ));
        }
    };

    let path = match path {
        Some(path) if !path.is_empty() => path,
        _ => return Err(Error::location(28812, "No path provided for $unwind stage")),
    };
    if !path.starts_with('$') || path.len() == 1 {
        return Err(Error::location(
            28818,
            format!("The path option provided to the $unwind stage must start with the '$' symbol: {path}"),
        ));
    }
    if path[1..].starts_with('$') {
        return Err(Error::location(
            16410,
            "FieldPath field names cannot begin with the symbol '$'.",
        ));
    }
    Ok(path)
}

/// `$unwind`: the document becomes a set-returning call, one row per
/// array element.
pub fn handle_unwind(value: &Bson, tree: &mut QueryTree, ctx: &mut PipelineContext<'_>) -> Result<()> {
    unwind_path(value)?;
    promote_if_paged(tree, ctx);

    let current = tree.root_node().document().clone();
    let expr = match value {
        Bson::String(path) => Expr::func("bson_dollar_unwind", vec![current, Expr::konst(path.clone())]),
        other => Expr::func(
            "bson_dollar_unwind_with_options",
            vec![current, Expr::Const(other.clone())],
        ),
    };
    tree.root_node_mut().set_document(expr);

    // nothing may share a SELECT with a set-returning target
    ctx.requires_subquery = true;
    Ok(())
}
