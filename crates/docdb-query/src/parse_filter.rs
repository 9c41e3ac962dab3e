use bson::{Bson, Document};

use crate::error::{Error, Result};
use crate::expression::{Expression, QueryPredicate};
use crate::operator::Operator;
use crate::range::RangeParams;
use crate::type_name::TypeSelector;

/// Parse a BSON filter document into an [`Expression`] tree.
///
/// Follows MongoDB query semantics:
/// - The top-level document is an implicit AND of its entries
/// - `{ "field": value }` is an implicit `$eq`
/// - `{ "field": { "$gt": v } }` uses operator sub-documents
/// - `$and` / `$or` / `$nor` take non-empty arrays of filter documents
/// - `{ "field": { "$regex": "p", "$options": "i" } }` builds a regex operand
/// - `$not` over a range operator becomes its negated form
pub fn parse_filter(doc: &Document) -> Result<Expression> {
    let mut children = Vec::new();
    for (key, value) in doc {
        match key.as_str() {
            "$and" => children.push(Expression::And(parse_logical_array(key, value)?)),
            "$or" => children.push(Expression::Or(parse_logical_array(key, value)?)),
            "$nor" => children.push(Expression::Nor(parse_logical_array(key, value)?)),
            "$expr" => children.push(Expression::Expr(value.clone())),
            "$comment" => {}
            k if k.starts_with('$') => {
                return Err(Error::bad_value(format!("unknown top level operator: {k}")));
            }
            _ => children.push(parse_field_condition(key, value)?),
        }
    }
    Ok(Expression::and(children))
}

fn parse_logical_array(op: &str, value: &Bson) -> Result<Vec<Expression>> {
    let Bson::Array(items) = value else {
        return Err(Error::bad_value(format!("{op} must be an array")));
    };
    if items.is_empty() {
        return Err(Error::bad_value(
            "$and/$or/$nor must be a nonempty array",
        ));
    }
    items
        .iter()
        .map(|item| match item {
            Bson::Document(d) => parse_filter(d),
            _ => Err(Error::bad_value(
                "$or/$and/$nor entries need to be full objects",
            )),
        })
        .collect()
}

fn parse_field_condition(field: &str, value: &Bson) -> Result<Expression> {
    if let Bson::Document(sub) = value {
        if sub.keys().next().is_some_and(|k| k.starts_with('$')) {
            return parse_operator_doc(field, sub);
        }
    }
    let operator = if matches!(value, Bson::RegularExpression(_)) {
        Operator::Regex
    } else {
        Operator::Eq
    };
    Ok(Expression::Condition(QueryPredicate::new(
        field,
        operator,
        value.clone(),
    )))
}

/// Parse an operator sub-document like `{ "$gt": 21, "$lte": 100 }`.
fn parse_operator_doc(field: &str, doc: &Document) -> Result<Expression> {
    let mut conditions = Vec::new();
    for (op_key, op_value) in doc {
        match op_key.as_str() {
            "$regex" => conditions.push(parse_regex(field, doc)?),
            "$options" => {
                if !doc.contains_key("$regex") {
                    return Err(Error::bad_value("$options needs a $regex"));
                }
            }
            "$not" => conditions.push(parse_not(field, op_value)?),
            name => {
                let operator = Operator::from_name(name)
                    .ok_or_else(|| Error::bad_value(format!("unknown operator: {name}")))?;
                let value = validate_operand(operator, op_value)?;
                conditions.push(Expression::Condition(QueryPredicate::new(
                    field, operator, value,
                )));
            }
        }
    }
    Ok(Expression::and(conditions))
}

fn parse_regex(field: &str, doc: &Document) -> Result<Expression> {
    let options = match doc.get("$options") {
        None => "",
        Some(Bson::String(o)) => o.as_str(),
        Some(_) => return Err(Error::bad_value("$options has to be a string")),
    };
    let value = match doc.get("$regex") {
        Some(Bson::String(pattern)) => regex_operand(pattern, options)?,
        Some(Bson::RegularExpression(re)) => {
            if !options.is_empty() && !re.options.as_str().is_empty() {
                return Err(Error::bad_value("options set in both $regex and $options"));
            }
            let merged = if options.is_empty() {
                re.options.as_str()
            } else {
                options
            };
            regex_operand(re.pattern.as_str(), merged)?
        }
        _ => return Err(Error::bad_value("$regex has to be a string")),
    };
    Ok(Expression::Condition(QueryPredicate::new(
        field,
        Operator::Regex,
        value,
    )))
}

fn regex_operand(pattern: &str, options: &str) -> Result<Bson> {
    crate::matcher::compile_regex(pattern, options)?;
    docdb_bson::key::regex_value(pattern, options)
        .ok_or_else(|| Error::bad_value("Regular expression cannot contain an embedded null byte"))
}

fn parse_not(field: &str, value: &Bson) -> Result<Expression> {
    match value {
        Bson::RegularExpression(_) => Ok(Expression::Not(Box::new(Expression::Condition(
            QueryPredicate::new(field, Operator::Regex, value.clone()),
        )))),
        Bson::Document(inner) => {
            if inner.is_empty() {
                return Err(Error::bad_value("$not cannot be empty"));
            }
            if !inner.keys().all(|k| k.starts_with('$')) {
                return Err(Error::bad_value("$not needs a document of operators"));
            }
            let mut negated = Vec::new();
            for (op_key, op_value) in inner {
                if op_key == "$options" {
                    continue;
                }
                let direct = Operator::from_name(op_key)
                    .and_then(|op| matches!(op, Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte).then_some(op))
                    .and_then(Operator::negated);
                match direct {
                    Some(op) => negated.push(Expression::Condition(QueryPredicate::new(
                        field,
                        op,
                        op_value.clone(),
                    ))),
                    None => {
                        let mut single = Document::new();
                        single.insert(op_key.clone(), op_value.clone());
                        if op_key == "$regex" {
                            if let Some(options) = inner.get("$options") {
                                single.insert("$options", options.clone());
                            }
                        }
                        negated.push(Expression::Not(Box::new(parse_operator_doc(
                            field, &single,
                        )?)));
                    }
                }
            }
            Ok(Expression::and(negated))
        }
        _ => Err(Error::bad_value("$not needs a regex or a document")),
    }
}

fn validate_operand(operator: Operator, value: &Bson) -> Result<Bson> {
    match operator {
        Operator::In | Operator::Nin | Operator::All => {
            let Bson::Array(items) = value else {
                return Err(Error::bad_value(format!(
                    "{} needs an array",
                    operator.name()
                )));
            };
            for item in items {
                if let Bson::Document(d) = item {
                    if d.keys().next().is_some_and(|k| k.starts_with('$'))
                        && operator != Operator::All
                    {
                        return Err(Error::bad_value(format!(
                            "cannot nest $ under {}",
                            operator.name()
                        )));
                    }
                }
            }
        }
        Operator::Exists => {}
        Operator::Size => {
            let ok = match value {
                Bson::Int32(n) => *n >= 0,
                Bson::Int64(n) => *n >= 0,
                Bson::Double(f) => *f >= 0.0 && f.fract() == 0.0,
                _ => false,
            };
            if !ok {
                return Err(Error::bad_value(
                    "$size needs a non-negative whole number",
                ));
            }
        }
        Operator::Mod => {
            let Bson::Array(items) = value else {
                return Err(Error::bad_value("malformed mod, needs to be an array"));
            };
            if items.len() != 2 {
                return Err(Error::bad_value("malformed mod, not enough elements"));
            }
            let divisor = docdb_bson::NumericKey::of(&items[0]).and_then(|k| k.as_i64());
            if divisor == Some(0) {
                return Err(Error::bad_value("divisor cannot be 0"));
            }
            if divisor.is_none()
                || docdb_bson::NumericKey::of(&items[1]).is_none()
            {
                return Err(Error::bad_value("malformed mod, divisor and remainder must be numbers"));
            }
        }
        Operator::Type => match value {
            Bson::Array(items) => {
                for item in items {
                    TypeSelector::parse(item)?;
                }
            }
            other => {
                TypeSelector::parse(other)?;
            }
        },
        Operator::ElemMatch => {
            if !matches!(value, Bson::Document(_)) {
                return Err(Error::bad_value("$elemMatch needs an Object"));
            }
        }
        Operator::BitsAllSet
        | Operator::BitsAnySet
        | Operator::BitsAllClear
        | Operator::BitsAnyClear => {
            crate::matcher::bit_mask(value)?;
        }
        Operator::Range => {
            RangeParams::parse(value)?;
        }
        _ => {}
    }
    Ok(value.clone())
}
