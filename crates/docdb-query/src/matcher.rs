use std::cmp::Ordering;

use bson::{Bson, Document};
use docdb_bson::{
    NumericKey, TypeRank, collect_path_values, collect_terminal_values, compare_values,
    values_equal,
};
use regex::{Regex, RegexBuilder};

use crate::error::{Error, Result};
use crate::expression::{Expression, QueryPredicate};
use crate::operator::Operator;
use crate::parse_filter::parse_filter;
use crate::range::RangeParams;
use crate::type_name::TypeSelector;

/// Evaluate a filter against a document.
///
/// `$expr` nodes are left to the aggregation runtime and evaluate to `true`
/// here.
pub fn matches(expr: &Expression, doc: &Document) -> bool {
    match expr {
        Expression::True | Expression::Expr(_) => true,
        Expression::And(children) => children.iter().all(|c| matches(c, doc)),
        Expression::Or(children) => children.iter().any(|c| matches(c, doc)),
        Expression::Nor(children) => !children.iter().any(|c| matches(c, doc)),
        Expression::Not(inner) => !matches(inner, doc),
        Expression::Condition(pred) => matches_predicate(pred, doc),
    }
}

pub fn matches_predicate(pred: &QueryPredicate, doc: &Document) -> bool {
    let values = collect_path_values(doc, &pred.path);
    let operand = &pred.value;
    match pred.operator {
        Operator::Eq => eq_matches(&values, operand),
        Operator::Ne => !eq_matches(&values, operand),
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            range_matches(&values, pred.operator, operand)
        }
        Operator::NotGt => !range_matches(&values, Operator::Gt, operand),
        Operator::NotGte => !range_matches(&values, Operator::Gte, operand),
        Operator::NotLt => !range_matches(&values, Operator::Lt, operand),
        Operator::NotLte => !range_matches(&values, Operator::Lte, operand),
        Operator::In => in_matches(&values, operand),
        Operator::Nin => !in_matches(&values, operand),
        Operator::All => all_matches(doc, &pred.path, &values, operand),
        Operator::Exists => values.is_empty() != is_truthy(operand),
        Operator::Type => type_matches(&values, operand),
        Operator::Size => {
            let Some(n) = NumericKey::of(operand).and_then(|k| k.as_i64()) else {
                return false;
            };
            collect_terminal_values(doc, &pred.path)
                .into_iter()
                .any(|v| matches!(v, Bson::Array(items) if items.len() as i64 == n))
        }
        Operator::Mod => values.iter().any(|v| mod_matches(v, operand)),
        Operator::Regex => match compiled_operand(operand) {
            Some(re) => values.iter().any(|v| regex_matches(&re, operand, v)),
            None => values.iter().any(|v| values_equal(v, operand)),
        },
        Operator::ElemMatch => {
            let Bson::Document(spec) = operand else {
                return false;
            };
            collect_terminal_values(doc, &pred.path)
                .into_iter()
                .any(|v| elem_match(v, spec))
        }
        Operator::BitsAllSet
        | Operator::BitsAnySet
        | Operator::BitsAllClear
        | Operator::BitsAnyClear => match bit_mask(operand) {
            Ok(mask) => values.iter().any(|v| bits_match(pred.operator, v, &mask)),
            Err(_) => false,
        },
        Operator::Range => match RangeParams::parse(operand) {
            Ok(params) => values.iter().any(|v| in_range(v, &params)),
            Err(_) => false,
        },
        Operator::OrderBy | Operator::OrderByReverse => true,
    }
}

fn eq_matches(values: &[&Bson], operand: &Bson) -> bool {
    if matches!(operand, Bson::Null) {
        return values.is_empty()
            || values
                .iter()
                .any(|v| matches!(v, Bson::Null | Bson::Undefined));
    }
    values.iter().any(|v| values_equal(v, operand))
}

fn range_matches(values: &[&Bson], op: Operator, operand: &Bson) -> bool {
    if matches!(operand, Bson::Null) && matches!(op, Operator::Gte | Operator::Lte) {
        return eq_matches(values, operand);
    }
    values.iter().any(|v| compare_matches(v, op, operand))
}

/// Type-bracketed comparison of a single value against a range operand.
pub fn compare_matches(value: &Bson, op: Operator, operand: &Bson) -> bool {
    let unbracketed = matches!(operand, Bson::MinKey | Bson::MaxKey);
    if !unbracketed && TypeRank::of(value) != TypeRank::of(operand) {
        return false;
    }
    let value_nan = docdb_bson::compare::is_nan(value);
    let operand_nan = docdb_bson::compare::is_nan(operand);
    if value_nan || operand_nan {
        return value_nan && operand_nan && matches!(op, Operator::Gte | Operator::Lte);
    }
    let ord = compare_values(value, operand);
    match op {
        Operator::Gt => ord == Ordering::Greater,
        Operator::Gte => ord != Ordering::Less,
        Operator::Lt => ord == Ordering::Less,
        Operator::Lte => ord != Ordering::Greater,
        _ => false,
    }
}

fn in_matches(values: &[&Bson], operand: &Bson) -> bool {
    let Bson::Array(items) = operand else {
        return false;
    };
    items.iter().any(|item| match compiled_operand(item) {
        Some(re) => values.iter().any(|v| regex_matches(&re, item, v)),
        None => eq_matches(values, item),
    })
}

fn all_matches(doc: &Document, path: &str, values: &[&Bson], operand: &Bson) -> bool {
    let Bson::Array(items) = operand else {
        return false;
    };
    if items.is_empty() {
        return false;
    }
    items.iter().all(|item| match item {
        Bson::Document(d) if d.contains_key("$elemMatch") => matches_predicate(
            &QueryPredicate::new(path, Operator::ElemMatch, d.get("$elemMatch").cloned().unwrap_or(Bson::Null)),
            doc,
        ),
        _ => match compiled_operand(item) {
            Some(re) => values.iter().any(|v| regex_matches(&re, item, v)),
            None => eq_matches(values, item),
        },
    })
}

fn type_matches(values: &[&Bson], operand: &Bson) -> bool {
    let selectors: Vec<TypeSelector> = match operand {
        Bson::Array(items) => items.iter().filter_map(|i| TypeSelector::parse(i).ok()).collect(),
        other => TypeSelector::parse(other).ok().into_iter().collect(),
    };
    values
        .iter()
        .any(|v| selectors.iter().any(|s| s.matches(v)))
}

fn elem_match(value: &Bson, spec: &Document) -> bool {
    let Bson::Array(items) = value else {
        return false;
    };
    let value_form = spec
        .keys()
        .next()
        .is_some_and(|k| k.starts_with('$') && !matches!(k.as_str(), "$and" | "$or" | "$nor" | "$expr"));
    if value_form {
        let mut wrapper = Document::new();
        wrapper.insert("v", Bson::Document(spec.clone()));
        let Ok(expr) = parse_filter(&wrapper) else {
            return false;
        };
        items.iter().any(|item| {
            let mut probe = Document::new();
            probe.insert("v", item.clone());
            matches(&expr, &probe)
        })
    } else {
        let Ok(expr) = parse_filter(spec) else {
            return false;
        };
        items
            .iter()
            .any(|item| matches!(item, Bson::Document(d) if matches(&expr, d)))
    }
}

fn in_range(value: &Bson, params: &RangeParams) -> bool {
    let lower = if params.min_inclusive {
        Operator::Gte
    } else {
        Operator::Gt
    };
    let upper = if params.max_inclusive {
        Operator::Lte
    } else {
        Operator::Lt
    };
    compare_matches(value, lower, &params.min) && compare_matches(value, upper, &params.max)
}

fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null | Bson::Undefined => false,
        other => match NumericKey::of(other) {
            Some(NumericKey::Value { approx, remainder }) => approx != 0.0 || remainder != 0,
            Some(NumericKey::NaN) => true,
            None => true,
        },
    }
}

/// Build a [`Regex`] honoring the `i`, `m`, `s` and `x` options.
pub fn compile_regex(pattern: &str, options: &str) -> Result<Regex> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            'u' => builder.unicode(true),
            other => {
                return Err(Error::location(
                    51108,
                    format!("invalid flag in regex options: {other}"),
                ));
            }
        };
    }
    builder
        .build()
        .map_err(|e| Error::location(51091, format!("Regular expression is invalid: {e}")))
}

fn compiled_operand(operand: &Bson) -> Option<Regex> {
    match operand {
        Bson::RegularExpression(re) => {
            compile_regex(re.pattern.as_str(), re.options.as_str()).ok()
        }
        _ => None,
    }
}

/// `$regex` against one value: strings and symbols are matched, regex values
/// compare by pattern and options.
pub fn regex_matches(re: &Regex, operand: &Bson, value: &Bson) -> bool {
    match value {
        Bson::String(s) | Bson::Symbol(s) => re.is_match(s),
        Bson::RegularExpression(_) => values_equal(value, operand),
        _ => false,
    }
}

/// `$mod: [divisor, remainder]` against one value.
pub fn mod_matches(value: &Bson, operand: &Bson) -> bool {
    let Bson::Array(parts) = operand else {
        return false;
    };
    let (Some(divisor), Some(remainder)) = (
        parts.first().and_then(truncated_i64),
        parts.get(1).and_then(truncated_i64),
    ) else {
        return false;
    };
    if divisor == 0 {
        return false;
    }
    match truncated_i64(value) {
        Some(v) => v.wrapping_rem(divisor) == remainder,
        None => false,
    }
}

fn truncated_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(f) if f.is_finite() => Some(f.trunc() as i64),
        Bson::Decimal128(d) => {
            let f = docdb_bson::compare::decimal128_to_f64(&d.bytes());
            f.is_finite().then(|| f.trunc() as i64)
        }
        _ => None,
    }
}

/// Bit positions named by a bitwise operand.
pub fn bit_mask(operand: &Bson) -> Result<Vec<u32>> {
    match operand {
        Bson::Array(items) => items
            .iter()
            .map(|item| match NumericKey::of(item).and_then(|k| k.as_i64()) {
                Some(pos) if pos >= 0 && pos <= i64::from(u32::MAX) => Ok(pos as u32),
                _ => Err(Error::bad_value(
                    "bit positions must be non-negative whole numbers",
                )),
            })
            .collect(),
        Bson::Binary(bin) => Ok(binary_positions(&bin.bytes)),
        other => match NumericKey::of(other).and_then(|k| k.as_i64()) {
            Some(n) if n >= 0 => Ok((0..63).filter(|b| n & (1 << b) != 0).collect()),
            Some(_) => Err(Error::bad_value("bitmask must be a non-negative number")),
            None => Err(Error::bad_value(
                "bitmask must be a number, a BinData or an array of bit positions",
            )),
        },
    }
}

fn binary_positions(bytes: &[u8]) -> Vec<u32> {
    let mut out = Vec::new();
    for (i, byte) in bytes.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                out.push(i as u32 * 8 + bit);
            }
        }
    }
    out
}

fn bit_at(value: &Bson, pos: u32) -> Option<bool> {
    match value {
        Bson::Binary(bin) => Some(
            bin.bytes
                .get(pos as usize / 8)
                .is_some_and(|b| b & (1 << (pos % 8)) != 0),
        ),
        Bson::Double(f) if f.fract() != 0.0 || !f.is_finite() => None,
        other => {
            let n = NumericKey::of(other)?.as_i64()?;
            Some(if pos < 64 { n & (1 << pos) != 0 } else { n < 0 })
        }
    }
}

/// Evaluate one of the `$bits*` operators on a single value.
pub fn bits_match(op: Operator, value: &Bson, mask: &[u32]) -> bool {
    let mut bits = Vec::with_capacity(mask.len());
    for pos in mask {
        match bit_at(value, *pos) {
            Some(b) => bits.push(b),
            None => return false,
        }
    }
    match op {
        Operator::BitsAllSet => bits.iter().all(|b| *b),
        Operator::BitsAnySet => bits.iter().any(|b| *b),
        Operator::BitsAllClear => bits.iter().all(|b| !*b),
        Operator::BitsAnyClear => bits.iter().any(|b| !*b),
        _ => false,
    }
}
