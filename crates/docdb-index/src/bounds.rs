//! Per-column bounds derived from query predicates.
//!
//! Each predicate becomes a [`BoundsSet`]: alternatives on one column, any
//! of which may match. Bounds live in value space; the solver turns them
//! into serialized seek terms.

use std::cmp::Ordering;

use bson::{Bson, Document};
use docdb_bson::{IndexTerm, TypeRank, compare_values, values_equal};
use docdb_query::matcher::{bit_mask, bits_match, compile_regex, mod_matches, regex_matches};
use docdb_query::{Error, Operator, QueryPredicate, RangeParams, Result, TypeSelector};
use regex::Regex;

use crate::spec::PathSpec;

#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub value: Bson,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(value: Bson, inclusive: bool) -> Self {
        Bound { value, inclusive }
    }
}

/// A per-entry check that the index term alone can answer.
#[derive(Debug, Clone)]
pub enum Recheck {
    Regex {
        regex: Regex,
        operand: Bson,
        negated: bool,
    },
    Exists,
    Mod(Bson),
    NotEqual(Bson),
    Bits { op: Operator, mask: Vec<u32> },
}

impl Recheck {
    pub fn check(&self, term: &IndexTerm) -> bool {
        match self {
            Recheck::Exists => !term.is_maybe_undefined(),
            Recheck::Regex {
                regex,
                operand,
                negated,
            } => term.truncated || regex_matches(regex, operand, &term.value) != *negated,
            Recheck::Mod(operand) => mod_matches(&term.value, operand),
            Recheck::NotEqual(Bson::Null) => {
                !term.is_maybe_undefined() && term.value != Bson::Null
            }
            Recheck::NotEqual(operand) => term.truncated || !values_equal(&term.value, operand),
            Recheck::Bits { op, mask } => term.truncated || bits_match(*op, &term.value, mask),
        }
    }
}

/// Lower and upper bounds on one column, with the checks entries inside
/// them must also pass.
#[derive(Debug, Clone, Default)]
pub struct ColumnBounds {
    /// The query path; only meaningful on a wildcard column.
    pub path: String,
    pub lower: Option<Bound>,
    pub upper: Option<Bound>,
    pub requires_runtime_recheck: bool,
    pub rechecks: Vec<Recheck>,
}

impl ColumnBounds {
    pub fn new(path: impl Into<String>) -> Self {
        ColumnBounds {
            path: path.into(),
            ..ColumnBounds::default()
        }
    }

    pub fn equality(path: impl Into<String>, value: Bson) -> Self {
        let mut b = ColumnBounds::new(path);
        b.lower = Some(Bound::new(value.clone(), true));
        b.upper = Some(Bound::new(value, true));
        b
    }

    /// `[MinKey, MaxKey]` minus missing values.
    pub fn exists(path: impl Into<String>) -> Self {
        let mut b = ColumnBounds::full(path);
        b.rechecks.push(Recheck::Exists);
        b
    }

    pub fn full(path: impl Into<String>) -> Self {
        let mut b = ColumnBounds::new(path);
        b.lower = Some(Bound::new(Bson::MinKey, true));
        b.upper = Some(Bound::new(Bson::MaxKey, true));
        b
    }

    /// Values of the given sort class.
    pub fn of_type(path: impl Into<String>, rank: TypeRank) -> Self {
        let mut b = ColumnBounds::new(path);
        b.lower = Some(type_lower(rank));
        b.upper = Some(type_upper(rank));
        b
    }

    /// Null or missing: `(MinKey, null]`.
    fn null_or_missing(path: impl Into<String>) -> Self {
        let mut b = ColumnBounds::new(path);
        b.lower = Some(Bound::new(Bson::MinKey, false));
        b.upper = Some(Bound::new(Bson::Null, true));
        b.requires_runtime_recheck = true;
        b
    }

    pub fn set_lower(&mut self, value: Bson, inclusive: bool) {
        match &mut self.lower {
            None => self.lower = Some(Bound::new(value, inclusive)),
            Some(current) => match compare_values(&value, &current.value) {
                Ordering::Equal => current.inclusive &= inclusive,
                Ordering::Greater => *current = Bound::new(value, inclusive),
                Ordering::Less => {}
            },
        }
    }

    pub fn set_upper(&mut self, value: Bson, inclusive: bool) {
        match &mut self.upper {
            None => self.upper = Some(Bound::new(value, inclusive)),
            Some(current) => match compare_values(&value, &current.value) {
                Ordering::Equal => current.inclusive &= inclusive,
                Ordering::Less => *current = Bound::new(value, inclusive),
                Ordering::Greater => {}
            },
        }
    }

    /// Tighten these bounds by `other`, keeping both sets of checks.
    pub fn intersect(&mut self, other: ColumnBounds) {
        if let Some(lower) = other.lower {
            self.set_lower(lower.value, lower.inclusive);
        }
        if let Some(upper) = other.upper {
            self.set_upper(upper.value, upper.inclusive);
        }
        self.requires_runtime_recheck |= other.requires_runtime_recheck;
        self.rechecks.extend(other.rechecks);
    }

    pub fn is_equality(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(lower), Some(upper)) => {
                lower.inclusive
                    && upper.inclusive
                    && compare_values(&lower.value, &upper.value) == Ordering::Equal
            }
            _ => false,
        }
    }

    /// No value can fall inside the bounds.
    pub fn is_unsatisfiable(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(lower), Some(upper)) => match compare_values(&lower.value, &upper.value) {
                Ordering::Greater => true,
                Ordering::Equal => !(lower.inclusive && upper.inclusive),
                Ordering::Less => false,
            },
            _ => false,
        }
    }
}

/// Alternatives for one column produced by a single predicate.
#[derive(Debug, Clone)]
pub struct BoundsSet {
    pub column: usize,
    pub bounds: Vec<ColumnBounds>,
}

#[derive(Debug, Clone, Default)]
pub struct PredicateBounds {
    pub sets: Vec<BoundsSet>,
    pub requires_runtime_recheck: bool,
}

pub fn type_lower(rank: TypeRank) -> Bound {
    Bound::new(rank.min_value(), true)
}

pub fn type_upper(rank: TypeRank) -> Bound {
    match rank.max_value() {
        Some(max) => Bound::new(max, true),
        None => match rank.next() {
            Some(next) => Bound::new(next.min_value(), false),
            None => Bound::new(Bson::MaxKey, true),
        },
    }
}

pub fn build_bounds(spec: &PathSpec, predicates: &[QueryPredicate]) -> Result<PredicateBounds> {
    let mut out = PredicateBounds::default();
    for pred in predicates {
        let column = spec.column_for(&pred.path).ok_or_else(|| {
            Error::internal(format!(
                "Query path '{}' does not match any index paths",
                pred.path
            ))
        })?;
        let wildcard = spec.path(column).is_some_and(|p| p.wildcard);
        if wildcard && !wildcard_supports(pred) {
            out.requires_runtime_recheck = true;
            continue;
        }
        let path = if wildcard { pred.path.as_str() } else { "" };
        for bounds in predicate_bounds(path, pred)? {
            out.requires_runtime_recheck |= bounds.iter().any(|b| b.requires_runtime_recheck);
            out.sets.push(BoundsSet { column, bounds });
        }
    }
    Ok(out)
}

/// Wildcard terms only exist for leaves, so anything that has to see a
/// missing, container or null value is answered by the runtime recheck.
fn wildcard_supports(pred: &QueryPredicate) -> bool {
    let plain = |v: &Bson| !matches!(v, Bson::Null | Bson::Document(_) | Bson::Array(_));
    match pred.operator {
        Operator::Ne
        | Operator::Nin
        | Operator::NotGt
        | Operator::NotGte
        | Operator::NotLt
        | Operator::NotLte
        | Operator::Exists
        | Operator::Type
        | Operator::Size
        | Operator::ElemMatch => false,
        Operator::Eq | Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            plain(&pred.value)
        }
        Operator::In | Operator::All => match &pred.value {
            Bson::Array(items) => items.iter().all(plain),
            _ => false,
        },
        _ => true,
    }
}

/// Bounds sets for one predicate. Most operators yield one set; `$all` and
/// `$range` yield one per constraint.
fn predicate_bounds(path: &str, pred: &QueryPredicate) -> Result<Vec<Vec<ColumnBounds>>> {
    let value = &pred.value;
    let sets = match pred.operator {
        Operator::Eq => vec![equality_bounds(path, value)],
        Operator::Gt | Operator::Gte => {
            vec![vec![greater_bounds(path, value, pred.operator == Operator::Gte)]]
        }
        Operator::Lt | Operator::Lte => {
            vec![vec![less_bounds(path, value, pred.operator == Operator::Lte)]]
        }
        Operator::Ne => vec![vec![not_equal_bounds(path, value)]],
        Operator::In => vec![in_bounds(path, value)?],
        Operator::Nin => vec![vec![not_in_bounds(path, value)?]],
        Operator::All => all_bounds(path, value),
        Operator::Exists => {
            if is_truthy(value) {
                vec![vec![ColumnBounds::exists(path)]]
            } else {
                let mut b = ColumnBounds::equality(path, Bson::Undefined);
                b.requires_runtime_recheck = true;
                vec![vec![b]]
            }
        }
        Operator::Type => vec![type_bounds(path, value)?],
        Operator::Size => {
            let mut b = if is_zero(value) {
                ColumnBounds::null_or_missing(path)
            } else {
                ColumnBounds::exists(path)
            };
            b.requires_runtime_recheck = true;
            vec![vec![b]]
        }
        Operator::Mod => {
            let mut b = ColumnBounds::of_type(path, TypeRank::Number);
            b.rechecks.push(Recheck::Mod(value.clone()));
            vec![vec![b]]
        }
        Operator::Regex => vec![regex_bounds(path, value, false)?],
        Operator::ElemMatch => {
            let mut b = ColumnBounds::exists(path);
            b.requires_runtime_recheck = true;
            vec![vec![b]]
        }
        Operator::BitsAllSet
        | Operator::BitsAnySet
        | Operator::BitsAllClear
        | Operator::BitsAnyClear => {
            let mask = bit_mask(value)?;
            let set = [TypeRank::Number, TypeRank::Binary]
                .into_iter()
                .map(|rank| {
                    let mut b = ColumnBounds::of_type(path, rank);
                    b.rechecks.push(Recheck::Bits {
                        op: pred.operator,
                        mask: mask.clone(),
                    });
                    b
                })
                .collect();
            vec![set]
        }
        Operator::Range => range_bounds(path, &RangeParams::parse(value)?),
        Operator::NotGt | Operator::NotGte => {
            vec![not_greater_bounds(path, value, pred.operator == Operator::NotGte)]
        }
        Operator::NotLt | Operator::NotLte => {
            vec![not_less_bounds(path, value, pred.operator == Operator::NotLte)]
        }
        Operator::OrderBy | Operator::OrderByReverse => Vec::new(),
    };
    Ok(sets)
}

fn equality_bounds(path: &str, value: &Bson) -> Vec<ColumnBounds> {
    match value {
        Bson::Null => vec![ColumnBounds::null_or_missing(path)],
        Bson::Array(items) => {
            // the array itself when nested, or any document holding its
            // first element
            let mut first = match items.first() {
                Some(first) => ColumnBounds::equality(path, first.clone()),
                None => ColumnBounds::null_or_missing(path),
            };
            first.requires_runtime_recheck = true;
            vec![ColumnBounds::equality(path, value.clone()), first]
        }
        other => vec![ColumnBounds::equality(path, other.clone())],
    }
}

fn greater_bounds(path: &str, value: &Bson, inclusive: bool) -> ColumnBounds {
    match value {
        Bson::MinKey => {
            let mut b = ColumnBounds::exists(path);
            b.requires_runtime_recheck = !inclusive;
            b
        }
        Bson::Array(items) => {
            let first = items.first().cloned().unwrap_or(Bson::MinKey);
            let lower = if compare_values(value, &first) == Ordering::Less {
                value.clone()
            } else {
                first
            };
            let mut b = ColumnBounds::new(path);
            b.lower = Some(Bound::new(lower, true));
            b.upper = Some(Bound::new(Bson::MaxKey, true));
            b.requires_runtime_recheck = true;
            b
        }
        Bson::Null if inclusive => ColumnBounds::null_or_missing(path),
        _ => {
            let mut b = ColumnBounds::new(path);
            b.lower = Some(Bound::new(value.clone(), inclusive));
            b.upper = Some(if docdb_bson::compare::is_nan(value) {
                Bound::new(value.clone(), true)
            } else {
                type_upper(TypeRank::of(value))
            });
            b.requires_runtime_recheck = matches!(value, Bson::Null);
            b
        }
    }
}

fn less_bounds(path: &str, value: &Bson, inclusive: bool) -> ColumnBounds {
    match value {
        Bson::MaxKey => {
            let mut b = ColumnBounds::exists(path);
            b.requires_runtime_recheck = !inclusive;
            b
        }
        Bson::Array(items) => {
            let first = items.first().cloned().unwrap_or(Bson::MaxKey);
            let upper = if compare_values(value, &first) == Ordering::Greater {
                value.clone()
            } else {
                first
            };
            let mut b = ColumnBounds::new(path);
            b.lower = Some(Bound::new(Bson::MinKey, true));
            b.upper = Some(Bound::new(upper, true));
            b.requires_runtime_recheck = true;
            b
        }
        Bson::Null if inclusive => ColumnBounds::null_or_missing(path),
        _ => {
            let mut b = ColumnBounds::new(path);
            b.lower = Some(if docdb_bson::compare::is_nan(value) {
                Bound::new(value.clone(), true)
            } else {
                type_lower(TypeRank::of(value))
            });
            b.upper = Some(Bound::new(value.clone(), inclusive));
            b.requires_runtime_recheck = matches!(value, Bson::Null);
            b
        }
    }
}

fn not_equal_bounds(path: &str, value: &Bson) -> ColumnBounds {
    let mut b = ColumnBounds::full(path);
    b.rechecks.push(Recheck::NotEqual(value.clone()));
    b.requires_runtime_recheck = true;
    b
}

fn in_bounds(path: &str, value: &Bson) -> Result<Vec<ColumnBounds>> {
    let Bson::Array(items) = value else {
        return Err(Error::bad_value("$in must contain an array of values"));
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Bson::Document(doc) if is_operator_document(doc) => {
                return Err(Error::bad_value("cannot nest $ under $in"));
            }
            Bson::RegularExpression(_) => out.extend(regex_bounds(path, item, false)?),
            other => out.extend(equality_bounds(path, other)),
        }
    }
    Ok(out)
}

fn not_in_bounds(path: &str, value: &Bson) -> Result<ColumnBounds> {
    let Bson::Array(items) = value else {
        return Err(Error::bad_value("$nin should have an array of values"));
    };
    let mut b = ColumnBounds::full(path);
    for item in items {
        match item {
            Bson::Document(doc) if is_operator_document(doc) => {
                return Err(Error::bad_value("cannot nest $ under $nin"));
            }
            Bson::RegularExpression(re) => b.rechecks.push(Recheck::Regex {
                regex: compile_regex(re.pattern.as_str(), re.options.as_str())?,
                operand: item.clone(),
                negated: true,
            }),
            other => b.rechecks.push(Recheck::NotEqual(other.clone())),
        }
    }
    b.requires_runtime_recheck = !items.is_empty();
    Ok(b)
}

fn all_bounds(path: &str, value: &Bson) -> Vec<Vec<ColumnBounds>> {
    match value {
        Bson::Array(items) if items.is_empty() => vec![Vec::new()],
        Bson::Array(items) => items
            .iter()
            .map(|item| match item {
                Bson::Document(doc) if is_operator_document(doc) => {
                    let mut b = ColumnBounds::exists(path);
                    b.requires_runtime_recheck = true;
                    vec![b]
                }
                other => equality_bounds(path, other),
            })
            .collect(),
        other => vec![equality_bounds(path, other)],
    }
}

fn regex_bounds(path: &str, value: &Bson, negated: bool) -> Result<Vec<ColumnBounds>> {
    let Bson::RegularExpression(re) = value else {
        return Err(Error::bad_value("$regex has to be a string"));
    };
    let regex = compile_regex(re.pattern.as_str(), re.options.as_str())?;
    let mut strings = if negated {
        ColumnBounds::full(path)
    } else {
        ColumnBounds::of_type(path, TypeRank::String)
    };
    strings.rechecks.push(Recheck::Regex {
        regex,
        operand: value.clone(),
        negated,
    });
    let mut literal = ColumnBounds::equality(path, value.clone());
    strings.requires_runtime_recheck = negated;
    literal.requires_runtime_recheck = negated;
    Ok(vec![strings, literal])
}

fn type_bounds(path: &str, value: &Bson) -> Result<Vec<ColumnBounds>> {
    let selectors = match value {
        Bson::Array(items) => items
            .iter()
            .map(TypeSelector::parse)
            .collect::<Result<Vec<_>>>()?,
        other => vec![TypeSelector::parse(other)?],
    };
    Ok(selectors
        .into_iter()
        .map(|selector| {
            let mut b = if selector.is_array() {
                ColumnBounds::exists(path)
            } else {
                ColumnBounds::of_type(path, selector.rank())
            };
            b.requires_runtime_recheck = true;
            b
        })
        .collect())
}

fn range_bounds(path: &str, params: &RangeParams) -> Vec<Vec<ColumnBounds>> {
    if params.full_scan {
        return Vec::new();
    }
    let mut sets = Vec::new();
    if params.min != Bson::MinKey {
        sets.push(vec![greater_bounds(path, &params.min, params.min_inclusive)]);
    }
    if params.max != Bson::MaxKey {
        sets.push(vec![less_bounds(path, &params.max, params.max_inclusive)]);
    }
    sets
}

/// `$not: {$gt: v}`: everything up to `v`, plus every sort class above
/// the one holding `v`.
fn not_greater_bounds(path: &str, value: &Bson, or_equal: bool) -> Vec<ColumnBounds> {
    let mut below = ColumnBounds::new(path);
    below.lower = Some(Bound::new(Bson::MinKey, true));
    below.upper = Some(Bound::new(
        value.clone(),
        !or_equal || matches!(value, Bson::Null),
    ));
    below.requires_runtime_recheck = true;

    let mut above = ColumnBounds::new(path);
    let type_max = type_upper(TypeRank::of(value));
    above.lower = Some(Bound::new(type_max.value, false));
    above.upper = Some(Bound::new(Bson::MaxKey, true));
    above.requires_runtime_recheck = true;
    vec![below, above]
}

/// `$not: {$lt: v}`: every sort class below the one holding `v`, plus
/// everything from `v` up.
fn not_less_bounds(path: &str, value: &Bson, or_equal: bool) -> Vec<ColumnBounds> {
    let mut below = ColumnBounds::new(path);
    below.lower = Some(Bound::new(Bson::MinKey, true));
    let type_min = type_lower(TypeRank::of(value));
    below.upper = Some(Bound::new(type_min.value, matches!(value, Bson::Null)));
    below.requires_runtime_recheck = true;

    let mut above = ColumnBounds::new(path);
    above.lower = Some(Bound::new(value.clone(), !or_equal));
    above.upper = Some(Bound::new(Bson::MaxKey, true));
    above.requires_runtime_recheck = true;
    vec![below, above]
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(f) => *f != 0.0,
        Bson::Null | Bson::Undefined => false,
        _ => true,
    }
}

fn is_zero(value: &Bson) -> bool {
    match value {
        Bson::Int32(n) => *n == 0,
        Bson::Int64(n) => *n == 0,
        Bson::Double(f) => *f == 0.0,
        _ => false,
    }
}
