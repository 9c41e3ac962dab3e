//! Scan callbacks for composite query keys.
//!
//! The storage layer walks index entries from a key's seek term and asks
//! [`compare_partial`] about each one. Skips come back through
//! [`index_term_transform`] as a new seek term; per-document checks are
//! folded by [`consistent`].

use std::cmp::Ordering;

use bson::{Bson, Document};
use docdb_bson::{CompositeTermRef, IndexTerm, compare_terms, serialize_composite};
use docdb_query::{Error, Result};

use crate::generator::term_error;
use crate::solver::{ColumnScan, QueryMetaInfo, QueryKey, RunData, decode_error, lowest_term};
use crate::spec::PathSpec;

/// Where a skip should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipTarget {
    /// The start of the column's range.
    Bound,
    /// Past every entry sharing the current value.
    PastValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialMatch {
    Match,
    Continue,
    Skip(SkipTarget),
    Stop,
}

impl PartialMatch {
    /// The integer form storage callbacks traditionally use.
    pub fn as_i32(self) -> i32 {
        match self {
            PartialMatch::Match => 0,
            PartialMatch::Continue => -1,
            PartialMatch::Skip(SkipTarget::PastValue) => -2,
            PartialMatch::Skip(SkipTarget::Bound) => -3,
            PartialMatch::Stop => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consistency {
    pub matches: bool,
    pub recheck: bool,
}

enum ColumnOrder {
    Within,
    /// Equal to an exclusive bound.
    Excluded,
    Below,
    Above,
}

/// Order of an entry against a bound in value space, undoing the
/// reversal applied to descending terms.
fn value_order(entry: &IndexTerm, bound: &IndexTerm) -> Ordering {
    let ord = compare_terms(entry, bound);
    if entry.descending { ord.reverse() } else { ord }
}

fn compare_column(term: &IndexTerm, scan: &ColumnScan) -> ColumnOrder {
    if let Some(lower) = &scan.lower {
        match value_order(term, &lower.term) {
            Ordering::Less => return ColumnOrder::Below,
            Ordering::Equal if !lower.inclusive && !lower.term.truncated => {
                return ColumnOrder::Excluded;
            }
            _ => {}
        }
    }
    if let Some(upper) = &scan.upper {
        match value_order(term, &upper.term) {
            Ordering::Greater => return ColumnOrder::Above,
            Ordering::Equal if !upper.inclusive && !upper.term.truncated => {
                return ColumnOrder::Excluded;
            }
            _ => {}
        }
    }
    ColumnOrder::Within
}

/// Evaluate a composite entry against a key's bounds, returning the
/// outcome and the column that decided it.
fn evaluate(terms: &[IndexTerm], run: &RunData) -> Result<(PartialMatch, Option<usize>)> {
    if terms.len() != run.columns.len() {
        return Err(Error::internal(format!(
            "index entry has {} terms, the index has {} paths",
            terms.len(),
            run.columns.len()
        )));
    }
    let mut equal_prefix = true;
    for (column, (term, scan)) in terms.iter().zip(&run.columns).enumerate() {
        if scan.is_unspecified() {
            equal_prefix = false;
            continue;
        }
        let descending = run.descending.get(column).copied().unwrap_or(false);
        let before_in_index = match compare_column(term, scan) {
            ColumnOrder::Within => None,
            ColumnOrder::Excluded => return Ok((PartialMatch::Continue, Some(column))),
            ColumnOrder::Below => Some(!descending),
            ColumnOrder::Above => Some(descending),
        };
        if let Some(before) = before_in_index {
            let outcome = match (run.backward, before, equal_prefix) {
                (false, true, true) => PartialMatch::Continue,
                (false, true, false) => PartialMatch::Skip(SkipTarget::Bound),
                (false, false, true) => PartialMatch::Stop,
                (false, false, false) => PartialMatch::Skip(SkipTarget::PastValue),
                (true, true, true) => PartialMatch::Stop,
                (true, _, _) => PartialMatch::Continue,
            };
            return Ok((outcome, Some(column)));
        }
        if !scan.rechecks.iter().all(|r| r.check(term)) {
            return Ok((PartialMatch::Continue, Some(column)));
        }
        equal_prefix &= scan.equality;
    }
    Ok((PartialMatch::Match, None))
}

fn decode_entry(entry: &[u8]) -> Result<Vec<IndexTerm>> {
    CompositeTermRef::new(entry).decode().map_err(decode_error)
}

/// Compare one composite entry against a composite query key.
pub fn compare_partial(entry: &[u8], key: &QueryKey) -> Result<PartialMatch> {
    let terms = decode_entry(entry)?;
    if terms.len() == 1 && terms[0].is_metadata() {
        return Ok(if key.run.backward {
            PartialMatch::Stop
        } else {
            PartialMatch::Continue
        });
    }
    Ok(evaluate(&terms, &key.run)?.0)
}

/// Fold the per-key check bits of one document.
pub fn consistent(checks: &[bool], meta: &QueryMetaInfo) -> Consistency {
    let truncated_hit = meta
        .truncation_term_index
        .is_some_and(|i| checks.get(i).copied().unwrap_or(false));
    let recheck = meta.requires_runtime_recheck || truncated_hit;
    let value_checks = match meta.truncation_term_index {
        Some(i) => &checks[..i.min(checks.len())],
        None => checks,
    };

    let matches = if !meta.multiple_scan_keys_per_path && !meta.has_truncation {
        value_checks.iter().any(|c| *c)
    } else if meta.num_scan_keys == 0 {
        value_checks.first().copied().unwrap_or(false)
    } else {
        meta.scan_key_map.iter().all(|keys| {
            keys.iter()
                .any(|k| value_checks.get(*k).copied().unwrap_or(false))
        })
    };
    Consistency { matches, recheck }
}

/// Build the seek term for a skip decided on `entry`. `None` when the
/// entry does not call for a skip.
pub fn index_term_transform(entry: &[u8], key: &QueryKey) -> Result<Option<Vec<u8>>> {
    let elements = CompositeTermRef::new(entry)
        .elements()
        .map_err(decode_error)?;
    let terms = decode_entry(entry)?;
    let (outcome, column) = evaluate(&terms, &key.run)?;
    let (PartialMatch::Skip(target), Some(skip_column)) = (outcome, column) else {
        return Ok(None);
    };

    let mut seek: Vec<Vec<u8>> = Vec::with_capacity(terms.len());
    for (column, element) in elements.iter().enumerate() {
        let descending = key.run.descending.get(column).copied().unwrap_or(false);
        let bytes = match column.cmp(&skip_column) {
            Ordering::Less => element.to_vec(),
            Ordering::Equal => match target {
                SkipTarget::Bound => match key.run.columns[column].index_start(descending) {
                    Some(bound) => bound.serialized.clone(),
                    None => return Ok(None),
                },
                SkipTarget::PastValue => {
                    let end = if descending { Bson::MinKey } else { Bson::MaxKey };
                    IndexTerm::new(terms[column].path.clone(), end)
                        .descending(descending)
                        .serialize()
                }
            },
            Ordering::Greater => lowest_term().serialize(),
        };
        seek.push(bytes);
    }
    serialize_composite(&seek).map(Some).map_err(term_error)
}

/// Answers for the root metadata strategies: the first non-metadata entry
/// ends the scan.
pub fn compare_metadata(entry: &[u8], marker: &IndexTerm) -> Result<PartialMatch> {
    let terms = decode_entry(entry)?;
    match terms.as_slice() {
        [term] if term.is_metadata() => Ok(if term.root_marker() == marker.root_marker() {
            PartialMatch::Match
        } else {
            PartialMatch::Continue
        }),
        _ => Ok(PartialMatch::Stop),
    }
}

/// Rebuild a sort key (`{path: value}`, plus `t` when truncated and `r`
/// when reversed) from the entry's column serving `sort_path`.
pub fn order_by_document(
    spec: &PathSpec,
    entry: &[u8],
    sort_path: &str,
    reverse: bool,
) -> Result<Document> {
    let terms = decode_entry(entry)?;
    let column = spec.column_for(sort_path).ok_or_else(|| {
        Error::internal(format!(
            "Unable to determine sort direction - path '{sort_path}' doesn't match any path in the index"
        ))
    })?;
    let term = terms.get(column).ok_or_else(|| {
        Error::internal(format!("index entry has no term for column {column}"))
    })?;
    let mut out = Document::new();
    out.insert(sort_path, term_value(term));
    if term.truncated {
        out.insert("t", true);
    }
    if reverse {
        out.insert("r", true);
    }
    Ok(out)
}

/// Recompose a document holding every column's value at its path.
pub fn project_entry(spec: &PathSpec, entry: &[u8]) -> Result<Document> {
    let terms = decode_entry(entry)?;
    let mut out = Document::new();
    for (index_path, term) in spec.paths().iter().zip(&terms) {
        if term.is_maybe_undefined() {
            continue;
        }
        let path = if index_path.wildcard {
            term.path.as_str()
        } else {
            index_path.path.as_str()
        };
        set_path(&mut out, path, term_value(term));
    }
    Ok(out)
}

fn term_value(term: &IndexTerm) -> Bson {
    if term.is_maybe_undefined() {
        Bson::Null
    } else {
        term.value.clone()
    }
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use docdb_query::{Operator, QueryPredicate};

    use super::*;
    use crate::config::IndexConfig;
    use crate::solver::{BoundsSolver, QueryKeys, SolveOptions};
    use crate::spec::{Direction, IndexPath};

    fn spec() -> PathSpec {
        PathSpec::new(vec![
            IndexPath::new("a", Direction::Ascending),
            IndexPath::new("b", Direction::Ascending),
        ])
        .unwrap()
    }

    fn entry(a: impl Into<Bson>, b: impl Into<Bson>) -> Vec<u8> {
        serialize_composite(&[
            IndexTerm::new("", a.into()).serialize(),
            IndexTerm::new("", b.into()).serialize(),
        ])
        .unwrap()
    }

    fn solve(preds: &[QueryPredicate]) -> QueryKeys {
        BoundsSolver::new(&spec(), &IndexConfig::default(), false)
            .solve(preds, SolveOptions::default())
            .unwrap()
    }

    #[test]
    fn equality_prefix_then_range() {
        let keys = solve(&[
            QueryPredicate::new("a", Operator::Eq, Bson::Int32(1)),
            QueryPredicate::new("b", Operator::Gte, Bson::Int32(15)),
        ]);
        let key = &keys.keys[0];
        assert_eq!(compare_partial(&entry(1, 20), key).unwrap(), PartialMatch::Match);
        assert_eq!(compare_partial(&entry(1, 10), key).unwrap(), PartialMatch::Continue);
        assert_eq!(compare_partial(&entry(2, 10), key).unwrap(), PartialMatch::Stop);
        assert_eq!(
            compare_partial(&entry(1, "str"), key).unwrap(),
            PartialMatch::Stop
        );
    }

    #[test]
    fn range_prefix_skips_to_the_next_bound() {
        let keys = solve(&[
            QueryPredicate::new("a", Operator::Gt, Bson::Int32(0)),
            QueryPredicate::new("b", Operator::Gte, Bson::Int32(15)),
        ]);
        let key = &keys.keys[0];
        let below = entry(2, 10);
        assert_eq!(
            compare_partial(&below, key).unwrap(),
            PartialMatch::Skip(SkipTarget::Bound)
        );
        let seek = index_term_transform(&below, key).unwrap().unwrap();
        let terms = CompositeTermRef::new(&seek).decode().unwrap();
        assert_eq!(terms[0].value, Bson::Int32(2));
        assert_eq!(terms[1].value, Bson::Int32(15));

        let above = entry(2, "str");
        assert_eq!(
            compare_partial(&above, key).unwrap(),
            PartialMatch::Skip(SkipTarget::PastValue)
        );
        let seek = index_term_transform(&above, key).unwrap().unwrap();
        let terms = CompositeTermRef::new(&seek).decode().unwrap();
        assert_eq!(terms[1].value, Bson::MaxKey);
        assert_eq!(index_term_transform(&entry(2, 20), key).unwrap(), None);
    }

    #[test]
    fn exclusive_bounds_continue() {
        let keys = solve(&[QueryPredicate::new("a", Operator::Gt, Bson::Int32(1))]);
        assert_eq!(
            compare_partial(&entry(1, 0), &keys.keys[0]).unwrap(),
            PartialMatch::Continue
        );
        assert_eq!(
            compare_partial(&entry(3, 0), &keys.keys[0]).unwrap(),
            PartialMatch::Match
        );
    }

    #[test]
    fn consistent_requires_every_set() {
        let meta = QueryMetaInfo {
            num_scan_keys: 2,
            multiple_scan_keys_per_path: true,
            scan_key_map: vec![vec![0], vec![1]],
            ..QueryMetaInfo::default()
        };
        assert!(!consistent(&[true, false], &meta).matches);
        assert!(consistent(&[true, true], &meta).matches);

        let meta = QueryMetaInfo {
            has_truncation: true,
            truncation_term_index: Some(1),
            num_scan_keys: 1,
            scan_key_map: vec![vec![0]],
            ..QueryMetaInfo::default()
        };
        let truncated = consistent(&[true, true], &meta);
        assert!(truncated.matches && truncated.recheck);
        let only_truncated = consistent(&[false, true], &meta);
        assert!(!only_truncated.matches);
    }

    #[test]
    fn ordering_documents() {
        let e = entry(7, "x");
        assert_eq!(
            order_by_document(&spec(), &e, "b", true).unwrap(),
            doc! { "b": "x", "r": true }
        );
        let nested = PathSpec::new(vec![
            IndexPath::new("a.x", Direction::Ascending),
            IndexPath::new("a.y", Direction::Ascending),
        ])
        .unwrap();
        assert_eq!(
            project_entry(&nested, &e).unwrap(),
            doc! { "a": { "x": 7, "y": "x" } }
        );
    }
}
