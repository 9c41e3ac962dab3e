//! Turns bounds sets into scan keys.
//!
//! Every column contributes the bounds of all its sets; the scan keys are
//! the cartesian product across columns. `scan_key_map` remembers, per
//! bounds set, which keys carry one of its bounds so `consistent` can ask
//! that every set was satisfied by some key.

use std::cmp::Ordering;

use bson::Bson;
use docdb_bson::term::serialize_with_limit;
use docdb_bson::{DecodeError, IndexTerm, compare_values, serialize_composite};
use docdb_query::{Error, QueryPredicate, Result};
use tracing::trace;

use crate::bounds::{Bound, BoundsSet, ColumnBounds, Recheck, build_bounds};
use crate::config::IndexConfig;
use crate::generator::term_error;
use crate::spec::PathSpec;

/// One end of a column range, serialized the way index entries are.
#[derive(Debug, Clone)]
pub struct ScanBound {
    pub term: IndexTerm,
    pub serialized: Vec<u8>,
    pub inclusive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ColumnScan {
    pub lower: Option<ScanBound>,
    pub upper: Option<ScanBound>,
    pub equality: bool,
    pub rechecks: Vec<Recheck>,
}

impl ColumnScan {
    /// No predicate constrains this column.
    pub fn is_unspecified(&self) -> bool {
        self.lower.is_none() && self.upper.is_none() && self.rechecks.is_empty()
    }

    /// The bound an ascending scan reaches first, in index order.
    pub fn index_start(&self, descending: bool) -> Option<&ScanBound> {
        if descending {
            self.upper.as_ref()
        } else {
            self.lower.as_ref()
        }
    }

    pub fn index_end(&self, descending: bool) -> Option<&ScanBound> {
        if descending {
            self.lower.as_ref()
        } else {
            self.upper.as_ref()
        }
    }
}

/// Per-key state the scan callbacks read.
#[derive(Debug, Clone, Default)]
pub struct RunData {
    pub columns: Vec<ColumnScan>,
    pub descending: Vec<bool>,
    pub backward: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMetaInfo {
    pub num_paths: usize,
    pub has_truncation: bool,
    pub truncation_term_index: Option<usize>,
    pub requires_runtime_recheck: bool,
    pub num_scan_keys: usize,
    pub multiple_scan_keys_per_path: bool,
    pub backward: bool,
    /// For each bounds set, the keys that carry one of its bounds.
    pub scan_key_map: Vec<Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct QueryKey {
    /// Serialized composite seek term (or the exact entry for non-partial
    /// keys).
    pub term: Vec<u8>,
    pub partial_match: bool,
    pub run: RunData,
}

#[derive(Debug, Clone, Default)]
pub struct QueryKeys {
    pub keys: Vec<QueryKey>,
    pub meta: QueryMetaInfo,
}

/// Flags that shape how predicates become keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolveOptions {
    /// The index may hold several entries per document.
    pub multikey: bool,
    /// Results must come back in index order.
    pub ordered: bool,
    /// The index holds reduced correlated terms.
    pub correlated_reduced: bool,
    pub backward: bool,
}

/// The lowest possible element in index order, whatever the column's
/// direction or path.
pub fn lowest_term() -> IndexTerm {
    IndexTerm::new("", Bson::MinKey)
}

pub fn highest_term() -> IndexTerm {
    IndexTerm::new("", Bson::MaxKey)
}

pub fn is_lowest(term: &IndexTerm) -> bool {
    !term.descending && term.path.is_empty() && term.value == Bson::MinKey
}

pub fn is_highest(term: &IndexTerm) -> bool {
    !term.descending && term.path.is_empty() && term.value == Bson::MaxKey
}

pub(crate) fn decode_error(err: DecodeError) -> Error {
    Error::internal(format!("corrupt index term: {err}"))
}

pub struct BoundsSolver<'a> {
    spec: &'a PathSpec,
    budget: Option<usize>,
    reduced_terms_enabled: bool,
}

impl<'a> BoundsSolver<'a> {
    pub fn new(spec: &'a PathSpec, config: &IndexConfig, reduced_terms_enabled: bool) -> Self {
        BoundsSolver {
            spec,
            budget: config.path_term_budget(spec.len()),
            reduced_terms_enabled,
        }
    }

    pub fn solve(&self, predicates: &[QueryPredicate], options: SolveOptions) -> Result<QueryKeys> {
        let built = build_bounds(self.spec, predicates)?;
        let mut meta = QueryMetaInfo {
            num_paths: self.spec.len(),
            requires_runtime_recheck: built.requires_runtime_recheck,
            backward: options.backward,
            ..QueryMetaInfo::default()
        };
        let mut sets = built.sets;

        if options.correlated_reduced && self.reduced_terms_enabled {
            meta.requires_runtime_recheck |= trim_secondary_sets(&mut sets);
        }
        if !options.multikey {
            sets = self.merge_single_sets(sets);
        }
        if options.ordered {
            meta.requires_runtime_recheck |= pick_for_ordered_scan(&mut sets, self.spec.len());
        }
        for set in &mut sets {
            set.bounds.retain(|b| !b.is_unsatisfiable());
        }
        if scan_key_count(&sets, self.spec.len()).is_none() {
            trace!("too many scan keys, one range per column");
            pick_for_ordered_scan(&mut sets, self.spec.len());
            meta.requires_runtime_recheck = true;
        }

        // (set, bound) alternatives per column
        let mut alternatives: Vec<Vec<(usize, usize)>> = vec![Vec::new(); self.spec.len()];
        let mut sets_per_column = vec![0usize; self.spec.len()];
        let mut any_empty = false;
        for (set_index, set) in sets.iter().enumerate() {
            any_empty |= set.bounds.is_empty();
            sets_per_column[set.column] += 1;
            for bound_index in 0..set.bounds.len() {
                alternatives[set.column].push((set_index, bound_index));
            }
        }
        meta.num_scan_keys = sets.len();
        meta.multiple_scan_keys_per_path = sets_per_column.iter().any(|n| *n > 1);
        meta.scan_key_map = vec![Vec::new(); sets.len()];

        let total = if any_empty {
            0
        } else {
            scan_key_count(&sets, self.spec.len()).unwrap_or(0)
        };

        let mut keys = Vec::with_capacity(total + 1);
        for permutation in 0..total {
            let mut rem = permutation;
            let mut columns = Vec::with_capacity(self.spec.len());
            for (column, alts) in alternatives.iter().enumerate() {
                if alts.is_empty() {
                    columns.push(ColumnScan::default());
                    continue;
                }
                let (set_index, bound_index) = alts[rem % alts.len()];
                rem /= alts.len();
                meta.scan_key_map[set_index].push(permutation);
                let bounds = &sets[set_index].bounds[bound_index];
                let scan = self.column_scan(column, bounds)?;
                let truncated = [&scan.lower, &scan.upper]
                    .into_iter()
                    .flatten()
                    .any(|b| b.term.truncated);
                meta.requires_runtime_recheck |= truncated || bounds.requires_runtime_recheck;
                columns.push(scan);
            }
            let run = RunData {
                columns,
                descending: (0..self.spec.len())
                    .map(|c| self.spec.is_descending(c))
                    .collect(),
                backward: options.backward,
            };
            keys.push(QueryKey {
                term: seek_term(&run)?,
                partial_match: true,
                run,
            });
        }

        // Entries may be truncated whenever truncation is on; the probe for
        // the root truncation term tells `consistent` to recheck them.
        if self.budget.is_some() && !keys.is_empty() {
            if options.ordered {
                meta.requires_runtime_recheck |= keys
                    .iter()
                    .any(|k| k.run.columns.iter().any(|c| !c.rechecks.is_empty()));
            } else {
                meta.has_truncation = true;
                meta.truncation_term_index = Some(keys.len());
                keys.push(QueryKey {
                    term: serialize_composite(&[IndexTerm::root_truncated().serialize()])
                        .map_err(term_error)?,
                    partial_match: false,
                    run: RunData::default(),
                });
            }
        }

        trace!(
            keys = keys.len(),
            sets = meta.num_scan_keys,
            truncated = meta.has_truncation,
            recheck = meta.requires_runtime_recheck,
            "solved index bounds"
        );
        Ok(QueryKeys { keys, meta })
    }

    fn column_scan(&self, column: usize, bounds: &ColumnBounds) -> Result<ColumnScan> {
        let descending = self.spec.is_descending(column);
        let process = |bound: &Option<Bound>| -> Result<Option<ScanBound>> {
            bound
                .as_ref()
                .map(|b| self.scan_bound(&bounds.path, b, descending))
                .transpose()
        };
        Ok(ColumnScan {
            lower: process(&bounds.lower)?,
            upper: process(&bounds.upper)?,
            equality: bounds.is_equality(),
            rechecks: bounds.rechecks.clone(),
        })
    }

    fn scan_bound(&self, path: &str, bound: &Bound, descending: bool) -> Result<ScanBound> {
        let term = IndexTerm::new(path, bound.value.clone()).descending(descending);
        let (serialized, _) = serialize_with_limit(&term, self.budget);
        let term = IndexTerm::deserialize(&serialized).map_err(decode_error)?;
        Ok(ScanBound {
            term,
            serialized,
            inclusive: bound.inclusive,
        })
    }

    /// Without arrays a document has one entry, so every single-bound set
    /// on a column must hold for that entry and the sets intersect.
    fn merge_single_sets(&self, sets: Vec<BoundsSet>) -> Vec<BoundsSet> {
        let mut merged: Vec<BoundsSet> = Vec::with_capacity(sets.len());
        for set in sets {
            if set.bounds.len() != 1 {
                merged.push(set);
                continue;
            }
            let target = merged.iter_mut().find(|m| {
                m.column == set.column
                    && m.bounds.len() == 1
                    && m.bounds[0].path == set.bounds[0].path
            });
            match target {
                Some(target) => {
                    let mut bounds = set.bounds;
                    if let Some(b) = bounds.pop() {
                        target.bounds[0].intersect(b);
                    }
                }
                None => merged.push(set),
            }
        }
        merged
    }
}

/// Reduced correlated entries only pair values from the same array
/// element, so only one column's bounds can be trusted.
/// Most scan keys one query expands into before columns collapse to a
/// single range.
pub const MAX_SCAN_KEYS: usize = 4096;

/// Size of the cartesian product of every column's alternatives, or `None`
/// past [`MAX_SCAN_KEYS`].
fn scan_key_count(sets: &[BoundsSet], num_columns: usize) -> Option<usize> {
    if sets.iter().any(|s| s.bounds.is_empty()) {
        return Some(0);
    }
    let mut per_column = vec![0usize; num_columns];
    for set in sets {
        per_column[set.column] += set.bounds.len();
    }
    per_column
        .iter()
        .try_fold(1usize, |acc, n| acc.checked_mul((*n).max(1)))
        .filter(|total| *total <= MAX_SCAN_KEYS)
}

fn trim_secondary_sets(sets: &mut Vec<BoundsSet>) -> bool {
    let Some(first) = sets.iter().map(|s| s.column).min() else {
        return false;
    };
    let before = sets.len();
    sets.retain(|s| s.column == first);
    before != sets.len()
}

/// Ordered scans need one key range, so keep a single set per column,
/// preferring equality, and collapse its alternatives into their hull.
fn pick_for_ordered_scan(sets: &mut Vec<BoundsSet>, num_columns: usize) -> bool {
    let mut lossy = false;
    let mut picked = Vec::new();
    for column in 0..num_columns {
        let candidates: Vec<usize> = (0..sets.len())
            .filter(|i| sets[*i].column == column)
            .collect();
        let Some(&first) = candidates.first() else {
            continue;
        };
        lossy |= candidates.len() > 1;
        let chosen = candidates
            .iter()
            .copied()
            .find(|i| sets[*i].bounds.len() == 1 && sets[*i].bounds[0].is_equality())
            .unwrap_or(first);
        let mut set = sets[chosen].clone();
        if set.bounds.len() > 1 {
            lossy = true;
            set.bounds = vec![hull(&set.bounds)];
        }
        picked.push(set);
    }
    *sets = picked;
    lossy
}

fn hull(bounds: &[ColumnBounds]) -> ColumnBounds {
    let mut out = bounds[0].clone();
    out.rechecks.clear();
    for b in &bounds[1..] {
        out.lower = widen(out.lower.take(), b.lower.as_ref(), Ordering::Less);
        out.upper = widen(out.upper.take(), b.upper.as_ref(), Ordering::Greater);
    }
    out.requires_runtime_recheck = true;
    out
}

/// The looser of two bounds; `outward` is the direction that widens.
fn widen(current: Option<Bound>, other: Option<&Bound>, outward: Ordering) -> Option<Bound> {
    let (mut current, other) = (current?, other?);
    match compare_values(&other.value, &current.value) {
        Ordering::Equal => current.inclusive |= other.inclusive,
        ord if ord == outward => current = other.clone(),
        _ => {}
    }
    Some(current)
}

/// Where a scan for `run` starts: the first in-range position in the scan
/// direction for every column.
fn seek_term(run: &RunData) -> Result<Vec<u8>> {
    let elements: Vec<Vec<u8>> = run
        .columns
        .iter()
        .zip(&run.descending)
        .map(|(scan, &descending)| {
            let bound = if run.backward {
                scan.index_end(descending)
            } else {
                scan.index_start(descending)
            };
            match (bound, run.backward) {
                (Some(b), _) => b.serialized.clone(),
                (None, false) => lowest_term().serialize(),
                (None, true) => highest_term().serialize(),
            }
        })
        .collect();
    serialize_composite(&elements).map_err(term_error)
}

#[cfg(test)]
mod tests {
    use docdb_bson::CompositeTermRef;
    use docdb_query::Operator;

    use super::*;
    use crate::spec::{Direction, IndexPath};

    fn spec() -> PathSpec {
        PathSpec::new(vec![
            IndexPath::new("a", Direction::Ascending),
            IndexPath::new("b", Direction::Descending),
        ])
        .unwrap()
    }

    fn pred(path: &str, op: Operator, value: impl Into<Bson>) -> QueryPredicate {
        QueryPredicate::new(path, op, value.into())
    }

    fn solve(preds: &[QueryPredicate], options: SolveOptions) -> QueryKeys {
        let spec = spec();
        let config = IndexConfig::default();
        BoundsSolver::new(&spec, &config, false)
            .solve(preds, options)
            .unwrap()
    }

    #[test]
    fn range_intersects_without_arrays() {
        let keys = solve(
            &[pred("a", Operator::Gt, 1), pred("a", Operator::Lt, 9)],
            SolveOptions::default(),
        );
        // one range plus the truncation probe
        assert_eq!(keys.keys.len(), 2);
        assert_eq!(keys.meta.truncation_term_index, Some(1));
        assert!(!keys.keys[1].partial_match);
        let scan = &keys.keys[0].run.columns[0];
        assert_eq!(scan.lower.as_ref().unwrap().term.value, Bson::Int32(1));
        assert_eq!(scan.upper.as_ref().unwrap().term.value, Bson::Int32(9));
        assert!(keys.keys[0].run.columns[1].is_unspecified());
        assert!(!keys.meta.multiple_scan_keys_per_path);
    }

    #[test]
    fn multikey_keeps_sets_apart() {
        let keys = solve(
            &[pred("a", Operator::Gt, 1), pred("a", Operator::Lt, 9)],
            SolveOptions {
                multikey: true,
                ..SolveOptions::default()
            },
        );
        assert_eq!(keys.keys.len(), 3);
        assert_eq!(keys.meta.num_scan_keys, 2);
        assert!(keys.meta.multiple_scan_keys_per_path);
        assert_eq!(keys.meta.scan_key_map, vec![vec![0], vec![1]]);
    }

    #[test]
    fn in_lists_multiply_across_columns() {
        let keys = solve(
            &[
                pred("a", Operator::In, vec![Bson::Int32(1), Bson::Int32(2)]),
                pred("b", Operator::In, vec![Bson::Int32(3), Bson::Int32(4), Bson::Int32(5)]),
            ],
            SolveOptions::default(),
        );
        assert_eq!(keys.keys.len(), 7);
        assert_eq!(keys.meta.scan_key_map[0].len(), 6);
    }

    #[test]
    fn seek_term_starts_descending_columns_at_their_upper_bound() {
        let keys = solve(
            &[pred("a", Operator::Eq, 1), pred("b", Operator::Lte, 7)],
            SolveOptions::default(),
        );
        let terms = CompositeTermRef::new(&keys.keys[0].term).decode().unwrap();
        assert_eq!(terms[0].value, Bson::Int32(1));
        assert!(terms[1].descending);
        assert_eq!(terms[1].value, Bson::Int32(7));
    }

    #[test]
    fn empty_in_yields_no_keys() {
        let keys = solve(
            &[pred("a", Operator::In, Vec::<Bson>::new())],
            SolveOptions::default(),
        );
        assert!(keys.keys.is_empty());
    }

    #[test]
    fn ordered_scans_use_one_range_per_column() {
        let keys = solve(
            &[pred("a", Operator::In, vec![Bson::Int32(4), Bson::Int32(2)])],
            SolveOptions {
                ordered: true,
                ..SolveOptions::default()
            },
        );
        assert_eq!(keys.keys.len(), 1);
        assert!(keys.meta.requires_runtime_recheck);
        let scan = &keys.keys[0].run.columns[0];
        assert_eq!(scan.lower.as_ref().unwrap().term.value, Bson::Int32(2));
        assert_eq!(scan.upper.as_ref().unwrap().term.value, Bson::Int32(4));
    }
}
