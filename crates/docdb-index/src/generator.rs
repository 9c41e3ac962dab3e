//! Index term generation for stored documents.
//!
//! Every column yields a set of single-path terms; the document's entries
//! are the cartesian product of those sets, each serialized as a composite
//! term. Root metadata entries record multikey, truncation and reduced
//! correlated generation so queries can ask about them.

use std::collections::HashSet;

use bson::{Bson, Document};
use docdb_bson::term::serialize_with_limit;
use docdb_bson::{IndexTerm, RootMetadata, get_path, serialize_composite};
use docdb_query::{Error, Result};

use crate::config::IndexConfig;
use crate::spec::{IndexPath, PathSpec, PathSpecKind};

/// The terms produced for one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedTerms {
    /// Composite value entries.
    pub terms: Vec<Vec<u8>>,
    /// Single-element composite entries holding root metadata terms.
    pub metadata: Vec<Vec<u8>>,
    pub has_array_values: bool,
    pub has_truncated_terms: bool,
    pub has_unspecified_paths: bool,
    pub emitted_root_metadata: bool,
}

impl GeneratedTerms {
    pub fn entries(&self) -> impl Iterator<Item = &[u8]> {
        self.terms
            .iter()
            .chain(self.metadata.iter())
            .map(Vec::as_slice)
    }

    pub fn into_entries(self) -> Vec<Vec<u8>> {
        let mut entries = self.terms;
        entries.extend(self.metadata);
        entries
    }
}

/// Serialized terms of a single column, deduplicated in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathTerms {
    pub terms: Vec<Vec<u8>>,
    pub has_array_values: bool,
    pub has_truncated_terms: bool,
    pub has_unspecified_paths: bool,
}

impl PathTerms {
    fn push(&mut self, bytes: Vec<u8>, seen: &mut HashSet<Vec<u8>>) {
        if seen.insert(bytes.clone()) {
            self.terms.push(bytes);
        }
    }
}

pub struct TermGenerator<'a> {
    spec: &'a PathSpec,
    budget: Option<usize>,
    reduced_correlated: bool,
}

impl<'a> TermGenerator<'a> {
    pub fn new(spec: &'a PathSpec, config: &IndexConfig, reduced_correlated: bool) -> Self {
        TermGenerator {
            spec,
            budget: config.path_term_budget(spec.len()),
            reduced_correlated: reduced_correlated && spec.wildcard_index().is_none(),
        }
    }

    /// Terms for one column of `doc`.
    pub fn path_terms(&self, doc: &Document, column: usize) -> PathTerms {
        let Some(index_path) = self.spec.path(column) else {
            return PathTerms::default();
        };
        let mut walker = Walker::new(index_path);
        walker.walk_root(doc);
        self.finish(index_path, walker)
    }

    pub fn generate(&self, doc: &Document) -> Result<GeneratedTerms> {
        let columns: Vec<PathTerms> = (0..self.spec.len())
            .map(|c| self.path_terms(doc, c))
            .collect();

        let mut out = GeneratedTerms {
            has_array_values: columns.iter().any(|c| c.has_array_values),
            has_truncated_terms: columns.iter().any(|c| c.has_truncated_terms),
            has_unspecified_paths: columns.iter().any(|c| c.has_unspecified_paths),
            ..GeneratedTerms::default()
        };

        let correlated = if self.reduced_correlated {
            self.correlated_terms(doc, &columns)?
        } else {
            None
        };
        let correlated_emitted = correlated.is_some();
        out.terms = match correlated {
            Some(terms) => terms,
            None => {
                let sets: Vec<&[Vec<u8>]> = columns.iter().map(|c| c.terms.as_slice()).collect();
                cartesian_product(&sets)?
            }
        };

        let multi_term_is_multikey = self.spec.kind() != PathSpecKind::Wildcard;
        let mut markers = Vec::new();
        if correlated_emitted {
            markers.push(IndexTerm::root(RootMetadata::CorrelatedRootArray));
        }
        if (multi_term_is_multikey && out.terms.len() > 1) || out.has_array_values {
            markers.push(IndexTerm::root(RootMetadata::MultiKey));
        }
        if out.has_truncated_terms {
            markers.push(IndexTerm::root_truncated());
        }
        for marker in markers {
            out.metadata.push(root_entry(&marker)?);
        }
        out.emitted_root_metadata = !out.metadata.is_empty();
        Ok(out)
    }

    fn finish(&self, index_path: &IndexPath, walker: Walker) -> PathTerms {
        let mut out = PathTerms {
            has_array_values: walker.has_array_values,
            ..PathTerms::default()
        };
        let mut seen = HashSet::new();
        let mut terms = walker.terms;
        if terms.is_empty() {
            terms.push(IndexTerm::undefined(walker.undefined_path));
        }
        for term in terms {
            out.has_unspecified_paths |= term.is_maybe_undefined();
            let term = term.descending(index_path.direction.is_descending());
            let (bytes, truncated) = serialize_with_limit(&term, self.budget);
            out.has_truncated_terms |= truncated;
            out.push(bytes, &mut seen);
        }
        out
    }

    /// Reduced generation: when two or more columns run through the same
    /// array of documents, pair their terms element by element instead of
    /// across the whole array.
    fn correlated_terms(
        &self,
        doc: &Document,
        columns: &[PathTerms],
    ) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(group) = self.correlation_group(doc) else {
            return Ok(None);
        };

        let mut seen = HashSet::new();
        let mut terms = Vec::new();
        for item in group.items {
            let mut element_sets: Vec<PathTerms> = Vec::with_capacity(self.spec.len());
            for (column, global) in columns.iter().enumerate() {
                let Some(suffix) = group.suffix_for(column) else {
                    element_sets.push(global.clone());
                    continue;
                };
                let index_path = &self.spec.paths()[column];
                let mut walker = Walker::new(index_path);
                let segments: Vec<&str> = suffix.split('.').collect();
                walker.walk(item, &segments, "", true);
                if walker.terms.is_empty() {
                    walker.terms.push(IndexTerm::maybe_undefined(""));
                }
                element_sets.push(self.finish(index_path, walker));
            }
            let sets: Vec<&[Vec<u8>]> = element_sets.iter().map(|c| c.terms.as_slice()).collect();
            for term in cartesian_product(&sets)? {
                if seen.insert(term.clone()) {
                    terms.push(term);
                }
            }
        }
        Ok(Some(terms))
    }

    /// The shortest shared prefix of two or more columns that resolves to a
    /// non-empty array in `doc`.
    fn correlation_group<'d>(&self, doc: &'d Document) -> Option<CorrelationGroup<'d>> {
        let segmented: Vec<Vec<&str>> = self
            .spec
            .paths()
            .iter()
            .map(|p| p.path.split('.').collect())
            .collect();
        let longest = segmented.iter().map(Vec::len).max().unwrap_or(0);
        for depth in 1..longest {
            for (column, segments) in segmented.iter().enumerate() {
                if segments.len() <= depth {
                    continue;
                }
                let prefix = segments[..depth].join(".");
                let members: Vec<usize> = segmented
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.len() > depth && s[..depth].join(".") == prefix)
                    .map(|(i, _)| i)
                    .collect();
                if members.len() < 2 || members[0] != column {
                    continue;
                }
                if let Some(Bson::Array(items)) = get_path(doc, &prefix) {
                    if items.is_empty() {
                        continue;
                    }
                    let suffixes = members
                        .into_iter()
                        .map(|i| (i, segmented[i][depth..].join(".")))
                        .collect();
                    return Some(CorrelationGroup { items, suffixes });
                }
            }
        }
        None
    }
}

struct CorrelationGroup<'d> {
    items: &'d [Bson],
    suffixes: Vec<(usize, String)>,
}

impl CorrelationGroup<'_> {
    fn suffix_for(&self, column: usize) -> Option<&str> {
        self.suffixes
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, s)| s.as_str())
    }
}

/// Depth-first walk of one index path. Regular columns emit value-only
/// terms; wildcard columns emit one term per leaf carrying its full path.
struct Walker<'p> {
    index_path: &'p IndexPath,
    undefined_path: String,
    terms: Vec<IndexTerm>,
    has_array_values: bool,
}

impl<'p> Walker<'p> {
    fn new(index_path: &'p IndexPath) -> Self {
        let undefined_path = if index_path.wildcard {
            index_path.path.clone()
        } else {
            String::new()
        };
        Walker {
            index_path,
            undefined_path,
            terms: Vec::new(),
            has_array_values: false,
        }
    }

    fn walk_root(&mut self, doc: &Document) {
        if self.index_path.path.is_empty() {
            // `$**` covers every top-level field but `_id`
            for (key, value) in doc {
                if key != "_id" {
                    self.expand(value, key);
                }
            }
            return;
        }
        let path = self.index_path.path.clone();
        let segments: Vec<&str> = path.split('.').collect();
        self.walk_document(doc, &segments, "", false);
    }

    fn walk(&mut self, value: &Bson, segments: &[&str], path: &str, in_array: bool) {
        if segments.is_empty() {
            self.terminal(value, path);
            return;
        }
        match value {
            Bson::Document(doc) => self.walk_document(doc, segments, path, in_array),
            Bson::Array(items) => {
                self.has_array_values = true;
                if items.is_empty() {
                    self.missing(true);
                    return;
                }
                let (seg, rest) = (segments[0], &segments[1..]);
                if let Some(item) = seg.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    self.walk(item, rest, &join(path, seg), true);
                }
                for item in items {
                    match item {
                        Bson::Document(doc) => self.walk_document(doc, segments, path, true),
                        _ => self.missing(true),
                    }
                }
            }
            _ => self.missing(in_array),
        }
    }

    fn walk_document(&mut self, doc: &Document, segments: &[&str], path: &str, in_array: bool) {
        let Some((seg, rest)) = segments.split_first() else {
            return;
        };
        match doc.get(*seg) {
            Some(next) => self.walk(next, rest, &join(path, seg), in_array),
            None => self.missing(in_array),
        }
    }

    fn terminal(&mut self, value: &Bson, path: &str) {
        if self.index_path.wildcard {
            self.expand(value, path);
            return;
        }
        match value {
            Bson::Array(items) => {
                self.has_array_values = true;
                if items.is_empty() {
                    self.missing(true);
                }
                for item in items {
                    self.terms.push(IndexTerm::new("", item.clone()));
                }
            }
            other => self.terms.push(IndexTerm::new("", other.clone())),
        }
    }

    fn expand(&mut self, value: &Bson, path: &str) {
        match value {
            Bson::Document(doc) if !doc.is_empty() => {
                for (key, child) in doc {
                    self.expand(child, &join(path, key));
                }
            }
            Bson::Array(items) if !items.is_empty() => {
                self.has_array_values = true;
                for item in items {
                    match item {
                        Bson::Document(_) => self.expand(item, path),
                        other => self.terms.push(IndexTerm::new(path, other.clone())),
                    }
                }
            }
            other => self.terms.push(IndexTerm::new(path, other.clone())),
        }
    }

    fn missing(&mut self, in_array: bool) {
        let path = self.undefined_path.clone();
        self.terms.push(if in_array {
            IndexTerm::maybe_undefined(path)
        } else {
            IndexTerm::undefined(path)
        });
    }
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}.{segment}")
    }
}

fn root_entry(term: &IndexTerm) -> Result<Vec<u8>> {
    serialize_composite(&[term.serialize()]).map_err(term_error)
}

pub(crate) fn term_error(err: docdb_bson::TermError) -> Error {
    Error::location(17280, format!("index key too large to index: {err}"))
}

/// Every combination of one term per column, first column varying fastest.
pub(crate) fn cartesian_product(sets: &[&[Vec<u8>]]) -> Result<Vec<Vec<u8>>> {
    let total: usize = sets.iter().map(|s| s.len()).product();
    let mut out = Vec::with_capacity(total);
    let mut row: Vec<&[u8]> = Vec::with_capacity(sets.len());
    for i in 0..total {
        row.clear();
        let mut rem = i;
        for set in sets {
            row.push(&set[rem % set.len()]);
            rem /= set.len();
        }
        out.push(serialize_composite(&row).map_err(term_error)?);
    }
    Ok(out)
}
