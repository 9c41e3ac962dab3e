//! An in-memory index driving an [`IndexOpClass`] the way a storage
//! engine would: sorted entries, seeks, and per-key partial scans.

use std::cmp::Ordering;
use std::collections::HashMap;

use bson::Document;
use docdb_bson::{CompositeTermRef, IndexTerm, compare_terms};
use docdb_query::{Error, ErrorCode, Result};
use tracing::{debug, trace};

use crate::opclass::{IndexQuery, SharedOpClass, Strategy};
use crate::scan::PartialMatch;
use crate::solver::{decode_error, is_highest, is_lowest};

pub type DocId = u64;

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    terms: Vec<IndexTerm>,
    metadata: bool,
    doc: DocId,
}

/// One `compare_partial` call made during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStep {
    pub key: usize,
    pub doc: DocId,
    pub result: PartialMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub doc: DocId,
    pub recheck: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    /// Matching documents in the order the scan first reached them.
    pub candidates: Vec<Candidate>,
    pub steps: Vec<ScanStep>,
}

impl ScanOutput {
    pub fn doc_ids(&self) -> Vec<DocId> {
        self.candidates.iter().map(|c| c.doc).collect()
    }
}

pub struct MemoryIndex {
    opclass: SharedOpClass,
    entries: Vec<Entry>,
}

impl MemoryIndex {
    pub fn new(opclass: SharedOpClass) -> Self {
        MemoryIndex {
            opclass,
            entries: Vec::new(),
        }
    }

    pub fn opclass(&self) -> &SharedOpClass {
        &self.opclass
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, doc_id: DocId, doc: &Document) -> Result<()> {
        if self.opclass.options().unique {
            let probe = self.scan(&IndexQuery::UniqueEqual(doc.clone()))?;
            if probe.candidates.iter().any(|c| c.doc != doc_id) {
                return Err(Error::new(
                    ErrorCode::DuplicateKey,
                    format!(
                        "E11000 duplicate key error index: {}",
                        self.opclass.options().name
                    ),
                ));
            }
        }
        let generated = self.opclass.extract_value(doc)?;
        trace!(
            doc = doc_id,
            entries = generated.terms.len(),
            metadata = generated.metadata.len(),
            "indexing document"
        );
        for bytes in generated.into_entries() {
            let view = CompositeTermRef::new(&bytes);
            let metadata = view.is_root_metadata().map_err(decode_error)?;
            let terms = view.decode().map_err(decode_error)?;
            let entry = Entry {
                bytes,
                terms,
                metadata,
                doc: doc_id,
            };
            let pos = self
                .entries
                .partition_point(|e| entry_order(e, &entry) != Ordering::Greater);
            self.entries.insert(pos, entry);
        }
        Ok(())
    }

    pub fn remove(&mut self, doc_id: DocId) {
        self.entries.retain(|e| e.doc != doc_id);
    }

    pub fn scan(&self, query: &IndexQuery) -> Result<ScanOutput> {
        let extracted = self.opclass.extract_query(query)?;
        let strategy = extracted.strategy;
        let num_keys = extracted.keys.len();
        let mut checks: HashMap<DocId, Vec<bool>> = HashMap::new();
        let mut order: Vec<DocId> = Vec::new();
        let mut steps = Vec::new();

        for (key_index, key) in extracted.keys.iter().enumerate() {
            let mut hit = |doc: DocId| {
                let bits = checks.entry(doc).or_insert_with(|| {
                    order.push(doc);
                    vec![false; num_keys]
                });
                bits[key_index] = true;
            };

            if !key.partial_match {
                for entry in self.entries.iter().filter(|e| e.bytes == key.term) {
                    hit(entry.doc);
                }
                continue;
            }

            let backward = key.run.backward;
            let key_terms = CompositeTermRef::new(&key.term)
                .decode()
                .map_err(decode_error)?;
            let mut pos = if matches!(
                strategy,
                Strategy::IsMultikey | Strategy::HasTruncatedTerms | Strategy::HasCorrelatedReducedTerms
            ) {
                Some(0)
            } else {
                self.seek(&key_terms, backward)
            };

            while let Some(current) = pos.filter(|p| *p < self.entries.len()) {
                let entry = &self.entries[current];
                let result = self
                    .opclass
                    .compare_partial(&entry.bytes, key, strategy)?;
                steps.push(ScanStep {
                    key: key_index,
                    doc: entry.doc,
                    result,
                });
                pos = match result {
                    PartialMatch::Match => {
                        hit(entry.doc);
                        step(current, backward)
                    }
                    PartialMatch::Continue => step(current, backward),
                    PartialMatch::Stop => None,
                    PartialMatch::Skip(_) => {
                        match self.opclass.index_term_transform(&entry.bytes, key)? {
                            Some(seek) => {
                                let seek_terms = CompositeTermRef::new(&seek)
                                    .decode()
                                    .map_err(decode_error)?;
                                // never move backwards
                                self.seek(&seek_terms, false).map(|p| p.max(current + 1))
                            }
                            None => step(current, backward),
                        }
                    }
                };
            }
        }

        let mut candidates = Vec::new();
        for doc in order {
            let Some(bits) = checks.get(&doc) else {
                continue;
            };
            let verdict = self.opclass.consistent(bits, strategy, &extracted.meta);
            if verdict.matches {
                candidates.push(Candidate {
                    doc,
                    recheck: verdict.recheck,
                });
            }
        }
        debug!(
            index = %self.opclass.options().name,
            keys = num_keys,
            steps = steps.len(),
            candidates = candidates.len(),
            "index scan finished"
        );
        Ok(ScanOutput { candidates, steps })
    }

    /// Sort keys for the entries a scan matched, in scan order.
    pub fn ordered_keys(
        &self,
        query: &IndexQuery,
        strategy: Strategy,
        sort_path: &str,
    ) -> Result<Vec<(DocId, Document)>> {
        let output = self.scan(query)?;
        let mut out = Vec::with_capacity(output.candidates.len());
        for candidate in output.candidates {
            let Some(entry) = self
                .entries
                .iter()
                .find(|e| e.doc == candidate.doc && !e.metadata)
            else {
                continue;
            };
            out.push((
                candidate.doc,
                self.opclass
                    .ordering_transform(&entry.bytes, strategy, sort_path)?,
            ));
        }
        Ok(out)
    }

    /// First entry at or after `key` (forward), or last entry at or before
    /// it (backward). Metadata entries sort before every value entry.
    fn seek(&self, key: &[IndexTerm], backward: bool) -> Option<usize> {
        if backward {
            let end = self
                .entries
                .partition_point(|e| e.metadata || compare_to_key(&e.terms, key) != Ordering::Greater);
            end.checked_sub(1)
        } else {
            Some(
                self.entries
                    .partition_point(|e| e.metadata || compare_to_key(&e.terms, key) == Ordering::Less),
            )
        }
    }
}

fn step(current: usize, backward: bool) -> Option<usize> {
    if backward {
        current.checked_sub(1)
    } else {
        Some(current + 1)
    }
}

fn entry_order(a: &Entry, b: &Entry) -> Ordering {
    b.metadata
        .cmp(&a.metadata)
        .then_with(|| {
            a.terms
                .iter()
                .zip(&b.terms)
                .map(|(x, y)| compare_terms(x, y))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        })
        .then(a.terms.len().cmp(&b.terms.len()))
        .then(a.doc.cmp(&b.doc))
}

/// Order of an entry against a seek key whose elements may be the
/// lowest/highest sentinels.
fn compare_to_key(entry: &[IndexTerm], key: &[IndexTerm]) -> Ordering {
    for (term, bound) in entry.iter().zip(key) {
        if is_lowest(bound) {
            return Ordering::Greater;
        }
        if is_highest(bound) {
            return Ordering::Less;
        }
        match compare_terms(term, bound) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
