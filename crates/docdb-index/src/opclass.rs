//! The operator class a storage layer drives: value extraction for
//! inserts, query extraction for scans, and the per-entry callbacks.

use std::sync::Arc;

use bson::{Bson, Document};
use docdb_bson::{CompositeTermRef, IndexTerm, RootMetadata, serialize_composite};
use docdb_query::{Error, Interrupt, Operator, QueryPredicate, Result};
use tracing::debug;

use crate::config::IndexConfig;
use crate::generator::{GeneratedTerms, TermGenerator, term_error};
use crate::scan::{self, Consistency, PartialMatch};
use crate::solver::{BoundsSolver, QueryKey, QueryKeys, QueryMetaInfo, RunData, SolveOptions, decode_error};
use crate::spec::IndexDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    CompositeQuery,
    UniqueEqual,
    OrderBy,
    OrderByReverse,
    IsMultikey,
    HasTruncatedTerms,
    HasCorrelatedReducedTerms,
    /// Rebuild the indexed columns as a document from the entry alone.
    IndexOnlyProjection,
}

impl Strategy {
    fn root_marker(self) -> Option<IndexTerm> {
        match self {
            Strategy::IsMultikey => Some(IndexTerm::root(RootMetadata::MultiKey)),
            Strategy::HasTruncatedTerms => Some(IndexTerm::root_truncated()),
            Strategy::HasCorrelatedReducedTerms => {
                Some(IndexTerm::root(RootMetadata::CorrelatedRootArray))
            }
            _ => None,
        }
    }
}

/// A conjunction of predicates against one composite index.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeQuery {
    pub predicates: Vec<QueryPredicate>,
    pub multikey: bool,
    pub ordered: bool,
    pub correlated_reduced: bool,
    pub backward: bool,
}

impl CompositeQuery {
    pub fn new(predicates: Vec<QueryPredicate>) -> Self {
        CompositeQuery {
            predicates,
            multikey: true,
            ordered: false,
            correlated_reduced: false,
            backward: false,
        }
    }

    /// Parse `{q: [{<path>: <value>, op: "$gt"}, ...], m, or, cr, db}`.
    pub fn from_document(doc: &Document) -> Result<CompositeQuery> {
        let mut query = CompositeQuery::new(Vec::new());
        for (key, value) in doc {
            match key.as_str() {
                "q" => {
                    let Bson::Array(items) = value else {
                        return Err(Error::bad_value("composite query 'q' must be an array"));
                    };
                    for item in items {
                        let Bson::Document(item) = item else {
                            return Err(Error::bad_value(
                                "composite query terms must be documents",
                            ));
                        };
                        query.predicates.push(parse_query_term(item)?);
                    }
                }
                "m" => query.multikey = flag(value),
                "or" => query.ordered = flag(value),
                "cr" => query.correlated_reduced = flag(value),
                "db" => query.backward = flag(value),
                other => {
                    return Err(Error::bad_value(format!(
                        "Unsupported composite query spec field: {other}"
                    )));
                }
            }
        }
        Ok(query)
    }

    pub fn to_document(&self) -> Document {
        let terms: Vec<Bson> = self
            .predicates
            .iter()
            .map(|p| {
                let mut term = Document::new();
                term.insert(p.path.clone(), p.value.clone());
                term.insert("op", p.operator.name());
                Bson::Document(term)
            })
            .collect();
        let mut doc = Document::new();
        doc.insert("q", terms);
        doc.insert("m", self.multikey);
        if self.ordered {
            doc.insert("or", true);
        }
        if self.correlated_reduced {
            doc.insert("cr", true);
        }
        if self.backward {
            doc.insert("db", true);
        }
        doc
    }
}

fn flag(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        _ => false,
    }
}

fn parse_query_term(term: &Document) -> Result<QueryPredicate> {
    let mut operator = None;
    let mut binding = None;
    for (key, value) in term {
        if key == "op" {
            let name = value
                .as_str()
                .ok_or_else(|| Error::bad_value("composite query 'op' must be a string"))?;
            operator = Some(parse_operator(name).ok_or_else(|| {
                Error::bad_value(format!("unknown composite query operator {name}"))
            })?);
        } else if binding.replace((key.clone(), value.clone())).is_some() {
            return Err(Error::bad_value(
                "composite query terms must name exactly one path",
            ));
        }
    }
    let (path, value) =
        binding.ok_or_else(|| Error::bad_value("composite query term has no path"))?;
    Ok(QueryPredicate::new(path, operator.unwrap_or(Operator::Eq), value))
}

fn parse_operator(name: &str) -> Option<Operator> {
    Operator::from_name(name).or_else(|| {
        [
            Operator::NotGt,
            Operator::NotGte,
            Operator::NotLt,
            Operator::NotLte,
            Operator::OrderBy,
            Operator::OrderByReverse,
        ]
        .into_iter()
        .find(|op| op.name() == name)
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    Composite(CompositeQuery),
    Predicate(QueryPredicate),
    /// Probe for entries equal to those of a document being inserted.
    UniqueEqual(Document),
    IsMultikey,
    HasTruncatedTerms,
    HasCorrelatedReducedTerms,
}

#[derive(Debug, Clone)]
pub struct ExtractedQuery {
    pub keys: Vec<QueryKey>,
    pub meta: QueryMetaInfo,
    pub strategy: Strategy,
}

pub trait IndexOpClass: Send + Sync {
    fn options(&self) -> &IndexDefinition;

    fn extract_value(&self, doc: &Document) -> Result<GeneratedTerms>;

    fn extract_query(&self, query: &IndexQuery) -> Result<ExtractedQuery>;

    fn compare_partial(
        &self,
        entry: &[u8],
        key: &QueryKey,
        strategy: Strategy,
    ) -> Result<PartialMatch>;

    fn consistent(&self, checks: &[bool], strategy: Strategy, meta: &QueryMetaInfo)
    -> Consistency;

    fn index_term_transform(&self, entry: &[u8], key: &QueryKey) -> Result<Option<Vec<u8>>>;

    fn ordering_transform(
        &self,
        entry: &[u8],
        strategy: Strategy,
        sort_path: &str,
    ) -> Result<Document>;
}

pub type SharedOpClass = Arc<dyn IndexOpClass>;

/// Operator class for composite, single-path and wildcard indexes.
pub struct CompositeOpClass {
    definition: IndexDefinition,
    config: IndexConfig,
    interrupt: Interrupt,
}

impl CompositeOpClass {
    pub fn new(definition: IndexDefinition, config: IndexConfig) -> Self {
        CompositeOpClass {
            definition,
            config,
            interrupt: Interrupt::default(),
        }
    }

    /// Poll `interrupt` on every entry a scan compares.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn shared(definition: IndexDefinition, config: IndexConfig) -> SharedOpClass {
        Arc::new(CompositeOpClass::new(definition, config))
    }

    fn reduced_terms(&self) -> bool {
        self.definition.enable_reduced_correlated_terms && self.config.enable_reduced_correlated_terms
    }

    fn generator(&self) -> TermGenerator<'_> {
        TermGenerator::new(&self.definition.spec, &self.config, self.reduced_terms())
    }

    fn solver(&self) -> BoundsSolver<'_> {
        BoundsSolver::new(&self.definition.spec, &self.config, self.reduced_terms())
    }

    fn metadata_query(&self, strategy: Strategy, marker: IndexTerm) -> Result<ExtractedQuery> {
        let term = serialize_composite(&[marker.serialize()]).map_err(term_error)?;
        Ok(ExtractedQuery {
            keys: vec![QueryKey {
                term,
                partial_match: true,
                run: RunData::default(),
            }],
            meta: QueryMetaInfo {
                num_paths: self.definition.spec.len(),
                ..QueryMetaInfo::default()
            },
            strategy,
        })
    }

    /// One key per entry the document would produce. Entries without
    /// null or missing values are probed exactly; the rest become ranges
    /// so they also meet stored nulls and missing paths.
    fn unique_query(&self, doc: &Document) -> Result<ExtractedQuery> {
        let generated = self.generator().generate(doc)?;
        let mut meta = QueryMetaInfo {
            num_paths: self.definition.spec.len(),
            requires_runtime_recheck: generated.has_truncated_terms,
            ..QueryMetaInfo::default()
        };
        let mut keys = Vec::with_capacity(generated.terms.len());
        for entry in generated.terms {
            let terms = CompositeTermRef::new(&entry).decode().map_err(decode_error)?;
            let nullish = terms
                .iter()
                .any(|t| t.is_maybe_undefined() || t.value == Bson::Null);
            if !nullish {
                keys.push(QueryKey {
                    term: entry,
                    partial_match: false,
                    run: RunData::default(),
                });
                continue;
            }
            meta.requires_runtime_recheck = true;
            let predicates: Vec<QueryPredicate> = self
                .definition
                .spec
                .paths()
                .iter()
                .zip(&terms)
                .filter(|(_, term)| !term.truncated)
                .map(|(index_path, term)| {
                    let path = if index_path.wildcard {
                        term.path.clone()
                    } else {
                        index_path.path.clone()
                    };
                    let value = if term.is_maybe_undefined() {
                        Bson::Null
                    } else {
                        term.value.clone()
                    };
                    QueryPredicate::new(path, Operator::Eq, value)
                })
                .collect();
            let QueryKeys { keys: solved, .. } = self.solver().solve(
                &predicates,
                SolveOptions {
                    multikey: false,
                    ..SolveOptions::default()
                },
            )?;
            keys.extend(solved.into_iter().filter(|k| k.partial_match));
        }
        Ok(ExtractedQuery {
            keys,
            meta,
            strategy: Strategy::UniqueEqual,
        })
    }
}

impl IndexOpClass for CompositeOpClass {
    fn options(&self) -> &IndexDefinition {
        &self.definition
    }

    fn extract_value(&self, doc: &Document) -> Result<GeneratedTerms> {
        self.generator().generate(doc)
    }

    fn extract_query(&self, query: &IndexQuery) -> Result<ExtractedQuery> {
        let extracted = match query {
            IndexQuery::Composite(composite) => {
                let QueryKeys { keys, meta } = self.solver().solve(
                    &composite.predicates,
                    SolveOptions {
                        multikey: composite.multikey,
                        ordered: composite.ordered,
                        // reduced entries only pair values from one array
                        // element, so secondary columns are recheck-only
                        correlated_reduced: composite.correlated_reduced || self.reduced_terms(),
                        backward: composite.backward,
                    },
                )?;
                ExtractedQuery {
                    keys,
                    meta,
                    strategy: Strategy::CompositeQuery,
                }
            }
            IndexQuery::Predicate(predicate) => {
                return self.extract_query(&IndexQuery::Composite(CompositeQuery::new(vec![
                    predicate.clone(),
                ])));
            }
            IndexQuery::UniqueEqual(doc) => self.unique_query(doc)?,
            IndexQuery::IsMultikey => self.metadata_query(
                Strategy::IsMultikey,
                IndexTerm::root(RootMetadata::MultiKey),
            )?,
            IndexQuery::HasTruncatedTerms => {
                self.metadata_query(Strategy::HasTruncatedTerms, IndexTerm::root_truncated())?
            }
            IndexQuery::HasCorrelatedReducedTerms => self.metadata_query(
                Strategy::HasCorrelatedReducedTerms,
                IndexTerm::root(RootMetadata::CorrelatedRootArray),
            )?,
        };
        debug!(
            index = %self.definition.name,
            strategy = ?extracted.strategy,
            keys = extracted.keys.len(),
            recheck = extracted.meta.requires_runtime_recheck,
            "extracted index query"
        );
        Ok(extracted)
    }

    fn compare_partial(
        &self,
        entry: &[u8],
        key: &QueryKey,
        strategy: Strategy,
    ) -> Result<PartialMatch> {
        self.interrupt.check()?;
        if let Some(marker) = strategy.root_marker() {
            return scan::compare_metadata(entry, &marker);
        }
        if !key.partial_match {
            return Ok(if entry == key.term.as_slice() {
                PartialMatch::Match
            } else {
                PartialMatch::Continue
            });
        }
        scan::compare_partial(entry, key)
    }

    fn consistent(
        &self,
        checks: &[bool],
        strategy: Strategy,
        meta: &QueryMetaInfo,
    ) -> Consistency {
        match strategy {
            Strategy::IsMultikey
            | Strategy::HasTruncatedTerms
            | Strategy::HasCorrelatedReducedTerms => Consistency {
                matches: checks.first().copied().unwrap_or(false),
                recheck: false,
            },
            Strategy::UniqueEqual => Consistency {
                matches: checks.iter().any(|c| *c),
                recheck: meta.requires_runtime_recheck,
            },
            _ => scan::consistent(checks, meta),
        }
    }

    fn index_term_transform(&self, entry: &[u8], key: &QueryKey) -> Result<Option<Vec<u8>>> {
        if !key.partial_match {
            return Ok(None);
        }
        scan::index_term_transform(entry, key)
    }

    fn ordering_transform(
        &self,
        entry: &[u8],
        strategy: Strategy,
        sort_path: &str,
    ) -> Result<Document> {
        match strategy {
            Strategy::IndexOnlyProjection => scan::project_entry(&self.definition.spec, entry),
            Strategy::OrderBy => {
                scan::order_by_document(&self.definition.spec, entry, sort_path, false)
            }
            Strategy::OrderByReverse => {
                scan::order_by_document(&self.definition.spec, entry, sort_path, true)
            }
            other => Err(Error::internal(format!(
                "strategy {other:?} does not support ordering"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn composite_query_document_round_trips_flags() {
        let spec = doc! {
            "q": [{ "a": 1, "op": "$gt" }, { "b": "x" }, { "c": 5, "op": "$not.$lt" }],
            "m": false,
            "db": true,
        };
        let query = CompositeQuery::from_document(&spec).unwrap();
        assert_eq!(query.predicates.len(), 3);
        assert_eq!(query.predicates[0].operator, Operator::Gt);
        assert_eq!(query.predicates[1].operator, Operator::Eq);
        assert_eq!(query.predicates[2].operator, Operator::NotLt);
        assert!(!query.multikey);
        assert!(query.backward);
        assert_eq!(CompositeQuery::from_document(&query.to_document()).unwrap(), query);

        assert!(CompositeQuery::from_document(&doc! { "zz": 1 }).is_err());
        assert!(CompositeQuery::from_document(&doc! { "q": [{ "a": 1, "b": 2 }] }).is_err());
    }

    #[test]
    fn metadata_strategies_read_the_first_check() {
        let def = IndexDefinition::parse(&doc! { "key": { "a": 1 } }).unwrap();
        let opclass = CompositeOpClass::new(def, IndexConfig::default());
        let query = opclass.extract_query(&IndexQuery::IsMultikey).unwrap();
        assert_eq!(query.strategy, Strategy::IsMultikey);
        let result = opclass.consistent(&[true], query.strategy, &query.meta);
        assert!(result.matches && !result.recheck);

        let multikey = serialize_composite(&[IndexTerm::root(RootMetadata::MultiKey).serialize()])
            .unwrap();
        let value = serialize_composite(&[IndexTerm::new("", Bson::Int32(1)).serialize()]).unwrap();
        assert_eq!(
            opclass
                .compare_partial(&multikey, &query.keys[0], query.strategy)
                .unwrap(),
            PartialMatch::Match
        );
        assert_eq!(
            opclass
                .compare_partial(&value, &query.keys[0], query.strategy)
                .unwrap(),
            PartialMatch::Stop
        );
    }

    #[test]
    fn unique_probe_ranges_over_missing_values() {
        let def = IndexDefinition::parse(&doc! { "key": { "a": 1, "b": 1 }, "unique": true })
            .unwrap();
        let opclass = CompositeOpClass::new(def, IndexConfig::default());
        let exact = opclass
            .extract_query(&IndexQuery::UniqueEqual(doc! { "a": 1, "b": 2 }))
            .unwrap();
        assert_eq!(exact.keys.len(), 1);
        assert!(!exact.keys[0].partial_match);
        assert!(!exact.meta.requires_runtime_recheck);

        let missing = opclass
            .extract_query(&IndexQuery::UniqueEqual(doc! { "a": 1 }))
            .unwrap();
        assert_eq!(missing.keys.len(), 1);
        assert!(missing.keys[0].partial_match);
        assert!(missing.meta.requires_runtime_recheck);
    }
}
