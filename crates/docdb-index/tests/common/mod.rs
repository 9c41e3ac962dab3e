#![allow(dead_code)]

use bson::{Bson, Document, doc};
use docdb_index::{CompositeOpClass, CompositeQuery, IndexConfig, IndexDefinition, IndexQuery, MemoryIndex};
use docdb_query::{matches, parse_filter};
use rand::Rng;
use rand::rngs::StdRng;

pub fn memory_index(key: Document, config: IndexConfig) -> MemoryIndex {
    memory_index_from(doc! { "key": key }, config)
}

/// Index over a full `{key, ...}` definition document.
pub fn memory_index_from(definition: Document, config: IndexConfig) -> MemoryIndex {
    let definition = IndexDefinition::parse(&definition).expect("valid index");
    MemoryIndex::new(CompositeOpClass::shared(definition, config))
}

pub fn load(index: &mut MemoryIndex, docs: &[Document]) {
    for (id, doc) in docs.iter().enumerate() {
        index.insert(id as u64, doc).expect("insert");
    }
}

/// The composite query an index scan runs for a filter's conjuncts.
pub fn index_query(filter: &Document) -> IndexQuery {
    let expr = parse_filter(filter).expect("valid filter");
    let predicates = expr.conjunct_predicates().into_iter().cloned().collect();
    IndexQuery::Composite(CompositeQuery::new(predicates))
}

/// Documents the index returns for `filter`, after rechecking the
/// candidates that ask for it. Conjuncts on paths the index does not
/// cover are left to the recheck.
pub fn index_results(index: &MemoryIndex, docs: &[Document], filter: &Document) -> Vec<u64> {
    let expr = parse_filter(filter).expect("valid filter");
    let spec = &index.opclass().options().spec;
    let conjuncts = expr.conjunct_predicates();
    let predicates: Vec<_> = conjuncts
        .iter()
        .filter(|p| spec.column_for(&p.path).is_some())
        .map(|p| (*p).clone())
        .collect();
    let covered = predicates.len() == conjuncts.len();
    let output = index
        .scan(&IndexQuery::Composite(CompositeQuery::new(predicates)))
        .expect("scan");
    let mut ids: Vec<u64> = output
        .candidates
        .iter()
        .filter(|c| (covered && !c.recheck) || matches(&expr, &docs[c.doc as usize]))
        .map(|c| c.doc)
        .collect();
    ids.sort_unstable();
    ids
}

pub fn collection_scan(docs: &[Document], filter: &Document) -> Vec<u64> {
    let expr = parse_filter(filter).expect("valid filter");
    (0..docs.len() as u64)
        .filter(|id| matches(&expr, &docs[*id as usize]))
        .collect()
}

pub fn random_int_value(rng: &mut StdRng) -> Bson {
    match rng.gen_range(0..6) {
        0 => Bson::Array(Vec::new()),
        1 | 2 => Bson::Array(
            (0..rng.gen_range(1..4))
                .map(|_| Bson::Int32(rng.gen_range(0..6)))
                .collect(),
        ),
        3 => Bson::Double(f64::from(rng.gen_range(0..6))),
        _ => Bson::Int32(rng.gen_range(0..6)),
    }
}

/// A document with optional `a` and `b` holding small integers or arrays
/// of them.
pub fn random_document(rng: &mut StdRng) -> Document {
    let mut doc = Document::new();
    for field in ["a", "b"] {
        if rng.gen_bool(0.85) {
            doc.insert(field, random_int_value(rng));
        }
    }
    doc
}

pub fn random_filter(rng: &mut StdRng) -> Document {
    let mut filter = Document::new();
    for field in ["a", "b"] {
        let n = rng.gen_range(0..6);
        let condition: Bson = match rng.gen_range(0..6) {
            0 => continue,
            1 => Bson::Int32(n),
            2 => doc! { "$gt": n }.into(),
            3 => doc! { "$lte": n }.into(),
            4 => doc! { "$gte": n, "$lt": n + 2 }.into(),
            _ => doc! { "$in": [n, (n + 3) % 6] }.into(),
        };
        filter.insert(field, condition);
    }
    filter
}

/// `{a: [{x, y}, ...]}` or `{a: {x, y}}`, with `x`/`y` sometimes missing.
pub fn random_subdocument_array(rng: &mut StdRng) -> Document {
    let element = |rng: &mut StdRng| {
        let mut sub = Document::new();
        for field in ["x", "y"] {
            if rng.gen_bool(0.9) {
                sub.insert(field, Bson::Int32(rng.gen_range(0..5)));
            }
        }
        Bson::Document(sub)
    };
    let a = match rng.gen_range(0..4) {
        0 => element(rng),
        _ => Bson::Array((0..rng.gen_range(0..4)).map(|_| element(rng)).collect()),
    };
    doc! { "a": a }
}

/// Conditions on `a.x` and `a.y`.
pub fn random_subdocument_filter(rng: &mut StdRng) -> Document {
    let mut filter = Document::new();
    for field in ["a.x", "a.y"] {
        let n = rng.gen_range(0..5);
        let condition: Bson = match rng.gen_range(0..5) {
            0 => continue,
            1 => Bson::Int32(n),
            2 => doc! { "$gte": n }.into(),
            3 => doc! { "$lt": n }.into(),
            _ => doc! { "$in": [n, (n + 2) % 5] }.into(),
        };
        filter.insert(field, condition);
    }
    filter
}
