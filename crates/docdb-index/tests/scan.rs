mod common;

use bson::{Bson, doc};
use docdb_index::{CompositeQuery, IndexConfig, IndexQuery, PartialMatch};
use docdb_query::{Operator, QueryPredicate};

use common::{index_results, load, memory_index};

#[test]
fn equality_prefix_stops_after_range() {
    let docs = vec![
        doc! { "a": 1, "b": 10 },
        doc! { "a": 1, "b": 20 },
        doc! { "a": 2, "b": 10 },
    ];
    let mut index = memory_index(doc! { "a": 1, "b": 1 }, IndexConfig::default());
    load(&mut index, &docs);

    let output = index
        .scan(&common::index_query(&doc! { "a": 1, "b": { "$gte": 15 } }))
        .unwrap();

    let trace: Vec<(u64, PartialMatch)> = output
        .steps
        .iter()
        .filter(|s| s.key == 0)
        .map(|s| (s.doc, s.result))
        .collect();
    assert_eq!(trace, vec![(1, PartialMatch::Match), (2, PartialMatch::Stop)]);
    assert_eq!(output.doc_ids(), vec![1]);
    assert!(output.candidates.iter().all(|c| !c.recheck));
}

#[test]
fn tightened_bounds_narrow_results() {
    let docs: Vec<_> = (0..10).map(|a| doc! { "a": a }).collect();
    let mut index = memory_index(doc! { "a": 1 }, IndexConfig::default());
    load(&mut index, &docs);

    let open = index_results(&index, &docs, &doc! { "a": { "$gt": 2, "$lt": 8 } });
    assert_eq!(open, vec![3, 4, 5, 6, 7]);

    let tightened = index_results(
        &index,
        &docs,
        &doc! { "a": { "$gt": 2, "$lt": 8, "$gte": 5 } },
    );
    assert_eq!(tightened, vec![5, 6, 7]);
}

#[test]
fn crossed_bounds_match_nothing() {
    let docs: Vec<_> = (0..10).map(|a| doc! { "a": a }).collect();
    let mut index = memory_index(doc! { "a": 1 }, IndexConfig::default());
    load(&mut index, &docs);

    let mut query = CompositeQuery::new(vec![
        QueryPredicate::new("a", Operator::Gt, Bson::Int32(7)),
        QueryPredicate::new("a", Operator::Lt, Bson::Int32(3)),
    ]);
    query.multikey = false;
    let extracted = index.opclass().extract_query(&IndexQuery::Composite(query.clone())).unwrap();
    assert!(extracted.keys.is_empty());

    let output = index.scan(&IndexQuery::Composite(query)).unwrap();
    assert!(output.candidates.is_empty());
}

#[test]
fn multikey_ranges_apply_per_element() {
    let docs = vec![
        doc! { "a": [1, 9] },
        doc! { "a": [5] },
        doc! { "a": 0 },
    ];
    let mut index = memory_index(doc! { "a": 1 }, IndexConfig::default());
    load(&mut index, &docs);

    // each operator may be satisfied by a different element
    let ids = index_results(&index, &docs, &doc! { "a": { "$gt": 7, "$lt": 3 } });
    assert_eq!(ids, vec![0]);
}

#[test]
fn in_list_on_leading_column() {
    let docs = vec![
        doc! { "a": 1, "b": "x" },
        doc! { "a": 2, "b": "y" },
        doc! { "a": 3, "b": "x" },
        doc! { "b": "x" },
    ];
    let mut index = memory_index(doc! { "a": 1, "b": 1 }, IndexConfig::default());
    load(&mut index, &docs);

    let ids = index_results(&index, &docs, &doc! { "a": { "$in": [1, 3] }, "b": "x" });
    assert_eq!(ids, vec![0, 2]);

    let none = index_results(&index, &docs, &doc! { "a": { "$in": [] } });
    assert!(none.is_empty());

    let nullish = index_results(&index, &docs, &doc! { "a": Bson::Null });
    assert_eq!(nullish, vec![3]);
}

#[test]
fn descending_column_orders_backward_scans() {
    let docs: Vec<_> = [4, 1, 3, 2].iter().map(|a| doc! { "a": *a }).collect();
    let mut index = memory_index(doc! { "a": -1 }, IndexConfig::default());
    load(&mut index, &docs);

    let mut query = CompositeQuery::new(vec![QueryPredicate::new(
        "a",
        Operator::Gte,
        Bson::Int32(2),
    )]);
    query.multikey = false;
    query.ordered = true;
    let forward = index.scan(&IndexQuery::Composite(query.clone())).unwrap();
    assert_eq!(forward.doc_ids(), vec![0, 2, 3]);

    query.backward = true;
    let backward = index.scan(&IndexQuery::Composite(query)).unwrap();
    assert_eq!(backward.doc_ids(), vec![3, 2, 0]);
}

#[test]
fn unique_index_rejects_duplicates() {
    let definition = docdb_index::IndexDefinition::parse(&doc! {
        "key": { "email": 1 },
        "name": "email_1",
        "unique": true,
    })
    .unwrap();
    let mut index = docdb_index::MemoryIndex::new(docdb_index::CompositeOpClass::shared(
        definition,
        IndexConfig::default(),
    ));
    index.insert(1, &doc! { "email": "a@x" }).unwrap();
    index.insert(2, &doc! { "email": "b@x" }).unwrap();

    let err = index.insert(3, &doc! { "email": "a@x" }).unwrap_err();
    assert_eq!(err.code, docdb_query::ErrorCode::DuplicateKey);
    assert!(err.message.contains("email_1"));
    assert_eq!(index.len(), 2);
}

#[test]
fn reduced_terms_find_matches_across_array_elements() {
    let docs = vec![doc! { "a": [{ "x": 3, "y": 2 }, { "x": 1, "y": 0 }] }];
    let config = IndexConfig {
        enable_reduced_correlated_terms: true,
        ..IndexConfig::default()
    };
    let mut index = common::memory_index_from(
        doc! { "key": { "a.x": 1, "a.y": 1 }, "enableReducedCorrelatedTerms": true },
        config,
    );
    load(&mut index, &docs);

    let output = index
        .scan(&common::index_query(&doc! { "a.x": 1, "a.y": { "$gte": 2 } }))
        .unwrap();

    assert_eq!(output.doc_ids(), vec![0]);
    assert!(output.candidates[0].recheck);
}

#[test]
fn huge_in_products_collapse_to_rechecked_ranges() {
    let docs: Vec<_> = (0..40)
        .map(|i| doc! { "a": i % 30, "b": (i * 7) % 30, "c": (i * 11) % 30 })
        .collect();
    let mut index = memory_index(doc! { "a": 1, "b": 1, "c": 1 }, IndexConfig::default());
    load(&mut index, &docs);

    let evens: Vec<Bson> = (0..40).step_by(2).map(Bson::Int32).collect();
    let filter = doc! { "a": { "$in": evens.clone() }, "b": { "$in": evens.clone() }, "c": { "$in": evens } };
    assert!(20 * 20 * 20 > docdb_index::MAX_SCAN_KEYS);

    let output = index.scan(&common::index_query(&filter)).unwrap();
    assert!(output.candidates.iter().all(|c| c.recheck));
    assert_eq!(
        index_results(&index, &docs, &filter),
        common::collection_scan(&docs, &filter)
    );
}

#[test]
fn cancelled_scans_stop_with_interrupted() {
    let interrupt = docdb_query::Interrupt::new();
    let definition = docdb_index::IndexDefinition::parse(&doc! { "key": { "a": 1 } }).unwrap();
    let opclass = docdb_index::CompositeOpClass::new(definition, IndexConfig::default())
        .with_interrupt(interrupt.clone());
    let mut index = docdb_index::MemoryIndex::new(std::sync::Arc::new(opclass));
    load(&mut index, &[doc! { "a": 1 }, doc! { "a": 2 }]);

    let query = common::index_query(&doc! { "a": { "$gte": 1 } });
    assert_eq!(index.scan(&query).unwrap().doc_ids(), vec![0, 1]);

    interrupt.cancel();
    let err = index.scan(&query).unwrap_err();
    assert_eq!(err.code, docdb_query::ErrorCode::Interrupted);
}
