mod common;

use bson::{Document, doc};
use docdb_index::{IndexConfig, MemoryIndex};
use rand::SeedableRng;
use rand::rngs::StdRng;

use common::{
    collection_scan, index_results, load, memory_index, memory_index_from, random_document,
    random_filter, random_subdocument_array, random_subdocument_filter,
};

fn check_against_collection_scan(
    index: MemoryIndex,
    seed: u64,
    document: fn(&mut StdRng) -> Document,
    filter: fn(&mut StdRng) -> Document,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let docs: Vec<_> = (0..120).map(|_| document(&mut rng)).collect();
    let mut index = index;
    load(&mut index, &docs);

    for _ in 0..200 {
        let filter = filter(&mut rng);
        assert_eq!(
            index_results(&index, &docs, &filter),
            collection_scan(&docs, &filter),
            "filter {filter:?}"
        );
    }
}

fn flat(key: Document, seed: u64) {
    check_against_collection_scan(
        memory_index(key, IndexConfig::default()),
        seed,
        random_document,
        random_filter,
    );
}

#[test]
fn single_path_index_agrees_with_collection_scan() {
    flat(doc! { "a": 1 }, 1);
}

#[test]
fn composite_index_agrees_with_collection_scan() {
    flat(doc! { "a": 1, "b": 1 }, 2);
}

#[test]
fn mixed_direction_index_agrees_with_collection_scan() {
    flat(doc! { "a": -1, "b": 1 }, 3);
}

#[test]
fn wildcard_index_agrees_with_collection_scan() {
    flat(doc! { "$**": 1 }, 4);
}

#[test]
fn composite_over_subdocument_arrays_agrees_with_collection_scan() {
    check_against_collection_scan(
        memory_index(doc! { "a.x": 1, "a.y": 1 }, IndexConfig::default()),
        5,
        random_subdocument_array,
        random_subdocument_filter,
    );
}

#[test]
fn reduced_correlated_index_agrees_with_collection_scan() {
    let config = IndexConfig {
        enable_reduced_correlated_terms: true,
        ..IndexConfig::default()
    };
    let definition = doc! {
        "key": { "a.x": 1, "a.y": 1 },
        "enableReducedCorrelatedTerms": true,
    };
    check_against_collection_scan(
        memory_index_from(definition, config),
        6,
        random_subdocument_array,
        random_subdocument_filter,
    );
}
