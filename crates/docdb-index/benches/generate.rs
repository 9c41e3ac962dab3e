use bson::{Document, doc};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use docdb_index::{
    CompositeOpClass, CompositeQuery, IndexConfig, IndexDefinition, IndexQuery, MemoryIndex,
    TermGenerator,
};
use docdb_query::{Operator, QueryPredicate};

fn definition(key: Document) -> IndexDefinition {
    IndexDefinition::parse(&doc! { "key": key }).expect("valid index")
}

fn bench_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("index/generate");
    let config = IndexConfig::default();
    let cases = [
        ("scalar", doc! { "a": 1, "b": "x" }, doc! { "a": 1, "b": 1 }),
        (
            "array_product",
            doc! { "a": [1, 2, 3, 4], "b": ["w", "x", "y", "z"] },
            doc! { "a": 1, "b": 1 },
        ),
        (
            "nested",
            doc! { "a": [{ "b": 1, "c": 2 }, { "b": 3, "c": 4 }, { "b": 5, "c": 6 }] },
            doc! { "a.b": 1, "a.c": 1 },
        ),
        (
            "wildcard",
            doc! { "x": 1, "y": { "z": [1, 2], "w": "q" }, "v": true },
            doc! { "$**": 1 },
        ),
    ];
    for (name, document, key) in cases {
        let def = definition(key);
        let generator = TermGenerator::new(&def.spec, &config, false);
        group.bench_with_input(BenchmarkId::from_parameter(name), &document, |b, d| {
            b.iter(|| generator.generate(d))
        });
    }
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut index = MemoryIndex::new(CompositeOpClass::shared(
        definition(doc! { "a": 1, "b": 1 }),
        IndexConfig::default(),
    ));
    for i in 0..2_000u64 {
        let doc = doc! { "a": (i % 20) as i32, "b": (i / 20) as i32 };
        index.insert(i, &doc).expect("insert");
    }
    let query = IndexQuery::Composite(CompositeQuery::new(vec![
        QueryPredicate::new("a", Operator::Eq, bson::Bson::Int32(7)),
        QueryPredicate::new("b", Operator::Gte, bson::Bson::Int32(50)),
    ]));
    c.bench_function("index/scan_eq_range", |b| b.iter(|| index.scan(&query)));
}

criterion_group!(benches, bench_generate, bench_scan);
criterion_main!(benches);
