use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use docdb_store::{MemoryStore, Store, Transaction};

const TABLE: &str = "bench";

fn generate_rows(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..n)
        .map(|i| {
            let key = format!("doc:{i:08}").into_bytes();
            let value = format!("{{\"_id\":{i},\"padding\":\"{}\"}}", "x".repeat(120)).into_bytes();
            (key, value)
        })
        .collect()
}

fn seeded_store(n: usize) -> MemoryStore {
    let store = MemoryStore::new();
    store.create_table(TABLE).unwrap();
    let rows = generate_rows(n);
    let txn = store.begin(false).unwrap();
    let table = txn.table(TABLE).unwrap();
    let refs: Vec<(&[u8], &[u8])> = rows.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
    txn.put_batch(&table, &refs).unwrap();
    txn.commit().unwrap();
    store
}

// ── Put ─────────────────────────────────────────────────────

fn bench_put_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory/put_batch");
    for n in [100, 1_000] {
        let store = MemoryStore::new();
        store.create_table(TABLE).unwrap();
        let rows = generate_rows(n);

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter_batched(
                || rows.clone(),
                |rows| {
                    let txn = store.begin(false).unwrap();
                    let table = txn.table(TABLE).unwrap();
                    let refs: Vec<(&[u8], &[u8])> =
                        rows.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
                    txn.put_batch(&table, &refs).unwrap();
                    txn.rollback().unwrap();
                },
                BatchSize::PerIteration,
            )
        });
    }
    group.finish();
}

// ── Scan ────────────────────────────────────────────────────

fn bench_scan_prefix(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory/scan_prefix");
    for n in [1_000, 10_000] {
        let store = seeded_store(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let txn = store.begin(true).unwrap();
                let table = txn.table(TABLE).unwrap();
                let rows = txn.scan_prefix(&table, b"doc:").unwrap().count();
                rows
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_put_batch, bench_scan_prefix);
criterion_main!(benches);
