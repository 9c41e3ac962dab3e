mod common;

use bson::doc;
use common::*;
use docdb_store::LockMode;
use docdb_ttl::{TtlConfig, TtlIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn expired_documents_go_in_bounded_batches() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(7, 1, "at", 60));
    fx.insert("documents_7", &dated(0..250, ago(120)));

    let report = fx.purger(small_batches(100)).purge_at(now());

    assert_eq!(report.deleted, 250);
    assert_eq!(report.batches, 3);
    assert!(report.skipped_collections.is_empty());
    assert!(report.failed_tables.is_empty());
    assert_eq!(fx.count("documents_7"), 0);
}

#[test]
fn fresh_and_undated_documents_survive() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(1, 1, "at", 60));
    fx.insert("documents_1", &dated(0..3, ago(61)));
    fx.insert("documents_1", &dated(3..5, ago(30)));
    fx.insert(
        "documents_1",
        &[
            doc! { "_id": 5, "at": "yesterday" },
            doc! { "_id": 6 },
            doc! { "_id": 7, "at": ago(59).timestamp_millis() },
        ],
    );

    let report = fx.purger(TtlConfig::default()).purge_at(now());

    assert_eq!(report.deleted, 3);
    assert_eq!(report.batches, 1);
    assert_eq!(fx.ids("documents_1"), vec![3, 4, 5, 6, 7]);
}

#[test]
fn locked_collection_is_skipped() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(1, 1, "at", 0));
    fx.index(TtlIndex::new(2, 1, "at", 0));
    fx.insert("documents_1", &dated(0..4, ago(10)));
    fx.insert("documents_2", &dated(0..4, ago(10)));

    let _ddl = fx.locks.try_lock("collection_1", LockMode::Exclusive).unwrap();
    let report = fx.purger(TtlConfig::default()).purge_at(now());

    assert_eq!(report.skipped_collections, vec![1]);
    assert_eq!(fx.count("documents_1"), 4);
    assert_eq!(fx.count("documents_2"), 0);
}

#[test]
fn row_share_holders_do_not_block_the_purge() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(1, 1, "at", 0));
    fx.insert("documents_1", &dated(0..4, ago(10)));

    let _reader = fx.locks.try_lock("collection_1", LockMode::RowShare).unwrap();
    let report = fx.purger(TtlConfig::default()).purge_at(now());

    assert_eq!(report.deleted, 4);
    assert!(report.skipped_collections.is_empty());
}

#[test]
fn every_shard_table_is_purged() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(3, 1, "at", 60).with_shard_tables(["documents_3_101", "documents_3_102"]));
    fx.insert("documents_3_101", &dated(0..5, ago(100)));
    fx.insert("documents_3_102", &dated(0..150, ago(100)));

    let report = fx.purger(small_batches(100)).purge_at(now());

    assert_eq!(report.deleted, 155);
    // 1 short batch, then 1 full and 1 short
    assert_eq!(report.batches, 3);
}

#[test]
fn one_batch_per_table_without_repeat() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(1, 1, "at", 0));
    fx.insert("documents_1", &dated(0..250, ago(10)));

    let config = TtlConfig {
        repeat_purge_until_drained: false,
        ..small_batches(100)
    };
    let report = fx.purger(config).purge_at(now());

    assert_eq!(report.deleted, 100);
    assert_eq!(fx.count("documents_1"), 150);
}

#[test]
fn spent_budget_moves_to_the_next_table() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(1, 1, "at", 0).with_shard_tables(["t1", "t2"]));
    fx.insert("t1", &dated(0..250, ago(10)));
    fx.insert("t2", &dated(0..250, ago(10)));

    let config = TtlConfig {
        single_task_budget_ms: 0,
        ..small_batches(100)
    };
    let report = fx.purger(config).purge_at(now());

    assert_eq!(report.batches, 2);
    assert_eq!(fx.count("t1"), 150);
    assert_eq!(fx.count("t2"), 150);
}

#[test]
fn task_runtime_stops_everything() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(1, 1, "at", 0));
    fx.insert("documents_1", &dated(0..10, ago(10)));

    let config = TtlConfig {
        max_task_runtime_ms: 0,
        ..TtlConfig::default()
    };
    let report = fx.purger(config).purge_at(now());

    assert!(report.timed_out);
    assert_eq!(report.batches, 0);
    assert_eq!(fx.count("documents_1"), 10);
}

#[test]
fn failed_batch_rolls_back_and_continues() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(1, 1, "at", 0).with_shard_tables(["bad", "good"]));
    fx.insert("bad", &dated(0..3, ago(10)));
    fx.insert_raw("bad", b"\xff", b"not bson");
    fx.insert("good", &dated(0..3, ago(10)));

    let report = fx.purger(TtlConfig::default()).purge_at(now());

    assert_eq!(report.failed_tables, vec!["bad".to_string()]);
    assert_eq!(fx.count("bad"), 4);
    assert_eq!(fx.count("good"), 0);
    assert_eq!(report.deleted, 3);
}

#[test]
fn table_lock_timeout_fails_the_table() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(1, 1, "at", 0));
    fx.insert("documents_1", &dated(0..3, ago(10)));

    let _writer = fx.locks.try_lock("documents_1", LockMode::Exclusive).unwrap();
    let config = TtlConfig {
        lock_timeout_ms: 10,
        ..TtlConfig::default()
    };
    let report = fx.purger(config).purge_at(now());

    assert_eq!(report.failed_tables, vec!["documents_1".to_string()]);
    assert_eq!(fx.count("documents_1"), 3);
}

#[test]
fn partial_filter_limits_what_expires() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(1, 1, "at", 0).with_partial_filter(doc! { "kind": "session" }));
    fx.insert(
        "documents_1",
        &[
            doc! { "_id": 1, "at": ago(5), "kind": "session" },
            doc! { "_id": 2, "at": ago(5), "kind": "audit" },
        ],
    );

    fx.purger(TtlConfig::default()).purge_at(now());

    assert_eq!(fx.ids("documents_1"), vec![2]);
}

#[test]
fn negative_expiry_is_ignored() {
    let fx = Fixture::new();
    fx.index(TtlIndex::new(1, 1, "at", -1));
    fx.insert("documents_1", &dated(0..3, ago(10)));

    let report = fx.purger(TtlConfig::default()).purge_at(now());

    assert_eq!(report.batches, 0);
    assert_eq!(fx.count("documents_1"), 3);
}

#[test]
fn random_ages_delete_exactly_the_expired() {
    let mut rng = StdRng::seed_from_u64(0x771);
    for _ in 0..20 {
        let fx = Fixture::new();
        let expire = rng.gen_range(0..600);
        fx.index(TtlIndex::new(1, 1, "at", expire));
        let ages: Vec<i64> = (0..rng.gen_range(0..300)).map(|_| rng.gen_range(0..1200)).collect();
        let docs: Vec<_> = ages
            .iter()
            .enumerate()
            .map(|(i, age)| doc! { "_id": i as i32, "at": ago(*age) })
            .collect();
        fx.insert("documents_1", &docs);

        let report = fx
            .purger(small_batches(rng.gen_range(1..64)))
            .purge_at(now());

        let expired = ages.iter().filter(|age| **age > expire).count();
        assert_eq!(report.deleted as usize, expired);
        assert_eq!(fx.count("documents_1"), ages.len() - expired);
    }
}
