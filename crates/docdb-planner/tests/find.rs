mod common;

use bson::{Bson, doc};
use common::{COLLECTION_ID, catalog, config, default_config, plan, try_plan};
use docdb_planner::{CursorKind, Expr};
use docdb_query::ErrorCode;
use docdb_shard::{ShardKey, compute_shard_key_hash};

#[test]
fn in_list_fans_out_to_each_shard() {
    let key = doc! { "a": "hashed", "b": "hashed" };
    let config = config(catalog(Some(key.clone())));
    let plan = plan(
        &config,
        doc! { "find": "c", "filter": { "a": { "$in": [1, 2, 3] }, "b": 5 } },
    );

    let shard_key = ShardKey::parse(&key).unwrap();
    let mut expected: Vec<i64> = [1, 2, 3]
        .into_iter()
        .map(|a| compute_shard_key_hash(&shard_key, COLLECTION_ID, &doc! { "a": a, "b": 5 }).unwrap())
        .collect();
    expected.sort_unstable();

    let mut values = plan.shard_key_values.clone().unwrap();
    values.sort_unstable();
    assert_eq!(values, expected);

    let routing = plan
        .tree
        .root_node()
        .quals
        .iter()
        .find(|q| matches!(q, Expr::Or(_)))
        .expect("routing qual");
    let Expr::Or(arms) = routing else { unreachable!() };
    assert_eq!(arms.len(), 3);
    assert!(arms.iter().all(Expr::is_shard_key_equality));
    assert_ne!(plan.cursor, CursorKind::PointRead);
}

#[test]
fn id_lookup_on_unsharded_collection_is_a_point_read() {
    let config = default_config();
    let plan = plan(&config, doc! { "find": "other", "filter": { "_id": 5 } });
    assert_eq!(plan.cursor, CursorKind::PointRead);
    assert_eq!(plan.point_read_id, Some(Bson::Int32(5)));
    assert_eq!(plan.shard_key_values, Some(vec![(COLLECTION_ID + 1) as i64]));
    assert!(plan.tree.explain().contains("object_id = 5"));
}

#[test]
fn collation_keeps_string_ids_out_of_the_base_table_filter() {
    let config = default_config();
    let collation = doc! { "locale": "en", "strength": 1 };
    let collated = plan(
        &config,
        doc! { "find": "other", "filter": { "_id": "abc" }, "collation": collation.clone() },
    );
    assert_ne!(collated.cursor, CursorKind::PointRead);
    assert_eq!(collated.point_read_id, None);
    assert!(!collated.tree.explain().contains("object_id"));

    let numeric = plan(
        &config,
        doc! { "find": "other", "filter": { "_id": 5 }, "collation": collation },
    );
    assert_eq!(numeric.cursor, CursorKind::PointRead);

    let plain = plan(&config, doc! { "find": "other", "filter": { "_id": "abc" } });
    assert_eq!(plain.cursor, CursorKind::PointRead);
}

#[test]
fn point_reads_can_be_disabled() {
    let mut config = default_config();
    config.use_point_read = false;
    let plan = plan(&config, doc! { "find": "other", "filter": { "_id": 5 } });
    assert_eq!(plan.cursor, CursorKind::Streamable);
    assert_eq!(plan.point_read_id, None);
}

#[test]
fn id_range_is_not_a_point_read() {
    let config = default_config();
    let plan = plan(
        &config,
        doc! { "find": "other", "filter": { "_id": { "$gt": 5 } } },
    );
    assert_eq!(plan.cursor, CursorKind::Streamable);
}

#[test]
fn plain_find_streams() {
    let config = default_config();
    let plan = plan(&config, doc! { "find": "c", "filter": { "a": 1 } });
    assert_eq!(plan.cursor, CursorKind::Streamable);
    let text = plan.tree.explain();
    assert!(text.contains("current_cursor_state(document) AS continuation"), "{text}");
    assert!(text.contains("cursor_state(document, $continuation)"), "{text}");
    assert_eq!(plan.batch_size, 101);
}

#[test]
fn sort_and_paging_need_persistence() {
    let config = default_config();

    let sorted = plan(&config, doc! { "find": "c", "sort": { "a": 1 } });
    assert_eq!(sorted.cursor, CursorKind::Persistent);

    let skipped = plan(&config, doc! { "find": "c", "skip": 3 });
    assert_eq!(skipped.cursor, CursorKind::Persistent);
    assert_eq!(skipped.tree.root_node().offset, Some(3));

    let single = plan(&config, doc! { "find": "c", "limit": 1 });
    assert_eq!(single.cursor, CursorKind::Streamable);
    assert_eq!(single.tree.root_node().limit, Some(1));

    let limited = plan(&config, doc! { "find": "c", "limit": -4, "batchSize": 2 });
    assert_eq!(limited.cursor, CursorKind::Persistent);
    assert_eq!(limited.tree.root_node().limit, Some(4));
    assert_eq!(limited.batch_size, 2);
}

#[test]
fn projection_sees_the_filter() {
    let config = default_config();
    let plan = plan(
        &config,
        doc! { "find": "c", "filter": { "a": 1 }, "projection": { "a.$": 1 } },
    );
    assert_eq!(
        plan.tree.root_node().document().function_name(),
        Some("bson_dollar_project_find")
    );
    assert!(
        plan.tree
            .explain()
            .contains("bson_dollar_project_find(document, {\"a.$\": 1}, {\"a\": 1})")
    );
}

#[test]
fn single_batch_is_honored() {
    let config = default_config();
    let plan = plan(&config, doc! { "find": "c", "singleBatch": true });
    assert_eq!(plan.cursor, CursorKind::SingleBatch);
}

#[test]
fn natural_sort_needs_natural_hint() {
    let config = default_config();
    let err = try_plan(
        &config,
        doc! { "find": "c", "sort": { "$natural": 1 }, "hint": { "a": 1 } },
    )
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::BadValue);

    assert!(
        try_plan(
            &config,
            doc! { "find": "c", "sort": { "$natural": 1 }, "hint": { "$natural": 1 } },
        )
        .is_ok()
    );
}

#[test]
fn find_over_view() {
    let catalog = catalog(None);
    catalog.add(docdb_planner::CollectionInfo::view(
        "db",
        "flat",
        "c",
        vec![doc! { "$unwind": "$items" }],
    ));
    let config = config(catalog);
    let plan = plan(&config, doc! { "find": "flat", "filter": { "items": 2 } });
    assert_eq!(plan.tree.depth(), 1);
    // a promoted plan cannot resume from a continuation
    assert_eq!(plan.cursor, CursorKind::Persistent);
    assert_eq!(plan.namespace, "db.flat");
}

#[test]
fn unsupported_find_options() {
    let config = default_config();
    let err = try_plan(&config, doc! { "find": "c", "returnKey": true }).unwrap_err();
    assert_eq!(err.code, ErrorCode::CommandNotSupported);
}
