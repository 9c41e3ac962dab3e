mod common;

use bson::{Bson, Document, doc};
use common::{aggregate, default_config, try_plan};
use docdb_planner::stage::split_inlinable;
use docdb_planner::{CursorKind, Relation};
use docdb_query::ErrorCode;

fn lookup(pipeline: Vec<Document>) -> Document {
    doc! {
        "$lookup": {
            "from": "other",
            "localField": "k",
            "foreignField": "j",
            "pipeline": pipeline,
            "as": "joined",
        }
    }
}

fn position(text: &str, needle: &str) -> usize {
    text.find(needle)
        .unwrap_or_else(|| panic!("{needle} not in plan:\n{text}"))
}

#[test]
fn inlinable_prefix_runs_before_the_join_filter() {
    let config = default_config();
    let sub = vec![
        doc! { "$match": { "x": 1 } },
        doc! { "$group": { "_id": "$x" } },
        doc! { "$match": { "_id": 2 } },
    ];
    let (inlined, rest) = split_inlinable(
        &sub.iter().cloned().map(Bson::Document).collect::<Vec<_>>(),
        "j",
        false,
    );
    assert_eq!(inlined.len(), 1);
    assert_eq!(rest.len(), 2);

    let plan = aggregate(&config, vec![lookup(sub)]);
    let text = plan.tree.explain();
    let first_match = position(&text, "bson_dollar_match(document, {\"x\": 1})");
    let join_filter = position(&text, "bson_dollar_lookup_join_filter");
    let second_match = position(&text, "{\"_id\": 2}");
    assert!(first_match < join_filter, "{text}");
    assert!(text.contains("LEFT JOIN LATERAL"), "{text}");
    assert!(text.contains("bson_dollar_lookup_project(document, lookup_right_0.document, 'joined')"), "{text}");
    // the group output is wrapped before the trailing match applies
    assert!(second_match < first_match, "{text}");
}

#[test]
fn inlining_can_be_disabled() {
    let mut config = default_config();
    config.enable_lookup_inlining = false;
    let plan = aggregate(&config, vec![lookup(vec![doc! { "$match": { "x": 1 } }])]);
    let text = plan.tree.explain();
    let join_filter = position(&text, "bson_dollar_lookup_join_filter");
    let matched = position(&text, "bson_dollar_match(document, {\"x\": 1})");
    assert!(join_filter < matched, "{text}");
}

#[test]
fn lookup_then_unwind_fuses() {
    let config = default_config();
    let plan = aggregate(
        &config,
        vec![
            doc! { "$lookup": { "from": "other", "localField": "k", "foreignField": "j", "as": "joined" } },
            doc! { "$unwind": "$joined" },
        ],
    );
    let stages: Vec<_> = plan.stages.iter().map(|s| s.stage).collect();
    assert_eq!(stages, vec!["$lookupUnwind"]);
    let text = plan.tree.explain();
    assert!(text.contains("bson_dollar_lookup_unwind(document, lookup_unwind_0.document, 'joined')"), "{text}");
    assert!(text.contains("\nJOIN LATERAL"), "{text}");
    assert!(!text.contains("bson_array_agg"), "{text}");
    assert_eq!(plan.cursor, CursorKind::Persistent);
}

#[test]
fn unwind_with_preserve_is_an_outer_join() {
    let config = default_config();
    let plan = aggregate(
        &config,
        vec![
            doc! { "$lookup": { "from": "other", "localField": "k", "foreignField": "j", "as": "joined" } },
            doc! { "$unwind": { "path": "$joined", "preserveNullAndEmptyArrays": true } },
        ],
    );
    assert!(plan.tree.explain().contains("LEFT JOIN LATERAL"));

    let unrelated = aggregate(
        &config,
        vec![
            doc! { "$lookup": { "from": "other", "localField": "k", "foreignField": "j", "as": "joined" } },
            doc! { "$unwind": "$other" },
        ],
    );
    assert_eq!(unrelated.stages.len(), 2);
}

#[test]
fn lookup_disables_shard_base_table_reads() {
    let config = default_config();
    let plan = aggregate(
        &config,
        vec![doc! { "$lookup": { "from": "other", "localField": "k", "foreignField": "j", "as": "joined" } }],
    );
    assert!(!plan.allow_shard_base_table);
}

#[test]
fn facet_merges_branches() {
    let config = default_config();
    let plan = aggregate(
        &config,
        vec![
            doc! { "$match": { "a": 1 } },
            doc! {
                "$facet": {
                    "small": [{ "$limit": 2 }],
                    "counted": [{ "$count": "n" }],
                }
            },
        ],
    );
    let text = plan.tree.explain();
    assert!(text.contains("bson_object_agg(document)"), "{text}");
    assert!(text.contains("bson_array_agg(document, 'small')"), "{text}");
    assert!(text.contains("bson_array_agg(document, 'counted')"), "{text}");
    assert!(text.contains("UNION ALL"), "{text}");
    assert_eq!(plan.cursor, CursorKind::Persistent);

    let err = try_plan(
        &config,
        doc! {
            "aggregate": "c",
            "pipeline": [{ "$facet": { "x": [{ "$facet": { "y": [] } }] } }],
            "cursor": {},
        },
    )
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::Location(40600));
}

#[test]
fn union_with_appends_rows() {
    let config = default_config();
    let plan = aggregate(
        &config,
        vec![doc! { "$unionWith": { "coll": "other", "pipeline": [{ "$match": { "b": 1 } }] } }],
    );
    assert!(matches!(plan.tree.root_node().source, Relation::UnionAll { .. }));
    let text = plan.tree.explain();
    assert!(text.contains("FROM db.other [18]"), "{text}");
    assert!(text.contains("FROM db.c [17]"), "{text}");

    let err = try_plan(
        &config,
        doc! {
            "aggregate": "c",
            "pipeline": [{ "$unionWith": { "pipeline": [{ "$match": {} }] } }],
            "cursor": {},
        },
    )
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::FailedToParse);
}

#[test]
fn nesting_depth_is_bounded() {
    let config = default_config();
    let nest = |levels: usize| {
        let mut pipeline: Vec<Document> = Vec::new();
        for _ in 0..levels {
            pipeline = vec![doc! { "$lookup": { "from": "other", "pipeline": pipeline, "as": "x" } }];
        }
        doc! { "aggregate": "c", "pipeline": pipeline, "cursor": {} }
    };

    assert!(try_plan(&config, nest(config.max_nested_pipeline_depth)).is_ok());
    let err = try_plan(&config, nest(config.max_nested_pipeline_depth + 1)).unwrap_err();
    assert_eq!(err.code, ErrorCode::Location(15962));
}
