use docdb_cli::catalog::load_catalog;
use docdb_cli::explain::{engine_config, explain, render};

const CATALOG: &str = r#"[
    {"database": "db", "name": "c", "collectionId": 17, "shardKey": {"a": "hashed"}},
    {"database": "db", "name": "other", "collectionId": 18}
]"#;

fn config(json: Option<&str>) -> docdb_planner::EngineConfig {
    engine_config(json, load_catalog(CATALOG).unwrap()).unwrap()
}

#[test]
fn aggregate_plan_reply() {
    let reply = explain(
        r#"{"aggregate": "c", "pipeline": [{"$match": {"a": 1}}, {"$limit": 5}], "cursor": {}, "$db": "db"}"#,
        None,
        &config(None),
    )
    .unwrap();
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert_eq!(reply.get_str("namespace").unwrap(), "db.c");
    assert_eq!(reply.get_array("shardKeyValues").unwrap().len(), 1);
    assert!(reply.get_str("plan").unwrap().contains("LIMIT 5"));
}

#[test]
fn database_argument_wins_over_dollar_db() {
    let reply = explain(
        r#"{"find": "other", "filter": {"_id": 3}, "$db": "elsewhere"}"#,
        Some("db"),
        &config(None),
    )
    .unwrap();
    assert_eq!(reply.get_str("namespace").unwrap(), "db.other");
    assert_eq!(reply.get_str("cursorKind").unwrap(), "pointRead");
}

#[test]
fn engine_config_is_read_from_json() {
    let reply = explain(
        r#"{"find": "other", "filter": {"_id": 3}, "$db": "db"}"#,
        None,
        &config(Some(r#"{"use_point_read": false}"#)),
    )
    .unwrap();
    assert_ne!(reply.get_str("cursorKind").unwrap(), "pointRead");
}

#[test]
fn planner_errors_become_error_replies() {
    let reply = explain(r#"{"drop": "c", "$db": "db"}"#, None, &config(None)).unwrap();
    assert_eq!(reply.get_f64("ok").unwrap(), 0.0);
    assert_eq!(reply.get_str("codeName").unwrap(), "UnrecognizedCommand");
    assert!(render(&reply).unwrap().contains("\"codeName\""));
}

#[test]
fn malformed_input_is_a_cli_error() {
    assert!(explain("{not json", None, &config(None)).is_err());
    assert!(engine_config(Some("[1]"), load_catalog("[]").unwrap()).is_err());
}
