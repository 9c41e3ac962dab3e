use std::thread;
use std::time::Duration;

use docdb_store::{MemoryStore, Store, StoreError, Transaction};

const TABLE: &str = "documents_1";

fn mem_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.create_table(TABLE).unwrap();
    store
}

#[test]
fn put_and_get() {
    let store = mem_store();
    let txn = store.begin(false).unwrap();
    let table = txn.table(TABLE).unwrap();
    txn.put(&table, b"key1", b"value1").unwrap();
    txn.commit().unwrap();

    let txn = store.begin(true).unwrap();
    let table = txn.table(TABLE).unwrap();
    assert_eq!(txn.get(&table, b"key1").unwrap().as_deref(), Some(&b"value1"[..]));
    assert!(txn.get(&table, b"missing").unwrap().is_none());
}

#[test]
fn writes_are_visible_inside_the_transaction_only() {
    let store = mem_store();
    let txn = store.begin(false).unwrap();
    let table = txn.table(TABLE).unwrap();
    txn.put(&table, b"k", b"v").unwrap();
    assert!(txn.get(&table, b"k").unwrap().is_some());

    let reader = store.begin(true).unwrap();
    let rt = reader.table(TABLE).unwrap();
    assert!(reader.get(&rt, b"k").unwrap().is_none());

    txn.rollback().unwrap();
    assert_eq!(store.row_count(TABLE).unwrap(), 0);
}

#[test]
fn readers_keep_their_snapshot() {
    let store = mem_store();
    let reader = store.begin(true).unwrap();
    let rt = reader.table(TABLE).unwrap();

    let txn = store.begin(false).unwrap();
    let table = txn.table(TABLE).unwrap();
    txn.put(&table, b"k", b"v").unwrap();
    txn.commit().unwrap();

    assert!(reader.get(&rt, b"k").unwrap().is_none());
    assert_eq!(store.row_count(TABLE).unwrap(), 1);
}

#[test]
fn put_batch_and_delete() {
    let store = mem_store();
    let txn = store.begin(false).unwrap();
    let table = txn.table(TABLE).unwrap();
    txn.put_batch(
        &table,
        &[
            (b"a:1" as &[u8], b"x" as &[u8]),
            (b"a:2", b"y"),
            (b"b:1", b"z"),
        ],
    )
    .unwrap();
    txn.delete(&table, b"a:2").unwrap();
    txn.commit().unwrap();

    let txn = store.begin(true).unwrap();
    let table = txn.table(TABLE).unwrap();
    let keys: Vec<Vec<u8>> = txn
        .scan_prefix(&table, b"a:")
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(keys, vec![b"a:1".to_vec()]);
}

#[test]
fn scan_prefix_is_ordered() {
    let store = mem_store();
    let txn = store.begin(false).unwrap();
    let table = txn.table(TABLE).unwrap();
    for i in [3u8, 1, 2] {
        txn.put(&table, &[b'p', i], &[i]).unwrap();
    }
    txn.put(&table, b"q", b"-").unwrap();
    txn.commit().unwrap();

    let txn = store.begin(true).unwrap();
    let table = txn.table(TABLE).unwrap();
    let values: Vec<u8> = txn
        .scan_prefix(&table, b"p")
        .unwrap()
        .map(|r| r.unwrap().1[0])
        .collect();
    assert_eq!(values, vec![1, 2, 3]);
}

#[test]
fn read_only_rejects_writes() {
    let store = mem_store();
    let txn = store.begin(true).unwrap();
    let table = txn.table(TABLE).unwrap();
    assert!(matches!(txn.put(&table, b"k", b"v"), Err(StoreError::ReadOnly)));
    assert!(matches!(txn.commit(), Err(StoreError::ReadOnly)));
}

#[test]
fn missing_table() {
    let store = mem_store();
    let txn = store.begin(true).unwrap();
    assert!(matches!(txn.table("nope"), Err(StoreError::TableNotFound(_))));
}

#[test]
fn statement_timeout_cancels_the_transaction() {
    let store = mem_store();
    let txn = store.begin(false).unwrap();
    let table = txn.table(TABLE).unwrap();
    txn.set_statement_timeout(Duration::from_millis(1));
    thread::sleep(Duration::from_millis(5));
    assert!(matches!(txn.put(&table, b"k", b"v"), Err(StoreError::StatementTimeout)));
    assert!(matches!(txn.commit(), Err(StoreError::StatementTimeout)));
    assert_eq!(store.row_count(TABLE).unwrap(), 0);
}

#[test]
fn table_names_are_sorted() {
    let store = mem_store();
    store.create_table("a").unwrap();
    store.create_table("z").unwrap();
    store.drop_table("z").unwrap();
    assert_eq!(store.table_names().unwrap(), vec!["a".to_string(), TABLE.to_string()]);
}
