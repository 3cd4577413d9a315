//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use holo_ql::{
    Client, Cluster, ClusterConfig, CompareOp, Condition, DataType, ReadOp, Row, Schema, Session,
    Table, Value, WriteOp,
};

pub const TABLE_NAME: &str = "t";

/// Every column of the test table in schema order.
pub const ALL_COLUMNS: [&str; 6] = ["h1", "h2", "r1", "r2", "c1", "c2"];

/// `h1 INT32, h2 STRING` hash key, `r1 INT32, r2 STRING` range key, then
/// nullable `c1 INT32, c2 STRING`.
pub fn test_schema() -> Schema {
    Schema::builder()
        .hash_column("h1", DataType::Int32)
        .hash_column("h2", DataType::String)
        .range_column("r1", DataType::Int32)
        .range_column("r2", DataType::String)
        .column("c1", DataType::Int32)
        .column("c2", DataType::String)
        .build()
        .expect("test schema")
}

/// In-memory cluster with the test table created on three tablets.
pub async fn start_cluster() -> (Cluster, Client, Table) {
    start_cluster_with(ClusterConfig::in_memory(3)).await
}

pub async fn start_cluster_with(config: ClusterConfig) -> (Cluster, Client, Table) {
    let cluster = Cluster::start(config).expect("start cluster");
    let client = cluster.client();
    let table = client
        .create_table(TABLE_NAME, test_schema(), 3)
        .await
        .expect("create test table");
    (cluster, client, table)
}

/// `insert into t values (h1, h2, r1, r2, c1, c2)`; returns the applied op.
pub async fn insert_row(
    session: &mut Session,
    table: &Table,
    key: (i32, &str, i32, &str),
    c1: i32,
    c2: &str,
) -> WriteOp {
    let op = table.new_insert_op();
    set_key(&op, key);
    op.request_mut().set_column("c1", c1).set_column("c2", c2);
    session.apply(&op).await.expect("apply insert");
    op
}

/// Fill the full row identity of a write.
pub fn set_key(op: &WriteOp, (h1, h2, r1, r2): (i32, &str, i32, &str)) {
    op.request_mut()
        .add_hash_value(h1)
        .add_hash_value(h2)
        .add_range_value(r1)
        .add_range_value(r2);
}

/// `select <columns> from t where h1 = .. and h2 = .. and r1 = .. and r2 = ..`
pub async fn select_row(
    session: &mut Session,
    table: &Table,
    columns: &[&str],
    (h1, h2, r1, r2): (i32, &str, i32, &str),
) -> ReadOp {
    let op = table.new_read_op();
    op.request_mut()
        .add_hash_value(h1)
        .add_hash_value(h2)
        .set_where_expr(Condition::and(vec![
            Condition::compare("r1", CompareOp::Equal, r1),
            Condition::compare("r2", CompareOp::Equal, r2),
        ]))
        .add_columns(columns.iter().copied());
    session.apply(&op).await.expect("apply select");
    op
}

/// Select the whole `(1, 'a', 2, 'b')` row with a fresh session.
pub async fn select_default_row(client: &Client, table: &Table) -> ReadOp {
    let mut session = client.new_session();
    select_row(&mut session, table, &ALL_COLUMNS, (1, "a", 2, "b")).await
}

/// Check a full row `h1, h2, r1, r2, c1, c2`.
pub fn assert_row_values(row: &Row, h1: i32, h2: &str, r1: i32, r2: &str, c1: i32, c2: &str) {
    assert_eq!(row.column(0), &Value::Int32(h1), "h1");
    assert_eq!(row.column(1), &Value::from(h2), "h2");
    assert_eq!(row.column(2), &Value::Int32(r1), "r1");
    assert_eq!(row.column(3), &Value::from(r2), "r2");
    assert_eq!(row.column(4), &Value::Int32(c1), "c1");
    assert_eq!(row.column(5), &Value::from(c2), "c2");
}

/// Deterministic pseudo-random payload for row `idx`.
pub fn value_at(idx: i32, len: usize) -> String {
    let mut rng = SmallRng::seed_from_u64(idx as u64);
    (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

pub fn range_for(idx: i32) -> String {
    format!("range_{}", 1_000_000 + idx)
}

pub const SHORT_TIMEOUT: Duration = Duration::from_millis(100);
