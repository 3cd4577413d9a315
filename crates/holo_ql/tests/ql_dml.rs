//! Integration tests for single-row DML through sessions.
//!
//! Test flow:
//! - Start an in-process cluster and create table `t` with a two-column hash
//!   key, a two-column range key and two nullable value columns.
//! - Drive inserts, upserts, deletes, guarded writes and filtered reads
//!   through sessions in both flush modes.
//! - Race guarded writes on one row from concurrent sessions on a
//!   multi-threaded runtime.
//!
//! Failure model:
//! - Stale schema versions and incomparable filters must surface as per-op
//!   statuses, never as partial results or silent mutations.
//!
//! Verification:
//! - Every op reports `Ok` unless the scenario expects otherwise, and rows
//!   read back match exactly what the preceding writes left behind.

mod common;

use std::sync::Arc;

use tokio::sync::Barrier;

use holo_ql::{
    ClusterConfig, CompareOp, Condition, DataType, FlushMode, ResponseStatus, StorageBackend,
    Value, APPLIED_COLUMN,
};

use common::{
    assert_row_values, insert_row, range_for, select_default_row, select_row, set_key,
    start_cluster, start_cluster_with, value_at, ALL_COLUMNS, TABLE_NAME,
};

#[tokio::test]
async fn insert_update_and_select() {
    let (_cluster, client, table) = start_cluster().await;

    {
        let mut session = client.new_session();
        let op = insert_row(&mut session, &table, (1, "a", 2, "b"), 3, "c").await;
        let response = op.response().expect("insert response");
        assert_eq!(response.status(), ResponseStatus::Ok);
        assert!(response.rows().is_empty());
        assert!(response.rows().columns().is_empty());
    }

    {
        let op = select_default_row(&client, &table).await;
        let response = op.response().expect("select response");
        assert_eq!(response.status(), ResponseStatus::Ok);
        assert_eq!(response.rows().row_count(), 1);
        assert_row_values(response.rows().row(0).expect("row"), 1, "a", 2, "b", 3, "c");
    }

    {
        // update t set c1 = 4, c2 = 'd' where h1 = 1 and h2 = 'a' and r1 = 2 and r2 = 'b'
        let op = table.new_update_op();
        set_key(&op, (1, "a", 2, "b"));
        op.request_mut().set_column("c1", 4).set_column("c2", "d");
        let mut session = client.new_session();
        session.apply(&op).await.expect("apply update");
        assert_eq!(op.response().expect("update response").status(), ResponseStatus::Ok);
    }

    {
        let mut session = client.new_session();
        session
            .set_flush_mode(FlushMode::ManualFlush)
            .expect("manual flush");
        let op = select_row(&mut session, &table, &["c1", "c2"], (1, "a", 2, "b")).await;
        assert!(op.response().is_none());
        session.flush().await.expect("flush");

        let response = op.response().expect("select response");
        assert_eq!(response.status(), ResponseStatus::Ok);
        assert_eq!(response.rows().row_count(), 1);
        let row = response.rows().row(0).expect("row");
        assert_eq!(row.column(0), &Value::Int32(4));
        assert_eq!(row.column(1), &Value::from("d"));
    }
}

#[tokio::test]
async fn insert_with_stale_schema_version_is_rejected() {
    let (_cluster, client, table) = start_cluster().await;
    let mut session = client.new_session();
    session
        .set_flush_mode(FlushMode::ManualFlush)
        .expect("manual flush");

    let altered = client
        .alter_table(TABLE_NAME)
        .add_column("c3", DataType::Int32)
        .not_null()
        .apply()
        .await
        .expect("alter table");
    assert_eq!(altered.schema().version(), table.schema().version() + 1);

    // `table` still carries the version it was opened at.
    let op = insert_row(&mut session, &table, (1, "a", 2, "b"), 3, "c").await;
    session.flush().await.expect("flush");
    let response = op.response().expect("insert response");
    assert_eq!(response.status(), ResponseStatus::SchemaVersionMismatch);

    let read = select_default_row(&client, &altered).await;
    assert_eq!(read.response().expect("select response").rows().row_count(), 0);
}

#[tokio::test]
async fn range_filter_point_reads_open_one_iterator_each() {
    const TOTAL_ROWS: i32 = 2_000;
    const HASH_INT: i32 = 42;
    const HASH_STR: &str = "all_records_have_same_id";

    let dir = tempfile::tempdir().expect("temp dir");
    let config = ClusterConfig::persistent(dir.path(), 1);
    assert!(matches!(config.storage, StorageBackend::Fjall { .. }));

    let (cluster, client, table) = start_cluster_with(config).await;
    {
        let mut session = client.new_session();
        session
            .set_flush_mode(FlushMode::ManualFlush)
            .expect("manual flush");
        for i in 0..TOTAL_ROWS {
            let key = range_for(i);
            let op = table.new_insert_op();
            set_key(&op, (HASH_INT, HASH_STR, i, key.as_str()));
            op.request_mut()
                .set_column("c1", -i)
                .set_column("c2", value_at(i, 200));
            session.apply(&op).await.expect("apply insert");
            if (i + 1) % 100 == 0 {
                let summary = session.flush().await.expect("flush");
                assert_eq!(summary.failed, 0);
            }
        }
        session.flush().await.expect("final flush");

        let mut session = client.new_session();
        for idx in (0..TOTAL_ROWS).step_by(97) {
            let range = range_for(idx);
            let key = (HASH_INT, HASH_STR, idx, range.as_str());
            let op = select_row(&mut session, &table, &["c1", "c2"], key).await;
            let response = op.response().expect("read response");
            assert_eq!(response.rows().row_count(), 1, "row {idx}");
            let row = response.rows().row(0).expect("row");
            assert_eq!(row.column(0), &Value::Int32(-idx));
            assert_eq!(row.column(1), &Value::from(value_at(idx, 200)));
        }
    }
    drop(table);
    drop(client);

    let cluster = cluster.restart().expect("restart cluster");
    let client = cluster.client();
    let table = client.open_table(TABLE_NAME).await.expect("reopen table");
    let mut session = client.new_session();
    let mut opened = cluster.iterators_opened();
    assert_eq!(opened, 0);
    for lookup in 0..200 {
        let idx = (lookup * 7_919) % TOTAL_ROWS;
        let range = range_for(idx);
        let key = (HASH_INT, HASH_STR, idx, range.as_str());
        let op = select_row(&mut session, &table, &["c1", "c2"], key).await;
        let response = op.response().expect("read response");
        assert_eq!(response.status(), ResponseStatus::Ok);
        assert_eq!(response.rows().row_count(), 1, "row {idx}");
        assert_eq!(
            response.rows().row(0).expect("row").column(0),
            &Value::Int32(-idx)
        );

        let now = cluster.iterators_opened();
        assert_eq!(opened + 1, now, "lookup {lookup}");
        opened = now;
    }
    assert_eq!(cluster.iterators_live(), 0);
}

#[tokio::test]
async fn insert_multiple_rows_and_reuse_read_op() {
    let (_cluster, client, table) = start_cluster().await;
    {
        let mut session = client.new_session();
        session
            .set_flush_mode(FlushMode::ManualFlush)
            .expect("manual flush");
        let op1 = insert_row(&mut session, &table, (1, "a", 2, "b"), 3, "c").await;
        let op2 = insert_row(&mut session, &table, (1, "a", 2, "d"), 4, "e").await;
        let summary = session.flush().await.expect("flush");
        assert_eq!(summary.ops, 2);
        assert_eq!(summary.ok, 2);
        assert_eq!(op1.response().expect("op1").status(), ResponseStatus::Ok);
        assert_eq!(op2.response().expect("op2").status(), ResponseStatus::Ok);
    }

    let op = table.new_read_op();
    op.request_mut()
        .add_hash_value(1)
        .add_hash_value("a")
        .set_where_expr(Condition::and(vec![
            Condition::compare("r1", CompareOp::Equal, 2),
            Condition::compare("r2", CompareOp::Equal, "b"),
        ]))
        .add_columns(ALL_COLUMNS);
    let mut session = client.new_session();
    session.apply(&op).await.expect("apply select");
    let first = op.response().expect("first response");
    assert_eq!(first.rows().row_count(), 1);
    assert_row_values(first.rows().row(0).expect("row"), 1, "a", 2, "b", 3, "c");

    // Edit the applied filter in place to select the other row.
    {
        let mut request = op.request_mut();
        let filter = request.where_expr_mut().expect("filter");
        filter.remove_last_operand();
        filter.add_comparison("r2", CompareOp::Equal, "d");
    }
    // The delivered response is a snapshot and must not follow the edit.
    assert_eq!(op.response().expect("unchanged response"), first);

    session.apply(&op).await.expect("re-apply select");
    let second = op.response().expect("second response");
    assert_eq!(second.rows().row_count(), 1);
    assert_row_values(second.rows().row(0).expect("row"), 1, "a", 2, "d", 4, "e");
}

#[tokio::test]
async fn select_multiple_rows_with_or_and_nested_conditions() {
    let (_cluster, client, table) = start_cluster().await;
    let mut session = client.new_session();
    session
        .set_flush_mode(FlushMode::ManualFlush)
        .expect("manual flush");
    insert_row(&mut session, &table, (1, "a", 2, "b"), 3, "c").await;
    insert_row(&mut session, &table, (1, "a", 2, "d"), 4, "e").await;
    insert_row(&mut session, &table, (1, "a", 3, "b"), 5, "f").await;
    session.flush().await.expect("flush");
    session
        .set_flush_mode(FlushMode::AutoFlushSync)
        .expect("auto flush");

    // select * from t where h1 = 1 and h2 = 'a' and (r2 = 'b' or r2 = 'd')
    let op = table.new_read_op();
    op.request_mut()
        .add_hash_value(1)
        .add_hash_value("a")
        .set_where_expr(Condition::or(vec![
            Condition::eq("r2", "b"),
            Condition::eq("r2", "d"),
        ]))
        .add_columns(ALL_COLUMNS);
    session.apply(&op).await.expect("apply or select");
    let response = op.response().expect("response");
    assert_eq!(response.rows().row_count(), 3);
    assert_row_values(response.rows().row(0).expect("row 0"), 1, "a", 2, "b", 3, "c");
    assert_row_values(response.rows().row(1).expect("row 1"), 1, "a", 2, "d", 4, "e");
    assert_row_values(response.rows().row(2).expect("row 2"), 1, "a", 3, "b", 5, "f");

    // select * from t where h1 = 1 and h2 = 'a' and r1 = 2 and (r2 = 'b' or r2 = 'd')
    let op = table.new_read_op();
    op.request_mut()
        .add_hash_value(1)
        .add_hash_value("a")
        .set_where_expr(Condition::and(vec![
            Condition::eq("r1", 2),
            Condition::or(vec![Condition::eq("r2", "b"), Condition::eq("r2", "d")]),
        ]))
        .add_columns(ALL_COLUMNS);
    session.apply(&op).await.expect("apply nested select");
    let response = op.response().expect("response");
    assert_eq!(response.rows().row_count(), 2);
    assert_row_values(response.rows().row(0).expect("row 0"), 1, "a", 2, "b", 3, "c");
    assert_row_values(response.rows().row(1).expect("row 1"), 1, "a", 2, "d", 4, "e");
}

#[tokio::test]
async fn select_without_condition_honors_limit() {
    let (_cluster, client, table) = start_cluster().await;
    {
        let mut session = client.new_session();
        session
            .set_flush_mode(FlushMode::ManualFlush)
            .expect("manual flush");
        let mut ops = Vec::new();
        for i in 0..100 {
            ops.push(insert_row(&mut session, &table, (1, "a", 2 + i, "b"), 3 + i, "c").await);
        }
        session.flush().await.expect("flush");
        for op in &ops {
            assert_eq!(op.response().expect("insert").status(), ResponseStatus::Ok);
        }
    }

    let mut session = client.new_session();
    let op = table.new_read_op();
    op.request_mut()
        .add_hash_value(1)
        .add_hash_value("a")
        .add_columns(ALL_COLUMNS)
        .set_limit(5);
    session.apply(&op).await.expect("apply limited select");
    let response = op.response().expect("response");
    assert_eq!(response.rows().row_count(), 5);
    for (i, row) in response.rows().rows().iter().enumerate() {
        let i = i as i32;
        assert_row_values(row, 1, "a", 2 + i, "b", 3 + i, "c");
    }

    // A zero limit means no limit.
    op.request_mut().set_limit(0);
    session.apply(&op).await.expect("apply unlimited select");
    assert_eq!(op.response().expect("response").rows().row_count(), 100);

    // Reverse order starts from the highest range key.
    op.request_mut().set_limit(2).set_reverse(true);
    session.apply(&op).await.expect("apply reverse select");
    let response = op.response().expect("response");
    assert_eq!(response.rows().row_count(), 2);
    assert_row_values(response.rows().row(0).expect("row 0"), 1, "a", 101, "b", 102, "c");
    assert_row_values(response.rows().row(1).expect("row 1"), 1, "a", 100, "b", 101, "c");
}

#[tokio::test]
async fn upsert_merges_value_columns() {
    let (_cluster, client, table) = start_cluster().await;
    let mut session = client.new_session();

    let op = table.new_insert_op();
    set_key(&op, (1, "a", 2, "b"));
    op.request_mut().set_column("c1", 3);
    session.apply(&op).await.expect("apply upsert");
    assert_eq!(op.response().expect("upsert").status(), ResponseStatus::Ok);

    let read = select_default_row(&client, &table).await;
    let response = read.response().expect("select");
    assert_eq!(response.rows().row_count(), 1);
    let row = response.rows().row(0).expect("row");
    assert_eq!(row.column(4), &Value::Int32(3));
    assert!(row.column(5).is_null());

    let op = table.new_insert_op();
    set_key(&op, (1, "a", 2, "b"));
    op.request_mut().set_column("c2", "c");
    session.apply(&op).await.expect("apply second upsert");

    let read = select_default_row(&client, &table).await;
    let response = read.response().expect("select");
    assert_eq!(response.rows().row_count(), 1);
    assert_row_values(response.rows().row(0).expect("row"), 1, "a", 2, "b", 3, "c");
}

#[tokio::test]
async fn delete_column_then_whole_row() {
    let (_cluster, client, table) = start_cluster().await;
    let mut session = client.new_session();
    insert_row(&mut session, &table, (1, "a", 2, "b"), 3, "c").await;

    // delete c1 from t where h1 = 1 and h2 = 'a' and r1 = 2 and r2 = 'b'
    let op = table.new_delete_op();
    set_key(&op, (1, "a", 2, "b"));
    op.request_mut().clear_column("c1");
    session.apply(&op).await.expect("apply column delete");
    assert_eq!(op.response().expect("delete").status(), ResponseStatus::Ok);

    let read = select_row(&mut session, &table, &["c1", "c2"], (1, "a", 2, "b")).await;
    let response = read.response().expect("select");
    assert_eq!(response.rows().row_count(), 1);
    let row = response.rows().row(0).expect("row");
    assert!(row.column(0).is_null());
    assert_eq!(row.column(1), &Value::from("c"));

    // delete from t where h1 = 1 and h2 = 'a' and r1 = 2 and r2 = 'b'
    let op = table.new_delete_op();
    set_key(&op, (1, "a", 2, "b"));
    session.apply(&op).await.expect("apply row delete");
    assert_eq!(op.response().expect("delete").status(), ResponseStatus::Ok);

    let read = select_row(&mut session, &table, &["c1", "c2"], (1, "a", 2, "b")).await;
    assert_eq!(read.response().expect("select").rows().row_count(), 0);
}

#[tokio::test]
async fn conditional_insert() {
    let (_cluster, client, table) = start_cluster().await;
    let mut session = client.new_session();
    insert_row(&mut session, &table, (1, "a", 2, "b"), 3, "c").await;

    // insert into t values (1, 'a', 2, 'b', 4, 'd') if not exists
    let op = table.new_insert_op();
    set_key(&op, (1, "a", 2, "b"));
    op.request_mut()
        .set_column("c1", 4)
        .set_column("c2", "d")
        .set_if_expr(Condition::NotExists);
    session.apply(&op).await.expect("apply if not exists");
    let response = op.response().expect("response");
    assert_eq!(response.status(), ResponseStatus::Ok);
    assert_eq!(response.rows().row_count(), 1);
    assert_eq!(response.rows().columns()[0].name, APPLIED_COLUMN);
    assert_eq!(response.rows().columns()[0].data_type, DataType::Bool);
    assert_eq!(response.applied(), Some(false));

    let read = select_default_row(&client, &table).await;
    assert_row_values(
        read.response().expect("select").rows().row(0).expect("row"),
        1,
        "a",
        2,
        "b",
        3,
        "c",
    );

    // ... if not exists or c2 = 'd': not applied, reports the current c2.
    let op = table.new_insert_op();
    set_key(&op, (1, "a", 2, "b"));
    op.request_mut()
        .set_column("c1", 4)
        .set_column("c2", "d")
        .set_if_expr(Condition::or(vec![
            Condition::NotExists,
            Condition::eq("c2", "d"),
        ]))
        .add_column_ref("c2");
    session.apply(&op).await.expect("apply guarded insert");
    let response = op.response().expect("response");
    assert_eq!(response.status(), ResponseStatus::Ok);
    let names = response
        .rows()
        .columns()
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec![APPLIED_COLUMN, "h1", "h2", "r1", "r2", "c2"]);
    let types = response
        .rows()
        .columns()
        .iter()
        .map(|c| c.data_type)
        .collect::<Vec<_>>();
    assert_eq!(
        types,
        vec![
            DataType::Bool,
            DataType::Int32,
            DataType::String,
            DataType::Int32,
            DataType::String,
            DataType::String
        ]
    );
    let row = response.rows().row(0).expect("row");
    assert_eq!(row.column(0), &Value::Bool(false));
    assert_eq!(row.column(1), &Value::Int32(1));
    assert_eq!(row.column(2), &Value::from("a"));
    assert_eq!(row.column(3), &Value::Int32(2));
    assert_eq!(row.column(4), &Value::from("b"));
    assert_eq!(row.column(5), &Value::from("c"));

    // ... if not exists or c2 = 'c': applied.
    let op = table.new_insert_op();
    set_key(&op, (1, "a", 2, "b"));
    op.request_mut()
        .set_column("c1", 4)
        .set_column("c2", "d")
        .set_if_expr(Condition::or(vec![
            Condition::NotExists,
            Condition::eq("c2", "c"),
        ]))
        .add_column_ref("c2");
    session.apply(&op).await.expect("apply guarded insert");
    assert_eq!(op.response().expect("response").applied(), Some(true));

    let read = select_default_row(&client, &table).await;
    assert_row_values(
        read.response().expect("select").rows().row(0).expect("row"),
        1,
        "a",
        2,
        "b",
        4,
        "d",
    );

    // A plain insert still overwrites.
    insert_row(&mut session, &table, (1, "a", 2, "b"), 5, "e").await;
    let read = select_default_row(&client, &table).await;
    assert_row_values(
        read.response().expect("select").rows().row(0).expect("row"),
        1,
        "a",
        2,
        "b",
        5,
        "e",
    );
}

#[tokio::test]
async fn conditional_update() {
    let (_cluster, client, table) = start_cluster().await;
    let mut session = client.new_session();
    insert_row(&mut session, &table, (1, "a", 2, "b"), 3, "c").await;

    // update t set c1 = 6 where ... if not exists
    let op = table.new_update_op();
    set_key(&op, (1, "a", 2, "b"));
    op.request_mut()
        .set_column("c1", 6)
        .set_if_expr(Condition::NotExists);
    session.apply(&op).await.expect("apply update if not exists");
    assert_eq!(op.response().expect("response").applied(), Some(false));

    let read = select_default_row(&client, &table).await;
    assert_row_values(
        read.response().expect("select").rows().row(0).expect("row"),
        1,
        "a",
        2,
        "b",
        3,
        "c",
    );

    // update t set c1 = 6 where ... if exists
    op.request_mut().set_if_expr(Condition::Exists);
    session.apply(&op).await.expect("apply update if exists");
    let response = op.response().expect("response");
    assert_eq!(response.status(), ResponseStatus::Ok);
    assert_eq!(response.applied(), Some(true));

    let read = select_default_row(&client, &table).await;
    assert_row_values(
        read.response().expect("select").rows().row(0).expect("row"),
        1,
        "a",
        2,
        "b",
        6,
        "c",
    );
}

#[tokio::test]
async fn conditional_delete() {
    let (_cluster, client, table) = start_cluster().await;
    let mut session = client.new_session();
    insert_row(&mut session, &table, (1, "a", 2, "b"), 3, "c").await;

    // delete c1 from t where ... if c1 = 4
    let op = table.new_delete_op();
    set_key(&op, (1, "a", 2, "b"));
    op.request_mut()
        .clear_column("c1")
        .set_if_expr(Condition::eq("c1", 4))
        .add_column_ref("c1");
    session.apply(&op).await.expect("apply guarded delete");
    let response = op.response().expect("response");
    assert_eq!(response.status(), ResponseStatus::Ok);
    assert_eq!(response.rows().columns().len(), 6);
    assert_eq!(response.rows().columns()[5].name, "c1");
    assert_eq!(response.rows().columns()[5].data_type, DataType::Int32);
    let row = response.rows().row(0).expect("row");
    assert_eq!(row.column(0), &Value::Bool(false));
    assert_eq!(row.column(5), &Value::Int32(3));

    // delete c1 from t where ... if exists and c1 = 3
    let op = table.new_delete_op();
    set_key(&op, (1, "a", 2, "b"));
    op.request_mut()
        .clear_column("c1")
        .set_if_expr(Condition::and(vec![Condition::Exists, Condition::eq("c1", 3)]))
        .add_column_ref("c1");
    session.apply(&op).await.expect("apply guarded delete");
    let response = op.response().expect("response");
    assert_eq!(response.applied(), Some(true));
    // The result reflects the state after the delete.
    assert!(response.rows().row(0).expect("row").column(5).is_null());

    let read = select_default_row(&client, &table).await;
    let response = read.response().expect("select");
    assert_eq!(response.rows().row_count(), 1);
    let row = response.rows().row(0).expect("row");
    assert!(row.column(4).is_null());
    assert_eq!(row.column(5), &Value::from("c"));

    // delete from t where h1 = 1 and h2 = 'a' and r1 = 2 and r2 = 'c' if exists
    let op = table.new_delete_op();
    set_key(&op, (1, "a", 2, "c"));
    op.request_mut().set_if_expr(Condition::Exists);
    session.apply(&op).await.expect("apply guarded row delete");
    let response = op.response().expect("response");
    assert_eq!(response.status(), ResponseStatus::Ok);
    assert_eq!(response.applied(), Some(false));
}

#[tokio::test]
async fn incomparable_filter_is_a_runtime_error() {
    let (_cluster, client, table) = start_cluster().await;
    let mut session = client.new_session();
    insert_row(&mut session, &table, (1, "a", 2, "b"), 3, "c").await;

    // select c1, c2 from t where h1 = 1 and h2 = 'a' and r1 <> '2' and r2 <> 'b'
    let op = table.new_read_op();
    op.request_mut()
        .add_hash_value(1)
        .add_hash_value("a")
        .set_where_expr(Condition::and(vec![
            Condition::compare("r1", CompareOp::NotEqual, "2"),
            Condition::compare("r2", CompareOp::NotEqual, "b"),
        ]))
        .add_columns(["c1", "c2"]);
    session.apply(&op).await.expect("apply select");

    let response = op.response().expect("response");
    assert_eq!(response.status(), ResponseStatus::RuntimeError);
    assert_eq!(response.error_message(), "values not comparable");
    assert!(response.rows().is_empty());
}

#[tokio::test]
async fn simultaneous_read_and_write() {
    const ITERATIONS: i32 = 10;
    let (_cluster, client, table) = start_cluster().await;
    let mut session = client.new_session();
    session
        .set_flush_mode(FlushMode::ManualFlush)
        .expect("manual flush");

    for i in 0..ITERATIONS {
        let write = insert_row(&mut session, &table, (1, "a", i, "b"), i * 2, "c").await;
        let read = if i > 0 {
            Some(select_row(&mut session, &table, &["c1", "c2"], (1, "a", i - 1, "b")).await)
        } else {
            None
        };
        session.flush().await.expect("flush");
        assert_eq!(write.response().expect("write").status(), ResponseStatus::Ok);
        if let Some(read) = read {
            let response = read.response().expect("read");
            assert_eq!(response.status(), ResponseStatus::Ok);
            assert_eq!(response.rows().row_count(), 1);
            let row = response.rows().row(0).expect("row");
            assert_eq!(row.column(0), &Value::Int32((i - 1) * 2));
            assert_eq!(row.column(1), &Value::from("c"));
        }
    }
}

#[tokio::test]
async fn open_recently_created_table() {
    const ITERATIONS: usize = 10;
    const KEYS: i32 = 100;
    let (_cluster, client, _table) = start_cluster().await;

    for i in 0..ITERATIONS {
        let name = format!("table_{i}");
        let creator = {
            let client = client.clone();
            let name = name.clone();
            tokio::spawn(async move {
                let schema = holo_ql::Schema::builder()
                    .hash_column("k", DataType::Int32)
                    .column("v", DataType::Int32)
                    .build()
                    .expect("schema");
                client
                    .create_table(&name, schema, 9)
                    .await
                    .expect("create table");
            })
        };

        let table = client.open_table(&name).await.expect("open table");
        assert_eq!(table.partitions().tablets().len(), 9);
        let mut session = client.new_session();
        session
            .set_flush_mode(FlushMode::ManualFlush)
            .expect("manual flush");
        for k in 0..KEYS {
            let op = table.new_insert_op();
            op.request_mut().add_hash_value(k).set_column("v", -k);
            session.apply(op).await.expect("apply insert");
        }
        let summary = session.flush().await.expect("flush");
        assert_eq!(summary.ok, KEYS as usize);
        creator.await.expect("creator task");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_insert_if_not_exists_applies_once() {
    const RACERS: i32 = 16;
    let (_cluster, client, table) = start_cluster().await;
    let barrier = Arc::new(Barrier::new(RACERS as usize));

    let mut racers = Vec::new();
    for racer in 0..RACERS {
        let (client, table, barrier) = (client.clone(), table.clone(), barrier.clone());
        racers.push(tokio::spawn(async move {
            let mut session = client.new_session();
            let op = table.new_insert_op();
            set_key(&op, (7, "race", 1, "r"));
            op.request_mut()
                .set_column("c1", racer)
                .set_if_expr(Condition::NotExists);
            barrier.wait().await;
            session.apply(&op).await.expect("apply guarded insert");
            let response = op.response().expect("response");
            assert_eq!(response.status(), ResponseStatus::Ok);
            (racer, response.applied())
        }));
    }
    let mut winners = Vec::new();
    for racer in racers {
        let (racer, applied) = racer.await.expect("racer task");
        assert!(applied.is_some(), "racer {racer} got no applied flag");
        if applied == Some(true) {
            winners.push(racer);
        }
    }
    assert_eq!(winners.len(), 1, "winners: {winners:?}");

    let mut session = client.new_session();
    let read = select_row(&mut session, &table, &["c1"], (7, "race", 1, "r")).await;
    let response = read.response().expect("read");
    assert_eq!(response.rows().row_count(), 1);
    assert_eq!(
        response.rows().row(0).expect("row").column(0),
        &Value::Int32(winners[0])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compare_and_set_counter_loses_no_increments() {
    const WORKERS: usize = 8;
    const ATTEMPTS: usize = 40;
    const KEY: (i32, &str, i32, &str) = (9, "counter", 0, "r");
    let (_cluster, client, table) = start_cluster().await;
    {
        let mut session = client.new_session();
        insert_row(&mut session, &table, KEY, 0, "counter").await;
    }

    let mut workers = Vec::new();
    for _ in 0..WORKERS {
        let (client, table) = (client.clone(), table.clone());
        workers.push(tokio::spawn(async move {
            let mut session = client.new_session();
            let mut applied: i32 = 0;
            for _ in 0..ATTEMPTS {
                let read = select_row(&mut session, &table, &["c1"], KEY).await;
                let response = read.response().expect("read");
                let row = response.rows().row(0).expect("counter row");
                let current = match row.column(0) {
                    Value::Int32(current) => *current,
                    other => panic!("unexpected counter value {other:?}"),
                };

                // update t set c1 = current + 1 where ... if c1 = current
                let op = table.new_update_op();
                set_key(&op, KEY);
                op.request_mut()
                    .set_column("c1", current + 1)
                    .set_if_expr(Condition::eq("c1", current));
                session.apply(&op).await.expect("apply guarded update");
                let response = op.response().expect("response");
                assert_eq!(response.status(), ResponseStatus::Ok);
                if response.applied() == Some(true) {
                    applied += 1;
                }
            }
            applied
        }));
    }
    let mut applied = 0;
    for worker in workers {
        applied += worker.await.expect("worker task");
    }
    assert!(applied > 0);

    let mut session = client.new_session();
    let read = select_row(&mut session, &table, &["c1"], KEY).await;
    let response = read.response().expect("read");
    assert_eq!(
        response.rows().row(0).expect("row").column(0),
        &Value::Int32(applied)
    );
}
