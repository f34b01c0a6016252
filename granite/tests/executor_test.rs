use std::sync::Arc;

use granite::catalog::ColDef;
use granite::executor::{
    collect, collect_rids, Context, DeleteExecutor, Executor, IndexScanExecutor, InsertExecutor,
    ProjectionExecutor, SeqScanExecutor, SetClause, UpdateExecutor,
};
use granite::{CompOp, Condition, QueryError, SystemManager, Value};
use granite::value::TabCol;
use strata::{ColType, StrataError};
use tempfile::tempdir;

fn open_db() -> (tempfile::TempDir, Arc<SystemManager>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    SystemManager::create_db(&path).unwrap();
    let sm = SystemManager::open(&path, granite::system::DEFAULT_POOL_SIZE).unwrap();
    (dir, sm)
}

fn people_table(sm: &SystemManager) {
    sm.create_table(
        "t",
        &[
            ColDef::new("id", ColType::Int, 4),
            ColDef::new("name", ColType::Str, 8),
        ],
    )
    .unwrap();
}

fn insert_row(sm: &Arc<SystemManager>, ctx: &Context, id: i32, name: &str) {
    let mut exec = InsertExecutor::new(
        sm.clone(),
        "t",
        vec![Value::Int(id), Value::Str(name.into())],
        ctx.clone(),
    )
    .unwrap();
    exec.begin().unwrap();
}

fn id_eq(id: i32) -> Condition {
    Condition::with_value(TabCol::new("t", "id"), CompOp::Eq, Value::Int(id))
}

#[test]
fn insert_then_point_lookup_returns_the_padded_row() {
    let (_dir, sm) = open_db();
    people_table(&sm);
    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());

    insert_row(&sm, &ctx, 1, "alice");
    insert_row(&sm, &ctx, 2, "bob");

    let mut scan = SeqScanExecutor::new(&sm, "t", vec![id_eq(2)], ctx.clone()).unwrap();
    let rows = collect(&mut scan).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].values(scan.schema()),
        vec![Value::Int(2), Value::Str("bob     ".into())]
    );
    sm.commit_txn(&txn).unwrap();
}

#[test]
fn projection_narrows_the_output_schema() {
    let (_dir, sm) = open_db();
    people_table(&sm);
    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    insert_row(&sm, &ctx, 3, "carol");

    let scan = SeqScanExecutor::new(&sm, "t", vec![], ctx.clone()).unwrap();
    let mut proj = ProjectionExecutor::new(Box::new(scan), &["name"]).unwrap();
    let rows = collect(&mut proj).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values(proj.schema()), vec![Value::Str("carol   ".into())]);
    assert_eq!(rows[0].data.len(), 8);
    sm.commit_txn(&txn).unwrap();
}

#[test]
fn duplicate_insert_on_a_unique_index_changes_nothing() {
    let (_dir, sm) = open_db();
    people_table(&sm);
    sm.create_index("t", &["id"]).unwrap();

    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    insert_row(&sm, &ctx, 1, "a");
    insert_row(&sm, &ctx, 2, "b");
    sm.commit_txn(&txn).unwrap();

    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    let mut dup = InsertExecutor::new(
        sm.clone(),
        "t",
        vec![Value::Int(1), Value::Str("c".into())],
        ctx.clone(),
    )
    .unwrap();
    match dup.begin() {
        Err(QueryError::Storage(StrataError::UniquenessViolation(_))) => {}
        other => panic!("expected a uniqueness violation, got {other:?}"),
    }
    sm.abort_txn(&txn).unwrap();

    // Heap and index both still hold exactly the two original rows.
    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    let mut seq = SeqScanExecutor::new(&sm, "t", vec![], ctx.clone()).unwrap();
    assert_eq!(collect(&mut seq).unwrap().len(), 2);
    let mut via_index =
        IndexScanExecutor::new(&sm, "t", &["id"], vec![], ctx.clone()).unwrap();
    assert_eq!(collect(&mut via_index).unwrap().len(), 2);
    sm.commit_txn(&txn).unwrap();
}

#[test]
fn index_range_scan_is_bounded_and_ordered() {
    let (_dir, sm) = open_db();
    people_table(&sm);
    sm.create_index("t", &["id"]).unwrap();

    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    // Out-of-order inserts; the index orders them.
    for id in [30, 10, 50, 20, 40] {
        insert_row(&sm, &ctx, id, "row");
    }
    sm.commit_txn(&txn).unwrap();

    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    let conds = vec![
        Condition::with_value(TabCol::new("t", "id"), CompOp::Gt, Value::Int(15)),
        Condition::with_value(TabCol::new("t", "id"), CompOp::Le, Value::Int(40)),
    ];
    let mut scan = IndexScanExecutor::new(&sm, "t", &["id"], conds, ctx.clone()).unwrap();
    let rows = collect(&mut scan).unwrap();
    let ids: Vec<Value> = rows
        .iter()
        .map(|r| r.values(scan.schema())[0].clone())
        .collect();
    assert_eq!(ids, vec![Value::Int(20), Value::Int(30), Value::Int(40)]);
    sm.commit_txn(&txn).unwrap();
}

#[test]
fn abort_rolls_back_heap_and_index() {
    let (_dir, sm) = open_db();
    people_table(&sm);
    sm.create_index("t", &["id"]).unwrap();

    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    insert_row(&sm, &ctx, 1, "x");

    let mut gather = IndexScanExecutor::new(&sm, "t", &["id"], vec![id_eq(1)], ctx.clone()).unwrap();
    let rids = collect_rids(&mut gather).unwrap();
    let mut update = UpdateExecutor::new(
        sm.clone(),
        "t",
        vec![SetClause::new("name", Value::Str("y".into()))],
        rids.clone(),
        ctx.clone(),
    )
    .unwrap();
    update.begin().unwrap();
    assert_eq!(update.rows_affected(), 1);

    let mut delete = DeleteExecutor::new(sm.clone(), "t", rids, ctx.clone()).unwrap();
    delete.begin().unwrap();
    assert_eq!(delete.rows_affected(), 1);

    sm.abort_txn(&txn).unwrap();

    // No trace of id 1 in the heap or the index.
    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    let mut seq = SeqScanExecutor::new(&sm, "t", vec![id_eq(1)], ctx.clone()).unwrap();
    assert!(collect(&mut seq).unwrap().is_empty());
    let mut via_index =
        IndexScanExecutor::new(&sm, "t", &["id"], vec![id_eq(1)], ctx.clone()).unwrap();
    assert!(collect(&mut via_index).unwrap().is_empty());
    sm.commit_txn(&txn).unwrap();
}

#[test]
fn aborted_statements_leave_prior_state_byte_identical() {
    let (_dir, sm) = open_db();
    people_table(&sm);
    sm.create_index("t", &["id"]).unwrap();

    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    insert_row(&sm, &ctx, 5, "base");
    sm.commit_txn(&txn).unwrap();

    let snapshot = |ctx: &Context| {
        let mut seq = SeqScanExecutor::new(&sm, "t", vec![], ctx.clone()).unwrap();
        collect(&mut seq).unwrap()
    };

    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    let before = snapshot(&ctx);
    sm.commit_txn(&txn).unwrap();

    // A transaction that touches everything and aborts.
    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    insert_row(&sm, &ctx, 6, "gone");
    let mut gather = SeqScanExecutor::new(&sm, "t", vec![id_eq(5)], ctx.clone()).unwrap();
    let rids = collect_rids(&mut gather).unwrap();
    let mut update = UpdateExecutor::new(
        sm.clone(),
        "t",
        vec![SetClause::new("id", Value::Int(55))],
        rids,
        ctx.clone(),
    )
    .unwrap();
    update.begin().unwrap();
    sm.abort_txn(&txn).unwrap();

    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    assert_eq!(snapshot(&ctx), before);
    let mut via_index =
        IndexScanExecutor::new(&sm, "t", &["id"], vec![id_eq(5)], ctx.clone()).unwrap();
    assert_eq!(collect(&mut via_index).unwrap().len(), 1);
    sm.commit_txn(&txn).unwrap();
}

#[test]
fn update_uniqueness_probe_tolerates_the_row_itself() {
    let (_dir, sm) = open_db();
    people_table(&sm);
    sm.create_index("t", &["id"]).unwrap();

    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    insert_row(&sm, &ctx, 1, "a");
    insert_row(&sm, &ctx, 2, "b");

    let mut gather = SeqScanExecutor::new(&sm, "t", vec![id_eq(1)], ctx.clone()).unwrap();
    let rids = collect_rids(&mut gather).unwrap();

    // Updating a non-indexed column of the row keeps its key: allowed.
    let mut rename = UpdateExecutor::new(
        sm.clone(),
        "t",
        vec![SetClause::new("name", Value::Str("a2".into()))],
        rids.clone(),
        ctx.clone(),
    )
    .unwrap();
    rename.begin().unwrap();

    // Moving the key onto an existing one is a violation.
    let mut collide = UpdateExecutor::new(
        sm.clone(),
        "t",
        vec![SetClause::new("id", Value::Int(2))],
        rids,
        ctx.clone(),
    )
    .unwrap();
    match collide.begin() {
        Err(QueryError::Storage(StrataError::UniquenessViolation(_))) => {}
        other => panic!("expected a uniqueness violation, got {other:?}"),
    }
    sm.abort_txn(&txn).unwrap();
}

#[test]
fn arity_and_type_mismatches_are_statement_errors() {
    let (_dir, sm) = open_db();
    people_table(&sm);
    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());

    match InsertExecutor::new(sm.clone(), "t", vec![Value::Int(1)], ctx.clone()) {
        Err(QueryError::InvalidValueCount {
            expected: 2,
            given: 1,
        }) => {}
        other => panic!("expected InvalidValueCount, got {other:?}"),
    }

    let mut bad_type = InsertExecutor::new(
        sm.clone(),
        "t",
        vec![Value::Str("oops".into()), Value::Str("x".into())],
        ctx.clone(),
    )
    .unwrap();
    assert!(matches!(
        bad_type.begin(),
        Err(QueryError::IncompatibleType { .. })
    ));
    sm.abort_txn(&txn).unwrap();
}

#[test]
fn writers_block_scans_of_other_transactions() {
    let (_dir, sm) = open_db();
    people_table(&sm);
    let t1 = sm.begin_txn().unwrap();
    let ctx1 = Context::new(&sm, t1.clone());
    insert_row(&sm, &ctx1, 1, "w");

    // T1 holds IX on the table; T2's table share lock must lose.
    let t2 = sm.begin_txn().unwrap();
    let ctx2 = Context::new(&sm, t2.clone());
    let mut scan = SeqScanExecutor::new(&sm, "t", vec![], ctx2).unwrap();
    match scan.begin() {
        Err(QueryError::Storage(StrataError::DeadlockPrevention(_))) => {}
        other => panic!("expected DeadlockPrevention, got {other:?}"),
    }
    sm.abort_txn(&t2).unwrap();
    sm.commit_txn(&t1).unwrap();

    // With T1 gone the same scan succeeds on a fresh transaction.
    let t3 = sm.begin_txn().unwrap();
    let ctx3 = Context::new(&sm, t3.clone());
    let mut scan = SeqScanExecutor::new(&sm, "t", vec![], ctx3).unwrap();
    assert_eq!(collect(&mut scan).unwrap().len(), 1);
    sm.commit_txn(&t3).unwrap();
}
