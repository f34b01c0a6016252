use std::sync::Arc;

use granite::catalog::ColDef;
use granite::executor::{
    collect, collect_rids, Context, DeleteExecutor, Executor, IndexScanExecutor, InsertExecutor,
    SeqScanExecutor, SetClause, UpdateExecutor,
};
use granite::value::TabCol;
use granite::{CompOp, Condition, SystemManager, Value};
use serial_test::serial;
use strata::ColType;
use tempfile::tempdir;

fn open_db(path: &std::path::Path) -> Arc<SystemManager> {
    SystemManager::open(path, granite::system::DEFAULT_POOL_SIZE).unwrap()
}

fn setup(dir: &tempfile::TempDir) -> (std::path::PathBuf, Arc<SystemManager>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = dir.path().join("db");
    SystemManager::create_db(&path).unwrap();
    let sm = open_db(&path);
    sm.create_table(
        "t",
        &[
            ColDef::new("id", ColType::Int, 4),
            ColDef::new("name", ColType::Str, 8),
        ],
    )
    .unwrap();
    sm.create_index("t", &["id"]).unwrap();
    (path, sm)
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

fn table_ids(sm: &Arc<SystemManager>, via_index: bool) -> Vec<i32> {
    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(sm, txn.clone());
    let mut ids: Vec<i32> = if via_index {
        let mut scan = IndexScanExecutor::new(sm, "t", &["id"], vec![], ctx.clone()).unwrap();
        collect(&mut scan)
            .unwrap()
            .iter()
            .map(|r| match r.values(scan.schema())[0] {
                Value::Int(v) => v,
                _ => unreachable!(),
            })
            .collect()
    } else {
        let mut scan = SeqScanExecutor::new(sm, "t", vec![], ctx.clone()).unwrap();
        let rows = collect(&mut scan).unwrap();
        rows.iter()
            .map(|r| match r.values(scan.schema())[0] {
                Value::Int(v) => v,
                _ => unreachable!(),
            })
            .collect()
    };
    sm.commit_txn(&txn).unwrap();
    if !via_index {
        ids.sort_unstable();
    }
    ids
}

#[test]
#[serial]
fn committed_work_survives_a_crash_and_live_work_is_undone() {
    let dir = tempdir().unwrap();
    let (path, sm) = setup(&dir);

    let t1 = sm.begin_txn().unwrap();
    let ctx1 = Context::new(&sm, t1.clone());
    insert_row(&sm, &ctx1, 1, "a");
    sm.commit_txn(&t1).unwrap();

    let t2 = sm.begin_txn().unwrap();
    let ctx2 = Context::new(&sm, t2.clone());
    insert_row(&sm, &ctx2, 2, "b");
    // T2's records reach the log file, but T2 never commits.
    sm.log_mgr().flush().unwrap();

    // Crash: the database is dropped without closing, so nothing but the
    // log and the creation-time file headers are on disk.
    drop((t1, t2, ctx1, ctx2));
    drop(sm);

    let sm = open_db(&path);
    assert_eq!(table_ids(&sm, false), vec![1]);
    // The rebuilt index agrees with the heap.
    assert_eq!(table_ids(&sm, true), vec![1]);

    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    let mut scan = IndexScanExecutor::new(&sm, "t", &["id"], vec![id_eq(2)], ctx.clone()).unwrap();
    assert!(collect(&mut scan).unwrap().is_empty());
    sm.commit_txn(&txn).unwrap();
    sm.close().unwrap();
}

#[test]
#[serial]
fn recovery_replays_updates_and_deletes_of_committed_transactions() {
    let dir = tempdir().unwrap();
    let (path, sm) = setup(&dir);

    let t1 = sm.begin_txn().unwrap();
    let ctx1 = Context::new(&sm, t1.clone());
    for id in [10, 20, 30] {
        insert_row(&sm, &ctx1, id, "base");
    }
    sm.commit_txn(&t1).unwrap();

    let t2 = sm.begin_txn().unwrap();
    let ctx2 = Context::new(&sm, t2.clone());
    let mut gather = SeqScanExecutor::new(&sm, "t", vec![id_eq(20)], ctx2.clone()).unwrap();
    let rids = collect_rids(&mut gather).unwrap();
    let mut update = UpdateExecutor::new(
        sm.clone(),
        "t",
        vec![SetClause::new("id", Value::Int(25))],
        rids,
        ctx2.clone(),
    )
    .unwrap();
    update.begin().unwrap();

    let mut gather = SeqScanExecutor::new(&sm, "t", vec![id_eq(30)], ctx2.clone()).unwrap();
    let rids = collect_rids(&mut gather).unwrap();
    let mut delete = DeleteExecutor::new(sm.clone(), "t", rids, ctx2.clone()).unwrap();
    delete.begin().unwrap();
    sm.commit_txn(&t2).unwrap();

    drop((t1, t2, ctx1, ctx2));
    drop(sm);

    let sm = open_db(&path);
    assert_eq!(table_ids(&sm, false), vec![10, 25]);
    assert_eq!(table_ids(&sm, true), vec![10, 25]);
    sm.close().unwrap();
}

#[test]
#[serial]
fn undo_reverts_pages_that_already_reached_disk() {
    let dir = tempdir().unwrap();
    let (path, sm) = setup(&dir);

    let t1 = sm.begin_txn().unwrap();
    let ctx1 = Context::new(&sm, t1.clone());
    insert_row(&sm, &ctx1, 7, "keep");
    sm.commit_txn(&t1).unwrap();

    let t2 = sm.begin_txn().unwrap();
    let ctx2 = Context::new(&sm, t2.clone());
    let mut gather = SeqScanExecutor::new(&sm, "t", vec![id_eq(7)], ctx2.clone()).unwrap();
    let rids = collect_rids(&mut gather).unwrap();
    let mut update = UpdateExecutor::new(
        sm.clone(),
        "t",
        vec![SetClause::new("name", Value::Str("dirty".into()))],
        rids,
        ctx2.clone(),
    )
    .unwrap();
    update.begin().unwrap();

    // Force T2's uncommitted change onto disk, WAL first.
    let fd = sm.record_file("t").unwrap().fd();
    sm.pool().flush_all(fd).unwrap();

    drop((t1, t2, ctx1, ctx2));
    drop(sm);

    let sm = open_db(&path);
    let txn = sm.begin_txn().unwrap();
    let ctx = Context::new(&sm, txn.clone());
    let mut scan = SeqScanExecutor::new(&sm, "t", vec![id_eq(7)], ctx.clone()).unwrap();
    let rows = collect(&mut scan).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].values(scan.schema())[1],
        Value::Str("keep    ".into())
    );
    sm.commit_txn(&txn).unwrap();
    sm.close().unwrap();
}

#[test]
#[serial]
fn clean_shutdown_reopens_without_losing_anything() {
    let dir = tempdir().unwrap();
    let (path, sm) = setup(&dir);

    let t1 = sm.begin_txn().unwrap();
    let ctx1 = Context::new(&sm, t1.clone());
    for id in 0..50 {
        insert_row(&sm, &ctx1, id, "persist");
    }
    sm.commit_txn(&t1).unwrap();
    drop((t1, ctx1));
    sm.close().unwrap();
    drop(sm);

    let sm = open_db(&path);
    assert_eq!(table_ids(&sm, false), (0..50).collect::<Vec<_>>());
    assert_eq!(table_ids(&sm, true), (0..50).collect::<Vec<_>>());
    sm.close().unwrap();
}
