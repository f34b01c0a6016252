use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use strata::buffer_pool::BufferPoolManager;
use strata::disk::DiskManager;
use strata::heap::RecordFile;
use strata::index::BTreeIndex;
use strata::lock_manager::{LockDataId, LockManager};
use strata::log::LogManager;
use strata::transaction::{TransactionManager, TxnState, WriteRecord};
use strata::{FileRegistry, Rid, StrataError};
use tempfile::tempdir;

struct Registry {
    tables: RwLock<HashMap<String, Arc<RecordFile>>>,
}

impl FileRegistry for Registry {
    fn record_file(&self, table: &str) -> Option<Arc<RecordFile>> {
        self.tables.read().get(table).cloned()
    }

    fn index(&self, _name: &str) -> Option<Arc<BTreeIndex>> {
        None
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    locks: Arc<LockManager>,
    txns: TransactionManager,
    heap: Arc<RecordFile>,
    registry: Registry,
}

fn setup() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let disk = Arc::new(DiskManager::new(dir.path()));
    disk.open_log("db.log").unwrap();
    let log = Arc::new(LogManager::new(disk.clone()));
    let pool = Arc::new(BufferPoolManager::new(32, disk.clone(), Some(log.clone())));
    let locks = Arc::new(LockManager::new());
    let txns = TransactionManager::new(0, locks.clone(), log.clone());
    RecordFile::create(&disk, "t", 8).unwrap();
    let heap = RecordFile::open(&disk, pool, "t").unwrap();
    let registry = Registry {
        tables: RwLock::new(HashMap::from([("t".to_string(), heap.clone())])),
    };
    Harness {
        _dir: dir,
        locks,
        txns,
        heap,
        registry,
    }
}

#[test]
fn commit_releases_locks_and_ends_the_transaction() {
    let h = setup();
    let t1 = h.txns.begin(None).unwrap();
    let rid = Rid::new(0, 0);
    assert!(h.locks.lock_exclusive_on_record(&t1, rid, 0).unwrap());

    h.txns.commit(&t1).unwrap();
    assert_eq!(t1.state(), TxnState::Committed);
    assert!(h.locks.queue_state(LockDataId::row(0, rid)).is_none());
    // A terminal transaction cannot lock again.
    assert!(!h.locks.lock_exclusive_on_record(&t1, rid, 0).unwrap());
}

#[test]
fn no_wait_conflict_aborts_loser_and_retry_succeeds() {
    let h = setup();
    let rid = Rid::new(0, 0);

    let t1 = h.txns.begin(None).unwrap();
    assert!(h.locks.lock_exclusive_on_record(&t1, rid, 0).unwrap());

    // T2 hits the conflict, aborts, and a fresh attempt after T1 commits
    // goes through.
    let t2 = h.txns.begin(None).unwrap();
    assert!(matches!(
        h.locks.lock_shared_on_record(&t2, rid, 0),
        Err(StrataError::DeadlockPrevention(_))
    ));
    h.txns.abort(&t2, &h.registry).unwrap();
    assert_eq!(t2.state(), TxnState::Aborted);

    h.txns.commit(&t1).unwrap();

    let t2_retry = h.txns.begin(None).unwrap();
    assert!(h.locks.lock_shared_on_record(&t2_retry, rid, 0).unwrap());
    h.txns.commit(&t2_retry).unwrap();
}

#[test]
fn abort_undoes_the_write_set_in_reverse() {
    let h = setup();
    let t1 = h.txns.begin(None).unwrap();

    // insert -> update -> delete of a second record, all in one transaction.
    let rid = h.heap.insert_record(&[1u8; 8], None).unwrap();
    t1.append_write_record(WriteRecord::InsertTuple {
        table: "t".into(),
        rid,
    });

    let victim = h.heap.insert_record(&[9u8; 8], None).unwrap();
    h.txns.commit(&t1).unwrap();

    let t2 = h.txns.begin(None).unwrap();
    let before = h.heap.get_record(victim).unwrap();
    h.heap.update_record(victim, &[7u8; 8]).unwrap();
    t2.append_write_record(WriteRecord::UpdateTuple {
        table: "t".into(),
        rid: victim,
        old_value: before.clone(),
    });
    h.heap.delete_record(victim).unwrap();
    t2.append_write_record(WriteRecord::DeleteTuple {
        table: "t".into(),
        rid: victim,
        value: vec![7u8; 8],
    });

    h.txns.abort(&t2, &h.registry).unwrap();
    // The delete was re-inserted, then the update rolled back.
    assert_eq!(h.heap.get_record(victim).unwrap(), before);
}

#[test]
fn abort_of_a_fresh_transaction_is_a_no_op_on_data() {
    let h = setup();
    let rid = h.heap.insert_record(&[5u8; 8], None).unwrap();
    let t1 = h.txns.begin(None).unwrap();
    h.txns.abort(&t1, &h.registry).unwrap();
    assert_eq!(h.heap.get_record(rid).unwrap(), [5u8; 8]);
}
