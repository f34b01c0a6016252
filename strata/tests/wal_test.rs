use std::sync::Arc;

use strata::buffer_pool::BufferPoolManager;
use strata::disk::DiskManager;
use strata::log::{LogManager, LogPayload, LogRecord};
use strata::{PageId, Rid};
use tempfile::tempdir;

fn setup(pool_size: usize) -> (tempfile::TempDir, Arc<DiskManager>, Arc<LogManager>, Arc<BufferPoolManager>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let disk = Arc::new(DiskManager::new(dir.path()));
    disk.open_log("db.log").unwrap();
    disk.create_file("t").unwrap();
    let log = Arc::new(LogManager::new(disk.clone()));
    let pool = Arc::new(BufferPoolManager::new(pool_size, disk.clone(), Some(log.clone())));
    (dir, disk, log, pool)
}

fn append(log: &LogManager, txn_id: i32, prev: i32) -> i32 {
    let mut record = LogRecord::new(
        txn_id,
        prev,
        LogPayload::Insert {
            value: vec![1, 2, 3, 4],
            rid: Rid::new(1, 0),
            table: "t".into(),
        },
    );
    log.append(&mut record).unwrap()
}

#[test]
fn evicting_a_dirty_page_forces_the_log_out_first() {
    let (_dir, _disk, log, pool) = setup(2);
    let fd = pool.disk().open_file("t").unwrap();

    // A data change is logged but the buffer has not been flushed.
    let lsn = append(&log, 1, -1);
    assert!(log.persist_lsn() < lsn);

    let page_id = {
        let guard = pool.new_page(fd).unwrap();
        guard.write().set_lsn(lsn);
        guard.page_id()
    };

    // Evict the dirty page by filling both frames with other pages.
    let _a = pool.new_page(fd).unwrap();
    let _b = pool.new_page(fd).unwrap();

    // The page write must not precede its governing log record.
    assert!(log.persist_lsn() >= lsn, "page reached disk before its log record");

    drop(_a);
    drop(_b);
    let guard = pool.fetch(page_id).unwrap();
    assert_eq!(guard.read().lsn(), lsn);
}

#[test]
fn flush_page_also_honors_the_wal_rule() {
    let (_dir, _disk, log, pool) = setup(4);
    let fd = pool.disk().open_file("t").unwrap();

    let lsn = append(&log, 1, -1);
    let guard = pool.new_page(fd).unwrap();
    guard.write().set_lsn(lsn);
    let page_id = guard.page_id();
    drop(guard);

    pool.flush_page(page_id).unwrap();
    assert!(log.persist_lsn() >= lsn);
}

#[test]
fn update_page_lsn_marks_the_page_dirty() {
    let (_dir, disk, log, pool) = setup(4);
    let fd = disk.open_file("t").unwrap();
    let page_id = pool.new_page(fd).unwrap().page_id();

    let lsn = append(&log, 1, -1);
    pool.update_page_lsn(fd, page_id.page_no, lsn).unwrap();
    pool.flush_all(fd).unwrap();

    // Re-read through a fresh pool: the stamped LSN reached disk.
    let pool2 = Arc::new(BufferPoolManager::new(4, disk.clone(), Some(log.clone())));
    let guard = pool2.fetch(PageId::new(fd, page_id.page_no)).unwrap();
    assert_eq!(guard.read().lsn(), lsn);
}
