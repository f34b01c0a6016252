//! Transactions: per-transaction state, the write set used for rollback,
//! and the begin/commit/abort lifecycle.

use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::errors::{Result, StrataError};
use crate::lock_manager::{LockDataId, LockManager};
use crate::log::{LogManager, LogPayload, LogRecord};
use crate::{FileRegistry, Lsn, Rid, TxnId, INVALID_LSN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Default,
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// One entry of a transaction's undo list. Rows carry whatever image their
/// inversion needs; index entries carry the key(s) that were written.
#[derive(Debug, Clone)]
pub enum WriteRecord {
    InsertTuple {
        table: String,
        rid: Rid,
    },
    DeleteTuple {
        table: String,
        rid: Rid,
        value: Vec<u8>,
    },
    UpdateTuple {
        table: String,
        rid: Rid,
        old_value: Vec<u8>,
    },
    InsertEntry {
        index: String,
        key: Vec<u8>,
    },
    DeleteEntry {
        index: String,
        key: Vec<u8>,
        rid: Rid,
    },
    UpdateEntry {
        index: String,
        old_key: Vec<u8>,
        new_key: Vec<u8>,
        rid: Rid,
    },
}

struct TxnInner {
    state: TxnState,
    prev_lsn: Lsn,
    write_set: Vec<WriteRecord>,
    lock_set: HashSet<LockDataId>,
}

/// A transaction. Shared as `Arc` between the session, the lock manager and
/// the transaction manager; all mutable state sits behind one latch.
pub struct Transaction {
    id: TxnId,
    start_ts: i32,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    pub fn new(id: TxnId, start_ts: i32) -> Self {
        Self {
            id,
            start_ts,
            inner: Mutex::new(TxnInner {
                state: TxnState::Default,
                prev_lsn: INVALID_LSN,
                write_set: Vec::new(),
                lock_set: HashSet::new(),
            }),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_ts(&self) -> i32 {
        self.start_ts
    }

    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: TxnState) {
        self.inner.lock().state = state;
    }

    /// LSN of this transaction's most recent log record, the head of its
    /// undo chain.
    pub fn prev_lsn(&self) -> Lsn {
        self.inner.lock().prev_lsn
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        self.inner.lock().prev_lsn = lsn;
    }

    pub fn append_write_record(&self, record: WriteRecord) {
        self.inner.lock().write_set.push(record);
    }

    pub fn take_write_set(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut self.inner.lock().write_set)
    }

    pub fn add_lock(&self, id: LockDataId) {
        self.inner.lock().lock_set.insert(id);
    }

    pub fn lock_ids(&self) -> Vec<LockDataId> {
        self.inner.lock().lock_set.iter().copied().collect()
    }

    pub fn clear_transient_state(&self) {
        let mut inner = self.inner.lock();
        inner.write_set.clear();
        inner.lock_set.clear();
    }
}

/// Orchestrates the transaction lifecycle over the lock and log managers.
pub struct TransactionManager {
    next_txn_id: AtomicI32,
    next_ts: AtomicI32,
    txn_map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    lock_mgr: Arc<LockManager>,
    log_mgr: Arc<LogManager>,
}

impl TransactionManager {
    pub fn new(initial_txn_id: TxnId, lock_mgr: Arc<LockManager>, log_mgr: Arc<LogManager>) -> Self {
        Self {
            next_txn_id: AtomicI32::new(initial_txn_id),
            next_ts: AtomicI32::new(0),
            txn_map: Mutex::new(HashMap::new()),
            lock_mgr,
            log_mgr,
        }
    }

    /// Starts a transaction. With `None` a fresh id and timestamp are
    /// allocated; an existing transaction is re-registered as is.
    pub fn begin(&self, txn: Option<Arc<Transaction>>) -> Result<Arc<Transaction>> {
        let txn = match txn {
            Some(txn) => txn,
            None => {
                let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
                let ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
                Arc::new(Transaction::new(id, ts))
            }
        };
        self.txn_map.lock().insert(txn.id(), txn.clone());
        txn.set_state(TxnState::Growing);
        let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Begin);
        let lsn = self.log_mgr.append(&mut record)?;
        txn.set_prev_lsn(lsn);
        debug!("txn {} started", txn.id());
        Ok(txn)
    }

    pub fn get(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.txn_map.lock().get(&id).cloned()
    }

    /// Commits: the log is forced, locks are released, data pages stay
    /// wherever the buffer pool left them.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Commit);
        let lsn = self.log_mgr.append(&mut record)?;
        txn.set_prev_lsn(lsn);

        for lock in txn.lock_ids() {
            self.lock_mgr.unlock(txn, lock)?;
        }
        txn.clear_transient_state();
        self.log_mgr.flush()?;
        txn.set_state(TxnState::Committed);
        self.txn_map.lock().remove(&txn.id());
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Aborts: the write set is undone in reverse order against the heap
    /// and the indexes, then locks are released and the log forced.
    pub fn abort(&self, txn: &Arc<Transaction>, files: &dyn FileRegistry) -> Result<()> {
        let write_set = txn.take_write_set();
        for record in write_set.into_iter().rev() {
            self.undo_write(files, record)?;
        }

        let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Abort);
        let lsn = self.log_mgr.append(&mut record)?;
        txn.set_prev_lsn(lsn);

        for lock in txn.lock_ids() {
            self.lock_mgr.unlock(txn, lock)?;
        }
        txn.clear_transient_state();
        self.log_mgr.flush()?;
        txn.set_state(TxnState::Aborted);
        self.txn_map.lock().remove(&txn.id());
        debug!("txn {} aborted", txn.id());
        Ok(())
    }

    fn undo_write(&self, files: &dyn FileRegistry, record: WriteRecord) -> Result<()> {
        match record {
            WriteRecord::InsertTuple { table, rid } => {
                self.table_of(files, &table)?.delete_record(rid)
            }
            WriteRecord::DeleteTuple { table, rid, value } => {
                self.table_of(files, &table)?.insert_record_at(rid, &value)
            }
            WriteRecord::UpdateTuple {
                table,
                rid,
                old_value,
            } => self.table_of(files, &table)?.update_record(rid, &old_value),
            WriteRecord::InsertEntry { index, key } => {
                self.index_of(files, &index)?.delete_entry(&key)?;
                Ok(())
            }
            WriteRecord::DeleteEntry { index, key, rid } => {
                self.index_of(files, &index)?.insert_entry(&key, rid)?;
                Ok(())
            }
            WriteRecord::UpdateEntry {
                index,
                old_key,
                new_key,
                rid,
            } => {
                let ih = self.index_of(files, &index)?;
                ih.delete_entry(&new_key)?;
                ih.insert_entry(&old_key, rid)?;
                Ok(())
            }
        }
    }

    fn table_of(
        &self,
        files: &dyn FileRegistry,
        table: &str,
    ) -> Result<Arc<crate::heap::RecordFile>> {
        files
            .record_file(table)
            .ok_or_else(|| StrataError::Internal(format!("no open record file for {table}")))
    }

    fn index_of(
        &self,
        files: &dyn FileRegistry,
        index: &str,
    ) -> Result<Arc<crate::index::BTreeIndex>> {
        files
            .index(index)
            .ok_or_else(|| StrataError::Internal(format!("no open index {index}")))
    }
}
