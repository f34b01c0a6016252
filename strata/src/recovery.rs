//! Restart recovery: analyze, redo and undo passes over the write-ahead log.

use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer_pool::BufferPoolManager;
use crate::disk::DiskManager;
use crate::errors::{Result, StrataError};
use crate::log::{LogManager, LogPayload, LogRecord, LOG_BUFFER_SIZE};
use crate::{FileRegistry, Lsn, PageId, Rid, TxnId, INVALID_LSN};

struct AnalyzeState {
    /// Active transaction table: last seen LSN per unfinished transaction.
    active_txn: HashMap<TxnId, Lsn>,
    /// Byte offset of each record in the log file.
    lsn_offsets: HashMap<Lsn, u64>,
    /// LSNs of data records whose effect never reached their page, in log
    /// order. Redo replays exactly these.
    dirty_lsns: Vec<Lsn>,
    max_lsn: Lsn,
    max_txn_id: TxnId,
}

/// Rebuilds a consistent heap from the log after a crash. Indexes are not
/// logged; the system layer rebuilds them from the recovered heap afterward.
pub struct RecoveryManager {
    disk: Arc<DiskManager>,
    pool: Arc<BufferPoolManager>,
    log: Arc<LogManager>,
}

impl RecoveryManager {
    pub fn new(
        disk: Arc<DiskManager>,
        pool: Arc<BufferPoolManager>,
        log: Arc<LogManager>,
    ) -> Self {
        Self { disk, pool, log }
    }

    /// Runs all three passes. Returns the highest transaction id seen so the
    /// transaction manager can resume id allocation past it.
    pub fn recover(&self, files: &dyn FileRegistry) -> Result<TxnId> {
        let state = self.analyze(files)?;
        info!(
            "recovery: {} live txns, {} records to redo",
            state.active_txn.len(),
            state.dirty_lsns.len()
        );
        self.redo(files, &state)?;
        self.undo(files, &state)?;
        self.log.reset_lsn(state.max_lsn + 1);
        Ok(state.max_txn_id)
    }

    /// Sequential scan of the whole log building the ATT, the LSN offset
    /// map and the dirty-LSN list. A torn record ends the scan: everything
    /// beyond it never became durable.
    fn analyze(&self, files: &dyn FileRegistry) -> Result<AnalyzeState> {
        let mut state = AnalyzeState {
            active_txn: HashMap::new(),
            lsn_offsets: HashMap::new(),
            dirty_lsns: Vec::new(),
            max_lsn: 0,
            max_txn_id: 0,
        };
        let mut buf = vec![0u8; LOG_BUFFER_SIZE];
        let mut offset: u64 = 0;
        loop {
            let read = self.disk.read_log(&mut buf, offset)?;
            if read == 0 {
                break;
            }
            let mut pos = 0;
            while pos < read {
                let Some((record, len)) = LogRecord::decode(&buf[pos..read]) else {
                    break;
                };
                self.analyze_record(files, &mut state, &record, offset + pos as u64)?;
                pos += len;
            }
            if pos == 0 {
                break;
            }
            offset += pos as u64;
        }
        Ok(state)
    }

    fn analyze_record(
        &self,
        files: &dyn FileRegistry,
        state: &mut AnalyzeState,
        record: &LogRecord,
        offset: u64,
    ) -> Result<()> {
        state.lsn_offsets.insert(record.lsn, offset);
        state.max_lsn = state.max_lsn.max(record.lsn);
        state.max_txn_id = state.max_txn_id.max(record.txn_id);
        match &record.payload {
            LogPayload::Begin => {
                state.active_txn.insert(record.txn_id, record.lsn);
            }
            LogPayload::Commit | LogPayload::Abort => {
                state.active_txn.remove(&record.txn_id);
            }
            LogPayload::NewPage { table, page_no } => {
                state.active_txn.insert(record.txn_id, record.lsn);
                // The page was created by a transaction whose file header
                // never reached disk: put the allocation marker past it so
                // redo and undo can reach the page again.
                if let Some(file) = files.record_file(table) {
                    if *page_no >= self.disk.allocated(file.fd()) {
                        debug!("recovery: re-allocated page {page_no} of {table}");
                    }
                    file.ensure_allocated(*page_no);
                }
            }
            LogPayload::Insert { rid, table, .. }
            | LogPayload::Delete { rid, table, .. }
            | LogPayload::Update { rid, table, .. } => {
                state.active_txn.insert(record.txn_id, record.lsn);
                if let Some(file) = files.record_file(table) {
                    let guard = self.pool.fetch(PageId::new(file.fd(), rid.page_no))?;
                    if guard.read().lsn() < record.lsn {
                        state.dirty_lsns.push(record.lsn);
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-applies, in log order, every record whose page missed it.
    fn redo(&self, files: &dyn FileRegistry, state: &AnalyzeState) -> Result<()> {
        for &lsn in &state.dirty_lsns {
            let record = self.record_at(state, lsn)?;
            match &record.payload {
                LogPayload::Insert { value, rid, table } => {
                    self.table_of(files, table)?.insert_record_at(*rid, value)?;
                    self.stamp_page_lsn(files, table, *rid, record.lsn)?;
                }
                LogPayload::Delete { rid, table, .. } => {
                    self.table_of(files, table)?.delete_record(*rid)?;
                    self.stamp_page_lsn(files, table, *rid, record.lsn)?;
                }
                LogPayload::Update {
                    new_value,
                    rid,
                    table,
                    ..
                } => {
                    self.table_of(files, table)?.update_record(*rid, new_value)?;
                    self.stamp_page_lsn(files, table, *rid, record.lsn)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Walks each live transaction's prev-LSN chain backwards, applying the
    /// compensating operation for every data record. Control records only
    /// link the chain.
    fn undo(&self, files: &dyn FileRegistry, state: &AnalyzeState) -> Result<()> {
        for (&txn_id, &last_lsn) in &state.active_txn {
            debug!("recovery: rolling back txn {txn_id}");
            let mut lsn = last_lsn;
            while lsn != INVALID_LSN {
                let record = self.record_at(state, lsn)?;
                match &record.payload {
                    LogPayload::Insert { rid, table, .. } => {
                        self.table_of(files, table)?.delete_record(*rid)?;
                    }
                    LogPayload::Delete { value, rid, table } => {
                        self.table_of(files, table)?.insert_record_at(*rid, value)?;
                    }
                    LogPayload::Update {
                        old_value,
                        rid,
                        table,
                        ..
                    } => {
                        self.table_of(files, table)?.update_record(*rid, old_value)?;
                    }
                    _ => {}
                }
                lsn = record.prev_lsn;
            }
        }
        Ok(())
    }

    fn record_at(&self, state: &AnalyzeState, lsn: Lsn) -> Result<LogRecord> {
        let offset = *state
            .lsn_offsets
            .get(&lsn)
            .ok_or_else(|| StrataError::Internal(format!("no log offset for lsn {lsn}")))?;
        let mut buf = vec![0u8; LOG_BUFFER_SIZE];
        let read = self.disk.read_log(&mut buf, offset)?;
        LogRecord::decode(&buf[..read])
            .map(|(record, _)| record)
            .ok_or_else(|| StrataError::Internal(format!("undecodable log record at lsn {lsn}")))
    }

    fn stamp_page_lsn(
        &self,
        files: &dyn FileRegistry,
        table: &str,
        rid: Rid,
        lsn: Lsn,
    ) -> Result<()> {
        let file = self.table_of(files, table)?;
        self.pool.update_page_lsn(file.fd(), rid.page_no, lsn)
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
}
