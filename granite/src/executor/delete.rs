//! Row deletion over a previously gathered rid list.

use std::sync::Arc;

use crate::catalog::{build_index_key, ColMeta, TabMeta};
use crate::errors::QueryResult;
use crate::executor::{Context, Executor, Record};
use crate::system::SystemManager;
use strata::heap::RecordFile;
use strata::index::DATA_TIEBREAKER;
use strata::log::{LogPayload, LogRecord};
use strata::transaction::WriteRecord;
use strata::{Rid, StrataError};

pub struct DeleteExecutor {
    sm: Arc<SystemManager>,
    tab: TabMeta,
    fh: Arc<RecordFile>,
    rids: Vec<Rid>,
    ctx: Context,
    affected: usize,
    done: bool,
}

impl DeleteExecutor {
    pub fn new(
        sm: Arc<SystemManager>,
        tab_name: &str,
        rids: Vec<Rid>,
        ctx: Context,
    ) -> QueryResult<Self> {
        let tab = sm.table_meta(tab_name)?;
        let fh = sm.record_file(tab_name)?;
        Ok(Self {
            sm,
            tab,
            fh,
            rids,
            ctx,
            affected: 0,
            done: false,
        })
    }

    pub fn rows_affected(&self) -> usize {
        self.affected
    }

    fn run(&mut self) -> QueryResult<()> {
        let txn = &self.ctx.txn;
        self.ctx.locks.lock_ix_on_table(txn, self.fh.fd())?;
        for &rid in &self.rids {
            self.ctx
                .locks
                .lock_exclusive_on_record(txn, rid, self.fh.fd())?;
            let old = self.fh.get_record(rid)?;

            // Mirror entries go first; a missing one is a structural fault.
            for index in &self.tab.indexes {
                let ih = self.sm.index_handle(&index.file_name())?;
                let key = build_index_key(&old, index, DATA_TIEBREAKER);
                if !ih.delete_entry(&key)? {
                    return Err(StrataError::IndexEntryNotFound.into());
                }
                txn.append_write_record(WriteRecord::DeleteEntry {
                    index: ih.name().to_string(),
                    key,
                    rid,
                });
            }

            self.fh.delete_record(rid)?;
            let mut record = LogRecord::new(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::Delete {
                    value: old.clone(),
                    rid,
                    table: self.tab.name.clone(),
                },
            );
            let lsn = self.ctx.log.append(&mut record)?;
            txn.set_prev_lsn(lsn);
            self.sm
                .pool()
                .update_page_lsn(self.fh.fd(), rid.page_no, lsn)?;

            txn.append_write_record(WriteRecord::DeleteTuple {
                table: self.tab.name.clone(),
                rid,
                value: old,
            });
            self.affected += 1;
        }
        Ok(())
    }
}

impl Executor for DeleteExecutor {
    fn schema(&self) -> &[ColMeta] {
        &self.tab.cols
    }

    fn begin(&mut self) -> QueryResult<()> {
        self.run()?;
        self.done = true;
        Ok(())
    }

    fn next(&mut self) -> QueryResult<()> {
        Ok(())
    }

    fn is_end(&self) -> bool {
        self.done
    }

    fn current(&self) -> QueryResult<Record> {
        Err(strata::StrataError::Internal("delete produces no rows".into()).into())
    }
}
