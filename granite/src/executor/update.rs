//! Row update over a previously gathered rid list: set clauses, per-index
//! uniqueness probe of the new key, index delete-old/insert-new.

use std::sync::Arc;

use crate::catalog::{build_index_key, ColMeta, TabMeta};
use crate::errors::{QueryError, QueryResult};
use crate::executor::index_scan::unique_probe;
use crate::executor::{Context, Executor, Record};
use crate::system::SystemManager;
use crate::value::Value;
use strata::heap::RecordFile;
use strata::index::DATA_TIEBREAKER;
use strata::log::{LogPayload, LogRecord};
use strata::transaction::WriteRecord;
use strata::{Rid, StrataError};

/// One `SET col = value` assignment.
#[derive(Debug, Clone)]
pub struct SetClause {
    pub col_name: String,
    pub value: Value,
}

impl SetClause {
    pub fn new(col_name: &str, value: Value) -> Self {
        Self {
            col_name: col_name.to_string(),
            value,
        }
    }
}

pub struct UpdateExecutor {
    sm: Arc<SystemManager>,
    tab: TabMeta,
    fh: Arc<RecordFile>,
    set_clauses: Vec<SetClause>,
    rids: Vec<Rid>,
    ctx: Context,
    affected: usize,
    done: bool,
}

impl UpdateExecutor {
    pub fn new(
        sm: Arc<SystemManager>,
        tab_name: &str,
        set_clauses: Vec<SetClause>,
        rids: Vec<Rid>,
        ctx: Context,
    ) -> QueryResult<Self> {
        let tab = sm.table_meta(tab_name)?;
        let fh = sm.record_file(tab_name)?;
        Ok(Self {
            sm,
            tab,
            fh,
            set_clauses,
            rids,
            ctx,
            affected: 0,
            done: false,
        })
    }

    pub fn rows_affected(&self) -> usize {
        self.affected
    }

    fn apply_set(&self, record: &mut [u8]) -> QueryResult<()> {
        for clause in &self.set_clauses {
            let col = self.tab.get_col(&clause.col_name)?;
            let value = clause.value.clone().coerce_to(col.col_type);
            if value.col_type() != col.col_type {
                return Err(QueryError::IncompatibleType {
                    lhs: col.name.clone(),
                    rhs: format!("{value:?}"),
                });
            }
            record[col.offset..col.offset + col.len].copy_from_slice(&value.encode(col.len)?);
        }
        Ok(())
    }

    fn run(&mut self) -> QueryResult<()> {
        let txn = &self.ctx.txn;
        self.ctx.locks.lock_ix_on_table(txn, self.fh.fd())?;
        for &rid in &self.rids {
            self.ctx
                .locks
                .lock_exclusive_on_record(txn, rid, self.fh.fd())?;
            let old = self.fh.get_record(rid)?;
            let mut new = old.clone();
            self.apply_set(&mut new)?;

            // Probe every changed key first; a duplicate aborts the
            // statement before this row mutates anything.
            let mut moved = Vec::new();
            for index in &self.tab.indexes {
                let ih = self.sm.index_handle(&index.file_name())?;
                let old_key = build_index_key(&old, index, DATA_TIEBREAKER);
                let new_key = build_index_key(&new, index, DATA_TIEBREAKER);
                if old_key == new_key {
                    continue;
                }
                if unique_probe(&ih, &new_key)?.is_some() {
                    return Err(
                        StrataError::UniquenessViolation(ih.name().to_string()).into()
                    );
                }
                moved.push((ih, old_key, new_key));
            }

            self.fh.update_record(rid, &new)?;
            for (ih, old_key, new_key) in moved {
                ih.delete_entry(&old_key)?;
                ih.insert_entry(&new_key, rid)?;
                txn.append_write_record(WriteRecord::UpdateEntry {
                    index: ih.name().to_string(),
                    old_key,
                    new_key,
                    rid,
                });
            }

            let mut record = LogRecord::new(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::Update {
                    old_value: old.clone(),
                    new_value: new,
                    rid,
                    table: self.tab.name.clone(),
                },
            );
            let lsn = self.ctx.log.append(&mut record)?;
            txn.set_prev_lsn(lsn);
            self.sm
                .pool()
                .update_page_lsn(self.fh.fd(), rid.page_no, lsn)?;

            txn.append_write_record(WriteRecord::UpdateTuple {
                table: self.tab.name.clone(),
                rid,
                old_value: old,
            });
            self.affected += 1;
        }
        Ok(())
    }
}

impl Executor for UpdateExecutor {
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
        Err(StrataError::Internal("update produces no rows".into()).into())
    }
}
