//! Row insertion: uniqueness probes, heap insert, index maintenance,
//! logging and the transaction's undo list.

use std::sync::Arc;

use crate::catalog::{build_index_key, ColMeta, TabMeta};
use crate::errors::{QueryError, QueryResult};
use crate::executor::index_scan::unique_probe;
use crate::executor::{Context, Executor, Record};
use crate::system::SystemManager;
use crate::value::Value;
use strata::heap::RecordFile;
use strata::index::{BTreeIndex, DATA_TIEBREAKER};
use strata::log::{LogPayload, LogRecord};
use strata::transaction::WriteRecord;
use strata::{Rid, StrataError};

impl std::fmt::Debug for InsertExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertExecutor").finish_non_exhaustive()
    }
}

pub struct InsertExecutor {
    sm: Arc<SystemManager>,
    tab: TabMeta,
    fh: Arc<RecordFile>,
    values: Vec<Value>,
    ctx: Context,
    rid: Rid,
    done: bool,
}

impl InsertExecutor {
    pub fn new(
        sm: Arc<SystemManager>,
        tab_name: &str,
        values: Vec<Value>,
        ctx: Context,
    ) -> QueryResult<Self> {
        let tab = sm.table_meta(tab_name)?;
        if values.len() != tab.cols.len() {
            return Err(QueryError::InvalidValueCount {
                expected: tab.cols.len(),
                given: values.len(),
            });
        }
        let fh = sm.record_file(tab_name)?;
        Ok(Self {
            sm,
            tab,
            fh,
            values,
            ctx,
            rid: Rid::new(strata::INVALID_PAGE_NO, -1),
            done: false,
        })
    }

    fn encode_record(&self) -> QueryResult<Vec<u8>> {
        let mut data = vec![0u8; self.tab.record_size()];
        for (col, value) in self.tab.cols.iter().zip(self.values.iter()) {
            let value = value.clone().coerce_to(col.col_type);
            if value.col_type() != col.col_type {
                return Err(QueryError::IncompatibleType {
                    lhs: col.name.clone(),
                    rhs: format!("{value:?}"),
                });
            }
            data[col.offset..col.offset + col.len].copy_from_slice(&value.encode(col.len)?);
        }
        Ok(data)
    }

    fn index_handles(&self) -> QueryResult<Vec<Arc<BTreeIndex>>> {
        self.tab
            .indexes
            .iter()
            .map(|ix| self.sm.index_handle(&ix.file_name()))
            .collect()
    }

    fn run(&mut self) -> QueryResult<()> {
        let txn = &self.ctx.txn;
        let data = self.encode_record()?;
        self.ctx.locks.lock_ix_on_table(txn, self.fh.fd())?;

        // Probe every index before touching anything: a duplicate leaves
        // both the heap and the indexes untouched.
        let handles = self.index_handles()?;
        for (index, ih) in self.tab.indexes.iter().zip(handles.iter()) {
            let key = build_index_key(&data, index, DATA_TIEBREAKER);
            if unique_probe(ih, &key)?.is_some() {
                return Err(StrataError::UniquenessViolation(ih.name().to_string()).into());
            }
        }

        let rid = self
            .fh
            .insert_record(&data, Some((self.ctx.log.as_ref(), txn.as_ref())))?;
        self.ctx.locks.lock_exclusive_on_record(txn, rid, self.fh.fd())?;

        for (index, ih) in self.tab.indexes.iter().zip(handles.iter()) {
            let key = build_index_key(&data, index, DATA_TIEBREAKER);
            ih.insert_entry(&key, rid)?;
            txn.append_write_record(WriteRecord::InsertEntry {
                index: ih.name().to_string(),
                key,
            });
        }

        let mut record = LogRecord::new(
            txn.id(),
            txn.prev_lsn(),
            LogPayload::Insert {
                value: data,
                rid,
                table: self.tab.name.clone(),
            },
        );
        let lsn = self.ctx.log.append(&mut record)?;
        txn.set_prev_lsn(lsn);
        self.sm
            .pool()
            .update_page_lsn(self.fh.fd(), rid.page_no, lsn)?;

        txn.append_write_record(WriteRecord::InsertTuple {
            table: self.tab.name.clone(),
            rid,
        });
        self.rid = rid;
        Ok(())
    }
}

impl Executor for InsertExecutor {
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
        Ok(Record::new(self.fh.get_record(self.rid)?))
    }

    fn rid(&self) -> Rid {
        self.rid
    }
}
