//! Full-table scan with predicate filtering.

use std::sync::Arc;

use crate::catalog::{ColMeta, TabMeta};
use crate::errors::QueryResult;
use crate::executor::{Context, Executor, Record};
use crate::system::SystemManager;
use crate::value::{eval_conds, Condition};
use strata::heap::{RecordFile, RecordScan};
use strata::Rid;

pub struct SeqScanExecutor {
    tab: TabMeta,
    fh: Arc<RecordFile>,
    conds: Vec<Condition>,
    ctx: Context,
    scan: Option<RecordScan>,
    rid: Rid,
}

impl SeqScanExecutor {
    pub fn new(
        sm: &SystemManager,
        tab_name: &str,
        conds: Vec<Condition>,
        ctx: Context,
    ) -> QueryResult<Self> {
        Ok(Self {
            tab: sm.table_meta(tab_name)?,
            fh: sm.record_file(tab_name)?,
            conds,
            ctx,
            scan: None,
            rid: Rid::new(strata::INVALID_PAGE_NO, -1),
        })
    }

    /// Advances the underlying scan to the next record matching every
    /// predicate.
    fn seek_match(&mut self) -> QueryResult<()> {
        let scan = self.scan.as_mut().expect("scan started");
        while !scan.is_end() {
            let rid = scan.rid();
            let record = self.fh.get_record(rid)?;
            if eval_conds(&record, &self.conds, &self.tab.cols)? {
                self.rid = rid;
                return Ok(());
            }
            scan.next()?;
        }
        Ok(())
    }
}

impl Executor for SeqScanExecutor {
    fn schema(&self) -> &[ColMeta] {
        &self.tab.cols
    }

    fn begin(&mut self) -> QueryResult<()> {
        self.ctx
            .locks
            .lock_shared_on_table(&self.ctx.txn, self.fh.fd())?;
        self.scan = Some(RecordScan::new(self.fh.clone())?);
        self.seek_match()
    }

    fn next(&mut self) -> QueryResult<()> {
        if let Some(scan) = self.scan.as_mut() {
            scan.next()?;
        }
        self.seek_match()
    }

    fn is_end(&self) -> bool {
        self.scan.as_ref().map(|s| s.is_end()).unwrap_or(true)
    }

    fn current(&self) -> QueryResult<Record> {
        Ok(Record::new(self.fh.get_record(self.rid)?))
    }

    fn rid(&self) -> Rid {
        self.rid
    }
}
