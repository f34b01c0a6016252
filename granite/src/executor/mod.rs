//! Pull-based physical operators. Read executors stream records through
//! `begin`/`next`/`current`; write executors perform their batch in `begin`
//! and report the affected row count.

use std::sync::Arc;

use crate::catalog::ColMeta;
use crate::errors::QueryResult;
use crate::system::SystemManager;
use crate::value::Value;
use strata::lock_manager::LockManager;
use strata::log::LogManager;
use strata::transaction::Transaction;
use strata::Rid;

mod delete;
mod index_scan;
mod insert;
mod projection;
mod seq_scan;
mod update;

pub use delete::DeleteExecutor;
pub use index_scan::IndexScanExecutor;
pub use insert::InsertExecutor;
pub use projection::ProjectionExecutor;
pub use seq_scan::SeqScanExecutor;
pub use update::{SetClause, UpdateExecutor};

/// Everything a statement needs from its session: the lock table, the log,
/// and the transaction it runs in.
#[derive(Clone)]
pub struct Context {
    pub locks: Arc<LockManager>,
    pub log: Arc<LogManager>,
    pub txn: Arc<Transaction>,
}

impl Context {
    pub fn new(sm: &SystemManager, txn: Arc<Transaction>) -> Self {
        Self {
            locks: sm.lock_mgr().clone(),
            log: sm.log_mgr().clone(),
            txn,
        }
    }
}

/// One materialized row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn values(&self, cols: &[ColMeta]) -> Vec<Value> {
        cols.iter()
            .map(|c| Value::decode(c.col_type, &self.data[c.offset..c.offset + c.len]))
            .collect()
    }
}

/// The operator contract: a pull iterator plus schema metadata.
pub trait Executor {
    fn schema(&self) -> &[ColMeta];

    fn begin(&mut self) -> QueryResult<()>;

    fn next(&mut self) -> QueryResult<()>;

    fn is_end(&self) -> bool;

    fn current(&self) -> QueryResult<Record>;

    /// Position of the current record in its heap file, where meaningful.
    fn rid(&self) -> Rid {
        Rid::new(strata::INVALID_PAGE_NO, -1)
    }
}

/// Drains a read executor into materialized rows.
pub fn collect(exec: &mut dyn Executor) -> QueryResult<Vec<Record>> {
    exec.begin()?;
    let mut out = Vec::new();
    while !exec.is_end() {
        out.push(exec.current()?);
        exec.next()?;
    }
    Ok(out)
}

/// Drains a read executor into the rids of its matching rows; the way a
/// write statement gathers its victim list.
pub fn collect_rids(exec: &mut dyn Executor) -> QueryResult<Vec<Rid>> {
    exec.begin()?;
    let mut out = Vec::new();
    while !exec.is_end() {
        out.push(exec.rid());
        exec.next()?;
    }
    Ok(out)
}
