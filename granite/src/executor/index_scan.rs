//! Index-driven range scan. Builds full-width probe keys from a leading
//! equality prefix plus at most one range condition, padding the unused key
//! columns with per-type extremes.

use std::sync::Arc;

use crate::catalog::{ColMeta, IndexMeta, TabMeta};
use crate::errors::{QueryError, QueryResult};
use crate::executor::{Context, Executor, Record};
use crate::system::SystemManager;
use crate::value::{eval_conds, CompOp, CondRhs, Condition, Value};
use strata::heap::RecordFile;
use strata::index::{BTreeIndex, Iid, IndexScan, DATA_TIEBREAKER};
use strata::Rid;

#[derive(Clone, Copy)]
enum Fill {
    Min,
    Max,
}

pub struct IndexScanExecutor {
    tab: TabMeta,
    index: IndexMeta,
    fh: Arc<RecordFile>,
    ih: Arc<BTreeIndex>,
    conds: Vec<Condition>,
    ctx: Context,
    scan: Option<IndexScan>,
    rid: Rid,
}

impl IndexScanExecutor {
    pub fn new(
        sm: &SystemManager,
        tab_name: &str,
        index_cols: &[&str],
        conds: Vec<Condition>,
        ctx: Context,
    ) -> QueryResult<Self> {
        let tab = sm.table_meta(tab_name)?;
        let index = tab
            .get_index_meta(index_cols)
            .ok_or_else(|| QueryError::IndexNotFound(tab_name.to_string(), index_cols.join(",")))?
            .clone();
        let ih = sm.index_handle(&index.file_name())?;
        Ok(Self {
            tab,
            index,
            fh: sm.record_file(tab_name)?,
            ih,
            conds,
            ctx,
            scan: None,
            rid: Rid::new(strata::INVALID_PAGE_NO, -1),
        })
    }

    /// Encodes a probe key: the equality prefix, then an optional bound
    /// value for the next column, then typed extremes, then the tiebreaker.
    fn probe_key(
        &self,
        eq: &[Value],
        bound: Option<&Value>,
        fill: Fill,
        tiebreaker: i32,
    ) -> QueryResult<Vec<u8>> {
        let mut key = Vec::with_capacity(self.index.col_tot_len + 4);
        for (i, col) in self.index.cols.iter().enumerate() {
            if i < eq.len() {
                key.extend(encode_for(&eq[i], col)?);
            } else if i == eq.len() && bound.is_some() {
                key.extend(encode_for(bound.unwrap(), col)?);
            } else {
                key.extend(match fill {
                    Fill::Min => Value::min_bytes(col.col_type, col.len),
                    Fill::Max => Value::max_bytes(col.col_type, col.len),
                });
            }
        }
        key.extend_from_slice(&tiebreaker.to_le_bytes());
        Ok(key)
    }

    /// Consumes the leading equality conditions in index-column order plus
    /// at most one range condition, and positions `[lower, upper)`.
    fn build_range(&self) -> QueryResult<(Iid, Iid)> {
        let mut eq = Vec::new();
        let mut range: Option<(CompOp, Value)> = None;
        for (cond, col) in self.conds.iter().zip(self.index.cols.iter()) {
            if cond.lhs.col_name != col.name {
                break;
            }
            let CondRhs::Value(value) = &cond.rhs else {
                break;
            };
            if cond.op == CompOp::Eq {
                eq.push(value.clone());
                continue;
            }
            if cond.op != CompOp::Ne {
                range = Some((cond.op, value.clone()));
            }
            break;
        }

        if eq.is_empty() && range.is_none() {
            return Ok((self.ih.leaf_begin()?, self.ih.leaf_end()?));
        }

        let prefix_lower =
            self.probe_key(&eq, None, Fill::Min, i32::MIN)
                .and_then(|k| Ok(self.ih.lower_bound(&k)?));
        let prefix_upper =
            self.probe_key(&eq, None, Fill::Max, i32::MAX)
                .and_then(|k| Ok(self.ih.upper_bound_for_gt(&k)?));

        let (lower, upper) = match &range {
            None => (prefix_lower?, prefix_upper?),
            Some((CompOp::Ge, v)) => {
                let k = self.probe_key(&eq, Some(v), Fill::Min, i32::MIN)?;
                (self.ih.lower_bound(&k)?, prefix_upper?)
            }
            Some((CompOp::Gt, v)) => {
                let k = self.probe_key(&eq, Some(v), Fill::Max, i32::MAX)?;
                (self.ih.upper_bound_for_gt(&k)?, prefix_upper?)
            }
            Some((CompOp::Le, v)) => {
                let k = self.probe_key(&eq, Some(v), Fill::Max, i32::MAX)?;
                (prefix_lower?, self.ih.upper_bound_for_gt(&k)?)
            }
            Some((CompOp::Lt, v)) => {
                let k = self.probe_key(&eq, Some(v), Fill::Min, i32::MIN)?;
                (prefix_lower?, self.ih.lower_bound(&k)?)
            }
            Some((CompOp::Eq, _)) | Some((CompOp::Ne, _)) => (prefix_lower?, prefix_upper?),
        };
        Ok((lower, upper))
    }

    /// Advances the cursor to the next entry whose row passes every residual
    /// predicate, taking a row share lock per visited row.
    fn seek_match(&mut self) -> QueryResult<()> {
        let fd = self.fh.fd();
        while let Some(scan) = self.scan.as_mut() {
            if scan.is_end() {
                break;
            }
            let rid = scan.rid()?;
            self.ctx.locks.lock_shared_on_record(&self.ctx.txn, rid, fd)?;
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

/// Encodes a literal for one key column, applying the dialect's widening.
fn encode_for(value: &Value, col: &ColMeta) -> QueryResult<Vec<u8>> {
    let value = value.clone().coerce_to(col.col_type);
    if value.col_type() != col.col_type {
        return Err(QueryError::IncompatibleType {
            lhs: col.name.clone(),
            rhs: format!("{value:?}"),
        });
    }
    value.encode(col.len)
}

impl Executor for IndexScanExecutor {
    fn schema(&self) -> &[ColMeta] {
        &self.tab.cols
    }

    fn begin(&mut self) -> QueryResult<()> {
        self.ctx.locks.lock_is_on_table(&self.ctx.txn, self.fh.fd())?;
        let (lower, upper) = self.build_range()?;
        self.scan = Some(IndexScan::new(self.ih.clone(), lower, upper));
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

// The exact-match probe every write path uses before inserting: the data
// tiebreaker finds only real entries.
pub(crate) fn unique_probe(
    ih: &BTreeIndex,
    key: &[u8],
) -> QueryResult<Option<Rid>> {
    debug_assert_eq!(
        &key[key.len() - 4..],
        &DATA_TIEBREAKER.to_le_bytes(),
        "uniqueness probes carry the data tiebreaker"
    );
    let mut hits = Vec::new();
    if ih.get_value(key, &mut hits)? {
        Ok(hits.pop())
    } else {
        Ok(None)
    }
}
