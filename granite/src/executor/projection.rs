//! Column projection over any child executor.

use crate::catalog::ColMeta;
use crate::errors::{QueryError, QueryResult};
use crate::executor::{Executor, Record};
use strata::Rid;

pub struct ProjectionExecutor {
    child: Box<dyn Executor>,
    /// Output columns with recomputed offsets.
    cols: Vec<ColMeta>,
    /// For each output column, its source column in the child's schema.
    sources: Vec<ColMeta>,
}

impl ProjectionExecutor {
    pub fn new(child: Box<dyn Executor>, col_names: &[&str]) -> QueryResult<Self> {
        let mut cols = Vec::with_capacity(col_names.len());
        let mut sources = Vec::with_capacity(col_names.len());
        let mut offset = 0;
        for name in col_names {
            let src = child
                .schema()
                .iter()
                .find(|c| c.name == *name)
                .ok_or_else(|| QueryError::ColumnNotFound(name.to_string()))?
                .clone();
            let mut out = src.clone();
            out.offset = offset;
            offset += out.len;
            cols.push(out);
            sources.push(src);
        }
        Ok(Self {
            child,
            cols,
            sources,
        })
    }
}

impl Executor for ProjectionExecutor {
    fn schema(&self) -> &[ColMeta] {
        &self.cols
    }

    fn begin(&mut self) -> QueryResult<()> {
        self.child.begin()
    }

    fn next(&mut self) -> QueryResult<()> {
        self.child.next()
    }

    fn is_end(&self) -> bool {
        self.child.is_end()
    }

    fn current(&self) -> QueryResult<Record> {
        let row = self.child.current()?;
        let mut data = Vec::with_capacity(self.cols.iter().map(|c| c.len).sum());
        for src in &self.sources {
            data.extend_from_slice(&row.data[src.offset..src.offset + src.len]);
        }
        Ok(Record::new(data))
    }

    fn rid(&self) -> Rid {
        self.child.rid()
    }
}
