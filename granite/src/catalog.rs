//! The database catalog: column, table and index metadata, persisted as the
//! per-database metadata file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::{QueryError, QueryResult};
use strata::ColType;

pub const DB_META_NAME: &str = "db.meta";
pub const LOG_FILE_NAME: &str = "db.log";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColMeta {
    pub tab_name: String,
    pub name: String,
    pub col_type: ColType,
    pub len: usize,
    pub offset: usize,
    pub indexed: bool,
}

/// Column definition supplied to `create_table`.
#[derive(Debug, Clone)]
pub struct ColDef {
    pub name: String,
    pub col_type: ColType,
    pub len: usize,
}

impl ColDef {
    pub fn new(name: &str, col_type: ColType, len: usize) -> Self {
        Self {
            name: name.to_string(),
            col_type,
            len,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub tab_name: String,
    pub col_tot_len: usize,
    pub col_num: usize,
    pub cols: Vec<ColMeta>,
}

impl IndexMeta {
    /// The index file name: `{table}_{col1}_..._{coln}.idx`.
    pub fn file_name(&self) -> String {
        index_file_name(&self.tab_name, self.cols.iter().map(|c| c.name.as_str()))
    }
}

pub fn index_file_name<'a>(tab_name: &str, cols: impl Iterator<Item = &'a str>) -> String {
    let mut name = tab_name.to_string();
    for col in cols {
        name.push('_');
        name.push_str(col);
    }
    name.push_str(".idx");
    name
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabMeta {
    pub name: String,
    pub cols: Vec<ColMeta>,
    pub indexes: Vec<IndexMeta>,
}

impl TabMeta {
    pub fn get_col(&self, name: &str) -> QueryResult<&ColMeta> {
        self.cols
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| QueryError::ColumnNotFound(name.to_string()))
    }

    pub fn record_size(&self) -> usize {
        self.cols.last().map(|c| c.offset + c.len).unwrap_or(0)
    }

    pub fn is_index(&self, col_names: &[&str]) -> bool {
        self.get_index_meta(col_names).is_some()
    }

    pub fn get_index_meta(&self, col_names: &[&str]) -> Option<&IndexMeta> {
        self.indexes.iter().find(|ix| {
            ix.cols.len() == col_names.len()
                && ix.cols.iter().zip(col_names).all(|(c, n)| c.name == *n)
        })
    }
}

/// The whole catalog of one database; text-serialized to [`DB_META_NAME`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbMeta {
    pub name: String,
    pub tabs: HashMap<String, TabMeta>,
}

impl DbMeta {
    pub fn is_table(&self, name: &str) -> bool {
        self.tabs.contains_key(name)
    }

    pub fn get_table(&self, name: &str) -> QueryResult<&TabMeta> {
        self.tabs
            .get(name)
            .ok_or_else(|| QueryError::TableNotFound(name.to_string()))
    }

    pub fn get_table_mut(&mut self, name: &str) -> QueryResult<&mut TabMeta> {
        self.tabs
            .get_mut(name)
            .ok_or_else(|| QueryError::TableNotFound(name.to_string()))
    }
}

/// Builds the stored key for one record under an index:
/// `concat(column bytes) || tiebreaker`.
pub fn build_index_key(record: &[u8], index: &IndexMeta, tiebreaker: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(index.col_tot_len + 4);
    for col in &index.cols {
        key.extend_from_slice(&record[col.offset..col.offset + col.len]);
    }
    key.extend_from_slice(&tiebreaker.to_le_bytes());
    key
}
