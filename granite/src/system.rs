//! The system manager: database lifecycle, DDL, recovery orchestration and
//! the registries of open files shared with the executors.

use log::info;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::{
    build_index_key, index_file_name, ColDef, ColMeta, DbMeta, IndexMeta, TabMeta, DB_META_NAME,
    LOG_FILE_NAME,
};
use crate::errors::{QueryError, QueryResult};
use strata::buffer_pool::BufferPoolManager;
use strata::disk::DiskManager;
use strata::heap::{RecordFile, RecordScan};
use strata::index::{BTreeIndex, DATA_TIEBREAKER};
use strata::lock_manager::LockManager;
use strata::log::LogManager;
use strata::recovery::RecoveryManager;
use strata::transaction::{Transaction, TransactionManager};
use strata::{FileRegistry, StrataError};

pub const DEFAULT_POOL_SIZE: usize = 256;

/// Recovery sees the heap only: indexes are rebuilt afterwards, not redone.
struct HeapRegistry<'a>(&'a HashMap<String, Arc<RecordFile>>);

impl FileRegistry for HeapRegistry<'_> {
    fn record_file(&self, table: &str) -> Option<Arc<RecordFile>> {
        self.0.get(table).cloned()
    }

    fn index(&self, _name: &str) -> Option<Arc<BTreeIndex>> {
        None
    }
}

/// One open database. Owns the engine components and the maps from table
/// and index names to their open file handles.
pub struct SystemManager {
    db_path: PathBuf,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPoolManager>,
    log: Arc<LogManager>,
    locks: Arc<LockManager>,
    txns: TransactionManager,
    meta: RwLock<DbMeta>,
    fhs: RwLock<HashMap<String, Arc<RecordFile>>>,
    ihs: RwLock<HashMap<String, Arc<BTreeIndex>>>,
}

impl FileRegistry for SystemManager {
    fn record_file(&self, table: &str) -> Option<Arc<RecordFile>> {
        self.fhs.read().get(table).cloned()
    }

    fn index(&self, name: &str) -> Option<Arc<BTreeIndex>> {
        self.ihs.read().get(name).cloned()
    }
}

impl SystemManager {
    /// Creates a database directory with an empty catalog and log file.
    pub fn create_db<P: AsRef<Path>>(path: P) -> QueryResult<()> {
        let path = path.as_ref();
        if path.is_dir() {
            return Err(QueryError::DatabaseExists(path.display().to_string()));
        }
        std::fs::create_dir_all(path)?;
        let meta = DbMeta {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            tabs: HashMap::new(),
        };
        std::fs::write(path.join(DB_META_NAME), serde_json::to_string_pretty(&meta)?)?;
        std::fs::File::create(path.join(LOG_FILE_NAME))?;
        Ok(())
    }

    pub fn drop_db<P: AsRef<Path>>(path: P) -> QueryResult<()> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(QueryError::DatabaseNotFound(path.display().to_string()));
        }
        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    /// Opens a database: loads the catalog, opens every file, and when the
    /// log is non-empty replays it and rebuilds every index from the heap.
    pub fn open<P: AsRef<Path>>(path: P, pool_size: usize) -> QueryResult<Arc<Self>> {
        let db_path = path.as_ref().to_path_buf();
        if !db_path.is_dir() {
            return Err(QueryError::DatabaseNotFound(db_path.display().to_string()));
        }
        let meta: DbMeta = serde_json::from_str(&std::fs::read_to_string(
            db_path.join(DB_META_NAME),
        )?)?;

        let disk = Arc::new(DiskManager::new(&db_path));
        disk.open_log(LOG_FILE_NAME)?;
        let log = Arc::new(LogManager::new(disk.clone()));
        let pool = Arc::new(BufferPoolManager::new(
            pool_size,
            disk.clone(),
            Some(log.clone()),
        ));
        let locks = Arc::new(LockManager::new());

        let mut fhs = HashMap::new();
        for tab in meta.tabs.values() {
            fhs.insert(
                tab.name.clone(),
                RecordFile::open(&disk, pool.clone(), &tab.name)?,
            );
        }

        let mut next_txn_id = 0;
        let recovered = disk.log_len() > 0;
        if recovered {
            let recovery = RecoveryManager::new(disk.clone(), pool.clone(), log.clone());
            next_txn_id = recovery.recover(&HeapRegistry(&fhs))? + 1;
            info!("database {} recovered from its log", db_path.display());
        }

        let mut ihs = HashMap::new();
        for tab in meta.tabs.values() {
            for index in &tab.indexes {
                let name = index.file_name();
                if recovered {
                    // Index contents are not logged; rebuild from the heap.
                    if disk.is_file(&name) {
                        disk.destroy_file(&name)?;
                    }
                    BTreeIndex::create(
                        &disk,
                        &name,
                        index.cols.iter().map(|c| c.col_type).collect(),
                        index.cols.iter().map(|c| c.len).collect(),
                    )?;
                    let ih = BTreeIndex::open(&disk, pool.clone(), &name)?;
                    let fh = &fhs[&index.tab_name];
                    bulk_build(fh, &ih, index, false)?;
                    ihs.insert(name, ih);
                } else {
                    ihs.insert(name.clone(), BTreeIndex::open(&disk, pool.clone(), &name)?);
                }
            }
        }

        let txns = TransactionManager::new(next_txn_id, locks.clone(), log.clone());
        Ok(Arc::new(Self {
            db_path,
            disk,
            pool,
            log,
            locks,
            txns,
            meta: RwLock::new(meta),
            fhs: RwLock::new(fhs),
            ihs: RwLock::new(ihs),
        }))
    }

    /// Flushes the catalog, every open file and the log, then closes them.
    pub fn close(&self) -> QueryResult<()> {
        self.flush_meta()?;
        self.log.flush()?;
        for fh in self.fhs.write().drain().map(|(_, fh)| fh) {
            fh.close()?;
        }
        for ih in self.ihs.write().drain().map(|(_, ih)| ih) {
            ih.close()?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn pool(&self) -> &Arc<BufferPoolManager> {
        &self.pool
    }

    pub fn log_mgr(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn lock_mgr(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn flush_meta(&self) -> QueryResult<()> {
        let meta = self.meta.read();
        std::fs::write(
            self.db_path.join(DB_META_NAME),
            serde_json::to_string_pretty(&*meta)?,
        )?;
        Ok(())
    }

    pub fn table_meta(&self, name: &str) -> QueryResult<TabMeta> {
        self.meta.read().get_table(name).cloned()
    }

    pub fn record_file(&self, table: &str) -> QueryResult<Arc<RecordFile>> {
        self.fhs
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| QueryError::TableNotFound(table.to_string()))
    }

    pub fn index_handle(&self, name: &str) -> QueryResult<Arc<BTreeIndex>> {
        self.ihs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::TableNotFound(name.to_string()))
    }

    // --- transactions ---

    pub fn begin_txn(&self) -> QueryResult<Arc<Transaction>> {
        Ok(self.txns.begin(None)?)
    }

    pub fn commit_txn(&self, txn: &Arc<Transaction>) -> QueryResult<()> {
        Ok(self.txns.commit(txn)?)
    }

    pub fn abort_txn(&self, txn: &Arc<Transaction>) -> QueryResult<()> {
        Ok(self.txns.abort(txn, self)?)
    }

    // --- DDL ---

    pub fn create_table(&self, tab_name: &str, col_defs: &[ColDef]) -> QueryResult<()> {
        let mut meta = self.meta.write();
        if meta.is_table(tab_name) {
            return Err(QueryError::TableExists(tab_name.to_string()));
        }
        let mut offset = 0;
        let mut cols = Vec::with_capacity(col_defs.len());
        for def in col_defs {
            cols.push(ColMeta {
                tab_name: tab_name.to_string(),
                name: def.name.clone(),
                col_type: def.col_type,
                len: def.len,
                offset,
                indexed: false,
            });
            offset += def.len;
        }
        let tab = TabMeta {
            name: tab_name.to_string(),
            cols,
            indexes: Vec::new(),
        };
        RecordFile::create(&self.disk, tab_name, offset)?;
        self.fhs.write().insert(
            tab_name.to_string(),
            RecordFile::open(&self.disk, self.pool.clone(), tab_name)?,
        );
        meta.tabs.insert(tab_name.to_string(), tab);
        drop(meta);
        self.flush_meta()
    }

    pub fn drop_table(&self, tab_name: &str) -> QueryResult<()> {
        let mut meta = self.meta.write();
        let tab = meta.get_table(tab_name)?.clone();
        if let Some(fh) = self.fhs.write().remove(tab_name) {
            fh.close()?;
        }
        self.disk.destroy_file(tab_name)?;
        for index in &tab.indexes {
            let name = index.file_name();
            if let Some(ih) = self.ihs.write().remove(&name) {
                ih.close()?;
            }
            self.disk.destroy_file(&name)?;
        }
        meta.tabs.remove(tab_name);
        drop(meta);
        self.flush_meta()
    }

    /// Creates a unique index over `col_names` and bulk-builds it from the
    /// table, probing before every insert; a duplicate prefix aborts the
    /// build and removes the half-built file.
    pub fn create_index(&self, tab_name: &str, col_names: &[&str]) -> QueryResult<()> {
        let mut meta = self.meta.write();
        let tab = meta.get_table_mut(tab_name)?;
        if tab.is_index(col_names) {
            return Err(QueryError::IndexExists(
                tab_name.to_string(),
                col_names.join(","),
            ));
        }
        let mut cols = Vec::with_capacity(col_names.len());
        let mut col_tot_len = 0;
        for name in col_names {
            let col = tab.get_col(name)?.clone();
            col_tot_len += col.len;
            cols.push(col);
        }
        let index = IndexMeta {
            tab_name: tab_name.to_string(),
            col_tot_len,
            col_num: cols.len(),
            cols,
        };
        let name = index.file_name();

        BTreeIndex::create(
            &self.disk,
            &name,
            index.cols.iter().map(|c| c.col_type).collect(),
            index.cols.iter().map(|c| c.len).collect(),
        )?;
        let ih = BTreeIndex::open(&self.disk, self.pool.clone(), &name)?;
        let fh = self.record_file(tab_name)?;
        if let Err(e) = bulk_build(&fh, &ih, &index, true) {
            ih.close()?;
            self.disk.destroy_file(&name)?;
            return Err(e);
        }

        for col in tab.cols.iter_mut() {
            if col_names.contains(&col.name.as_str()) {
                col.indexed = true;
            }
        }
        tab.indexes.push(index);
        self.ihs.write().insert(name, ih);
        drop(meta);
        self.flush_meta()
    }

    pub fn drop_index(&self, tab_name: &str, col_names: &[&str]) -> QueryResult<()> {
        let mut meta = self.meta.write();
        let tab = meta.get_table_mut(tab_name)?;
        if !tab.is_index(col_names) {
            return Err(QueryError::IndexNotFound(
                tab_name.to_string(),
                col_names.join(","),
            ));
        }
        let name = index_file_name(tab_name, col_names.iter().copied());
        if let Some(ih) = self.ihs.write().remove(&name) {
            ih.close()?;
        }
        self.disk.destroy_file(&name)?;
        tab.indexes.retain(|ix| ix.file_name() != name);
        let remaining: Vec<Vec<String>> = tab
            .indexes
            .iter()
            .map(|ix| ix.cols.iter().map(|c| c.name.clone()).collect())
            .collect();
        for col in tab.cols.iter_mut() {
            col.indexed = remaining.iter().any(|ix| ix.contains(&col.name));
        }
        drop(meta);
        self.flush_meta()
    }
}

/// Inserts every heap record into the index. With `probe` set, a key whose
/// column prefix is already present fails the build.
fn bulk_build(
    fh: &Arc<RecordFile>,
    ih: &Arc<BTreeIndex>,
    index: &IndexMeta,
    probe: bool,
) -> QueryResult<()> {
    let mut scan = RecordScan::new(fh.clone())?;
    while !scan.is_end() {
        let rid = scan.rid();
        let record = fh.get_record(rid)?;
        let key = build_index_key(&record, index, DATA_TIEBREAKER);
        if probe {
            let mut hits = Vec::new();
            if ih.get_value(&key, &mut hits)? {
                return Err(QueryError::Storage(StrataError::UniquenessViolation(
                    ih.name().to_string(),
                )));
            }
        }
        ih.insert_entry(&key, rid)?;
        scan.next()?;
    }
    Ok(())
}
