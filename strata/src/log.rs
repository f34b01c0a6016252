//! The write-ahead log: record layout, LSN assignment and the log buffer.

use bytes::{Buf, BufMut, BytesMut};
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::disk::DiskManager;
use crate::errors::{Result, StrataError};
use crate::{Lsn, PageNo, Rid, TxnId, PAGE_SIZE};

pub const LOG_BUFFER_SIZE: usize = 4 * PAGE_SIZE;

/// LSNs start at 1 so that a page that was never written (page LSN 0 after a
/// zero-filled read) always tests older than any logged record.
pub const FIRST_LSN: Lsn = 1;

const LOG_HEADER_SIZE: usize = 20;

const LOG_TYPE_BEGIN: u32 = 0;
const LOG_TYPE_COMMIT: u32 = 1;
const LOG_TYPE_ABORT: u32 = 2;
const LOG_TYPE_INSERT: u32 = 3;
const LOG_TYPE_DELETE: u32 = 4;
const LOG_TYPE_UPDATE: u32 = 5;
const LOG_TYPE_NEWPAGE: u32 = 6;

/// The type-specific tail of a log record.
#[derive(Debug, Clone, PartialEq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Insert {
        value: Vec<u8>,
        rid: Rid,
        table: String,
    },
    Delete {
        value: Vec<u8>,
        rid: Rid,
        table: String,
    },
    Update {
        old_value: Vec<u8>,
        new_value: Vec<u8>,
        rid: Rid,
        table: String,
    },
    NewPage {
        table: String,
        page_no: PageNo,
    },
}

/// One log record: the common header plus a per-type payload. The LSN is
/// assigned by the log manager when the record is appended.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub payload: LogPayload,
}

impl LogRecord {
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, payload: LogPayload) -> Self {
        Self {
            lsn: crate::INVALID_LSN,
            txn_id,
            prev_lsn,
            payload,
        }
    }

    fn log_type(&self) -> u32 {
        match self.payload {
            LogPayload::Begin => LOG_TYPE_BEGIN,
            LogPayload::Commit => LOG_TYPE_COMMIT,
            LogPayload::Abort => LOG_TYPE_ABORT,
            LogPayload::Insert { .. } => LOG_TYPE_INSERT,
            LogPayload::Delete { .. } => LOG_TYPE_DELETE,
            LogPayload::Update { .. } => LOG_TYPE_UPDATE,
            LogPayload::NewPage { .. } => LOG_TYPE_NEWPAGE,
        }
    }

    pub fn encoded_len(&self) -> usize {
        LOG_HEADER_SIZE
            + match &self.payload {
                LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => 0,
                LogPayload::Insert { value, table, .. }
                | LogPayload::Delete { value, table, .. } => 4 + value.len() + 8 + 8 + table.len(),
                LogPayload::Update {
                    old_value,
                    new_value,
                    table,
                    ..
                } => 4 + old_value.len() + 4 + new_value.len() + 8 + 8 + table.len(),
                LogPayload::NewPage { table, .. } => 8 + table.len() + 4,
            }
    }

    pub fn encode(&self) -> Vec<u8> {
        let total = self.encoded_len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32_le(self.log_type());
        buf.put_i32_le(self.lsn);
        buf.put_u32_le(total as u32);
        buf.put_i32_le(self.txn_id);
        buf.put_i32_le(self.prev_lsn);
        match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => {}
            LogPayload::Insert { value, rid, table } | LogPayload::Delete { value, rid, table } => {
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
                buf.put_i32_le(rid.page_no);
                buf.put_i32_le(rid.slot_no);
                buf.put_u64_le(table.len() as u64);
                buf.put_slice(table.as_bytes());
            }
            LogPayload::Update {
                old_value,
                new_value,
                rid,
                table,
            } => {
                buf.put_u32_le(old_value.len() as u32);
                buf.put_slice(old_value);
                buf.put_u32_le(new_value.len() as u32);
                buf.put_slice(new_value);
                buf.put_i32_le(rid.page_no);
                buf.put_i32_le(rid.slot_no);
                buf.put_u64_le(table.len() as u64);
                buf.put_slice(table.as_bytes());
            }
            LogPayload::NewPage { table, page_no } => {
                buf.put_u64_le(table.len() as u64);
                buf.put_slice(table.as_bytes());
                buf.put_i32_le(*page_no);
            }
        }
        buf.to_vec()
    }

    /// Decodes one record from the front of `buf`. Returns `None` when the
    /// buffer holds less than a whole record, which at the log tail means a
    /// torn write from a crash.
    pub fn decode(buf: &[u8]) -> Option<(LogRecord, usize)> {
        if buf.len() < LOG_HEADER_SIZE {
            return None;
        }
        let mut cur = buf;
        let log_type = cur.get_u32_le();
        let lsn = cur.get_i32_le();
        let total = cur.get_u32_le() as usize;
        let txn_id = cur.get_i32_le();
        let prev_lsn = cur.get_i32_le();
        if total < LOG_HEADER_SIZE || buf.len() < total {
            return None;
        }
        let mut tail = &buf[LOG_HEADER_SIZE..total];
        let payload = match log_type {
            LOG_TYPE_BEGIN => LogPayload::Begin,
            LOG_TYPE_COMMIT => LogPayload::Commit,
            LOG_TYPE_ABORT => LogPayload::Abort,
            LOG_TYPE_INSERT | LOG_TYPE_DELETE => {
                let value = get_bytes(&mut tail, false)?;
                let rid = get_rid(&mut tail)?;
                let table = get_name(&mut tail)?;
                if log_type == LOG_TYPE_INSERT {
                    LogPayload::Insert { value, rid, table }
                } else {
                    LogPayload::Delete { value, rid, table }
                }
            }
            LOG_TYPE_UPDATE => {
                let old_value = get_bytes(&mut tail, false)?;
                let new_value = get_bytes(&mut tail, false)?;
                let rid = get_rid(&mut tail)?;
                let table = get_name(&mut tail)?;
                LogPayload::Update {
                    old_value,
                    new_value,
                    rid,
                    table,
                }
            }
            LOG_TYPE_NEWPAGE => {
                let table = get_name(&mut tail)?;
                if tail.remaining() < 4 {
                    return None;
                }
                let page_no = tail.get_i32_le();
                LogPayload::NewPage { table, page_no }
            }
            _ => return None,
        };
        Some((
            LogRecord {
                lsn,
                txn_id,
                prev_lsn,
                payload,
            },
            total,
        ))
    }
}

fn get_bytes(cur: &mut &[u8], wide: bool) -> Option<Vec<u8>> {
    let len = if wide {
        if cur.remaining() < 8 {
            return None;
        }
        cur.get_u64_le() as usize
    } else {
        if cur.remaining() < 4 {
            return None;
        }
        cur.get_u32_le() as usize
    };
    if cur.remaining() < len {
        return None;
    }
    let out = cur[..len].to_vec();
    cur.advance(len);
    Some(out)
}

fn get_rid(cur: &mut &[u8]) -> Option<Rid> {
    if cur.remaining() < 8 {
        return None;
    }
    Some(Rid::new(cur.get_i32_le(), cur.get_i32_le()))
}

fn get_name(cur: &mut &[u8]) -> Option<String> {
    let bytes = get_bytes(cur, true)?;
    String::from_utf8(bytes).ok()
}

struct LogBuffer {
    buf: Vec<u8>,
    global_lsn: Lsn,
}

/// Append-only log with a single in-memory buffer. All operations serialize
/// on the buffer latch; `persist_lsn` is readable without it so the buffer
/// pool can test the WAL rule before writing a dirty page.
pub struct LogManager {
    disk: Arc<DiskManager>,
    inner: Mutex<LogBuffer>,
    persist_lsn: AtomicI32,
}

impl LogManager {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        Self {
            disk,
            inner: Mutex::new(LogBuffer {
                buf: Vec::with_capacity(LOG_BUFFER_SIZE),
                global_lsn: FIRST_LSN,
            }),
            persist_lsn: AtomicI32::new(FIRST_LSN - 1),
        }
    }

    /// Serializes the record into the buffer, assigning its LSN. A record
    /// that does not fit forces a flush first.
    pub fn append(&self, record: &mut LogRecord) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        record.lsn = inner.global_lsn;
        inner.global_lsn += 1;
        let bytes = record.encode();
        if bytes.len() > LOG_BUFFER_SIZE {
            return Err(StrataError::Internal(format!(
                "log record of {} bytes exceeds the log buffer",
                bytes.len()
            )));
        }
        if inner.buf.len() + bytes.len() > LOG_BUFFER_SIZE {
            self.flush_locked(&mut inner)?;
        }
        inner.buf.extend_from_slice(&bytes);
        Ok(record.lsn)
    }

    /// Writes the buffer to the log file and advances `persist_lsn`.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut LogBuffer) -> Result<()> {
        if !inner.buf.is_empty() {
            self.disk.write_log(&inner.buf)?;
            inner.buf.clear();
        }
        self.persist_lsn.store(inner.global_lsn - 1, Ordering::SeqCst);
        debug!("log flushed, persist_lsn={}", inner.global_lsn - 1);
        Ok(())
    }

    /// Highest LSN already durable in the log file.
    pub fn persist_lsn(&self) -> Lsn {
        self.persist_lsn.load(Ordering::SeqCst)
    }

    /// Re-primes the LSN counter after restart recovery has read the tail of
    /// the existing log.
    pub fn reset_lsn(&self, next_lsn: Lsn) {
        let mut inner = self.inner.lock();
        inner.global_lsn = next_lsn.max(FIRST_LSN);
        self.persist_lsn
            .store(inner.global_lsn - 1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_assigns_increasing_lsns_and_flush_advances_persist() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()));
        disk.open_log("db.log").unwrap();
        let log = LogManager::new(disk.clone());

        let mut begin = LogRecord::new(1, crate::INVALID_LSN, LogPayload::Begin);
        let first = log.append(&mut begin).unwrap();
        let mut insert = LogRecord::new(
            1,
            first,
            LogPayload::Insert {
                value: vec![1, 2, 3],
                rid: Rid::new(1, 0),
                table: "t".into(),
            },
        );
        let second = log.append(&mut insert).unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(log.persist_lsn(), first - 1);

        log.flush().unwrap();
        assert_eq!(log.persist_lsn(), second);

        // Both records are decodable from the file in order.
        let mut buf = vec![0u8; LOG_BUFFER_SIZE];
        let n = disk.read_log(&mut buf, 0).unwrap();
        let (rec, len) = LogRecord::decode(&buf[..n]).unwrap();
        assert_eq!(rec, begin);
        let (rec, _) = LogRecord::decode(&buf[len..n]).unwrap();
        assert_eq!(rec, insert);
    }

    #[test]
    fn torn_tail_decodes_as_none() {
        let mut rec = LogRecord::new(
            9,
            3,
            LogPayload::Update {
                old_value: vec![0; 16],
                new_value: vec![1; 16],
                rid: Rid::new(2, 5),
                table: "accounts".into(),
            },
        );
        rec.lsn = 12;
        let bytes = rec.encode();
        assert!(LogRecord::decode(&bytes[..bytes.len() - 1]).is_none());
        let (back, consumed) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(back, rec);
    }
}
