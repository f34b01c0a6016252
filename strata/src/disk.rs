//! Raw file I/O for one database directory: paged data files and the
//! append-only log file.

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::errors::{Result, StrataError};
use crate::{PageNo, PAGE_SIZE};

struct OpenFile {
    file: File,
    path: PathBuf,
}

#[derive(Default)]
struct DiskInner {
    files: HashMap<i32, OpenFile>,
    path2fd: HashMap<PathBuf, i32>,
    /// Next page number to hand out per file, the allocation marker.
    fd2pageno: HashMap<i32, PageNo>,
}

struct LogFile {
    file: File,
    len: u64,
}

/// Owns every open file of a database. Page I/O is keyed by
/// (file descriptor, page number); the log file is append-only.
pub struct DiskManager {
    dir: PathBuf,
    next_fd: AtomicI32,
    inner: Mutex<DiskInner>,
    log: Mutex<Option<LogFile>>,
}

impl DiskManager {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            next_fd: AtomicI32::new(0),
            inner: Mutex::new(DiskInner::default()),
            log: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn is_file(&self, name: &str) -> bool {
        self.resolve(name).is_file()
    }

    pub fn create_file(&self, name: &str) -> Result<()> {
        let path = self.resolve(name);
        if path.exists() {
            return Err(StrataError::FileExists(name.to_string()));
        }
        File::create(&path)?;
        Ok(())
    }

    /// Opens a file and returns its descriptor. Opening an already-open file
    /// returns the existing descriptor.
    pub fn open_file(&self, name: &str) -> Result<i32> {
        let path = self.resolve(name);
        let mut inner = self.inner.lock();
        if let Some(&fd) = inner.path2fd.get(&path) {
            return Ok(fd);
        }
        if !path.is_file() {
            return Err(StrataError::FileNotFound(name.to_string()));
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let pages = (file.metadata()?.len() / PAGE_SIZE as u64) as PageNo;
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        inner.path2fd.insert(path.clone(), fd);
        inner.fd2pageno.insert(fd, pages);
        inner.files.insert(fd, OpenFile { file, path });
        debug!("opened {name} as fd {fd} with {pages} pages");
        Ok(fd)
    }

    pub fn close_file(&self, fd: i32) -> Result<()> {
        let mut inner = self.inner.lock();
        let open = inner
            .files
            .remove(&fd)
            .ok_or_else(|| StrataError::Internal(format!("close of unknown fd {fd}")))?;
        open.file.sync_all()?;
        inner.path2fd.remove(&open.path);
        inner.fd2pageno.remove(&fd);
        Ok(())
    }

    pub fn destroy_file(&self, name: &str) -> Result<()> {
        let path = self.resolve(name);
        if self.inner.lock().path2fd.contains_key(&path) {
            return Err(StrataError::Internal(format!(
                "destroy of open file {name}"
            )));
        }
        if !path.is_file() {
            return Err(StrataError::FileNotFound(name.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Reads one page. A page past the end of the file reads as zeroes, so a
    /// page allocated but never written behaves like a fresh page.
    pub fn read_page(&self, fd: i32, page_no: PageNo, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock();
        let open = inner
            .files
            .get(&fd)
            .ok_or_else(|| StrataError::Internal(format!("read on unknown fd {fd}")))?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        let n = read_full(&open.file, buf, offset)?;
        buf[n..].fill(0);
        Ok(())
    }

    pub fn write_page(&self, fd: i32, page_no: PageNo, buf: &[u8]) -> Result<()> {
        let inner = self.inner.lock();
        let open = inner
            .files
            .get(&fd)
            .ok_or_else(|| StrataError::Internal(format!("write on unknown fd {fd}")))?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        open.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Hands out the next page number of a file.
    pub fn allocate_page(&self, fd: i32) -> Result<PageNo> {
        let mut inner = self.inner.lock();
        let next = inner
            .fd2pageno
            .get_mut(&fd)
            .ok_or_else(|| StrataError::Internal(format!("allocate on unknown fd {fd}")))?;
        let page_no = *next;
        *next += 1;
        Ok(page_no)
    }

    pub fn allocated(&self, fd: i32) -> PageNo {
        self.inner.lock().fd2pageno.get(&fd).copied().unwrap_or(0)
    }

    pub fn set_allocated(&self, fd: i32, pages: PageNo) {
        let mut inner = self.inner.lock();
        let next = inner.fd2pageno.entry(fd).or_insert(0);
        if pages > *next {
            *next = pages;
        }
    }

    pub fn open_log(&self, name: &str) -> Result<()> {
        let path = self.resolve(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        *self.log.lock() = Some(LogFile { file, len });
        Ok(())
    }

    /// Appends to the log file and syncs it; the WAL rule depends on this
    /// being durable when it returns.
    pub fn write_log(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self.log.lock();
        let log = guard
            .as_mut()
            .ok_or_else(|| StrataError::Internal("log file not open".into()))?;
        log.file.write_all_at(buf, log.len)?;
        log.len += buf.len() as u64;
        log.file.sync_data()?;
        Ok(())
    }

    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let guard = self.log.lock();
        let log = guard
            .as_ref()
            .ok_or_else(|| StrataError::Internal("log file not open".into()))?;
        if offset >= log.len {
            return Ok(0);
        }
        let want = buf.len().min((log.len - offset) as usize);
        read_full(&log.file, &mut buf[..want], offset)
    }

    pub fn log_len(&self) -> u64 {
        self.log.lock().as_ref().map(|l| l.len).unwrap_or(0)
    }
}

fn read_full(file: &File, buf: &mut [u8], mut offset: u64) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        let n = file.read_at(&mut buf[read..], offset)?;
        if n == 0 {
            break;
        }
        read += n;
        offset += n as u64;
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pages_round_trip_and_short_reads_zero_fill() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(dir.path());
        disk.create_file("t").unwrap();
        let fd = disk.open_file("t").unwrap();

        assert_eq!(disk.allocate_page(fd).unwrap(), 0);
        assert_eq!(disk.allocate_page(fd).unwrap(), 1);

        let mut page = vec![7u8; PAGE_SIZE];
        disk.write_page(fd, 1, &page).unwrap();
        page.fill(0);
        disk.read_page(fd, 1, &mut page).unwrap();
        assert!(page.iter().all(|&b| b == 7));

        // Page 0 was allocated but never written.
        disk.read_page(fd, 0, &mut page).unwrap();
        assert!(page.iter().all(|&b| b == 0));
    }

    #[test]
    fn allocation_marker_survives_reopen() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(dir.path());
        disk.create_file("t").unwrap();
        let fd = disk.open_file("t").unwrap();
        let page = vec![1u8; PAGE_SIZE];
        disk.write_page(fd, 2, &page).unwrap();
        disk.close_file(fd).unwrap();

        let fd = disk.open_file("t").unwrap();
        assert_eq!(disk.allocated(fd), 3);
        assert_eq!(disk.allocate_page(fd).unwrap(), 3);
    }

    #[test]
    fn log_appends_and_reads_by_offset() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(dir.path());
        disk.open_log("db.log").unwrap();
        disk.write_log(b"hello").unwrap();
        disk.write_log(b"world").unwrap();

        let mut buf = [0u8; 16];
        let n = disk.read_log(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"helloworld");
        let n = disk.read_log(&mut buf, 5).unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(disk.read_log(&mut buf, 10).unwrap(), 0);
    }
}
