//! Heap files: fixed-length records in slotted pages with a per-page
//! occupancy bitmap and a free-page list threaded through the page headers.

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::buffer_pool::{BufferPoolManager, PageGuard};
use crate::disk::DiskManager;
use crate::errors::{Result, StrataError};
use crate::log::{LogManager, LogPayload, LogRecord};
use crate::transaction::Transaction;
use crate::{PageId, PageNo, Rid, INVALID_LSN, INVALID_PAGE_NO, PAGE_HEADER_SIZE, PAGE_SIZE};

/// File header, serialized on page 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFileHeader {
    pub record_size: usize,
    pub num_pages: PageNo,
    pub records_per_page: usize,
    pub first_free_page_no: PageNo,
    pub bitmap_size: usize,
}

// Data page layout: page LSN, then the page header, then the bitmap, then
// the fixed-size slots.
const OFF_NEXT_FREE: usize = PAGE_HEADER_SIZE;
const OFF_NUM_RECORDS: usize = PAGE_HEADER_SIZE + 4;
const OFF_BITMAP: usize = PAGE_HEADER_SIZE + 8;

fn layout(record_size: usize) -> (usize, usize) {
    let usable = (PAGE_SIZE - OFF_BITMAP) * 8;
    let mut per_page = usable / (record_size * 8 + 1);
    while per_page > 0 && OFF_BITMAP + per_page.div_ceil(8) + per_page * record_size > PAGE_SIZE {
        per_page -= 1;
    }
    (per_page, per_page.div_ceil(8))
}

fn bitmap_get(bitmap: &[u8], slot: usize) -> bool {
    bitmap[slot / 8] & (1 << (slot % 8)) != 0
}

fn bitmap_set(bitmap: &mut [u8], slot: usize) {
    bitmap[slot / 8] |= 1 << (slot % 8);
}

fn bitmap_clear(bitmap: &mut [u8], slot: usize) {
    bitmap[slot / 8] &= !(1 << (slot % 8));
}

/// A heap file of fixed-length records, addressed by [`Rid`]. All record
/// operations go through the buffer pool; the in-memory header serializes
/// file-level state behind its own latch.
pub struct RecordFile {
    name: String,
    fd: i32,
    pool: Arc<BufferPoolManager>,
    hdr: Mutex<RecordFileHeader>,
}

impl RecordFile {
    /// Creates the file with its header page; the file stays closed.
    pub fn create(disk: &DiskManager, name: &str, record_size: usize) -> Result<()> {
        let (records_per_page, bitmap_size) = layout(record_size);
        if records_per_page == 0 {
            return Err(StrataError::Internal(format!(
                "record of {record_size} bytes does not fit a page"
            )));
        }
        disk.create_file(name)?;
        let fd = disk.open_file(name)?;
        let hdr = RecordFileHeader {
            record_size,
            num_pages: 1,
            records_per_page,
            first_free_page_no: INVALID_PAGE_NO,
            bitmap_size,
        };
        write_header(disk, fd, &hdr)?;
        disk.set_allocated(fd, 1);
        disk.close_file(fd)?;
        Ok(())
    }

    pub fn open(disk: &DiskManager, pool: Arc<BufferPoolManager>, name: &str) -> Result<Arc<Self>> {
        let fd = disk.open_file(name)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        disk.read_page(fd, 0, &mut buf)?;
        let hdr: RecordFileHeader = bincode::deserialize(&buf)
            .map_err(|e| StrataError::Internal(format!("bad record file header in {name}: {e}")))?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            fd,
            pool,
            hdr: Mutex::new(hdr),
        }))
    }

    /// Flushes the header and every cached page, then closes the file.
    pub fn close(&self) -> Result<()> {
        let hdr = self.hdr.lock();
        write_header(self.pool.disk(), self.fd, &hdr)?;
        self.pool.flush_all(self.fd)?;
        self.pool.disk().close_file(self.fd)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn record_size(&self) -> usize {
        self.hdr.lock().record_size
    }

    pub fn num_pages(&self) -> PageNo {
        self.hdr.lock().num_pages
    }

    fn slot_offset(hdr: &RecordFileHeader, slot: usize) -> usize {
        OFF_BITMAP + hdr.bitmap_size + slot * hdr.record_size
    }

    fn check_rid(hdr: &RecordFileHeader, rid: Rid) -> Result<()> {
        if rid.page_no < 1
            || rid.page_no >= hdr.num_pages
            || rid.slot_no < 0
            || rid.slot_no as usize >= hdr.records_per_page
        {
            return Err(StrataError::RecordNotFound(rid));
        }
        Ok(())
    }

    pub fn get_record(&self, rid: Rid) -> Result<Vec<u8>> {
        let hdr = self.hdr.lock();
        Self::check_rid(&hdr, rid)?;
        let guard = self.pool.fetch(PageId::new(self.fd, rid.page_no))?;
        let page = guard.read();
        let slot = rid.slot_no as usize;
        if !bitmap_get(&page.data()[OFF_BITMAP..], slot) {
            return Err(StrataError::RecordNotFound(rid));
        }
        let off = Self::slot_offset(&hdr, slot);
        Ok(page.data()[off..off + hdr.record_size].to_vec())
    }

    /// Inserts into the first page with a free slot, allocating a page when
    /// none has room. A fresh page allocated inside a transaction is logged
    /// as a NEWPAGE record so recovery can re-create it.
    pub fn insert_record(
        &self,
        buf: &[u8],
        wal: Option<(&LogManager, &Transaction)>,
    ) -> Result<Rid> {
        let mut hdr = self.hdr.lock();
        if buf.len() != hdr.record_size {
            return Err(StrataError::Internal(format!(
                "record of {} bytes in file of {}-byte records",
                buf.len(),
                hdr.record_size
            )));
        }
        loop {
            let guard = if hdr.first_free_page_no == INVALID_PAGE_NO {
                self.create_page(&mut hdr, wal)?
            } else {
                self.pool
                    .fetch(PageId::new(self.fd, hdr.first_free_page_no))?
            };
            let page_no = guard.page_id().page_no;

            let mut page = guard.write();
            let slot = (0..hdr.records_per_page)
                .find(|&s| !bitmap_get(&page.data()[OFF_BITMAP..], s));
            let Some(slot) = slot else {
                // A stale free-list head (a page recovery filled after the
                // header last reached disk): unlink it and move on.
                hdr.first_free_page_no = read_i32(page.data(), OFF_NEXT_FREE);
                write_i32(page.data_mut(), OFF_NEXT_FREE, INVALID_PAGE_NO);
                continue;
            };
            bitmap_set(&mut page.data_mut()[OFF_BITMAP..], slot);
            let off = Self::slot_offset(&hdr, slot);
            page.data_mut()[off..off + hdr.record_size].copy_from_slice(buf);
            let count = read_i32(page.data(), OFF_NUM_RECORDS) + 1;
            write_i32(page.data_mut(), OFF_NUM_RECORDS, count);
            if count as usize == hdr.records_per_page {
                hdr.first_free_page_no = read_i32(page.data(), OFF_NEXT_FREE);
                write_i32(page.data_mut(), OFF_NEXT_FREE, INVALID_PAGE_NO);
            }
            return Ok(Rid::new(page_no, slot as i32));
        }
    }

    /// Slot-directed insert used by redo, undo and abort compensation.
    /// Idempotent: an occupied slot is overwritten in place.
    pub fn insert_record_at(&self, rid: Rid, buf: &[u8]) -> Result<()> {
        let mut hdr = self.hdr.lock();
        if rid.page_no >= hdr.num_pages {
            self.pool.disk().set_allocated(self.fd, rid.page_no + 1);
            hdr.num_pages = rid.page_no + 1;
        }
        let guard = self.pool.fetch(PageId::new(self.fd, rid.page_no))?;
        let mut page = guard.write();
        let slot = rid.slot_no as usize;
        if !bitmap_get(&page.data()[OFF_BITMAP..], slot) {
            bitmap_set(&mut page.data_mut()[OFF_BITMAP..], slot);
            let count = read_i32(page.data(), OFF_NUM_RECORDS) + 1;
            write_i32(page.data_mut(), OFF_NUM_RECORDS, count);
        }
        let off = Self::slot_offset(&hdr, slot);
        page.data_mut()[off..off + hdr.record_size].copy_from_slice(buf);
        Ok(())
    }

    /// Extends the page count past `page_no`. Recovery calls this for a
    /// NEWPAGE record whose page the on-disk header never learned about.
    pub fn ensure_allocated(&self, page_no: PageNo) {
        let mut hdr = self.hdr.lock();
        if page_no >= hdr.num_pages {
            self.pool.disk().set_allocated(self.fd, page_no + 1);
            hdr.num_pages = page_no + 1;
        }
    }

    pub fn delete_record(&self, rid: Rid) -> Result<()> {
        let mut hdr = self.hdr.lock();
        Self::check_rid(&hdr, rid)?;
        let guard = self.pool.fetch(PageId::new(self.fd, rid.page_no))?;
        let mut page = guard.write();
        let slot = rid.slot_no as usize;
        if !bitmap_get(&page.data()[OFF_BITMAP..], slot) {
            return Err(StrataError::RecordNotFound(rid));
        }
        let was_full = read_i32(page.data(), OFF_NUM_RECORDS) as usize == hdr.records_per_page;
        bitmap_clear(&mut page.data_mut()[OFF_BITMAP..], slot);
        let count = read_i32(page.data(), OFF_NUM_RECORDS) - 1;
        write_i32(page.data_mut(), OFF_NUM_RECORDS, count);
        if was_full {
            write_i32(page.data_mut(), OFF_NEXT_FREE, hdr.first_free_page_no);
            hdr.first_free_page_no = rid.page_no;
        }
        Ok(())
    }

    pub fn update_record(&self, rid: Rid, buf: &[u8]) -> Result<()> {
        let hdr = self.hdr.lock();
        Self::check_rid(&hdr, rid)?;
        let guard = self.pool.fetch(PageId::new(self.fd, rid.page_no))?;
        let mut page = guard.write();
        let slot = rid.slot_no as usize;
        if !bitmap_get(&page.data()[OFF_BITMAP..], slot) {
            return Err(StrataError::RecordNotFound(rid));
        }
        let off = Self::slot_offset(&hdr, slot);
        page.data_mut()[off..off + hdr.record_size].copy_from_slice(buf);
        Ok(())
    }

    fn create_page(
        &self,
        hdr: &mut RecordFileHeader,
        wal: Option<(&LogManager, &Transaction)>,
    ) -> Result<PageGuard> {
        let guard = self.pool.new_page(self.fd)?;
        let page_no = guard.page_id().page_no;
        {
            let mut page = guard.write();
            page.set_lsn(INVALID_LSN);
            write_i32(page.data_mut(), OFF_NEXT_FREE, INVALID_PAGE_NO);
            write_i32(page.data_mut(), OFF_NUM_RECORDS, 0);
        }
        hdr.num_pages = hdr.num_pages.max(page_no + 1);
        hdr.first_free_page_no = page_no;
        if let Some((log, txn)) = wal {
            let mut record = LogRecord::new(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::NewPage {
                    table: self.name.clone(),
                    page_no,
                },
            );
            let lsn = log.append(&mut record)?;
            txn.set_prev_lsn(lsn);
        }
        debug!("heap {}: new page {page_no}", self.name);
        Ok(guard)
    }
}

fn write_header(disk: &DiskManager, fd: i32, hdr: &RecordFileHeader) -> Result<()> {
    let mut buf = vec![0u8; PAGE_SIZE];
    let bytes = bincode::serialize(hdr)
        .map_err(|e| StrataError::Internal(format!("record file header encode: {e}")))?;
    buf[..bytes.len()].copy_from_slice(&bytes);
    disk.write_page(fd, 0, &buf)
}

fn read_i32(data: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn write_i32(data: &mut [u8], off: usize, v: i32) {
    data[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Scans every occupied slot of a heap file in (page, slot) order.
pub struct RecordScan {
    file: Arc<RecordFile>,
    rid: Rid,
    ended: bool,
}

impl RecordScan {
    pub fn new(file: Arc<RecordFile>) -> Result<Self> {
        let mut scan = Self {
            file,
            rid: Rid::new(1, -1),
            ended: false,
        };
        scan.advance()?;
        Ok(scan)
    }

    pub fn is_end(&self) -> bool {
        self.ended
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn next(&mut self) -> Result<()> {
        if !self.ended {
            self.advance()?;
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        let (num_pages, per_page) = {
            let hdr = self.file.hdr.lock();
            (hdr.num_pages, hdr.records_per_page)
        };
        let mut page_no = self.rid.page_no;
        let mut slot = self.rid.slot_no + 1;
        while page_no < num_pages {
            let guard = self.file.pool.fetch(PageId::new(self.file.fd, page_no))?;
            let page = guard.read();
            while (slot as usize) < per_page {
                if bitmap_get(&page.data()[OFF_BITMAP..], slot as usize) {
                    self.rid = Rid::new(page_no, slot);
                    return Ok(());
                }
                slot += 1;
            }
            page_no += 1;
            slot = 0;
        }
        self.ended = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_heap(record_size: usize) -> (tempfile::TempDir, Arc<DiskManager>, Arc<RecordFile>) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()));
        RecordFile::create(&disk, "t", record_size).unwrap();
        let pool = Arc::new(BufferPoolManager::new(16, disk.clone(), None));
        let file = RecordFile::open(&disk, pool, "t").unwrap();
        (dir, disk, file)
    }

    #[test]
    fn insert_get_round_trip_until_delete() {
        let (_dir, _disk, heap) = open_heap(16);
        let rec = [5u8; 16];
        let rid = heap.insert_record(&rec, None).unwrap();
        assert_eq!(heap.get_record(rid).unwrap(), rec);

        heap.update_record(rid, &[9u8; 16]).unwrap();
        assert_eq!(heap.get_record(rid).unwrap(), [9u8; 16]);

        heap.delete_record(rid).unwrap();
        assert!(matches!(
            heap.get_record(rid),
            Err(StrataError::RecordNotFound(_))
        ));
    }

    #[test]
    fn inserts_spill_to_new_pages_and_scan_sees_all() {
        let (_dir, _disk, heap) = open_heap(512);
        let per_page = heap.hdr.lock().records_per_page;
        let total = per_page * 3 + 1;
        let mut rids = Vec::new();
        for i in 0..total {
            let mut rec = [0u8; 512];
            rec[0..8].copy_from_slice(&(i as u64).to_le_bytes());
            rids.push(heap.insert_record(&rec, None).unwrap());
        }
        assert!(heap.num_pages() >= 4);

        let mut scan = RecordScan::new(heap.clone()).unwrap();
        let mut seen = Vec::new();
        while !scan.is_end() {
            let rec = heap.get_record(scan.rid()).unwrap();
            seen.push(u64::from_le_bytes(rec[0..8].try_into().unwrap()));
            scan.next().unwrap();
        }
        assert_eq!(seen.len(), total);
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..total as u64).collect::<Vec<_>>());
    }

    #[test]
    fn deleted_slots_are_reused() {
        let (_dir, _disk, heap) = open_heap(64);
        let per_page = heap.hdr.lock().records_per_page;
        for _ in 0..per_page {
            heap.insert_record(&[1u8; 64], None).unwrap();
        }
        // Page 1 is now full; deleting from it puts it back on the free list.
        heap.delete_record(Rid::new(1, 3)).unwrap();
        let rid = heap.insert_record(&[2u8; 64], None).unwrap();
        assert_eq!(rid, Rid::new(1, 3));
    }

    #[test]
    fn slot_directed_insert_is_idempotent() {
        let (_dir, _disk, heap) = open_heap(32);
        let rid = Rid::new(2, 5);
        heap.insert_record_at(rid, &[3u8; 32]).unwrap();
        heap.insert_record_at(rid, &[4u8; 32]).unwrap();
        assert_eq!(heap.get_record(rid).unwrap(), [4u8; 32]);
    }
}
