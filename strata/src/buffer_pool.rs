//! The buffer pool: a bounded set of frames caching disk pages, with LRU
//! victim selection and write-back that honors the WAL rule.

use log::debug;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::disk::DiskManager;
use crate::errors::{Result, StrataError};
use crate::log::LogManager;
use crate::page::Page;
use crate::{Lsn, PageId, PageNo};

/// Tracks unpinned frames in least-recently-used order. Pinning removes a
/// frame from consideration; unpinning re-inserts it at the MRU end.
struct LruReplacer {
    queue: VecDeque<usize>,
    members: HashSet<usize>,
}

impl LruReplacer {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    fn victim(&mut self) -> Option<usize> {
        let frame = self.queue.pop_front()?;
        self.members.remove(&frame);
        Some(frame)
    }

    fn pin(&mut self, frame: usize) {
        if self.members.remove(&frame) {
            self.queue.retain(|&f| f != frame);
        }
    }

    fn unpin(&mut self, frame: usize) {
        if self.members.insert(frame) {
            self.queue.push_back(frame);
        }
    }
}

struct Frame {
    page: RwLock<Page>,
    dirty: AtomicBool,
}

struct PoolState {
    page_table: HashMap<PageId, usize>,
    /// Which page each frame currently holds, if any.
    resident: Vec<Option<PageId>>,
    pin_counts: Vec<u32>,
    free_list: Vec<usize>,
    replacer: LruReplacer,
}

/// A fixed pool of frames. All bookkeeping serializes on one latch; page
/// bytes are reached through a per-frame lock held by [`PageGuard`].
pub struct BufferPoolManager {
    disk: Arc<DiskManager>,
    log: Option<Arc<LogManager>>,
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
}

/// Pin handle for one page. Dropping the guard unpins; `write` marks the
/// frame dirty, and the dirty flag is sticky until the page reaches disk.
pub struct PageGuard {
    pool: Arc<BufferPoolManager>,
    page_id: PageId,
    frame_idx: usize,
}

impl std::fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .finish_non_exhaustive()
    }
}

impl PageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.pool.frames[self.frame_idx].page.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.mark_dirty();
        self.pool.frames[self.frame_idx].page.write()
    }

    pub fn mark_dirty(&self) {
        self.pool.frames[self.frame_idx]
            .dirty
            .store(true, Ordering::SeqCst);
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.pool.unpin(self.page_id, false);
    }
}

impl BufferPoolManager {
    pub fn new(size: usize, disk: Arc<DiskManager>, log: Option<Arc<LogManager>>) -> Self {
        let mut frames = Vec::with_capacity(size);
        let mut free_list = Vec::with_capacity(size);
        for i in 0..size {
            frames.push(Frame {
                page: RwLock::new(Page::invalid()),
                dirty: AtomicBool::new(false),
            });
            free_list.push(i);
        }
        free_list.reverse();
        Self {
            disk,
            log,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                resident: vec![None; size],
                pin_counts: vec![0; size],
                free_list,
                replacer: LruReplacer::new(),
            }),
        }
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Pins the page, reading it from disk if it is not resident.
    pub fn fetch(self: &Arc<Self>, page_id: PageId) -> Result<PageGuard> {
        let mut state = self.state.lock();
        if let Some(&frame_idx) = state.page_table.get(&page_id) {
            state.pin_counts[frame_idx] += 1;
            state.replacer.pin(frame_idx);
            return Ok(PageGuard {
                pool: self.clone(),
                page_id,
                frame_idx,
            });
        }

        let frame_idx = self.find_victim(&mut state)?;
        self.write_back(&mut state, frame_idx)?;
        {
            let mut page = self.frames[frame_idx].page.write();
            page.reset();
            page.set_id(page_id);
            self.disk
                .read_page(page_id.fd, page_id.page_no, page.data_mut())?;
        }
        self.frames[frame_idx].dirty.store(false, Ordering::SeqCst);
        state.page_table.insert(page_id, frame_idx);
        state.resident[frame_idx] = Some(page_id);
        state.pin_counts[frame_idx] = 1;
        state.replacer.pin(frame_idx);
        Ok(PageGuard {
            pool: self.clone(),
            page_id,
            frame_idx,
        })
    }

    /// Allocates a fresh page in `fd` and returns it pinned and zeroed.
    pub fn new_page(self: &Arc<Self>, fd: i32) -> Result<PageGuard> {
        let mut state = self.state.lock();
        let frame_idx = self.find_victim(&mut state)?;
        self.write_back(&mut state, frame_idx)?;
        let page_no = self.disk.allocate_page(fd)?;
        let page_id = PageId::new(fd, page_no);
        {
            let mut page = self.frames[frame_idx].page.write();
            page.reset();
            page.set_id(page_id);
        }
        self.frames[frame_idx].dirty.store(true, Ordering::SeqCst);
        state.page_table.insert(page_id, frame_idx);
        state.resident[frame_idx] = Some(page_id);
        state.pin_counts[frame_idx] = 1;
        state.replacer.pin(frame_idx);
        debug!("allocated page {page_no} in fd {fd}");
        Ok(PageGuard {
            pool: self.clone(),
            page_id,
            frame_idx,
        })
    }

    /// Drops one pin. The dirty flag only ever moves towards dirty here;
    /// `false` never clears it. Returns false when the page is not resident
    /// or was not pinned.
    pub fn unpin(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.state.lock();
        let Some(&frame_idx) = state.page_table.get(&page_id) else {
            return false;
        };
        if state.pin_counts[frame_idx] == 0 {
            return false;
        }
        state.pin_counts[frame_idx] -= 1;
        if state.pin_counts[frame_idx] == 0 {
            state.replacer.unpin(frame_idx);
        }
        if is_dirty {
            self.frames[frame_idx].dirty.store(true, Ordering::SeqCst);
        }
        true
    }

    /// Writes the page out regardless of the dirty flag and clears it.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let state = self.state.lock();
        let Some(&frame_idx) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        self.flush_frame(frame_idx)?;
        Ok(true)
    }

    /// Flushes every resident page belonging to `fd`.
    pub fn flush_all(&self, fd: i32) -> Result<()> {
        let state = self.state.lock();
        for (&page_id, &frame_idx) in state.page_table.iter() {
            if page_id.fd == fd {
                self.flush_frame(frame_idx)?;
            }
        }
        Ok(())
    }

    /// Evicts the page from the pool. Fails (returns false) while pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(&frame_idx) = state.page_table.get(&page_id) else {
            return Ok(true);
        };
        if state.pin_counts[frame_idx] > 0 {
            return Ok(false);
        }
        self.flush_frame(frame_idx)?;
        state.page_table.remove(&page_id);
        state.resident[frame_idx] = None;
        state.replacer.pin(frame_idx);
        self.frames[frame_idx].page.write().reset();
        self.frames[frame_idx].dirty.store(false, Ordering::SeqCst);
        state.free_list.push(frame_idx);
        Ok(true)
    }

    /// Stamps the page LSN after a log record that modified the page.
    pub fn update_page_lsn(self: &Arc<Self>, fd: i32, page_no: PageNo, lsn: Lsn) -> Result<()> {
        let guard = self.fetch(PageId::new(fd, page_no))?;
        guard.write().set_lsn(lsn);
        Ok(())
    }

    fn find_victim(&self, state: &mut PoolState) -> Result<usize> {
        if let Some(frame_idx) = state.free_list.pop() {
            return Ok(frame_idx);
        }
        state.replacer.victim().ok_or(StrataError::PoolExhausted)
    }

    /// Writes back whatever the frame holds before it is reused. A dirty
    /// page whose LSN is past the durable log forces a log flush first.
    fn write_back(&self, state: &mut PoolState, frame_idx: usize) -> Result<()> {
        let Some(old_id) = state.resident[frame_idx] else {
            return Ok(());
        };
        if self.frames[frame_idx].dirty.load(Ordering::SeqCst) {
            self.flush_frame(frame_idx)?;
        }
        state.page_table.remove(&old_id);
        state.resident[frame_idx] = None;
        Ok(())
    }

    fn flush_frame(&self, frame_idx: usize) -> Result<()> {
        let page = self.frames[frame_idx].page.read();
        let id = page.id();
        if let Some(log) = &self.log {
            if page.lsn() > log.persist_lsn() {
                debug!(
                    "WAL: flushing log before page {:?} (page lsn {})",
                    id,
                    page.lsn()
                );
                log.flush()?;
            }
        }
        self.disk.write_page(id.fd, id.page_no, page.data())?;
        self.frames[frame_idx].dirty.store(false, Ordering::SeqCst);
        Ok(())
    }
}
