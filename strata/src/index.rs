//! Disk-resident B+-tree indexes over concatenated multi-column keys with a
//! trailing 4-byte tiebreaker. Every node access goes through the buffer
//! pool; structural operations serialize on the per-tree root latch.

use log::debug;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::buffer_pool::BufferPoolManager;
use crate::disk::DiskManager;
use crate::errors::{Result, StrataError};
use crate::{ColType, PageId, PageNo, Rid, INVALID_LSN, INVALID_PAGE_NO, PAGE_SIZE};

/// Page 0 of an index file holds the serialized [`IndexFileHeader`].
pub const IX_FILE_HDR_PAGE: PageNo = 0;
/// Page 1 terminates the leaf chain at both ends.
pub const IX_SENTINEL_PAGE: PageNo = 1;

/// Tiebreaker carried by every entry inserted from data.
pub const DATA_TIEBREAKER: i32 = -1;

// Node page layout, after the 4-byte page LSN.
const OFF_IS_LEAF: usize = 4;
const OFF_NUM_KEYS: usize = 8;
const OFF_PARENT: usize = 12;
const OFF_PREV_LEAF: usize = 16;
const OFF_NEXT_LEAF: usize = 20;
const NODE_HDR_END: usize = 24;
const RID_SIZE: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFileHeader {
    pub root_page: PageNo,
    pub first_leaf: PageNo,
    pub last_leaf: PageNo,
    pub num_pages: PageNo,
    pub btree_order: usize,
    pub key_len: usize,
    pub col_types: Vec<ColType>,
    pub col_lens: Vec<usize>,
}

/// Key shape shared by every node of one tree. The tiebreaker is the final
/// `Int` column.
#[derive(Debug, Clone)]
pub struct KeySchema {
    pub col_types: Vec<ColType>,
    pub col_lens: Vec<usize>,
    pub key_len: usize,
}

fn datetime_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let ay = u16::from_le_bytes(a[0..2].try_into().unwrap());
    let by = u16::from_le_bytes(b[0..2].try_into().unwrap());
    ay.cmp(&by).then_with(|| a[2..7].cmp(&b[2..7]))
}

/// Column-wise lexicographic comparison; the tiebreaker compares last as a
/// signed integer because it is just the final `Int` column.
pub fn compare_keys(a: &[u8], b: &[u8], schema: &KeySchema) -> Ordering {
    let mut off = 0;
    for (ty, len) in schema.col_types.iter().zip(schema.col_lens.iter()) {
        let av = &a[off..off + len];
        let bv = &b[off..off + len];
        let ord = match ty {
            ColType::Int => i32::from_le_bytes(av.try_into().unwrap())
                .cmp(&i32::from_le_bytes(bv.try_into().unwrap())),
            ColType::Bigint => i64::from_le_bytes(av.try_into().unwrap())
                .cmp(&i64::from_le_bytes(bv.try_into().unwrap())),
            ColType::Float => f64::from_le_bytes(av.try_into().unwrap())
                .total_cmp(&f64::from_le_bytes(bv.try_into().unwrap())),
            ColType::Str => av.cmp(bv),
            ColType::Datetime => datetime_cmp(av, bv),
        };
        if ord != Ordering::Equal {
            return ord;
        }
        off += len;
    }
    Ordering::Equal
}

/// An index iterator position: (leaf page, slot). The past-last position is
/// the slot one past the end of the last leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iid {
    pub page_no: PageNo,
    pub slot_no: i32,
}

impl Iid {
    pub fn invalid() -> Self {
        Self {
            page_no: INVALID_PAGE_NO,
            slot_no: -1,
        }
    }
}

/// Retained hook for latch-crabbing descents; the current implementation
/// serializes on the root latch and ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Find,
    Insert,
    Delete,
}

/// A pinned node. All accessors copy in and out of the guarded frame; the
/// pin is released when the node is dropped.
struct Node {
    guard: crate::buffer_pool::PageGuard,
    page_no: PageNo,
    schema: Arc<KeySchema>,
    order: usize,
}

impl Node {
    fn keys_off(&self) -> usize {
        NODE_HDR_END
    }

    fn rids_off(&self) -> usize {
        NODE_HDR_END + self.order * self.schema.key_len
    }

    fn read_i32(&self, off: usize) -> i32 {
        let page = self.guard.read();
        i32::from_le_bytes(page.data()[off..off + 4].try_into().unwrap())
    }

    fn write_i32(&self, off: usize, v: i32) {
        let mut page = self.guard.write();
        page.data_mut()[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn is_leaf(&self) -> bool {
        self.guard.read().data()[OFF_IS_LEAF] == 1
    }

    fn init(&self, is_leaf: bool) {
        let mut page = self.guard.write();
        page.set_lsn(INVALID_LSN);
        page.data_mut()[OFF_IS_LEAF] = is_leaf as u8;
        for off in [OFF_NUM_KEYS, OFF_PARENT, OFF_PREV_LEAF, OFF_NEXT_LEAF] {
            let v = if off == OFF_NUM_KEYS { 0 } else { INVALID_PAGE_NO };
            page.data_mut()[off..off + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    fn num_keys(&self) -> usize {
        self.read_i32(OFF_NUM_KEYS) as usize
    }

    fn set_num_keys(&self, n: usize) {
        self.write_i32(OFF_NUM_KEYS, n as i32);
    }

    fn parent(&self) -> PageNo {
        self.read_i32(OFF_PARENT)
    }

    fn set_parent(&self, p: PageNo) {
        self.write_i32(OFF_PARENT, p);
    }

    fn prev_leaf(&self) -> PageNo {
        self.read_i32(OFF_PREV_LEAF)
    }

    fn set_prev_leaf(&self, p: PageNo) {
        self.write_i32(OFF_PREV_LEAF, p);
    }

    fn next_leaf(&self) -> PageNo {
        self.read_i32(OFF_NEXT_LEAF)
    }

    fn set_next_leaf(&self, p: PageNo) {
        self.write_i32(OFF_NEXT_LEAF, p);
    }

    fn key(&self, i: usize) -> Vec<u8> {
        let off = self.keys_off() + i * self.schema.key_len;
        self.guard.read().data()[off..off + self.schema.key_len].to_vec()
    }

    fn set_key(&self, i: usize, key: &[u8]) {
        let off = self.keys_off() + i * self.schema.key_len;
        self.guard.write().data_mut()[off..off + self.schema.key_len].copy_from_slice(key);
    }

    fn rid(&self, i: usize) -> Rid {
        let off = self.rids_off() + i * RID_SIZE;
        let page = self.guard.read();
        let data = page.data();
        Rid::new(
            i32::from_le_bytes(data[off..off + 4].try_into().unwrap()),
            i32::from_le_bytes(data[off + 4..off + 8].try_into().unwrap()),
        )
    }

    fn set_rid(&self, i: usize, rid: Rid) {
        let off = self.rids_off() + i * RID_SIZE;
        let mut page = self.guard.write();
        let data = page.data_mut();
        data[off..off + 4].copy_from_slice(&rid.page_no.to_le_bytes());
        data[off + 4..off + 8].copy_from_slice(&rid.slot_no.to_le_bytes());
    }

    /// Child page of an internal node at position `i`.
    fn child_at(&self, i: usize) -> PageNo {
        self.rid(i).page_no
    }

    /// First position in `[0, num_keys]` whose key is >= `key`.
    fn lower_bound(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.num_keys());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if compare_keys(&self.key(mid), key, &self.schema) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// First position in `[1, num_keys]` whose key is > `key`. The search
    /// starts at 1: an internal node's first key is the subtree floor.
    fn upper_bound(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = (1, self.num_keys());
        if hi < 1 {
            return 1;
        }
        while lo < hi {
            let mid = (lo + hi) / 2;
            if compare_keys(&self.key(mid), key, &self.schema) != Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn leaf_lookup(&self, key: &[u8]) -> Option<Rid> {
        let pos = self.lower_bound(key);
        if pos == self.num_keys() || compare_keys(&self.key(pos), key, &self.schema) != Ordering::Equal
        {
            return None;
        }
        Some(self.rid(pos))
    }

    fn internal_lookup(&self, key: &[u8]) -> PageNo {
        self.child_at(self.upper_bound(key) - 1)
    }

    fn keys_range(&self, from: usize, to: usize) -> Vec<u8> {
        let kl = self.schema.key_len;
        let off = self.keys_off();
        self.guard.read().data()[off + from * kl..off + to * kl].to_vec()
    }

    fn rids_range(&self, from: usize, to: usize) -> Vec<Rid> {
        (from..to).map(|i| self.rid(i)).collect()
    }

    /// Inserts `rids.len()` consecutive pairs at `pos`, shifting the tail.
    fn insert_pairs(&self, pos: usize, keys: &[u8], rids: &[Rid]) -> Result<()> {
        let num = self.num_keys();
        if pos > num {
            return Err(StrataError::IndexEntryNotFound);
        }
        let n = rids.len();
        let kl = self.schema.key_len;
        let keys_off = self.keys_off();
        let rids_off = self.rids_off();
        {
            let mut page = self.guard.write();
            let data = page.data_mut();
            let ksrc = keys_off + pos * kl;
            data.copy_within(ksrc..keys_off + num * kl, ksrc + n * kl);
            data[ksrc..ksrc + n * kl].copy_from_slice(keys);
            let rsrc = rids_off + pos * RID_SIZE;
            data.copy_within(rsrc..rids_off + num * RID_SIZE, rsrc + n * RID_SIZE);
        }
        for (i, rid) in rids.iter().enumerate() {
            self.set_rid(pos + i, *rid);
        }
        self.set_num_keys(num + n);
        Ok(())
    }

    fn insert_pair(&self, pos: usize, key: &[u8], rid: Rid) -> Result<()> {
        self.insert_pairs(pos, key, &[rid])
    }

    fn erase_pair(&self, pos: usize) {
        let num = self.num_keys();
        let kl = self.schema.key_len;
        let keys_off = self.keys_off();
        let rids_off = self.rids_off();
        let mut page = self.guard.write();
        let data = page.data_mut();
        data.copy_within(
            keys_off + (pos + 1) * kl..keys_off + num * kl,
            keys_off + pos * kl,
        );
        data.copy_within(
            rids_off + (pos + 1) * RID_SIZE..rids_off + num * RID_SIZE,
            rids_off + pos * RID_SIZE,
        );
        drop(page);
        self.set_num_keys(num - 1);
    }

    /// Inserts the pair unless the key is already present.
    fn insert(&self, key: &[u8], rid: Rid) -> Result<usize> {
        let pos = self.lower_bound(key);
        if pos >= self.num_keys()
            || compare_keys(key, &self.key(pos), &self.schema) != Ordering::Equal
        {
            self.insert_pair(pos, key, rid)?;
        }
        Ok(self.num_keys())
    }

    fn remove(&self, key: &[u8]) -> usize {
        let pos = self.lower_bound(key);
        if pos < self.num_keys()
            && compare_keys(key, &self.key(pos), &self.schema) == Ordering::Equal
        {
            self.erase_pair(pos);
        }
        self.num_keys()
    }

    fn find_child(&self, child_page: PageNo) -> Option<usize> {
        (0..self.num_keys()).find(|&i| self.child_at(i) == child_page)
    }
}

/// One open B+-tree index file.
pub struct BTreeIndex {
    name: String,
    fd: i32,
    pool: Arc<BufferPoolManager>,
    schema: Arc<KeySchema>,
    order: usize,
    hdr: Mutex<IndexFileHeader>,
    root_latch: RwLock<()>,
}

impl BTreeIndex {
    /// Creates the index file: header page, leaf-chain sentinel, empty tree.
    /// The tiebreaker column is appended here.
    pub fn create(
        disk: &DiskManager,
        name: &str,
        mut col_types: Vec<ColType>,
        mut col_lens: Vec<usize>,
    ) -> Result<()> {
        col_types.push(ColType::Int);
        col_lens.push(4);
        let key_len: usize = col_lens.iter().sum();
        let order = (PAGE_SIZE - NODE_HDR_END) / (key_len + RID_SIZE);
        if order < 4 {
            return Err(StrataError::Internal(format!(
                "key of {key_len} bytes is too long for an index page"
            )));
        }
        let hdr = IndexFileHeader {
            root_page: INVALID_PAGE_NO,
            first_leaf: IX_SENTINEL_PAGE,
            last_leaf: IX_SENTINEL_PAGE,
            num_pages: 2,
            btree_order: order,
            key_len,
            col_types,
            col_lens,
        };
        disk.create_file(name)?;
        let fd = disk.open_file(name)?;
        write_header(disk, fd, &hdr)?;

        let mut sentinel = vec![0u8; PAGE_SIZE];
        sentinel[0..4].copy_from_slice(&INVALID_LSN.to_le_bytes());
        sentinel[OFF_IS_LEAF] = 1;
        sentinel[OFF_PARENT..OFF_PARENT + 4].copy_from_slice(&INVALID_PAGE_NO.to_le_bytes());
        sentinel[OFF_PREV_LEAF..OFF_PREV_LEAF + 4]
            .copy_from_slice(&IX_SENTINEL_PAGE.to_le_bytes());
        sentinel[OFF_NEXT_LEAF..OFF_NEXT_LEAF + 4]
            .copy_from_slice(&IX_SENTINEL_PAGE.to_le_bytes());
        disk.write_page(fd, IX_SENTINEL_PAGE, &sentinel)?;
        disk.set_allocated(fd, 2);
        disk.close_file(fd)?;
        Ok(())
    }

    pub fn open(disk: &DiskManager, pool: Arc<BufferPoolManager>, name: &str) -> Result<Arc<Self>> {
        let fd = disk.open_file(name)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        disk.read_page(fd, IX_FILE_HDR_PAGE, &mut buf)?;
        let hdr: IndexFileHeader = bincode::deserialize(&buf)
            .map_err(|e| StrataError::Internal(format!("bad index header in {name}: {e}")))?;
        let schema = Arc::new(KeySchema {
            col_types: hdr.col_types.clone(),
            col_lens: hdr.col_lens.clone(),
            key_len: hdr.key_len,
        });
        Ok(Arc::new(Self {
            name: name.to_string(),
            fd,
            pool,
            schema,
            order: hdr.btree_order,
            hdr: Mutex::new(hdr),
            root_latch: RwLock::new(()),
        }))
    }

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

    pub fn key_schema(&self) -> &KeySchema {
        &self.schema
    }

    pub fn order(&self) -> usize {
        self.order
    }

    fn min_size(&self) -> usize {
        self.order / 2
    }

    pub fn is_empty(&self) -> bool {
        self.hdr.lock().root_page == INVALID_PAGE_NO
    }

    fn fetch_node(&self, page_no: PageNo) -> Result<Node> {
        let guard = self.pool.fetch(PageId::new(self.fd, page_no))?;
        Ok(Node {
            guard,
            page_no,
            schema: self.schema.clone(),
            order: self.order,
        })
    }

    fn create_node(&self, hdr: &mut IndexFileHeader, is_leaf: bool) -> Result<Node> {
        let guard = self.pool.new_page(self.fd)?;
        let page_no = guard.page_id().page_no;
        let node = Node {
            guard,
            page_no,
            schema: self.schema.clone(),
            order: self.order,
        };
        node.init(is_leaf);
        hdr.num_pages += 1;
        Ok(node)
    }

    /// Descends from the root to the leaf that owns `key`. The operation is
    /// the hook an implementation with coupling latches would key off.
    fn find_leaf(&self, hdr: &IndexFileHeader, key: &[u8], _op: Operation) -> Result<Node> {
        let mut node = self.fetch_node(hdr.root_page)?;
        while !node.is_leaf() {
            let child = node.internal_lookup(key);
            node = self.fetch_node(child)?;
        }
        Ok(node)
    }

    /// Point lookup. Pushes the rid for `key` into `out` and reports whether
    /// the key exists.
    pub fn get_value(&self, key: &[u8], out: &mut Vec<Rid>) -> Result<bool> {
        let _r = self.root_latch.read();
        let hdr = self.hdr.lock();
        if hdr.root_page == INVALID_PAGE_NO {
            return Ok(false);
        }
        let leaf = self.find_leaf(&hdr, key, Operation::Find)?;
        match leaf.leaf_lookup(key) {
            Some(rid) => {
                out.push(rid);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Inserts a key/rid pair and returns the page of the hosting leaf.
    /// Duplicate keys are silently ignored; uniqueness is the caller's
    /// probe-with-`-1` protocol.
    pub fn insert_entry(&self, key: &[u8], rid: Rid) -> Result<PageNo> {
        let _w = self.root_latch.write();
        let mut hdr = self.hdr.lock();
        if hdr.root_page == INVALID_PAGE_NO {
            let root = self.create_node(&mut hdr, true)?;
            root.set_prev_leaf(IX_SENTINEL_PAGE);
            root.set_next_leaf(IX_SENTINEL_PAGE);
            hdr.root_page = root.page_no;
            hdr.first_leaf = root.page_no;
            hdr.last_leaf = root.page_no;
            let sentinel = self.fetch_node(IX_SENTINEL_PAGE)?;
            sentinel.set_prev_leaf(root.page_no);
            sentinel.set_next_leaf(root.page_no);
            debug!("index {}: new root leaf {}", self.name, root.page_no);
        }
        let leaf = self.find_leaf(&hdr, key, Operation::Insert)?;
        leaf.insert(key, rid)?;
        self.maintain_parent(&leaf)?;
        if leaf.num_keys() == self.order {
            let new = self.split(&mut hdr, &leaf)?;
            let split_key = new.key(0);
            let new_is_last = new.is_leaf() && new.next_leaf() == IX_SENTINEL_PAGE;
            let new_page = new.page_no;
            self.insert_into_parent(&mut hdr, &leaf, &split_key, &new)?;
            if new_is_last {
                hdr.last_leaf = new_page;
            }
        }
        Ok(leaf.page_no)
    }

    /// Removes the entry for `key`. Returns false when the key is absent.
    pub fn delete_entry(&self, key: &[u8]) -> Result<bool> {
        let _w = self.root_latch.write();
        let mut hdr = self.hdr.lock();
        if hdr.root_page == INVALID_PAGE_NO {
            return Ok(false);
        }
        let leaf = self.find_leaf(&hdr, key, Operation::Delete)?;
        let before = leaf.num_keys();
        if leaf.remove(key) == before {
            return Ok(false);
        }
        self.maintain_parent(&leaf)?;
        self.coalesce_or_redistribute(&mut hdr, leaf)?;
        Ok(true)
    }

    /// Splits `node`, moving its right half into a fresh right sibling.
    fn split(&self, hdr: &mut IndexFileHeader, node: &Node) -> Result<Node> {
        let new = self.create_node(hdr, node.is_leaf())?;
        new.set_parent(node.parent());
        let size = node.num_keys();
        let split_point = self.min_size();
        if node.is_leaf() {
            new.set_prev_leaf(node.page_no);
            new.set_next_leaf(node.next_leaf());
            node.set_next_leaf(new.page_no);
            // The successor exists even at the chain end: the sentinel.
            let next = self.fetch_node(new.next_leaf())?;
            next.set_prev_leaf(new.page_no);
        }
        let keys = node.keys_range(split_point, size);
        let rids = node.rids_range(split_point, size);
        new.insert_pairs(0, &keys, &rids)?;
        node.set_num_keys(split_point);
        if !new.is_leaf() {
            for i in 0..new.num_keys() {
                self.maintain_child(&new, i)?;
            }
        }
        debug!(
            "index {}: split node {} -> {} at {}",
            self.name, node.page_no, new.page_no, split_point
        );
        Ok(new)
    }

    /// Hooks `new` (the right half of a split) into the tree next to `old`,
    /// growing a new root when `old` was the root.
    fn insert_into_parent(
        &self,
        hdr: &mut IndexFileHeader,
        old: &Node,
        key: &[u8],
        new: &Node,
    ) -> Result<()> {
        if old.page_no == hdr.root_page {
            let root = self.create_node(hdr, false)?;
            root.insert_pair(0, &old.key(0), Rid::new(old.page_no, 0))?;
            root.insert_pair(1, key, Rid::new(new.page_no, 0))?;
            old.set_parent(root.page_no);
            new.set_parent(root.page_no);
            hdr.root_page = root.page_no;
            debug!("index {}: new root {}", self.name, root.page_no);
            return Ok(());
        }
        let parent = self.fetch_node(old.parent())?;
        let rank = parent
            .find_child(old.page_no)
            .ok_or(StrataError::IndexEntryNotFound)?;
        parent.insert_pair(rank + 1, key, Rid::new(new.page_no, 0))?;
        new.set_parent(parent.page_no);
        if parent.num_keys() == self.order {
            let pnew = self.split(hdr, &parent)?;
            let split_key = pnew.key(0);
            self.insert_into_parent(hdr, &parent, &split_key, &pnew)?;
        }
        Ok(())
    }

    /// Re-balances an underfull node: borrow from a sibling when the two
    /// together still fill two nodes, merge otherwise. Returns whether the
    /// node was consumed.
    fn coalesce_or_redistribute(&self, hdr: &mut IndexFileHeader, node: Node) -> Result<bool> {
        if node.page_no == hdr.root_page {
            return self.adjust_root(hdr, node);
        }
        if node.num_keys() >= self.min_size() {
            return Ok(false);
        }
        let parent = self.fetch_node(node.parent())?;
        let rank = parent
            .find_child(node.page_no)
            .ok_or(StrataError::IndexEntryNotFound)?;
        let sibling_rank = if rank > 0 { rank - 1 } else { 1 };
        let sibling = self.fetch_node(parent.child_at(sibling_rank))?;
        if node.num_keys() + sibling.num_keys() >= self.min_size() * 2 {
            self.redistribute(&sibling, &node, &parent, rank)?;
            Ok(false)
        } else {
            self.coalesce(hdr, sibling, node, parent, rank)?;
            Ok(true)
        }
    }

    /// Moves one pair from the sibling into `node` and fixes the separator
    /// key in the parent. `rank` is node's slot in the parent; rank 0 means
    /// the sibling sits to the right.
    fn redistribute(&self, sibling: &Node, node: &Node, parent: &Node, rank: usize) -> Result<()> {
        if rank == 0 {
            let key = sibling.key(0);
            let rid = sibling.rid(0);
            node.insert_pair(node.num_keys(), &key, rid)?;
            sibling.erase_pair(0);
            parent.set_key(1, &sibling.key(0));
            self.maintain_child(node, node.num_keys() - 1)?;
        } else {
            let end = sibling.num_keys() - 1;
            let key = sibling.key(end);
            let rid = sibling.rid(end);
            node.insert_pair(0, &key, rid)?;
            sibling.erase_pair(end);
            parent.set_key(rank, &node.key(0));
            self.maintain_child(node, 0)?;
        }
        Ok(())
    }

    /// Merges the right node into the left one, unlinks it from the leaf
    /// chain and the parent, and frees its page. Recurses when the parent
    /// becomes underfull.
    fn coalesce(
        &self,
        hdr: &mut IndexFileHeader,
        sibling: Node,
        node: Node,
        parent: Node,
        rank: usize,
    ) -> Result<()> {
        let (left, right, right_rank) = if rank == 0 {
            (node, sibling, 1)
        } else {
            (sibling, node, rank)
        };
        let prev_size = left.num_keys();
        let keys = right.keys_range(0, right.num_keys());
        let rids = right.rids_range(0, right.num_keys());
        left.insert_pairs(prev_size, &keys, &rids)?;
        if !left.is_leaf() {
            for i in prev_size..left.num_keys() {
                self.maintain_child(&left, i)?;
            }
        }
        if right.is_leaf() {
            if right.next_leaf() == IX_SENTINEL_PAGE {
                hdr.last_leaf = left.page_no;
            }
            self.erase_leaf(&right)?;
        }
        parent.erase_pair(right_rank);
        debug!(
            "index {}: merged node {} into {}",
            self.name, right.page_no, left.page_no
        );

        let right_id = PageId::new(self.fd, right.page_no);
        drop(right);
        if !self.pool.delete_page(right_id)? {
            return Err(StrataError::Internal(format!(
                "merged index page {} still pinned",
                right_id.page_no
            )));
        }
        hdr.num_pages -= 1;

        if parent.num_keys() < self.min_size() {
            self.coalesce_or_redistribute(hdr, parent)?;
        }
        Ok(())
    }

    /// Root collapse: an internal root with one child hands the tree to that
    /// child; an empty leaf root empties the tree.
    fn adjust_root(&self, hdr: &mut IndexFileHeader, root: Node) -> Result<bool> {
        if !root.is_leaf() && root.num_keys() == 1 {
            let child = self.fetch_node(root.child_at(0))?;
            child.set_parent(INVALID_PAGE_NO);
            hdr.root_page = child.page_no;
        } else if root.is_leaf() && root.num_keys() == 0 {
            hdr.root_page = INVALID_PAGE_NO;
            hdr.first_leaf = IX_SENTINEL_PAGE;
            hdr.last_leaf = IX_SENTINEL_PAGE;
            let sentinel = self.fetch_node(IX_SENTINEL_PAGE)?;
            sentinel.set_prev_leaf(IX_SENTINEL_PAGE);
            sentinel.set_next_leaf(IX_SENTINEL_PAGE);
        } else {
            return Ok(false);
        }
        let root_id = PageId::new(self.fd, root.page_no);
        drop(root);
        if !self.pool.delete_page(root_id)? {
            return Err(StrataError::Internal(format!(
                "collapsed root page {} still pinned",
                root_id.page_no
            )));
        }
        hdr.num_pages -= 1;
        debug!("index {}: root collapsed", self.name);
        Ok(true)
    }

    /// Walks ancestor first-keys upward after a change to a node's minimum.
    fn maintain_parent(&self, node: &Node) -> Result<()> {
        if node.num_keys() == 0 {
            return Ok(());
        }
        let mut cur_page = node.page_no;
        let mut first_key = node.key(0);
        let mut parent_no = node.parent();
        while parent_no != INVALID_PAGE_NO {
            let parent = self.fetch_node(parent_no)?;
            let rank = parent
                .find_child(cur_page)
                .ok_or(StrataError::IndexEntryNotFound)?;
            if parent.key(rank) == first_key {
                break;
            }
            parent.set_key(rank, &first_key);
            cur_page = parent.page_no;
            first_key = parent.key(0);
            parent_no = parent.parent();
        }
        Ok(())
    }

    /// Repoints the parent field of an internal node's `i`-th child.
    fn maintain_child(&self, node: &Node, i: usize) -> Result<()> {
        if node.is_leaf() {
            return Ok(());
        }
        let child = self.fetch_node(node.child_at(i))?;
        child.set_parent(node.page_no);
        Ok(())
    }

    /// Unlinks a leaf from the doubly linked chain before it is freed.
    fn erase_leaf(&self, leaf: &Node) -> Result<()> {
        let prev = self.fetch_node(leaf.prev_leaf())?;
        prev.set_next_leaf(leaf.next_leaf());
        let next = self.fetch_node(leaf.next_leaf())?;
        next.set_prev_leaf(leaf.prev_leaf());
        Ok(())
    }

    fn position_at_or_after(&self, hdr: &IndexFileHeader, leaf: &Node, pos: usize) -> Iid {
        if pos == leaf.num_keys() {
            if hdr.last_leaf == leaf.page_no {
                Iid {
                    page_no: leaf.page_no,
                    slot_no: pos as i32,
                }
            } else {
                Iid {
                    page_no: leaf.next_leaf(),
                    slot_no: 0,
                }
            }
        } else {
            Iid {
                page_no: leaf.page_no,
                slot_no: pos as i32,
            }
        }
    }

    /// Position of the first entry >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> Result<Iid> {
        let _r = self.root_latch.read();
        let hdr = self.hdr.lock();
        if hdr.root_page == INVALID_PAGE_NO {
            return Ok(Iid::invalid());
        }
        let leaf = self.find_leaf(&hdr, key, Operation::Find)?;
        let pos = leaf.lower_bound(key);
        Ok(self.position_at_or_after(&hdr, &leaf, pos))
    }

    /// Position after the last entry <= `key`, by the node-level bound that
    /// treats slot 0 as the subtree floor.
    pub fn upper_bound(&self, key: &[u8]) -> Result<Iid> {
        let _r = self.root_latch.read();
        let hdr = self.hdr.lock();
        if hdr.root_page == INVALID_PAGE_NO {
            return Ok(Iid::invalid());
        }
        let leaf = self.find_leaf(&hdr, key, Operation::Find)?;
        let pos = leaf.upper_bound(key);
        if pos == leaf.num_keys() {
            return self.leaf_end_locked(&hdr);
        }
        Ok(Iid {
            page_no: leaf.page_no,
            slot_no: pos as i32,
        })
    }

    /// The probe used to build exclusive upper bounds: like `upper_bound`,
    /// but correct on the leftmost leaf where every key may exceed `key`.
    pub fn upper_bound_for_gt(&self, key: &[u8]) -> Result<Iid> {
        let _r = self.root_latch.read();
        let hdr = self.hdr.lock();
        if hdr.root_page == INVALID_PAGE_NO {
            return Ok(Iid::invalid());
        }
        let leaf = self.find_leaf(&hdr, key, Operation::Find)?;
        let mut pos = leaf.upper_bound(key);
        if leaf.num_keys() == 0
            || (pos == 1 && compare_keys(&leaf.key(0), key, &self.schema) == Ordering::Greater)
        {
            pos = 0;
        }
        Ok(self.position_at_or_after(&hdr, &leaf, pos))
    }

    pub fn leaf_begin(&self) -> Result<Iid> {
        let hdr = self.hdr.lock();
        if hdr.root_page == INVALID_PAGE_NO {
            return Ok(Iid::invalid());
        }
        Ok(Iid {
            page_no: hdr.first_leaf,
            slot_no: 0,
        })
    }

    /// The past-last position of the whole tree.
    pub fn leaf_end(&self) -> Result<Iid> {
        let _r = self.root_latch.read();
        let hdr = self.hdr.lock();
        if hdr.root_page == INVALID_PAGE_NO {
            return Ok(Iid::invalid());
        }
        self.leaf_end_locked(&hdr)
    }

    fn leaf_end_locked(&self, hdr: &MutexGuard<'_, IndexFileHeader>) -> Result<Iid> {
        let node = self.fetch_node(hdr.last_leaf)?;
        Ok(Iid {
            page_no: hdr.last_leaf,
            slot_no: node.num_keys() as i32,
        })
    }

    /// The rid stored at an iterator position.
    pub fn get_rid(&self, iid: Iid) -> Result<Rid> {
        let _r = self.root_latch.read();
        let node = self.fetch_node(iid.page_no)?;
        if iid.slot_no < 0 || iid.slot_no as usize >= node.num_keys() {
            return Err(StrataError::IndexEntryNotFound);
        }
        Ok(node.rid(iid.slot_no as usize))
    }

    /// The key stored at an iterator position.
    pub fn key_at(&self, iid: Iid) -> Result<Vec<u8>> {
        let _r = self.root_latch.read();
        let node = self.fetch_node(iid.page_no)?;
        if iid.slot_no < 0 || iid.slot_no as usize >= node.num_keys() {
            return Err(StrataError::IndexEntryNotFound);
        }
        Ok(node.key(iid.slot_no as usize))
    }

    /// Walks the whole tree checking its structural invariants: key order,
    /// occupancy floors, parent pointers, the min-key rule for internal
    /// separators, and the leaf chain in both directions.
    pub fn verify_integrity(&self) -> Result<()> {
        let _r = self.root_latch.read();
        let hdr = self.hdr.lock();
        if hdr.root_page == INVALID_PAGE_NO {
            if hdr.first_leaf != IX_SENTINEL_PAGE || hdr.last_leaf != IX_SENTINEL_PAGE {
                return Err(StrataError::Internal(
                    "empty tree with a non-sentinel leaf chain".into(),
                ));
            }
            return Ok(());
        }
        let mut leaves = Vec::new();
        self.verify_node(&hdr, hdr.root_page, INVALID_PAGE_NO, &mut leaves)?;

        // Forward leaf-chain traversal must visit exactly the leaves found
        // by the tree walk, in order.
        let mut chain = Vec::new();
        let mut page_no = hdr.first_leaf;
        let mut prev = IX_SENTINEL_PAGE;
        while page_no != IX_SENTINEL_PAGE {
            let node = self.fetch_node(page_no)?;
            if node.prev_leaf() != prev {
                return Err(StrataError::Internal(format!(
                    "leaf {page_no} has prev {} but was reached from {prev}",
                    node.prev_leaf()
                )));
            }
            chain.push(page_no);
            prev = page_no;
            page_no = node.next_leaf();
        }
        if prev != hdr.last_leaf {
            return Err(StrataError::Internal(format!(
                "leaf chain ends at {prev}, header says {}",
                hdr.last_leaf
            )));
        }
        if chain != leaves {
            return Err(StrataError::Internal(
                "leaf chain disagrees with the tree walk".into(),
            ));
        }
        Ok(())
    }

    fn verify_node(
        &self,
        hdr: &IndexFileHeader,
        page_no: PageNo,
        expected_parent: PageNo,
        leaves: &mut Vec<PageNo>,
    ) -> Result<()> {
        let node = self.fetch_node(page_no)?;
        let num = node.num_keys();
        let is_root = page_no == hdr.root_page;
        if node.parent() != expected_parent {
            return Err(StrataError::Internal(format!(
                "node {page_no} has parent {}, expected {expected_parent}",
                node.parent()
            )));
        }
        if !is_root && (num < self.min_size() || num >= self.order) {
            return Err(StrataError::Internal(format!(
                "node {page_no} holds {num} keys outside [{}, {})",
                self.min_size(),
                self.order
            )));
        }
        for i in 1..num {
            if compare_keys(&node.key(i - 1), &node.key(i), &self.schema) != Ordering::Less {
                return Err(StrataError::Internal(format!(
                    "node {page_no} keys out of order at slot {i}"
                )));
            }
        }
        if node.is_leaf() {
            leaves.push(page_no);
            return Ok(());
        }
        for i in 0..num {
            let child_no = node.child_at(i);
            let child = self.fetch_node(child_no)?;
            if child.key(0) != node.key(i) {
                return Err(StrataError::Internal(format!(
                    "internal {page_no} separator {i} is not the min key of child {child_no}"
                )));
            }
            drop(child);
            self.verify_node(hdr, child_no, page_no, leaves)?;
        }
        Ok(())
    }

    fn leaf_hop_info(&self, page_no: PageNo) -> Result<(usize, PageNo, bool)> {
        let hdr = self.hdr.lock();
        let node = self.fetch_node(page_no)?;
        Ok((node.num_keys(), node.next_leaf(), hdr.last_leaf == page_no))
    }
}

fn write_header(disk: &DiskManager, fd: i32, hdr: &IndexFileHeader) -> Result<()> {
    let mut buf = vec![0u8; PAGE_SIZE];
    let bytes = bincode::serialize(hdr)
        .map_err(|e| StrataError::Internal(format!("index header encode: {e}")))?;
    buf[..bytes.len()].copy_from_slice(&bytes);
    disk.write_page(fd, IX_FILE_HDR_PAGE, &buf)
}

/// Range cursor over `[lower, upper)` in leaf-chain order. One leaf is
/// pinned at a time, only for the duration of each step.
pub struct IndexScan {
    index: Arc<BTreeIndex>,
    iid: Iid,
    end: Iid,
}

impl IndexScan {
    pub fn new(index: Arc<BTreeIndex>, lower: Iid, upper: Iid) -> Self {
        Self {
            index,
            iid: lower,
            end: upper,
        }
    }

    pub fn is_end(&self) -> bool {
        self.iid.page_no == INVALID_PAGE_NO || self.iid == self.end
    }

    pub fn iid(&self) -> Iid {
        self.iid
    }

    pub fn rid(&self) -> Result<Rid> {
        self.index.get_rid(self.iid)
    }

    pub fn next(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        let (num_keys, next_leaf, is_last) = self.index.leaf_hop_info(self.iid.page_no)?;
        self.iid.slot_no += 1;
        if self.iid.slot_no as usize >= num_keys {
            if is_last {
                self.iid.slot_no = num_keys as i32;
            } else {
                self.iid = Iid {
                    page_no: next_leaf,
                    slot_no: 0,
                };
            }
        }
        Ok(())
    }
}
