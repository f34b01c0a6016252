//! The in-memory representation of a disk page.

use crate::{Lsn, PageId, INVALID_PAGE_NO, PAGE_SIZE};

/// A fixed-size page. Data pages reserve their first four bytes for the
/// page LSN; file-header pages use the whole array.
pub struct Page {
    id: PageId,
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    pub fn invalid() -> Self {
        Self::new(PageId::new(-1, INVALID_PAGE_NO))
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn set_id(&mut self, id: PageId) {
        self.id = id;
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// The LSN of the latest log record whose effect this page reflects.
    pub fn lsn(&self) -> Lsn {
        i32::from_le_bytes(self.data[0..4].try_into().unwrap())
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.data[0..4].copy_from_slice(&lsn.to_le_bytes());
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
        self.id = PageId::new(-1, INVALID_PAGE_NO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_lsn_round_trips_through_the_header() {
        let mut page = Page::new(PageId::new(3, 7));
        assert_eq!(page.lsn(), 0);
        page.set_lsn(41);
        assert_eq!(page.lsn(), 41);
        page.reset();
        assert_eq!(page.lsn(), 0);
        assert_eq!(page.id().page_no, INVALID_PAGE_NO);
    }
}
