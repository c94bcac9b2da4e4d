//! Variable-length overflow pages.
//!
//! A record's variable tail lives on a singly linked chain of VARIABLE
//! pages rooted at the head id stored in the record's data cell. Body
//! layout after the page header: `[next page u32][fragment length u16]
//! [fragment bytes]`.

use xtrieve_common::types::PageId;

use super::header::{PageHeader, PageHeaderRef, PAGE_HEADER_SIZE};
use super::kinds::PageKind;

const BODY_PREFIX: usize = 6;

/// Largest fragment one overflow page can carry.
#[inline]
#[must_use]
pub const fn max_fragment(page_size: u16) -> usize {
    page_size as usize - PAGE_HEADER_SIZE - BODY_PREFIX
}

/// Mutable view over an overflow page.
pub struct OverflowPage<'a> {
    data: &'a mut [u8],
}

impl<'a> OverflowPage<'a> {
    /// Wraps a page buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer cannot hold the body prefix.
    #[inline]
    pub fn new(data: &'a mut [u8]) -> Self {
        assert!(
            data.len() >= PAGE_HEADER_SIZE + BODY_PREFIX,
            "buffer too small for overflow page"
        );
        Self { data }
    }

    /// Initializes the buffer as an overflow page carrying `fragment`.
    ///
    /// # Panics
    ///
    /// Panics if the fragment exceeds [`max_fragment`].
    pub fn initialize(&mut self, page_id: PageId, next: PageId, fragment: &[u8]) {
        assert!(fragment.len() <= max_fragment(self.data.len() as u16));
        PageHeader::new(self.data).initialize(page_id, PageKind::Variable);
        self.set_next(next);
        let body = PAGE_HEADER_SIZE;
        self.data[body + 4..body + 6].copy_from_slice(&(fragment.len() as u16).to_le_bytes());
        self.data[body + BODY_PREFIX..body + BODY_PREFIX + fragment.len()].copy_from_slice(fragment);
    }

    /// Sets the next-page link.
    pub fn set_next(&mut self, next: PageId) {
        let body = PAGE_HEADER_SIZE;
        self.data[body..body + 4].copy_from_slice(&next.as_u32().to_le_bytes());
    }

    /// The next page in the chain (`PageId::NONE` at the tail).
    pub fn next(&self) -> PageId {
        let body = PAGE_HEADER_SIZE;
        PageId::new(u32::from_le_bytes(self.data[body..body + 4].try_into().unwrap()))
    }

    /// This page's fragment bytes.
    pub fn fragment(&self) -> &[u8] {
        let body = PAGE_HEADER_SIZE;
        let len = u16::from_le_bytes(self.data[body + 4..body + 6].try_into().unwrap()) as usize;
        let start = body + BODY_PREFIX;
        &self.data[start..start + len.min(self.data.len() - start)]
    }

    /// True when the page header marks this as a VARIABLE page.
    pub fn is_overflow(&self) -> bool {
        PageHeaderRef::new(self.data).kind() == Some(PageKind::Variable)
    }
}
