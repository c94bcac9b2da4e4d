//! Page header.
//!
//! Every page starts with the same 24-byte header:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       2   magic (0x5458 = "XT")
//!   2       1   page kind
//!   3       1   reserved
//!   4       4   page id (u32)
//!   8       4   usage counter (bumped on every disk write)
//!  12       4   checksum (CRC32 of the page, excluding this field)
//!  16       2   flags
//!  18       2   slot count
//!  20       2   free space offset
//!  22       2   free space end
//! ```
//!
//! The usage counter orders page images: of two copies of the same page,
//! the one with the higher counter is newer. After a crash the FCR's own
//! counter is the trusted truth about what was durably published.

use xtrieve_common::constants::PAGE_MAGIC;
use xtrieve_common::types::PageId;

use super::checksum::{compute_page_checksum, CHECKSUM_OFFSET};
use super::kinds::PageKind;

/// Fixed header size shared by all page kinds.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Mutable view over a page's header.
#[derive(Debug)]
pub struct PageHeader<'a> {
    data: &'a mut [u8],
}

impl<'a> PageHeader<'a> {
    /// Wraps a page buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than the header.
    #[inline]
    pub fn new(data: &'a mut [u8]) -> Self {
        assert!(data.len() >= PAGE_HEADER_SIZE, "buffer too small for page header");
        Self { data }
    }

    /// Zeroes the page and stamps a fresh header.
    pub fn initialize(&mut self, page_id: PageId, kind: PageKind) {
        self.data.fill(0);
        self.data[0..2].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
        self.data[2] = kind as u8;
        self.set_page_id(page_id);
        self.set_slot_count(0);
        self.set_free_space_offset(PAGE_HEADER_SIZE as u16);
        self.set_free_space_end(self.data.len() as u16);
    }

    /// Sets the page kind.
    #[inline]
    pub fn set_kind(&mut self, kind: PageKind) {
        self.data[2] = kind as u8;
    }

    /// Sets the page id.
    #[inline]
    pub fn set_page_id(&mut self, page_id: PageId) {
        self.data[4..8].copy_from_slice(&page_id.as_u32().to_le_bytes());
    }

    /// Increments the usage counter, wrapping on overflow.
    #[inline]
    pub fn bump_usage(&mut self) {
        let current = u32::from_le_bytes(self.data[8..12].try_into().unwrap());
        self.data[8..12].copy_from_slice(&current.wrapping_add(1).to_le_bytes());
    }

    /// Overwrites the usage counter (used when re-encoding a page whose
    /// counter must carry over).
    #[inline]
    pub fn set_usage(&mut self, usage: u32) {
        self.data[8..12].copy_from_slice(&usage.to_le_bytes());
    }

    /// Computes and stores the checksum. Call after all other edits.
    pub fn update_checksum(&mut self) {
        let sum = compute_page_checksum(self.data);
        self.data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&sum.to_le_bytes());
    }

    /// Sets the flags word.
    #[inline]
    pub fn set_flags(&mut self, flags: u16) {
        self.data[16..18].copy_from_slice(&flags.to_le_bytes());
    }

    /// Sets the slot count.
    #[inline]
    pub fn set_slot_count(&mut self, count: u16) {
        self.data[18..20].copy_from_slice(&count.to_le_bytes());
    }

    /// Sets the free space offset (end of the slot directory).
    #[inline]
    pub fn set_free_space_offset(&mut self, offset: u16) {
        self.data[20..22].copy_from_slice(&offset.to_le_bytes());
    }

    /// Sets the free space end (start of the cell area).
    #[inline]
    pub fn set_free_space_end(&mut self, end: u16) {
        self.data[22..24].copy_from_slice(&end.to_le_bytes());
    }

    /// Read-only view over the same buffer.
    #[inline]
    pub fn as_ref(&self) -> PageHeaderRef<'_> {
        PageHeaderRef::new(self.data)
    }
}

/// Read-only view over a page's header.
#[derive(Debug, Clone, Copy)]
pub struct PageHeaderRef<'a> {
    data: &'a [u8],
}

impl<'a> PageHeaderRef<'a> {
    /// Wraps a page buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than the header.
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        assert!(data.len() >= PAGE_HEADER_SIZE, "buffer too small for page header");
        Self { data }
    }

    /// True when the magic bytes match.
    #[inline]
    pub fn is_valid_magic(&self) -> bool {
        u16::from_le_bytes(self.data[0..2].try_into().unwrap()) == PAGE_MAGIC
    }

    /// The page kind tag, if recognized.
    #[inline]
    pub fn kind(&self) -> Option<PageKind> {
        PageKind::from_u8(self.data[2])
    }

    /// The page id stamped in the header.
    #[inline]
    pub fn page_id(&self) -> PageId {
        PageId::new(u32::from_le_bytes(self.data[4..8].try_into().unwrap()))
    }

    /// The usage counter.
    #[inline]
    pub fn usage(&self) -> u32 {
        u32::from_le_bytes(self.data[8..12].try_into().unwrap())
    }

    /// The flags word.
    #[inline]
    pub fn flags(&self) -> u16 {
        u16::from_le_bytes(self.data[16..18].try_into().unwrap())
    }

    /// Number of slots in the directory.
    #[inline]
    pub fn slot_count(&self) -> u16 {
        u16::from_le_bytes(self.data[18..20].try_into().unwrap())
    }

    /// End of the slot directory.
    #[inline]
    pub fn free_space_offset(&self) -> u16 {
        u16::from_le_bytes(self.data[20..22].try_into().unwrap())
    }

    /// Start of the cell area.
    #[inline]
    pub fn free_space_end(&self) -> u16 {
        u16::from_le_bytes(self.data[22..24].try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_and_read_back() {
        let mut buf = vec![0xAAu8; 512];
        let mut header = PageHeader::new(&mut buf);
        header.initialize(PageId::new(7), PageKind::Data);

        let view = PageHeaderRef::new(&buf);
        assert!(view.is_valid_magic());
        assert_eq!(view.kind(), Some(PageKind::Data));
        assert_eq!(view.page_id(), PageId::new(7));
        assert_eq!(view.usage(), 0);
        assert_eq!(view.slot_count(), 0);
        assert_eq!(view.free_space_offset(), PAGE_HEADER_SIZE as u16);
        assert_eq!(view.free_space_end(), 512);
    }

    #[test]
    fn test_usage_bump() {
        let mut buf = vec![0u8; 512];
        let mut header = PageHeader::new(&mut buf);
        header.initialize(PageId::new(1), PageKind::Index);
        header.bump_usage();
        header.bump_usage();
        assert_eq!(PageHeaderRef::new(&buf).usage(), 2);
    }

    #[test]
    fn test_checksum_roundtrip() {
        let mut buf = vec![0u8; 512];
        let mut header = PageHeader::new(&mut buf);
        header.initialize(PageId::new(3), PageKind::Variable);
        buf[200] = 42;
        PageHeader::new(&mut buf).update_checksum();
        assert!(super::super::checksum::verify_checksum(&buf));
    }
}
