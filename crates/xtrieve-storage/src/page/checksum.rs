//! Page checksums.
//!
//! CRC32 over the whole page except the checksum field itself, computed
//! on write and verified on every read from disk.

/// Offset of the 4-byte checksum field inside the page header.
pub const CHECKSUM_OFFSET: usize = 12;

/// Computes the checksum of a page, skipping the checksum field.
pub fn compute_page_checksum(page: &[u8]) -> u32 {
    debug_assert!(page.len() >= CHECKSUM_OFFSET + 4);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..CHECKSUM_OFFSET]);
    hasher.update(&page[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

/// Verifies a page against its stored checksum field.
pub fn verify_checksum(page: &[u8]) -> bool {
    let stored = u32::from_le_bytes(
        page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]
            .try_into()
            .unwrap(),
    );
    stored == compute_page_checksum(page)
}
