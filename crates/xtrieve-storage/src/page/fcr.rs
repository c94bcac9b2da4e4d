//! File Control Record.
//!
//! Page 0 of every file. Geometry (page size, record length, key table) is
//! fixed at create time; the counters, free chain head, and per-key root
//! pages change over the file's life and are republished after every
//! structural change, always after the pages they describe have been
//! written.
//!
//! Body layout (offsets relative to the end of the page header):
//!
//! ```text
//! 0    4   signature "XTRV"
//! 4    2   format version
//! 6    2   page size
//! 8    2   record length (fixed portion)
//! 10   2   key table entry count
//! 12   2   file flags (bit 0: needs recovery)
//! 14   2   reserved
//! 16   8   FCR version counter
//! 24   8   next insertion sequence
//! 32   4   record count
//! 36   4   total page count
//! 40   4   free chain head
//! 44   4   first data page
//! 48   4   last data page (insert hint)
//! 52   12  reserved
//! 64   ..  key table, 16 bytes per entry
//! ```
//!
//! Key table entry: position u16, length u16, flags u16, type u8, null
//! value u8, root page u32, reserved 4. An entry whose SEGMENTED flag is
//! set continues into the next entry; a chain of entries forms one key.
//! The root page field is meaningful only on the first entry of a chain.

use xtrieve_common::constants::{FILE_SIGNATURE, FORMAT_VERSION, MAX_KEYS};
use xtrieve_common::types::{KeyChain, KeyDescriptor, KeyFlags, KeyType, PageId};
use xtrieve_common::{XtrieveError, XtrieveResult};

use super::header::{PageHeader, PageHeaderRef, PAGE_HEADER_SIZE};
use super::kinds::PageKind;

const KEY_TABLE_OFFSET: usize = 64;
const KEY_ENTRY_SIZE: usize = 16;

const FLAG_NEEDS_RECOVERY: u16 = 1 << 0;

/// In-memory image of page 0.
#[derive(Debug, Clone)]
pub struct FileControlRecord {
    /// Page size, fixed at create time.
    pub page_size: u16,
    /// Fixed-portion record length.
    pub record_length: u16,
    /// Set while an interrupted transaction may have left torn pages.
    pub needs_recovery: bool,
    /// Monotone counter bumped on every publish while the file is open.
    pub fcr_version: u64,
    /// Next insertion sequence, stamped on each inserted record.
    pub next_sequence: u64,
    /// Live records in the file.
    pub record_count: u32,
    /// Pages in the file, including page 0.
    pub page_count: u32,
    /// Head of the free page chain.
    pub free_head: PageId,
    /// First data page ever allocated (physical iteration start hint).
    pub first_data_page: PageId,
    /// Most recently used data page (insert placement hint).
    pub last_data_page: PageId,
    /// Declared keys, one chain per key number.
    pub keys: Vec<KeyChain>,
    /// Root index page per key number (`PageId::NONE` while empty).
    pub index_roots: Vec<PageId>,
}

impl FileControlRecord {
    /// Builds a fresh FCR for a newly created file.
    pub fn new(record_length: u16, page_size: u16, keys: Vec<KeyChain>) -> Self {
        let key_count = keys.len();
        Self {
            page_size,
            record_length,
            needs_recovery: false,
            fcr_version: 1,
            next_sequence: 1,
            record_count: 0,
            page_count: 1,
            free_head: PageId::NONE,
            first_data_page: PageId::NONE,
            last_data_page: PageId::NONE,
            keys,
            index_roots: vec![PageId::NONE; key_count],
        }
    }

    /// Number of key table entries (segments) across all chains.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.keys.iter().map(|k| k.segments().len()).sum()
    }

    /// Looks up a key chain by wire key number.
    #[must_use]
    pub fn key(&self, key_number: usize) -> Option<&KeyChain> {
        self.keys.get(key_number)
    }

    /// Allocates and stamps the next insertion sequence.
    pub fn take_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Encodes the FCR into a full page image (header included).
    ///
    /// The usage counter and checksum are left zero; the page store stamps
    /// both when the page goes to disk.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut page = vec![0u8; self.page_size as usize];
        PageHeader::new(&mut page).initialize(PageId::FCR, PageKind::Fcr);

        let body = &mut page[PAGE_HEADER_SIZE..];
        body[0..4].copy_from_slice(&FILE_SIGNATURE);
        body[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        body[6..8].copy_from_slice(&self.page_size.to_le_bytes());
        body[8..10].copy_from_slice(&self.record_length.to_le_bytes());
        body[10..12].copy_from_slice(&(self.entry_count() as u16).to_le_bytes());

        let mut flags = 0u16;
        if self.needs_recovery {
            flags |= FLAG_NEEDS_RECOVERY;
        }
        body[12..14].copy_from_slice(&flags.to_le_bytes());

        body[16..24].copy_from_slice(&self.fcr_version.to_le_bytes());
        body[24..32].copy_from_slice(&self.next_sequence.to_le_bytes());
        body[32..36].copy_from_slice(&self.record_count.to_le_bytes());
        body[36..40].copy_from_slice(&self.page_count.to_le_bytes());
        body[40..44].copy_from_slice(&self.free_head.as_u32().to_le_bytes());
        body[44..48].copy_from_slice(&self.first_data_page.as_u32().to_le_bytes());
        body[48..52].copy_from_slice(&self.last_data_page.as_u32().to_le_bytes());

        let mut offset = KEY_TABLE_OFFSET;
        for (key, root) in self.keys.iter().zip(&self.index_roots) {
            for (i, segment) in key.segments().iter().enumerate() {
                let entry = &mut body[offset..offset + KEY_ENTRY_SIZE];
                entry[0..2].copy_from_slice(&segment.position.to_le_bytes());
                entry[2..4].copy_from_slice(&segment.length.to_le_bytes());
                entry[4..6].copy_from_slice(&segment.flags.bits().to_le_bytes());
                entry[6] = segment.key_type as u8;
                entry[7] = segment.null_value;
                let entry_root = if i == 0 { *root } else { PageId::NONE };
                entry[8..12].copy_from_slice(&entry_root.as_u32().to_le_bytes());
                offset += KEY_ENTRY_SIZE;
            }
        }

        page
    }

    /// Decodes page 0, validating the header and signature.
    pub fn decode(page: &[u8]) -> XtrieveResult<Self> {
        let header = PageHeaderRef::new(page);
        if !header.is_valid_magic() {
            return Err(XtrieveError::corrupt("bad page magic on page 0"));
        }
        if header.kind() != Some(PageKind::Fcr) {
            return Err(XtrieveError::corrupt("page 0 is not an FCR"));
        }

        let body = &page[PAGE_HEADER_SIZE..];
        if body[0..4] != FILE_SIGNATURE {
            return Err(XtrieveError::corrupt("bad file signature"));
        }
        let format = u16::from_le_bytes(body[4..6].try_into().unwrap());
        if format != FORMAT_VERSION {
            return Err(XtrieveError::corrupt(format!(
                "unsupported format version {format}"
            )));
        }

        let page_size = u16::from_le_bytes(body[6..8].try_into().unwrap());
        if page_size as usize != page.len() {
            return Err(XtrieveError::corrupt("FCR page size disagrees with read size"));
        }

        let record_length = u16::from_le_bytes(body[8..10].try_into().unwrap());
        let entry_count = u16::from_le_bytes(body[10..12].try_into().unwrap()) as usize;
        let flags = u16::from_le_bytes(body[12..14].try_into().unwrap());

        if entry_count > MAX_KEYS {
            return Err(XtrieveError::corrupt("key table entry count out of range"));
        }

        let fcr_version = u64::from_le_bytes(body[16..24].try_into().unwrap());
        let next_sequence = u64::from_le_bytes(body[24..32].try_into().unwrap());
        let record_count = u32::from_le_bytes(body[32..36].try_into().unwrap());
        let page_count = u32::from_le_bytes(body[36..40].try_into().unwrap());
        let free_head = PageId::new(u32::from_le_bytes(body[40..44].try_into().unwrap()));
        let first_data_page = PageId::new(u32::from_le_bytes(body[44..48].try_into().unwrap()));
        let last_data_page = PageId::new(u32::from_le_bytes(body[48..52].try_into().unwrap()));

        let mut keys = Vec::new();
        let mut index_roots = Vec::new();
        let mut segments: Vec<KeyDescriptor> = Vec::new();
        let mut chain_root = PageId::NONE;

        for i in 0..entry_count {
            let start = KEY_TABLE_OFFSET + i * KEY_ENTRY_SIZE;
            let entry = body
                .get(start..start + KEY_ENTRY_SIZE)
                .ok_or_else(|| XtrieveError::corrupt("key table overruns page 0"))?;

            let position = u16::from_le_bytes(entry[0..2].try_into().unwrap());
            let length = u16::from_le_bytes(entry[2..4].try_into().unwrap());
            let seg_flags = KeyFlags::from_bits(u16::from_le_bytes(entry[4..6].try_into().unwrap()));
            let key_type = KeyType::from_u8(entry[6]);
            let null_value = entry[7];
            let root = PageId::new(u32::from_le_bytes(entry[8..12].try_into().unwrap()));

            if segments.is_empty() {
                chain_root = root;
            }
            let continues = seg_flags.is_set(KeyFlags::SEGMENTED);
            segments.push(KeyDescriptor::new(position, length, seg_flags, key_type, null_value));

            if !continues {
                keys.push(KeyChain::new(std::mem::take(&mut segments)));
                index_roots.push(chain_root);
            }
        }

        if !segments.is_empty() {
            return Err(XtrieveError::corrupt("trailing unterminated key segment"));
        }

        Ok(Self {
            page_size,
            record_length,
            needs_recovery: (flags & FLAG_NEEDS_RECOVERY) != 0,
            fcr_version,
            next_sequence,
            record_count,
            page_count,
            free_head,
            first_data_page,
            last_data_page,
            keys,
            index_roots,
        })
    }
}
