//! Slotted data pages.
//!
//! A data page holds the fixed portion of records. The slot directory
//! grows down from the header while cells grow up from the tail:
//!
//! ```text
//! +---------------------+
//! |     page header     |
//! +---------------------+
//! |   slot directory    |  4 bytes per slot, grows downward
//! +---------------------+
//! |     free space      |
//! +---------------------+
//! |       cells         |  grow upward from the page end
//! +---------------------+
//! ```
//!
//! Each cell is `[overflow head page u32][overflow length u32][fixed
//! portion][insertion sequence u64]`; the sequence rides at a fixed
//! offset so the index tie-break survives without consulting any index.
//! A deleted slot keeps its directory entry with offset 0xFFFF; the slot
//! index is reused by the next insert into the same page, so record
//! addresses stay stable.

use xtrieve_common::types::PageId;

use super::header::{PageHeader, PageHeaderRef, PAGE_HEADER_SIZE};
use super::kinds::PageKind;

/// Size of one slot directory entry.
pub const SLOT_SIZE: usize = 4;

/// Cell prefix: overflow head (4) + overflow length (4).
pub const CELL_PREFIX_SIZE: usize = 8;

/// Cell suffix: insertion sequence (8).
pub const CELL_SUFFIX_SIZE: usize = 8;

/// Directory offset marking a dead slot.
const SLOT_DEAD: u16 = 0xFFFF;

/// Slot index within a data page.
pub type SlotId = u16;

/// Total cell size for a given fixed record length.
#[inline]
#[must_use]
pub const fn cell_size(record_length: u16) -> usize {
    CELL_PREFIX_SIZE + record_length as usize + CELL_SUFFIX_SIZE
}

/// One decoded cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Head of the overflow chain, `PageId::NONE` when the tail is empty.
    pub overflow_head: PageId,
    /// Total variable tail length across the chain.
    pub overflow_len: u32,
    /// Insertion sequence stamped at insert time.
    pub sequence: u64,
    /// The fixed portion bytes.
    pub fixed: Vec<u8>,
}

/// Mutable view over a data page.
pub struct DataPage<'a> {
    data: &'a mut [u8],
}

impl<'a> DataPage<'a> {
    /// Wraps a page buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than the page header.
    #[inline]
    pub fn new(data: &'a mut [u8]) -> Self {
        assert!(data.len() >= PAGE_HEADER_SIZE, "buffer too small for data page");
        Self { data }
    }

    /// Initializes the buffer as an empty data page.
    pub fn initialize(&mut self, page_id: PageId) {
        PageHeader::new(self.data).initialize(page_id, PageKind::Data);
    }

    fn header(&self) -> PageHeaderRef<'_> {
        PageHeaderRef::new(self.data)
    }

    /// Number of directory slots (live and dead).
    #[inline]
    pub fn slot_count(&self) -> u16 {
        self.header().slot_count()
    }

    fn slot_offset(slot: SlotId) -> usize {
        PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE
    }

    fn slot(&self, slot: SlotId) -> Option<(u16, u16)> {
        if slot >= self.slot_count() {
            return None;
        }
        let at = Self::slot_offset(slot);
        let offset = u16::from_le_bytes(self.data[at..at + 2].try_into().unwrap());
        let length = u16::from_le_bytes(self.data[at + 2..at + 4].try_into().unwrap());
        Some((offset, length))
    }

    fn set_slot(&mut self, slot: SlotId, offset: u16, length: u16) {
        let at = Self::slot_offset(slot);
        self.data[at..at + 2].copy_from_slice(&offset.to_le_bytes());
        self.data[at + 2..at + 4].copy_from_slice(&length.to_le_bytes());
    }

    /// True if the slot exists and holds a live cell.
    #[inline]
    pub fn is_live(&self, slot: SlotId) -> bool {
        matches!(self.slot(slot), Some((offset, _)) if offset != SLOT_DEAD)
    }

    /// Free bytes between the directory and the cell area.
    pub fn free_space(&self) -> usize {
        let header = self.header();
        let offset = header.free_space_offset() as usize;
        let end = header.free_space_end() as usize;
        end.saturating_sub(offset)
    }

    /// True if a cell of `record_length` fits, counting a directory entry
    /// unless a dead slot can be reused.
    pub fn can_fit(&self, record_length: u16) -> bool {
        let need = cell_size(record_length);
        if self.find_dead_slot().is_some() {
            self.free_space() >= need
        } else {
            self.free_space() >= need + SLOT_SIZE
        }
    }

    fn find_dead_slot(&self) -> Option<SlotId> {
        (0..self.slot_count()).find(|&slot| matches!(self.slot(slot), Some((SLOT_DEAD, _))))
    }

    /// Inserts a cell, reusing a dead slot when one exists.
    ///
    /// Returns the slot id, or `None` when the page is full.
    pub fn insert(
        &mut self,
        fixed: &[u8],
        overflow_head: PageId,
        overflow_len: u32,
        sequence: u64,
    ) -> Option<SlotId> {
        let need = cell_size(fixed.len() as u16);

        let (slot, new_slot) = match self.find_dead_slot() {
            Some(slot) => (slot, false),
            None => (self.slot_count(), true),
        };

        let dir_cost = if new_slot { SLOT_SIZE } else { 0 };
        if self.free_space() < need + dir_cost {
            return None;
        }

        let header = self.header();
        let cell_start = header.free_space_end() as usize - need;

        self.write_cell(cell_start, fixed, overflow_head, overflow_len, sequence);
        {
            let mut header = PageHeader::new(self.data);
            header.set_free_space_end(cell_start as u16);
            if new_slot {
                header.set_slot_count(slot + 1);
                header.set_free_space_offset((Self::slot_offset(slot) + SLOT_SIZE) as u16);
            }
        }
        self.set_slot(slot, cell_start as u16, need as u16);

        Some(slot)
    }

    fn write_cell(
        &mut self,
        at: usize,
        fixed: &[u8],
        overflow_head: PageId,
        overflow_len: u32,
        sequence: u64,
    ) {
        self.data[at..at + 4].copy_from_slice(&overflow_head.as_u32().to_le_bytes());
        self.data[at + 4..at + 8].copy_from_slice(&overflow_len.to_le_bytes());
        let fixed_at = at + CELL_PREFIX_SIZE;
        self.data[fixed_at..fixed_at + fixed.len()].copy_from_slice(fixed);
        let seq_at = fixed_at + fixed.len();
        self.data[seq_at..seq_at + 8].copy_from_slice(&sequence.to_le_bytes());
    }

    /// Reads the cell in a slot, if live.
    pub fn cell(&self, slot: SlotId) -> Option<Cell> {
        let (offset, length) = self.slot(slot)?;
        if offset == SLOT_DEAD {
            return None;
        }

        let at = offset as usize;
        let end = at + length as usize;
        if end > self.data.len() || (length as usize) < CELL_PREFIX_SIZE + CELL_SUFFIX_SIZE {
            return None;
        }

        let overflow_head = PageId::new(u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap()));
        let overflow_len = u32::from_le_bytes(self.data[at + 4..at + 8].try_into().unwrap());
        let fixed = self.data[at + CELL_PREFIX_SIZE..end - CELL_SUFFIX_SIZE].to_vec();
        let sequence = u64::from_le_bytes(self.data[end - CELL_SUFFIX_SIZE..end].try_into().unwrap());

        Some(Cell {
            overflow_head,
            overflow_len,
            sequence,
            fixed,
        })
    }

    /// Rewrites a live cell in place. The fixed portion length never
    /// changes for a given file, so the cell always fits where it is.
    pub fn rewrite(
        &mut self,
        slot: SlotId,
        fixed: &[u8],
        overflow_head: PageId,
        overflow_len: u32,
        sequence: u64,
    ) -> bool {
        let Some((offset, length)) = self.slot(slot) else {
            return false;
        };
        if offset == SLOT_DEAD || length as usize != cell_size(fixed.len() as u16) {
            return false;
        }

        self.write_cell(offset as usize, fixed, overflow_head, overflow_len, sequence);
        true
    }

    /// Marks a slot dead. The cell bytes stay until compaction; the slot
    /// index is reusable immediately.
    pub fn delete(&mut self, slot: SlotId) -> bool {
        match self.slot(slot) {
            Some((offset, _)) if offset != SLOT_DEAD => {
                self.set_slot(slot, SLOT_DEAD, 0);
                true
            }
            _ => false,
        }
    }

    /// Live slot ids in ascending order.
    pub fn live_slots(&self) -> Vec<SlotId> {
        (0..self.slot_count()).filter(|&s| self.is_live(s)).collect()
    }

    /// Number of live cells.
    pub fn live_count(&self) -> usize {
        (0..self.slot_count()).filter(|&s| self.is_live(s)).count()
    }

    /// Rebuilds the cell area to reclaim space from dead cells. Slot ids
    /// of live cells are preserved; dead slots stay dead.
    pub fn compact(&mut self) {
        let page_size = self.data.len();
        let cells: Vec<(SlotId, Cell)> = (0..self.slot_count())
            .filter_map(|slot| self.cell(slot).map(|c| (slot, c)))
            .collect();

        let mut cell_start = page_size;
        for (slot, cell) in &cells {
            let need = cell_size(cell.fixed.len() as u16);
            cell_start -= need;
            let (head, len, seq) = (cell.overflow_head, cell.overflow_len, cell.sequence);
            let fixed = cell.fixed.clone();
            self.write_cell(cell_start, &fixed, head, len, seq);
            self.set_slot(*slot, cell_start as u16, need as u16);
        }

        PageHeader::new(self.data).set_free_space_end(cell_start as u16);
    }
}
