//! Record encoding over data and overflow pages.
//!
//! The fixed portion of a record lives in a slotted data-page cell; any
//! variable tail goes to a chain of overflow pages whose head id is kept
//! in the cell. Physical iteration visits data pages in ascending page id
//! and live slots in ascending slot order, skipping deleted slots.

use xtrieve_common::types::{PageId, RecordId};
use xtrieve_common::{StatusCode, XtrieveError, XtrieveResult};

use crate::page::overflow::{max_fragment, OverflowPage};
use crate::page::slotted::{cell_size, Cell, DataPage};
use crate::page::PageKind;
use crate::store::PageStore;

/// Record operations over one open file.
pub struct RecordStore<'a> {
    store: &'a PageStore,
}

impl<'a> RecordStore<'a> {
    /// Wraps a page store.
    pub fn new(store: &'a PageStore) -> Self {
        Self { store }
    }

    fn record_length(&self) -> usize {
        self.store.fcr().record_length as usize
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Inserts a record, returning its address and insertion sequence.
    ///
    /// `record` must be at least the fixed record length; anything beyond
    /// it becomes the variable tail.
    pub fn insert(&self, record: &[u8]) -> XtrieveResult<(RecordId, u64)> {
        let sequence = self.store.fcr_mut().take_sequence();
        let id = self.insert_at_sequence(record, sequence)?;
        Ok((id, sequence))
    }

    /// Re-inserts a record under an already-issued sequence (transaction
    /// rollback of a delete). The sequence counter is advanced past it so
    /// the value can never be issued twice.
    pub fn insert_with_sequence(&self, record: &[u8], sequence: u64) -> XtrieveResult<RecordId> {
        {
            let mut fcr = self.store.fcr_mut();
            if fcr.next_sequence <= sequence {
                fcr.next_sequence = sequence + 1;
            }
        }
        self.insert_at_sequence(record, sequence)
    }

    fn insert_at_sequence(&self, record: &[u8], sequence: u64) -> XtrieveResult<RecordId> {
        let fixed_len = self.record_length();
        if record.len() < fixed_len {
            return Err(StatusCode::DataBufferTooShort.into());
        }
        let fixed = &record[..fixed_len];
        let tail = &record[fixed_len..];

        let (overflow_head, overflow_len) = self.write_overflow(tail)?;

        let page_id = self.find_insert_page(fixed_len as u16)?;
        let mut page = self.store.read_owned(page_id)?;
        let slot = {
            let mut view = DataPage::new(&mut page);
            match view.insert(fixed, overflow_head, overflow_len, sequence) {
                Some(slot) => slot,
                None => {
                    // Contiguous space is short but dead cells hold enough;
                    // rebuild the cell area and retry.
                    view.compact();
                    view.insert(fixed, overflow_head, overflow_len, sequence)
                        .ok_or_else(|| XtrieveError::corrupt("data page insert after compaction failed"))?
                }
            }
        };
        self.store.write_page(page_id, page)?;

        {
            let mut fcr = self.store.fcr_mut();
            fcr.record_count += 1;
            if !fcr.first_data_page.is_some() {
                fcr.first_data_page = page_id;
            }
            fcr.last_data_page = page_id;
        }

        Ok(RecordId::new(page_id, slot))
    }

    /// Replaces a record's bytes. The address and insertion sequence are
    /// preserved; the overflow chain is reallocated.
    pub fn update(&self, id: RecordId, record: &[u8]) -> XtrieveResult<()> {
        let fixed_len = self.record_length();
        if record.len() < fixed_len {
            return Err(StatusCode::DataBufferTooShort.into());
        }
        let fixed = &record[..fixed_len];
        let tail = &record[fixed_len..];

        let old = self.cell(id)?;
        let (overflow_head, overflow_len) = self.write_overflow(tail)?;

        let mut page = self.store.read_owned(id.page)?;
        let ok = DataPage::new(&mut page).rewrite(id.slot, fixed, overflow_head, overflow_len, old.sequence);
        if !ok {
            return Err(XtrieveError::corrupt("cell rewrite failed"));
        }
        self.store.write_page(id.page, page)?;

        self.free_overflow(old.overflow_head)?;
        Ok(())
    }

    /// Deletes a record: frees its overflow chain, kills the slot (the
    /// slot index stays reusable on the same page), drops the count.
    pub fn delete(&self, id: RecordId) -> XtrieveResult<()> {
        let cell = self.cell(id)?;

        let mut page = self.store.read_owned(id.page)?;
        if !DataPage::new(&mut page).delete(id.slot) {
            return Err(StatusCode::InvalidPositioning.into());
        }
        self.store.write_page(id.page, page)?;

        self.free_overflow(cell.overflow_head)?;
        self.store.fcr_mut().record_count -= 1;
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn cell(&self, id: RecordId) -> XtrieveResult<Cell> {
        if self.store.page_kind(id.page)? != Some(PageKind::Data) {
            return Err(StatusCode::InvalidPositioning.into());
        }
        let mut page = self.store.read_owned(id.page)?;
        DataPage::new(&mut page)
            .cell(id.slot)
            .ok_or_else(|| StatusCode::InvalidPositioning.into())
    }

    /// True if the address still names a live record.
    pub fn exists(&self, id: RecordId) -> bool {
        self.cell(id).is_ok()
    }

    /// The insertion sequence stamped on a record.
    pub fn sequence(&self, id: RecordId) -> XtrieveResult<u64> {
        Ok(self.cell(id)?.sequence)
    }

    /// Reads a record's full bytes: fixed portion plus variable tail.
    pub fn read(&self, id: RecordId) -> XtrieveResult<Vec<u8>> {
        let cell = self.cell(id)?;
        let mut record = cell.fixed;

        let mut remaining = cell.overflow_len as usize;
        let mut next = cell.overflow_head;
        let page_count = self.store.fcr().page_count;
        let mut hops = 0u32;
        while remaining > 0 {
            if !next.is_some() || hops > page_count {
                return Err(XtrieveError::corrupt("overflow chain truncated"));
            }
            hops += 1;
            let mut page = self.store.read_owned(next)?;
            let view = OverflowPage::new(&mut page);
            if !view.is_overflow() {
                return Err(XtrieveError::corrupt("overflow link points at wrong page kind"));
            }
            let fragment = view.fragment();
            let take = fragment.len().min(remaining);
            record.extend_from_slice(&fragment[..take]);
            remaining -= take;
            next = view.next();
        }

        Ok(record)
    }

    // =========================================================================
    // Physical iteration
    // =========================================================================

    /// First record in physical order.
    pub fn first(&self) -> XtrieveResult<Option<RecordId>> {
        let page_count = self.store.fcr().page_count;
        for raw in 1..page_count {
            let page_id = PageId::new(raw);
            if let Some(id) = self.first_in_page(page_id, 0)? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Last record in physical order.
    pub fn last(&self) -> XtrieveResult<Option<RecordId>> {
        let page_count = self.store.fcr().page_count;
        for raw in (1..page_count).rev() {
            let page_id = PageId::new(raw);
            if let Some(id) = self.last_in_page(page_id, u16::MAX)? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Next record after `id` in physical order.
    pub fn next_after(&self, id: RecordId) -> XtrieveResult<Option<RecordId>> {
        if let Some(found) = self.first_in_page(id.page, id.slot.saturating_add(1))? {
            return Ok(Some(found));
        }
        let page_count = self.store.fcr().page_count;
        for raw in id.page.as_u32() + 1..page_count {
            if let Some(found) = self.first_in_page(PageId::new(raw), 0)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Previous record before `id` in physical order.
    pub fn prev_before(&self, id: RecordId) -> XtrieveResult<Option<RecordId>> {
        if id.slot > 0 {
            if let Some(found) = self.last_in_page(id.page, id.slot - 1)? {
                return Ok(Some(found));
            }
        }
        for raw in (1..id.page.as_u32()).rev() {
            if let Some(found) = self.last_in_page(PageId::new(raw), u16::MAX)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn first_in_page(&self, page_id: PageId, from_slot: u16) -> XtrieveResult<Option<RecordId>> {
        if self.store.page_kind(page_id)? != Some(PageKind::Data) {
            return Ok(None);
        }
        let mut page = self.store.read_owned(page_id)?;
        let view = DataPage::new(&mut page);
        for slot in from_slot..view.slot_count() {
            if view.is_live(slot) {
                return Ok(Some(RecordId::new(page_id, slot)));
            }
        }
        Ok(None)
    }

    fn last_in_page(&self, page_id: PageId, up_to_slot: u16) -> XtrieveResult<Option<RecordId>> {
        if self.store.page_kind(page_id)? != Some(PageKind::Data) {
            return Ok(None);
        }
        let mut page = self.store.read_owned(page_id)?;
        let view = DataPage::new(&mut page);
        let top = view.slot_count().saturating_sub(1).min(up_to_slot);
        for slot in (0..=top).rev() {
            if view.is_live(slot) {
                return Ok(Some(RecordId::new(page_id, slot)));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Overflow chains
    // =========================================================================

    fn write_overflow(&self, tail: &[u8]) -> XtrieveResult<(PageId, u32)> {
        if tail.is_empty() {
            return Ok((PageId::NONE, 0));
        }

        let fragment_size = max_fragment(self.store.page_size());
        let chunks: Vec<&[u8]> = tail.chunks(fragment_size).collect();

        let mut ids = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            ids.push(self.store.allocate(PageKind::Variable)?);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let next = ids.get(i + 1).copied().unwrap_or(PageId::NONE);
            let mut page = self.store.read_owned(ids[i])?;
            OverflowPage::new(&mut page).initialize(ids[i], next, chunk);
            self.store.write_page(ids[i], page)?;
        }

        Ok((ids[0], tail.len() as u32))
    }

    fn free_overflow(&self, head: PageId) -> XtrieveResult<()> {
        let page_count = self.store.fcr().page_count;
        let mut next = head;
        let mut hops = 0u32;
        while next.is_some() {
            if hops > page_count {
                return Err(XtrieveError::corrupt("overflow chain loops"));
            }
            hops += 1;
            let mut page = self.store.read_owned(next)?;
            let following = OverflowPage::new(&mut page).next();
            self.store.free(next)?;
            next = following;
        }
        Ok(())
    }

    fn find_insert_page(&self, fixed_len: u16) -> XtrieveResult<PageId> {
        // Try the placement hint first, then any data page with room,
        // dead-cell space included, then grow the file.
        let (hint, page_count) = {
            let fcr = self.store.fcr();
            (fcr.last_data_page, fcr.page_count)
        };

        if hint.is_some() && self.page_has_room(hint, fixed_len)? {
            return Ok(hint);
        }

        for raw in 1..page_count {
            let page_id = PageId::new(raw);
            if page_id != hint && self.page_has_room(page_id, fixed_len)? {
                return Ok(page_id);
            }
        }

        self.store.allocate(PageKind::Data)
    }

    fn page_has_room(&self, page_id: PageId, fixed_len: u16) -> XtrieveResult<bool> {
        if self.store.page_kind(page_id)? != Some(PageKind::Data) {
            return Ok(false);
        }
        let mut page = self.store.read_owned(page_id)?;
        let view = DataPage::new(&mut page);
        if view.can_fit(fixed_len) {
            return Ok(true);
        }
        let dead = view.slot_count() as usize - view.live_count();
        Ok(dead > 0 && view.free_space() + dead * cell_size(fixed_len) >= cell_size(fixed_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::FileControlRecord;
    use tempfile::tempdir;

    fn store_with(record_length: u16, page_size: u16) -> (tempfile::TempDir, PageStore) {
        let dir = tempdir().unwrap();
        let fcr = FileControlRecord::new(record_length, page_size, vec![]);
        let store = PageStore::create(dir.path().join("rec.xtv"), fcr, 128).unwrap();
        (dir, store)
    }

    #[test]
    fn test_insert_read_roundtrip() {
        let (_dir, store) = store_with(32, 512);
        let records = RecordStore::new(&store);

        let mut payload = vec![0u8; 32];
        payload[..6].copy_from_slice(b"record");

        let (id, seq) = records.insert(&payload).unwrap();
        assert_eq!(records.read(id).unwrap(), payload);
        assert_eq!(records.sequence(id).unwrap(), seq);
        assert_eq!(store.fcr().record_count, 1);
    }

    #[test]
    fn test_insert_rejects_short_buffer() {
        let (_dir, store) = store_with(32, 512);
        let records = RecordStore::new(&store);

        let err = records.insert(&[0u8; 10]).unwrap_err();
        assert_eq!(err.status(), StatusCode::DataBufferTooShort);
        assert_eq!(store.fcr().record_count, 0);
    }

    #[test]
    fn test_variable_tail_roundtrip() {
        let (_dir, store) = store_with(16, 512);
        let records = RecordStore::new(&store);

        // Tail spans several overflow pages.
        let mut payload = vec![7u8; 16];
        payload.extend((0..2000u32).map(|i| (i % 251) as u8));

        let (id, _) = records.insert(&payload).unwrap();
        assert_eq!(records.read(id).unwrap(), payload);
    }

    #[test]
    fn test_update_preserves_identity_and_reallocates_tail() {
        let (_dir, store) = store_with(16, 512);
        let records = RecordStore::new(&store);

        let mut small = vec![1u8; 16];
        small.extend_from_slice(b"short tail");
        let (id, seq) = records.insert(&small).unwrap();

        let mut grown = vec![2u8; 16];
        grown.extend(std::iter::repeat_n(0xCD, 1500));
        records.update(id, &grown).unwrap();

        assert_eq!(records.read(id).unwrap(), grown);
        assert_eq!(records.sequence(id).unwrap(), seq);

        // Shrinking returns overflow pages to the free chain.
        let shrunk = vec![3u8; 16];
        records.update(id, &shrunk).unwrap();
        assert_eq!(records.read(id).unwrap(), shrunk);
        assert!(store.fcr().free_head.is_some());
    }

    #[test]
    fn test_delete_frees_and_reuses() {
        let (_dir, store) = store_with(16, 512);
        let records = RecordStore::new(&store);

        let mut payload = vec![9u8; 16];
        payload.extend_from_slice(&[0xEE; 600]);
        let (id, _) = records.insert(&payload).unwrap();

        records.delete(id).unwrap();
        assert!(!records.exists(id));
        assert_eq!(store.fcr().record_count, 0);
        assert!(store.fcr().free_head.is_some());

        let err = records.read(id).unwrap_err();
        assert_eq!(err.status(), StatusCode::InvalidPositioning);

        // The next insert reuses the dead slot on the same page.
        let (id2, _) = records.insert(&vec![1u8; 16]).unwrap();
        assert_eq!(id2, id);
    }

    #[test]
    fn test_physical_iteration_skips_deleted() {
        let (_dir, store) = store_with(16, 512);
        let records = RecordStore::new(&store);

        let mut ids = Vec::new();
        for i in 0..5u8 {
            let mut payload = vec![0u8; 16];
            payload[0] = i;
            ids.push(records.insert(&payload).unwrap().0);
        }
        records.delete(ids[2]).unwrap();

        let mut seen = Vec::new();
        let mut cursor = records.first().unwrap();
        while let Some(id) = cursor {
            seen.push(records.read(id).unwrap()[0]);
            cursor = records.next_after(id).unwrap();
        }
        assert_eq!(seen, vec![0, 1, 3, 4]);

        let mut reverse = Vec::new();
        let mut cursor = records.last().unwrap();
        while let Some(id) = cursor {
            reverse.push(records.read(id).unwrap()[0]);
            cursor = records.prev_before(id).unwrap();
        }
        assert_eq!(reverse, vec![4, 3, 1, 0]);
    }

    #[test]
    fn test_page_fills_then_new_page_allocated() {
        let (_dir, store) = store_with(100, 512);
        let records = RecordStore::new(&store);

        // 512-byte pages hold few 100-byte records; keep inserting until
        // at least two data pages exist.
        let mut pages = std::collections::BTreeSet::new();
        for i in 0..12u8 {
            let (id, _) = records.insert(&vec![i; 100]).unwrap();
            pages.insert(id.page);
        }
        assert!(pages.len() >= 2);
        assert_eq!(store.fcr().record_count, 12);
    }
}
