//! The page store.
//!
//! One `PageStore` per open file: it owns the backing file, the page
//! cache, the decoded FCR, and the active operation-undo scope. All page
//! traffic (reads, writes, allocation, the free chain, flushing) goes
//! through here, which is what lets the store keep the ordering rules
//! the format depends on:
//!
//! - dirty pages stay in the cache until an explicit flush or
//!   checkpoint; eviction only ever drops clean pages, so nothing
//!   half-done leaks to disk behind an operation's back,
//! - a checkpoint makes the previous on-disk images durable in the
//!   commit journal before overwriting them, and
//! - data and index pages are always written before the FCR that
//!   publishes them.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use xtrieve_common::constants::PAGE_HEADER_SIZE;
use xtrieve_common::types::PageId;
use xtrieve_common::{StatusCode, XtrieveError, XtrieveResult};

use crate::cache::{Frame, PageCache};
use crate::file::PageFile;
use crate::page::checksum::verify_checksum;
use crate::page::header::{PageHeader, PageHeaderRef};
use crate::page::kinds::PageKind;
use crate::page::FileControlRecord;
use crate::undo::{self, CommitJournal, UndoScope};

/// Page-structured storage for one file.
pub struct PageStore {
    file: PageFile,
    cache: PageCache,
    fcr: RwLock<FileControlRecord>,
    page_size: u16,
    fcr_usage: AtomicU32,
    unhealthy: AtomicBool,
    undo: Mutex<Option<UndoScope>>,
    /// Serializes whole operations against this file: readers share,
    /// mutators and checkpoints are exclusive. Never held across a
    /// lock-manager wait.
    op_latch: RwLock<()>,
}

impl PageStore {
    /// Creates a new file holding only the FCR.
    pub fn create(path: impl AsRef<Path>, fcr: FileControlRecord, cache_pages: usize) -> XtrieveResult<Self> {
        let file = PageFile::create(path)?;

        let mut page = fcr.encode();
        PageHeader::new(&mut page).update_checksum();
        file.write_at(&page, 0)?;
        file.sync()?;

        debug!(path = %file.path().display(), page_size = fcr.page_size, "created file");

        Ok(Self {
            page_size: fcr.page_size,
            cache: PageCache::new(cache_pages),
            fcr: RwLock::new(fcr),
            file,
            fcr_usage: AtomicU32::new(0),
            unhealthy: AtomicBool::new(false),
            undo: Mutex::new(None),
            op_latch: RwLock::new(()),
        })
    }

    /// Opens an existing file, rolling back an interrupted flush first.
    pub fn open(path: impl AsRef<Path>, writable: bool, cache_pages: usize) -> XtrieveResult<Self> {
        let path = path.as_ref();

        if writable {
            Self::recover(path)?;
        }

        let file = PageFile::open(path, writable)?;

        // The page size lives inside page 0; bootstrap with the smallest
        // legal page, then re-read at full size.
        let mut probe = vec![0u8; 512];
        file.read_at(&mut probe, 0)?;
        let page_size =
            u16::from_le_bytes(probe[PAGE_HEADER_SIZE + 6..PAGE_HEADER_SIZE + 8].try_into().unwrap());

        let mut page0 = vec![0u8; page_size as usize];
        if page_size as usize == probe.len() {
            page0.copy_from_slice(&probe);
        } else {
            file.read_at(&mut page0, 0)?;
        }

        if !verify_checksum(&page0) {
            return Err(XtrieveError::corrupt("FCR checksum mismatch"));
        }

        let mut fcr = FileControlRecord::decode(&page0)?;
        let usage = PageHeaderRef::new(&page0).usage();

        let store = Self {
            page_size,
            cache: PageCache::new(cache_pages),
            fcr: RwLock::new(FileControlRecord::new(0, page_size, vec![])),
            file,
            fcr_usage: AtomicU32::new(usage),
            unhealthy: AtomicBool::new(false),
            undo: Mutex::new(None),
            op_latch: RwLock::new(()),
        };

        if fcr.needs_recovery {
            warn!(path = %store.file.path().display(), "clearing recovery flag");
            fcr.needs_recovery = false;
            *store.fcr.write() = fcr;
            if writable {
                store.publish_fcr()?;
                store.flush()?;
                store.sync()?;
            }
        } else {
            *store.fcr.write() = fcr;
        }

        Ok(store)
    }

    /// Replays and removes the commit journal shadowing `path`, if any,
    /// restoring the file to its state before the interrupted flush.
    pub fn recover(path: &Path) -> XtrieveResult<()> {
        let Some(images) = undo::read_journal(path)? else {
            return Ok(());
        };

        warn!(path = %path.display(), images = images.len(), "rolling back interrupted flush");

        if !images.is_empty() {
            let file = PageFile::open(path, true)?;
            for (page_id, image) in &images {
                file.write_at(image, page_id.file_offset(image.len() as u16))?;
            }
            file.sync()?;
        }

        undo::remove_journal(path)
    }

    /// The page size every page in this file uses.
    #[inline]
    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    /// The backing file's path.
    #[inline]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// The per-file operation latch. Read operations take it shared,
    /// mutations exclusive; it must never be held across a lock wait.
    #[inline]
    pub fn latch(&self) -> &RwLock<()> {
        &self.op_latch
    }

    /// Read access to the FCR.
    pub fn fcr(&self) -> RwLockReadGuard<'_, FileControlRecord> {
        self.fcr.read()
    }

    /// Write access to the FCR. Callers publish after mutating.
    pub fn fcr_mut(&self) -> RwLockWriteGuard<'_, FileControlRecord> {
        self.fcr.write()
    }

    /// Marks the file unhealthy; every later operation fails until reopen.
    pub fn mark_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::Release);
    }

    /// True once corruption has been observed.
    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::Acquire)
    }

    fn ensure_healthy(&self) -> XtrieveResult<()> {
        if self.is_unhealthy() {
            return Err(StatusCode::Internal.into());
        }
        Ok(())
    }

    // =========================================================================
    // Page access
    // =========================================================================

    fn load(&self, page_id: PageId) -> XtrieveResult<std::sync::Arc<Frame>> {
        self.ensure_healthy()?;

        if let Some(frame) = self.cache.get(page_id) {
            return Ok(frame);
        }

        let page_count = self.fcr.read().page_count;
        if page_id.as_u32() >= page_count {
            self.mark_unhealthy();
            return Err(XtrieveError::corrupt(format!(
                "page {page_id} beyond page count {page_count}"
            )));
        }

        let mut buffer = vec![0u8; self.page_size as usize];
        self.file.read_at(&mut buffer, page_id.file_offset(self.page_size))?;

        let header = PageHeaderRef::new(&buffer);
        if !header.is_valid_magic() || header.page_id() != page_id || !verify_checksum(&buffer) {
            self.mark_unhealthy();
            return Err(XtrieveError::corrupt(format!("page {page_id} failed validation")));
        }

        let frame = self.cache.insert(page_id, buffer);
        self.evict_excess();
        Ok(frame)
    }

    /// Reads a page into an owned buffer.
    pub fn read_owned(&self, page_id: PageId) -> XtrieveResult<Vec<u8>> {
        let frame = self.load(page_id)?;
        let buffer = frame.buffer().read();
        Ok(buffer.clone())
    }

    /// The kind tag of a page.
    pub fn page_kind(&self, page_id: PageId) -> XtrieveResult<Option<PageKind>> {
        let frame = self.load(page_id)?;
        let buffer = frame.buffer().read();
        Ok(PageHeaderRef::new(&buffer).kind())
    }

    /// Replaces a page's contents, capturing its before-image if an undo
    /// scope is active.
    pub fn write_page(&self, page_id: PageId, buffer: Vec<u8>) -> XtrieveResult<()> {
        self.ensure_healthy()?;
        debug_assert_eq!(buffer.len(), self.page_size as usize);

        self.capture_before(page_id)?;
        self.store_page(page_id, buffer);
        self.evict_excess();
        Ok(())
    }

    /// Puts a page into the cache dirty, without undo capture.
    fn store_page(&self, page_id: PageId, buffer: Vec<u8>) {
        if let Some(frame) = self.cache.get(page_id) {
            *frame.buffer().write() = buffer;
            frame.set_dirty(true);
        } else {
            let frame = self.cache.insert(page_id, buffer);
            frame.set_dirty(true);
        }
    }

    fn capture_before(&self, page_id: PageId) -> XtrieveResult<()> {
        let mut undo = self.undo.lock();
        let Some(scope) = undo.as_mut() else {
            return Ok(());
        };
        if scope.has_captured(page_id) {
            return Ok(());
        }

        let image = if let Some(frame) = self.cache.get(page_id) {
            frame.buffer().read().clone()
        } else {
            let mut buffer = vec![0u8; self.page_size as usize];
            match self.file.read_at(&mut buffer, page_id.file_offset(self.page_size)) {
                Ok(()) => buffer,
                // A page past the old end of file has no prior state.
                Err(XtrieveError::Io { source }) if source.kind() == std::io::ErrorKind::UnexpectedEof => {
                    vec![0u8; self.page_size as usize]
                }
                Err(e) => return Err(e),
            }
        };

        scope.capture(page_id, image);
        Ok(())
    }

    // =========================================================================
    // Allocation and the free chain
    // =========================================================================

    /// Allocates a page, reusing the free chain before growing the file.
    pub fn allocate(&self, kind: PageKind) -> XtrieveResult<PageId> {
        self.ensure_healthy()?;

        let free_head = self.fcr.read().free_head;
        let page_id = if free_head.is_some() {
            let page = self.read_owned(free_head)?;
            let next = PageId::new(u32::from_le_bytes(
                page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4].try_into().unwrap(),
            ));
            self.fcr.write().free_head = next;
            free_head
        } else {
            let page_id = {
                let mut fcr = self.fcr.write();
                let id = PageId::new(fcr.page_count);
                fcr.page_count += 1;
                id
            };
            // Reserve the space now so the medium rejecting growth
            // surfaces here as DiskFull rather than at flush.
            let zeroes = vec![0u8; self.page_size as usize];
            if let Err(e) = self.file.write_at(&zeroes, page_id.file_offset(self.page_size)) {
                self.fcr.write().page_count -= 1;
                return Err(e);
            }
            page_id
        };

        let mut buffer = vec![0u8; self.page_size as usize];
        PageHeader::new(&mut buffer).initialize(page_id, kind);
        self.write_page(page_id, buffer)?;

        Ok(page_id)
    }

    /// Returns a page to the free chain.
    pub fn free(&self, page_id: PageId) -> XtrieveResult<()> {
        self.ensure_healthy()?;
        debug_assert!(page_id.is_some(), "cannot free the FCR");

        let old_head = self.fcr.read().free_head;

        let mut buffer = vec![0u8; self.page_size as usize];
        let mut header = PageHeader::new(&mut buffer);
        header.initialize(page_id, PageKind::Free);
        buffer[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4]
            .copy_from_slice(&old_head.as_u32().to_le_bytes());
        self.write_page(page_id, buffer)?;

        self.fcr.write().free_head = page_id;
        Ok(())
    }

    // =========================================================================
    // FCR publication, flushing, checkpoints
    // =========================================================================

    /// Re-encodes the FCR into page 0 with a bumped version counter.
    ///
    /// The page itself reaches disk on the next flush, after every data
    /// and index page already dirty.
    pub fn publish_fcr(&self) -> XtrieveResult<()> {
        self.ensure_healthy()?;

        let mut encoded = {
            let mut fcr = self.fcr.write();
            fcr.fcr_version += 1;
            fcr.encode()
        };
        PageHeader::new(&mut encoded).set_usage(self.fcr_usage.load(Ordering::Acquire));

        self.capture_before(PageId::FCR)?;
        self.store_page(PageId::FCR, encoded);
        Ok(())
    }

    fn write_frame(&self, page_id: PageId, frame: &Frame) -> XtrieveResult<()> {
        let mut buffer = frame.buffer().write();
        let mut header = PageHeader::new(&mut buffer);
        header.bump_usage();
        header.update_checksum();
        if page_id == PageId::FCR {
            self.fcr_usage
                .store(PageHeaderRef::new(&buffer).usage(), Ordering::Release);
        }
        self.file.write_at(&buffer, page_id.file_offset(self.page_size))?;
        frame.set_dirty(false);
        Ok(())
    }

    /// Writes every dirty page, data and index pages first, FCR last.
    pub fn flush(&self) -> XtrieveResult<()> {
        for (page_id, frame) in self.cache.dirty_pages() {
            self.write_frame(page_id, &frame)?;
        }
        Ok(())
    }

    /// Forces the backing file to stable storage.
    pub fn sync(&self) -> XtrieveResult<()> {
        self.file.sync()
    }

    /// Flushes all dirty pages under crash protection: the current
    /// on-disk image of every page about to be overwritten is made
    /// durable in the commit journal first, so a crash in the middle of
    /// the flush rolls back to the previous durable state on the next
    /// open. Takes the file's write latch for the duration.
    pub fn checkpoint(&self) -> XtrieveResult<()> {
        self.ensure_healthy()?;
        let _latch = self.op_latch.write();

        let dirty = self.cache.dirty_pages();
        if dirty.is_empty() {
            return Ok(());
        }

        let mut journal = CommitJournal::create(self.file.path())?;
        for (page_id, _) in &dirty {
            let mut image = vec![0u8; self.page_size as usize];
            match self.file.read_at(&mut image, page_id.file_offset(self.page_size)) {
                Ok(()) => journal.append(*page_id, &image)?,
                // A page past the current end of file has no prior state
                // worth shadowing.
                Err(XtrieveError::Io { source }) if source.kind() == std::io::ErrorKind::UnexpectedEof => {}
                Err(e) => return Err(e),
            }
        }
        journal.sync()?;

        let result = (|| {
            for (page_id, frame) in &dirty {
                self.write_frame(*page_id, frame)?;
            }
            self.file.sync()
        })();

        match result {
            Ok(()) => journal.remove(),
            Err(e) => {
                // The journal stays behind; the next open rolls back.
                self.mark_unhealthy();
                Err(e)
            }
        }
    }

    fn evict_excess(&self) {
        // Only clean pages leave the cache; flushing a dirty page here
        // would publish in-flight state without its undo coverage. The
        // cache simply runs over capacity until the next flush.
        let mut attempts = 0;
        while self.cache.excess() > 0 && attempts < 64 {
            attempts += 1;
            let Some((page_id, frame)) = self.cache.lru_candidate() else {
                break;
            };
            if frame.is_dirty() || !self.cache.remove_if_clean(page_id) {
                break;
            }
        }
    }

    // =========================================================================
    // Operation undo scopes
    // =========================================================================

    /// Opens an in-memory undo scope for one operation. The caller holds
    /// the write latch from before this call until after the scope ends,
    /// so the captured images cannot interleave with anyone else's work.
    pub fn begin_undo(&self) -> XtrieveResult<()> {
        let mut undo = self.undo.lock();
        if undo.is_some() {
            return Err(XtrieveError::corrupt("nested undo scope"));
        }
        *undo = Some(UndoScope::new(self.fcr.read().clone()));
        Ok(())
    }

    /// True while an undo scope is open.
    pub fn undo_active(&self) -> bool {
        self.undo.lock().is_some()
    }

    /// Closes the scope keeping its effects in the cache.
    pub fn end_undo_keep(&self) -> XtrieveResult<()> {
        if self.undo.lock().take().is_none() {
            return Err(XtrieveError::corrupt("end without undo scope"));
        }
        Ok(())
    }

    /// Aborts the scope: every captured image goes back into the cache
    /// and the in-memory FCR reverts, its version counter still moving
    /// forward. Nothing touches disk: dirty pages never left the cache
    /// while the operation ran.
    pub fn abort_undo(&self) -> XtrieveResult<()> {
        let Some(scope) = self.undo.lock().take() else {
            return Err(XtrieveError::corrupt("abort without undo scope"));
        };
        let (images, fcr_before) = scope.into_rollback();

        for (page_id, image) in images {
            if page_id == PageId::FCR {
                continue;
            }
            self.store_page(page_id, image);
        }

        {
            let current_version = self.fcr.read().fcr_version;
            let mut fcr = self.fcr.write();
            *fcr = fcr_before;
            fcr.fcr_version = current_version;
        }
        self.publish_fcr()
    }
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("path", &self.file.path())
            .field("page_size", &self.page_size)
            .field("cached", &self.cache.len())
            .field("unhealthy", &self.is_unhealthy())
            .finish()
    }
}
