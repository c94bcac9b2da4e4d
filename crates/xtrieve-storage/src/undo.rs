//! Operation rollback and the commit shadow journal.
//!
//! Two mechanisms live here:
//!
//! - [`UndoScope`]: an in-memory set of page before-images collected
//!   while a single operation runs under the file's write latch. If the
//!   operation fails, the images go back into the cache and the file is
//!   exactly as it was; nothing reached disk in between because dirty
//!   pages are never written while an operation is in flight.
//!
//! - The commit shadow journal (`<file>.xcj`): written by
//!   [`crate::store::PageStore::checkpoint`] right before a batch of
//!   dirty pages is flushed. It holds the current *on-disk* image of
//!   every page about to be overwritten, forced to stable storage first,
//!   so a crash in the middle of the flush can be rolled back to the
//!   previous durable state on the next open.
//!
//! Journal layout: header `["XCJP"][format u16]` followed by records
//! `[page id u32][image length u32][image bytes]`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use xtrieve_common::types::PageId;
use xtrieve_common::XtrieveResult;

use crate::page::FileControlRecord;

const JOURNAL_SIGNATURE: [u8; 4] = *b"XCJP";
const JOURNAL_FORMAT: u16 = 1;
const JOURNAL_HEADER_SIZE: usize = 6;
const JOURNAL_SUFFIX: &str = ".xcj";

/// Path of the commit journal shadowing `base`.
#[must_use]
pub fn journal_path(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(JOURNAL_SUFFIX);
    PathBuf::from(name)
}

/// Append-only journal of on-disk page images, written before a flush.
pub struct CommitJournal {
    file: File,
    path: PathBuf,
}

impl CommitJournal {
    /// Creates (truncating) the journal for `base` and writes the header.
    pub fn create(base: &Path) -> XtrieveResult<Self> {
        let path = journal_path(base);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut header = [0u8; JOURNAL_HEADER_SIZE];
        header[0..4].copy_from_slice(&JOURNAL_SIGNATURE);
        header[4..6].copy_from_slice(&JOURNAL_FORMAT.to_le_bytes());
        file.write_all(&header)?;

        Ok(Self { file, path })
    }

    /// Appends one page image. Call [`Self::sync`] before relying on it.
    pub fn append(&mut self, page_id: PageId, image: &[u8]) -> XtrieveResult<()> {
        let mut record = Vec::with_capacity(8 + image.len());
        record.extend_from_slice(&page_id.as_u32().to_le_bytes());
        record.extend_from_slice(&(image.len() as u32).to_le_bytes());
        record.extend_from_slice(image);
        self.file.write_all(&record)?;
        Ok(())
    }

    /// Forces the journal to stable storage.
    pub fn sync(&mut self) -> XtrieveResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Deletes the journal once the flush it covered is durable.
    pub fn remove(self) -> XtrieveResult<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Reads every page image out of an existing commit journal. Returns
/// `None` when no journal shadows `base`.
pub fn read_journal(base: &Path) -> XtrieveResult<Option<Vec<(PageId, Vec<u8>)>>> {
    let path = journal_path(base);
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;

    if raw.len() < JOURNAL_HEADER_SIZE || raw[0..4] != JOURNAL_SIGNATURE {
        // A torn header means no image was durably recorded.
        return Ok(Some(Vec::new()));
    }

    let mut images = Vec::new();
    let mut at = JOURNAL_HEADER_SIZE;
    while at + 8 <= raw.len() {
        let page_id = PageId::new(u32::from_le_bytes(raw[at..at + 4].try_into().unwrap()));
        let len = u32::from_le_bytes(raw[at + 4..at + 8].try_into().unwrap()) as usize;
        let start = at + 8;
        if start + len > raw.len() {
            // Torn tail: the flush this journal covers never started.
            break;
        }
        images.push((page_id, raw[start..start + len].to_vec()));
        at = start + len;
    }

    Ok(Some(images))
}

/// Removes the commit journal shadowing `base`, if any.
pub fn remove_journal(base: &Path) -> XtrieveResult<()> {
    match std::fs::remove_file(journal_path(base)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// In-memory before-images for one operation.
pub struct UndoScope {
    images: Vec<(PageId, Vec<u8>)>,
    seen: std::collections::HashSet<PageId>,
    fcr_before: FileControlRecord,
}

impl UndoScope {
    /// Opens a scope around the current FCR state.
    pub fn new(fcr_before: FileControlRecord) -> Self {
        Self {
            images: Vec::new(),
            seen: std::collections::HashSet::new(),
            fcr_before,
        }
    }

    /// True if this page's before-image is already captured.
    #[must_use]
    pub fn has_captured(&self, page_id: PageId) -> bool {
        self.seen.contains(&page_id)
    }

    /// Captures a before-image (first touch only).
    pub fn capture(&mut self, page_id: PageId, image: Vec<u8>) {
        if self.seen.insert(page_id) {
            self.images.push((page_id, image));
        }
    }

    /// The captured images, newest first, plus the FCR snapshot.
    #[must_use]
    pub fn into_rollback(mut self) -> (Vec<(PageId, Vec<u8>)>, FileControlRecord) {
        self.images.reverse();
        (self.images, self.fcr_before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_commit_journal_roundtrip() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("file.xtv");
        std::fs::write(&base, b"x").unwrap();

        let mut journal = CommitJournal::create(&base).unwrap();
        journal.append(PageId::new(2), &[0xAA; 16]).unwrap();
        journal.append(PageId::new(5), &[0xBB; 16]).unwrap();
        journal.sync().unwrap();
        drop(journal);

        let images = read_journal(&base).unwrap().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0], (PageId::new(2), vec![0xAA; 16]));
        assert_eq!(images[1].0, PageId::new(5));
    }

    #[test]
    fn test_journal_missing_is_none() {
        let dir = tempdir().unwrap();
        assert!(read_journal(&dir.path().join("nothing.xtv")).unwrap().is_none());
    }

    #[test]
    fn test_journal_torn_tail_ignored() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("torn.xtv");

        let mut journal = CommitJournal::create(&base).unwrap();
        journal.append(PageId::new(9), &[1; 8]).unwrap();
        journal.sync().unwrap();
        drop(journal);

        let mut raw = std::fs::read(journal_path(&base)).unwrap();
        raw.extend_from_slice(&[3, 0, 0, 0, 200, 0]);
        std::fs::write(journal_path(&base), &raw).unwrap();

        let images = read_journal(&base).unwrap().unwrap();
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn test_remove_journal() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("gone.xtv");

        let journal = CommitJournal::create(&base).unwrap();
        journal.remove().unwrap();
        assert!(read_journal(&base).unwrap().is_none());
        remove_journal(&base).unwrap();
    }

    #[test]
    fn test_scope_captures_once() {
        let fcr = FileControlRecord::new(32, 512, vec![]);
        let mut scope = UndoScope::new(fcr);

        scope.capture(PageId::new(1), vec![1]);
        assert!(scope.has_captured(PageId::new(1)));
        scope.capture(PageId::new(1), vec![2]);
        scope.capture(PageId::new(3), vec![3]);

        let (images, _) = scope.into_rollback();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].0, PageId::new(3));
        assert_eq!(images[1], (PageId::new(1), vec![1]));
    }
}
