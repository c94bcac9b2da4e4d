//! Positioned file I/O.
//!
//! All page traffic goes through [`PageFile`], a thin wrapper around the
//! backing file that serializes access with a mutex and always reads or
//! writes whole buffers at explicit offsets. The engine runs every
//! operation on a blocking thread, so the calls here are synchronous.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use xtrieve_common::{StatusCode, XtrieveError, XtrieveResult};

/// Handle to one on-disk Xtrieve file.
pub struct PageFile {
    file: Mutex<File>,
    path: PathBuf,
    writable: bool,
}

impl PageFile {
    /// Creates (or truncates) a file for read/write access.
    pub fn create(path: impl AsRef<Path>) -> XtrieveResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            file: Mutex::new(file),
            path,
            writable: true,
        })
    }

    /// Opens an existing file.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> XtrieveResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;

        Ok(Self {
            file: Mutex::new(file),
            path,
            writable,
        })
    }

    /// The path this file was opened with.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether writes are permitted.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Current file size in bytes.
    pub fn size(&self) -> XtrieveResult<u64> {
        let file = self.file.lock();
        Ok(file.metadata()?.len())
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> XtrieveResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Writes the whole buffer at `offset`.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> XtrieveResult<()> {
        if !self.writable {
            return Err(StatusCode::Permission.into());
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::StorageFull {
                XtrieveError::from(StatusCode::DiskFull)
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    /// Forces file contents and metadata to stable storage.
    pub fn sync(&self) -> XtrieveResult<()> {
        let file = self.file.lock();
        file.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for PageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFile")
            .field("path", &self.path)
            .field("writable", &self.writable)
            .finish()
    }
}
