//! The file manager.
//!
//! Owns the mapping from file path to descriptor (one descriptor per
//! distinct path, shared by every handle opened on it and dropped when
//! the last handle closes) and the table of open handles addressed by
//! position blocks. Every incoming block resolves here first; a block
//! whose handle is gone or whose generation does not match is rejected
//! with `FileNotOpen`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use xtrieve_common::types::SessionId;
use xtrieve_common::{EngineConfig, StatusCode, XtrieveResult};
use xtrieve_storage::page::FileControlRecord;
use xtrieve_storage::PageStore;

use crate::position::PositionBlock;

/// How a handle was opened; decoded from Open's key number field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Shared read/write access.
    Normal,
    /// Shared access, mutating operations rejected.
    ReadOnly,
    /// Sole access to the file.
    Exclusive,
}

impl OpenMode {
    /// Decodes the Open request's key number (-1 normal, -2 read-only,
    /// -3 exclusive). Non-negative values mean normal as well.
    #[must_use]
    pub const fn from_wire(key_number: i16) -> Option<Self> {
        match key_number {
            -2 => Some(Self::ReadOnly),
            -3 => Some(Self::Exclusive),
            -1 | 0.. => Some(Self::Normal),
            _ => None,
        }
    }
}

/// Shared state for one distinct open file.
pub struct FileDescriptor {
    /// Engine-unique id, used as the lock-manager key.
    pub file_id: u64,
    /// The path the file was opened with.
    pub path: PathBuf,
    /// The file's page store (which carries the per-file operation latch).
    pub store: Arc<PageStore>,
    open_count: AtomicU32,
}

/// One session's open handle on a file.
pub struct OpenHandle {
    /// Handle id carried in position blocks.
    pub id: u32,
    /// Generation stamped at Open.
    pub generation: u32,
    /// Owning session.
    pub session: SessionId,
    /// Open mode.
    pub mode: OpenMode,
    /// The shared descriptor.
    pub descriptor: Arc<FileDescriptor>,
}

impl std::fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("file_id", &self.file_id)
            .field("path", &self.path)
            .field("open_count", &self.open_count)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for OpenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("session", &self.session)
            .field("mode", &self.mode)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Open-file and handle tables.
pub struct FileManager {
    config: EngineConfig,
    descriptors: Mutex<HashMap<PathBuf, Arc<FileDescriptor>>>,
    handles: Mutex<HashMap<u32, Arc<OpenHandle>>>,
    next_handle: AtomicU32,
    next_file_id: AtomicU64,
    next_generation: AtomicU32,
}

impl FileManager {
    /// Creates an empty file manager.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            descriptors: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            next_file_id: AtomicU64::new(1),
            next_generation: AtomicU32::new(1),
        }
    }

    /// True while any session has the path open.
    pub fn is_open(&self, path: &Path) -> bool {
        self.descriptors.lock().contains_key(path)
    }

    /// Creates a new file on disk. Fails while the path is open.
    pub fn create_file(&self, path: &Path, fcr: FileControlRecord) -> XtrieveResult<()> {
        if self.is_open(path) {
            return Err(StatusCode::FileLocked.into());
        }
        let store = PageStore::create(path, fcr, self.config.cache_pages)?;
        info!(path = %path.display(), "created file");
        drop(store);
        Ok(())
    }

    /// Opens a handle on `path`, loading (and recovering) the file on its
    /// first open.
    pub fn open(&self, path: &Path, mode: OpenMode, session: SessionId) -> XtrieveResult<Arc<OpenHandle>> {
        let descriptor = {
            let mut descriptors = self.descriptors.lock();
            match descriptors.get(path) {
                Some(descriptor) => Arc::clone(descriptor),
                None => {
                    if !path.exists() {
                        return Err(StatusCode::FileNotFound.into());
                    }
                    let mut writable = true;
                    let store = match PageStore::open(path, true, self.config.cache_pages) {
                        Ok(store) => store,
                        // The file itself may be read-only on disk.
                        Err(e) if e.status() == StatusCode::Permission => {
                            writable = false;
                            PageStore::open(path, false, self.config.cache_pages)?
                        }
                        Err(e) => return Err(e),
                    };
                    if writable {
                        // Roll back whatever an unfinished transaction
                        // left behind before anyone sees the file.
                        xtrieve_txn::journal::recover(&store)?;
                    }
                    let descriptor = Arc::new(FileDescriptor {
                        file_id: self.next_file_id.fetch_add(1, Ordering::SeqCst),
                        path: path.to_path_buf(),
                        store: Arc::new(store),
                        open_count: AtomicU32::new(0),
                    });
                    descriptors.insert(path.to_path_buf(), Arc::clone(&descriptor));
                    descriptor
                }
            }
        };

        descriptor.open_count.fetch_add(1, Ordering::SeqCst);

        let handle = Arc::new(OpenHandle {
            id: self.next_handle.fetch_add(1, Ordering::SeqCst),
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            session,
            mode,
            descriptor,
        });

        debug!(%session, handle = handle.id, path = %path.display(), "opened handle");
        self.handles.lock().insert(handle.id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Resolves an echoed position block to its handle, rejecting stale
    /// blocks and blocks belonging to another session.
    pub fn resolve(&self, block: &PositionBlock, session: SessionId) -> XtrieveResult<Arc<OpenHandle>> {
        let handles = self.handles.lock();
        let handle = handles.get(&block.handle).ok_or(xtrieve_common::XtrieveError::Status(
            StatusCode::FileNotOpen,
        ))?;
        if handle.generation != block.generation || handle.session != session {
            return Err(StatusCode::FileNotOpen.into());
        }
        Ok(Arc::clone(handle))
    }

    /// Closes a handle. The last handle on a descriptor flushes the file
    /// and drops it from the table. Returns the descriptor's file id and
    /// whether it was the last close.
    pub fn close(&self, handle: &OpenHandle) -> XtrieveResult<(u64, bool)> {
        self.handles.lock().remove(&handle.id);

        let remaining = handle.descriptor.open_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining > 0 {
            return Ok((handle.descriptor.file_id, false));
        }

        self.descriptors.lock().remove(&handle.descriptor.path);
        if !handle.descriptor.store.is_unhealthy() {
            handle.descriptor.store.flush()?;
            handle.descriptor.store.sync()?;
        }
        info!(path = %handle.descriptor.path.display(), "closed file");
        Ok((handle.descriptor.file_id, true))
    }

    /// Every handle a session holds.
    pub fn session_handles(&self, session: SessionId) -> Vec<Arc<OpenHandle>> {
        self.handles
            .lock()
            .values()
            .filter(|h| h.session == session)
            .cloned()
            .collect()
    }

    /// Flushes every open file; used at server shutdown.
    pub fn flush_all(&self) {
        let descriptors: Vec<Arc<FileDescriptor>> =
            self.descriptors.lock().values().cloned().collect();
        for descriptor in descriptors {
            if !descriptor.store.is_unhealthy() {
                let _ = descriptor.store.flush();
                let _ = descriptor.store.sync();
            }
        }
    }
}
