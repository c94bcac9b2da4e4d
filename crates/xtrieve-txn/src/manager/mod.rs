//! Transactions.
//!
//! One transaction per session. Begin opens nothing by itself; the first
//! mutation against each file enlists that file, creating its logical
//! undo journal. Every mutation inside the transaction records its
//! inverse, in memory and (fsynced) in its journal, before the
//! operation returns. Commit checkpoints every enlisted store (dirty
//! pages flushed under a physical shadow journal, FCR last) and drops
//! the undo; abort applies the inverses in reverse through the ordinary
//! record and index paths, which keeps a rollback safe next to other
//! sessions' concurrent transactions on the same file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use xtrieve_common::types::{SessionId, TxnId};
use xtrieve_common::{StatusCode, XtrieveError, XtrieveResult};
use xtrieve_storage::PageStore;

use crate::journal::{self, TxnJournal, UndoRecord};
use crate::lock::LockBias;

/// Most files one transaction may touch.
pub const MAX_TXN_FILES: usize = 24;

struct EnlistedFile {
    file_id: u64,
    store: Arc<PageStore>,
    journal: TxnJournal,
    undo: Vec<UndoRecord>,
}

struct Transaction {
    id: TxnId,
    started: Instant,
    default_bias: LockBias,
    files: Vec<EnlistedFile>,
}

/// Per-session transaction registry.
pub struct TransactionManager {
    active: Mutex<HashMap<SessionId, Transaction>>,
    next_txn: AtomicU64,
}

impl TransactionManager {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
        }
    }

    /// Starts a transaction for the session.
    pub fn begin(&self, session: SessionId, default_bias: LockBias) -> XtrieveResult<TxnId> {
        let mut active = self.active.lock();
        if active.contains_key(&session) {
            return Err(StatusCode::TransactionActive.into());
        }

        let id = TxnId::new(self.next_txn.fetch_add(1, Ordering::SeqCst));
        debug!(%session, %id, "begin transaction");
        active.insert(
            session,
            Transaction {
                id,
                started: Instant::now(),
                default_bias,
                files: Vec::new(),
            },
        );
        Ok(id)
    }

    /// True while the session has a transaction open.
    pub fn is_active(&self, session: SessionId) -> bool {
        self.active.lock().contains_key(&session)
    }

    /// The transaction's default lock bias, if one is open.
    pub fn default_bias(&self, session: SessionId) -> Option<LockBias> {
        self.active.lock().get(&session).map(|t| t.default_bias)
    }

    /// When the session's transaction began (used for victim selection).
    pub fn started_at(&self, session: SessionId) -> Option<Instant> {
        self.active.lock().get(&session).map(|t| t.started)
    }

    /// True if the open transaction has enlisted this file.
    pub fn involves(&self, session: SessionId, file_id: u64) -> bool {
        self.active
            .lock()
            .get(&session)
            .is_some_and(|t| t.files.iter().any(|f| f.file_id == file_id))
    }

    /// Enlists a file into the session's transaction, creating its undo
    /// journal on first touch. Must only be called while a transaction
    /// is active.
    pub fn enlist(&self, session: SessionId, file_id: u64, store: &Arc<PageStore>) -> XtrieveResult<()> {
        let mut active = self.active.lock();
        let txn = active
            .get_mut(&session)
            .ok_or(XtrieveError::Status(StatusCode::NoTransaction))?;

        if txn.files.iter().any(|f| f.file_id == file_id) {
            return Ok(());
        }
        if txn.files.len() >= MAX_TXN_FILES {
            return Err(StatusCode::TransactionLimit.into());
        }

        let journal = TxnJournal::create(store.path(), txn.id.as_u64(), session.as_u64())?;
        txn.files.push(EnlistedFile {
            file_id,
            store: Arc::clone(store),
            journal,
            undo: Vec::new(),
        });
        Ok(())
    }

    /// Records one mutation's inverse, durably, before the operation that
    /// produced it returns. The caller still holds the file's write
    /// latch, so no flush can race the journal append.
    pub fn record_undo(&self, session: SessionId, file_id: u64, record: UndoRecord) -> XtrieveResult<()> {
        let mut active = self.active.lock();
        let txn = active
            .get_mut(&session)
            .ok_or(XtrieveError::Status(StatusCode::NoTransaction))?;
        let file = txn
            .files
            .iter_mut()
            .find(|f| f.file_id == file_id)
            .ok_or_else(|| XtrieveError::corrupt("undo for a file the transaction never enlisted"))?;

        file.journal.append(&record)?;
        file.undo.push(record);
        Ok(())
    }

    /// Commits the session's transaction: every enlisted file is
    /// checkpointed (durable before this returns), then the undo
    /// journals disappear. If a checkpoint fails its file keeps both
    /// journals for recovery on reopen, and the files not yet committed
    /// roll back.
    pub fn commit(&self, session: SessionId) -> XtrieveResult<()> {
        let txn = self
            .active
            .lock()
            .remove(&session)
            .ok_or(XtrieveError::Status(StatusCode::NoTransaction))?;

        debug!(%session, id = %txn.id, files = txn.files.len(), "commit transaction");

        let mut files = txn.files.into_iter();
        while let Some(file) = files.next() {
            if let Err(e) = file.store.checkpoint() {
                warn!(%session, file = file.file_id, "commit failed mid-flush");
                drop(file); // journals stay behind for recovery
                for rest in files {
                    let _ = Self::rollback_file(rest);
                }
                return Err(e);
            }
            file.journal.remove()?;
        }
        Ok(())
    }

    /// Aborts the session's transaction, undoing every enlisted file.
    pub fn abort(&self, session: SessionId) -> XtrieveResult<()> {
        let txn = self
            .active
            .lock()
            .remove(&session)
            .ok_or(XtrieveError::Status(StatusCode::NoTransaction))?;

        debug!(%session, id = %txn.id, files = txn.files.len(), "abort transaction");

        let mut first_error = None;
        for file in txn.files {
            if let Err(e) = Self::rollback_file(file) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn rollback_file(file: EnlistedFile) -> XtrieveResult<()> {
        {
            let _latch = file.store.latch().write();
            journal::apply_undo(&file.store, &file.undo)?;
            file.store.publish_fcr()?;
        }
        // Some of the transaction's pages may have reached disk through a
        // neighbour's checkpoint; make the undo durable before the
        // journal goes away.
        file.store.flush()?;
        file.store.sync()?;
        file.journal.remove()
    }

    /// Aborts the session's transaction if it involves `file_id` (a Close
    /// of a participating file implicitly aborts). Returns whether an
    /// abort happened.
    pub fn abort_if_involves(&self, session: SessionId, file_id: u64) -> XtrieveResult<bool> {
        if !self.involves(session, file_id) {
            return Ok(false);
        }
        self.abort(session)?;
        Ok(true)
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use xtrieve_common::types::{KeyChain, KeyDescriptor, KeyFlags, KeyType, RecordId};
    use xtrieve_storage::btree::BTree;
    use xtrieve_storage::page::FileControlRecord;
    use xtrieve_storage::record::RecordStore;

    fn keyed_store(dir: &tempfile::TempDir, name: &str) -> Arc<PageStore> {
        let chain = KeyChain::new(vec![KeyDescriptor::new(
            0,
            8,
            KeyFlags::empty(),
            KeyType::UnsignedBinary,
            0,
        )]);
        let fcr = FileControlRecord::new(32, 512, vec![chain]);
        Arc::new(PageStore::create(dir.path().join(name), fcr, 128).unwrap())
    }

    fn txn_insert(
        tm: &TransactionManager,
        session: SessionId,
        store: &Arc<PageStore>,
        key: u64,
    ) -> RecordId {
        let mut bytes = vec![0u8; 32];
        bytes[..8].copy_from_slice(&key.to_le_bytes());
        let (record, sequence) = RecordStore::new(store).insert(&bytes).unwrap();
        BTree::new(store, 0)
            .unwrap()
            .insert(&key.to_le_bytes(), sequence, record)
            .unwrap();
        store.publish_fcr().unwrap();
        tm.record_undo(session, 1, UndoRecord::Insert { record }).unwrap();
        record
    }

    #[test]
    fn test_begin_twice_fails() {
        let tm = TransactionManager::new();
        let session = SessionId::new(1);

        tm.begin(session, LockBias::SingleWait).unwrap();
        let err = tm.begin(session, LockBias::None).unwrap_err();
        assert_eq!(err.status(), StatusCode::TransactionActive);
    }

    #[test]
    fn test_end_without_begin_fails() {
        let tm = TransactionManager::new();
        let session = SessionId::new(1);

        assert_eq!(tm.commit(session).unwrap_err().status(), StatusCode::NoTransaction);
        assert_eq!(tm.abort(session).unwrap_err().status(), StatusCode::NoTransaction);
    }

    #[test]
    fn test_commit_persists_changes() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::new();
        let session = SessionId::new(1);
        let store = keyed_store(&dir, "c.xtv");

        tm.begin(session, LockBias::None).unwrap();
        tm.enlist(session, 1, &store).unwrap();
        txn_insert(&tm, session, &store, 7);
        tm.commit(session).unwrap();

        assert!(!tm.is_active(session));
        assert_eq!(store.fcr().record_count, 1);
        assert!(journal::pending_journals(store.path()).unwrap().is_empty());
    }

    #[test]
    fn test_abort_undoes_changes() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::new();
        let session = SessionId::new(1);
        let store = keyed_store(&dir, "a.xtv");

        tm.begin(session, LockBias::None).unwrap();
        tm.enlist(session, 1, &store).unwrap();
        txn_insert(&tm, session, &store, 7);
        txn_insert(&tm, session, &store, 8);
        tm.abort(session).unwrap();

        assert_eq!(store.fcr().record_count, 0);
        let tree = BTree::new(&store, 0).unwrap();
        assert!(tree.first().unwrap().is_none());
        assert!(journal::pending_journals(store.path()).unwrap().is_empty());
    }

    #[test]
    fn test_enlist_is_idempotent_per_file() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::new();
        let session = SessionId::new(1);
        let store = keyed_store(&dir, "i.xtv");

        tm.begin(session, LockBias::None).unwrap();
        tm.enlist(session, 1, &store).unwrap();
        tm.enlist(session, 1, &store).unwrap();
        assert!(tm.involves(session, 1));
        tm.abort(session).unwrap();
    }

    #[test]
    fn test_close_of_participating_file_aborts() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::new();
        let session = SessionId::new(1);
        let store = keyed_store(&dir, "x.xtv");

        tm.begin(session, LockBias::None).unwrap();
        tm.enlist(session, 1, &store).unwrap();
        txn_insert(&tm, session, &store, 9);

        assert!(!tm.abort_if_involves(session, 8).unwrap());
        assert!(tm.abort_if_involves(session, 1).unwrap());
        assert!(!tm.is_active(session));
        assert_eq!(store.fcr().record_count, 0);
    }

    #[test]
    fn test_concurrent_transactions_on_one_file() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::new();
        let (s1, s2) = (SessionId::new(1), SessionId::new(2));
        let store = keyed_store(&dir, "two.xtv");

        tm.begin(s1, LockBias::None).unwrap();
        tm.begin(s2, LockBias::None).unwrap();
        tm.enlist(s1, 1, &store).unwrap();
        tm.enlist(s2, 1, &store).unwrap();

        let mut bytes = vec![0u8; 32];
        bytes[..8].copy_from_slice(&1u64.to_le_bytes());
        let (r1, q1) = RecordStore::new(&store).insert(&bytes).unwrap();
        BTree::new(&store, 0).unwrap().insert(&1u64.to_le_bytes(), q1, r1).unwrap();
        tm.record_undo(s1, 1, UndoRecord::Insert { record: r1 }).unwrap();

        bytes[..8].copy_from_slice(&2u64.to_le_bytes());
        let (r2, q2) = RecordStore::new(&store).insert(&bytes).unwrap();
        BTree::new(&store, 0).unwrap().insert(&2u64.to_le_bytes(), q2, r2).unwrap();
        tm.record_undo(s2, 1, UndoRecord::Insert { record: r2 }).unwrap();
        store.publish_fcr().unwrap();

        // S1 aborts; S2's record survives and commits.
        tm.abort(s1).unwrap();
        assert_eq!(store.fcr().record_count, 1);
        tm.commit(s2).unwrap();

        let tree = BTree::new(&store, 0).unwrap();
        let entry = tree.first().unwrap().unwrap().entry(&tree).unwrap();
        assert_eq!(entry.key, 2u64.to_le_bytes().to_vec());
    }
}
