//! File and record locks.
//!
//! Two scopes: the whole file (taken at Open according to the open mode)
//! and single records. Record lock requests carry a bias decoded from the
//! request:
//!
//! | Bias | Meaning |
//! |------|---------|
//! | 0    | no lock |
//! | 100  | single record, exclusive, wait |
//! | 200  | single record, exclusive, no wait |
//! | 300  | multiple records, exclusive, wait |
//! | 400  | multiple records, exclusive, no wait |
//!
//! A session's single-record lock is replaced when it locks another
//! record; multi-record locks accumulate until released. Waiters park on
//! a per-file condition variable and re-probe the wait-for graph each
//! wake; a cycle aborts the youngest member with `Deadlock`. There is no
//! implicit wait timeout; only deadlock, grant, or session cancellation
//! ends a wait.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use xtrieve_common::types::{RecordId, SessionId};
use xtrieve_common::{StatusCode, XtrieveResult};

use crate::deadlock::WaitForGraph;

/// Decoded lock request bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBias {
    /// No lock held past the operation.
    None,
    /// Single record, wait until available.
    SingleWait,
    /// Single record, fail immediately if held.
    SingleNoWait,
    /// Multiple records, wait.
    MultiWait,
    /// Multiple records, fail immediately.
    MultiNoWait,
}

impl LockBias {
    /// Decodes a wire bias value. Tolerates the `opcode + bias` arithmetic
    /// legacy clients leak by accepting whole ranges.
    #[must_use]
    pub const fn from_wire(bias: u16) -> Self {
        match bias {
            100..=199 => Self::SingleWait,
            200..=299 => Self::SingleNoWait,
            300..=399 => Self::MultiWait,
            400..=499 => Self::MultiNoWait,
            _ => Self::None,
        }
    }

    /// True when the request blocks on conflict.
    #[inline]
    #[must_use]
    pub const fn waits(self) -> bool {
        matches!(self, Self::SingleWait | Self::MultiWait)
    }

    /// True for the accumulating multi-record modes.
    #[inline]
    #[must_use]
    pub const fn is_multi(self) -> bool {
        matches!(self, Self::MultiWait | Self::MultiNoWait)
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordLock {
    session: SessionId,
    multi: bool,
}

#[derive(Default)]
struct FileLockState {
    exclusive: Option<SessionId>,
    shared: HashSet<SessionId>,
    records: HashMap<RecordId, RecordLock>,
}

struct FileLockTable {
    state: Mutex<FileLockState>,
    waiters: Condvar,
}

impl FileLockTable {
    fn new() -> Self {
        Self {
            state: Mutex::new(FileLockState::default()),
            waiters: Condvar::new(),
        }
    }
}

/// Counters kept for the log and for tests.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Record locks granted.
    pub grants: AtomicU64,
    /// Requests that had to wait at least once.
    pub waits: AtomicU64,
    /// Deadlocks resolved.
    pub deadlocks: AtomicU64,
}

/// The engine-wide lock manager.
pub struct LockManager {
    files: Mutex<HashMap<u64, Arc<FileLockTable>>>,
    graph: WaitForGraph,
    cancelled: Mutex<HashSet<SessionId>>,
    victims: Mutex<HashSet<SessionId>>,
    probe: Duration,
    stats: LockStats,
}

impl LockManager {
    /// Creates a lock manager with the given deadlock probe interval.
    pub fn new(probe: Duration) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            graph: WaitForGraph::new(),
            cancelled: Mutex::new(HashSet::new()),
            victims: Mutex::new(HashSet::new()),
            probe,
            stats: LockStats::default(),
        }
    }

    fn table(&self, file: u64) -> Arc<FileLockTable> {
        let mut files = self.files.lock();
        Arc::clone(files.entry(file).or_insert_with(|| Arc::new(FileLockTable::new())))
    }

    /// Registers a session (refreshing its age for victim selection).
    pub fn note_session_start(&self, session: SessionId) {
        self.graph.note_start(session);
    }

    /// Lock statistics.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    // =========================================================================
    // File locks (open modes)
    // =========================================================================

    /// Claims file-level access for an opening session. Exclusive opens
    /// fail with `FileAlreadyOpen` while anyone else holds the file;
    /// shared opens fail with `FileLocked` while it is held exclusively.
    pub fn open_file(&self, file: u64, session: SessionId, exclusive: bool) -> XtrieveResult<()> {
        let table = self.table(file);
        let mut state = table.state.lock();

        if exclusive {
            let held_by_other = state.exclusive.is_some_and(|s| s != session)
                || state.shared.iter().any(|&s| s != session);
            if held_by_other {
                return Err(StatusCode::FileAlreadyOpen.into());
            }
            state.exclusive = Some(session);
        } else {
            if state.exclusive.is_some_and(|s| s != session) {
                return Err(StatusCode::FileLocked.into());
            }
            state.shared.insert(session);
        }
        Ok(())
    }

    /// Releases a session's file-level claim and its record locks there.
    pub fn close_file(&self, file: u64, session: SessionId) {
        let table = self.table(file);
        let mut state = table.state.lock();
        if state.exclusive == Some(session) {
            state.exclusive = None;
        }
        state.shared.remove(&session);
        state.records.retain(|_, lock| lock.session != session);
        table.waiters.notify_all();
    }

    /// Forgets a closed file's lock table entirely.
    pub fn forget_file(&self, file: u64) {
        self.files.lock().remove(&file);
    }

    // =========================================================================
    // Record locks
    // =========================================================================

    /// True when another session holds `record`.
    pub fn is_locked_by_other(&self, file: u64, record: RecordId, session: SessionId) -> bool {
        let table = self.table(file);
        let state = table.state.lock();
        state.records.get(&record).is_some_and(|lock| lock.session != session)
    }

    /// Acquires a record lock per the bias. `LockBias::None` is a no-op.
    pub fn lock_record(
        &self,
        file: u64,
        record: RecordId,
        session: SessionId,
        bias: LockBias,
    ) -> XtrieveResult<()> {
        if bias == LockBias::None {
            return Ok(());
        }

        let table = self.table(file);

        // A new single-record lock displaces the session's previous one.
        if !bias.is_multi() {
            let mut state = table.state.lock();
            state
                .records
                .retain(|id, lock| !(lock.session == session && !lock.multi && *id != record));
            table.waiters.notify_all();
        }

        let mut state = table.state.lock();
        let mut waited = false;
        loop {
            match state.records.get(&record) {
                Some(lock) if lock.session != session => {
                    if !bias.waits() {
                        return Err(StatusCode::RecordLocked.into());
                    }

                    if !waited {
                        waited = true;
                        self.stats.waits.fetch_add(1, AtomicOrdering::Relaxed);
                        debug!(%session, %record, "waiting for record lock");
                    }

                    self.graph.set_wait(session, lock.session);
                    table.waiters.wait_for(&mut state, self.probe);

                    if self.cancelled.lock().remove(&session) {
                        self.graph.clear_waits(session);
                        return Err(StatusCode::RecordLocked.into());
                    }
                    if self.victims.lock().remove(&session) {
                        self.graph.clear_waits(session);
                        self.stats.deadlocks.fetch_add(1, AtomicOrdering::Relaxed);
                        return Err(StatusCode::Deadlock.into());
                    }
                    if let Some(victim) = self.graph.victim_for(session) {
                        if victim == session {
                            self.graph.clear_waits(session);
                            self.stats.deadlocks.fetch_add(1, AtomicOrdering::Relaxed);
                            return Err(StatusCode::Deadlock.into());
                        }
                        self.victims.lock().insert(victim);
                        self.notify_everyone();
                    }
                }
                _ => {
                    state.records.insert(
                        record,
                        RecordLock {
                            session,
                            multi: bias.is_multi(),
                        },
                    );
                    self.graph.clear_waits(session);
                    self.stats.grants.fetch_add(1, AtomicOrdering::Relaxed);
                    return Ok(());
                }
            }
        }
    }

    /// Releases one record lock if the session holds it.
    pub fn unlock_record(&self, file: u64, record: RecordId, session: SessionId) -> bool {
        let table = self.table(file);
        let mut state = table.state.lock();
        let held = state.records.get(&record).is_some_and(|l| l.session == session);
        if held {
            state.records.remove(&record);
            table.waiters.notify_all();
        }
        held
    }

    /// Releases every record lock the session holds in one file.
    pub fn unlock_all_records(&self, file: u64, session: SessionId) {
        let table = self.table(file);
        let mut state = table.state.lock();
        state.records.retain(|_, lock| lock.session != session);
        table.waiters.notify_all();
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Releases the session's record locks in every file, leaving its
    /// file-level claims alone. Used at transaction end.
    pub fn release_records(&self, session: SessionId) {
        let tables: Vec<Arc<FileLockTable>> = self.files.lock().values().cloned().collect();
        for table in tables {
            let mut state = table.state.lock();
            state.records.retain(|_, lock| lock.session != session);
            table.waiters.notify_all();
        }
        self.graph.clear_waits(session);
    }

    /// Wakes a session blocked in a lock wait; its request fails. Used
    /// when the connection drops mid-wait.
    pub fn cancel_session(&self, session: SessionId) {
        self.cancelled.lock().insert(session);
        self.notify_everyone();
    }

    /// Releases everything a session holds, everywhere.
    pub fn release_session(&self, session: SessionId) {
        let tables: Vec<Arc<FileLockTable>> = self.files.lock().values().cloned().collect();
        for table in tables {
            let mut state = table.state.lock();
            if state.exclusive == Some(session) {
                state.exclusive = None;
            }
            state.shared.remove(&session);
            state.records.retain(|_, lock| lock.session != session);
            table.waiters.notify_all();
        }
        self.graph.remove_session(session);
        self.cancelled.lock().remove(&session);
        self.victims.lock().remove(&session);
    }

    fn notify_everyone(&self) {
        let tables: Vec<Arc<FileLockTable>> = self.files.lock().values().cloned().collect();
        for table in tables {
            table.waiters.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xtrieve_common::types::PageId;

    fn rid(slot: u16) -> RecordId {
        RecordId::new(PageId::new(1), slot)
    }

    fn manager() -> LockManager {
        LockManager::new(Duration::from_millis(5))
    }

    #[test]
    fn test_bias_decoding() {
        assert_eq!(LockBias::from_wire(0), LockBias::None);
        assert_eq!(LockBias::from_wire(100), LockBias::SingleWait);
        assert_eq!(LockBias::from_wire(150), LockBias::SingleWait);
        assert_eq!(LockBias::from_wire(200), LockBias::SingleNoWait);
        assert_eq!(LockBias::from_wire(300), LockBias::MultiWait);
        assert_eq!(LockBias::from_wire(400), LockBias::MultiNoWait);
        assert_eq!(LockBias::from_wire(500), LockBias::None);
    }

    #[test]
    fn test_no_wait_conflict() {
        let lm = manager();
        let (a, b) = (SessionId::new(1), SessionId::new(2));

        lm.lock_record(1, rid(0), a, LockBias::SingleNoWait).unwrap();
        let err = lm.lock_record(1, rid(0), b, LockBias::SingleNoWait).unwrap_err();
        assert_eq!(err.status(), StatusCode::RecordLocked);

        lm.unlock_record(1, rid(0), a);
        lm.lock_record(1, rid(0), b, LockBias::SingleNoWait).unwrap();
    }

    #[test]
    fn test_single_lock_replaced_by_next() {
        let lm = manager();
        let a = SessionId::new(1);
        let b = SessionId::new(2);

        lm.lock_record(1, rid(0), a, LockBias::SingleNoWait).unwrap();
        lm.lock_record(1, rid(1), a, LockBias::SingleNoWait).unwrap();

        // The first record is free again.
        lm.lock_record(1, rid(0), b, LockBias::SingleNoWait).unwrap();
        let err = lm.lock_record(1, rid(1), b, LockBias::SingleNoWait).unwrap_err();
        assert_eq!(err.status(), StatusCode::RecordLocked);
    }

    #[test]
    fn test_multi_locks_accumulate() {
        let lm = manager();
        let a = SessionId::new(1);
        let b = SessionId::new(2);

        lm.lock_record(1, rid(0), a, LockBias::MultiNoWait).unwrap();
        lm.lock_record(1, rid(1), a, LockBias::MultiNoWait).unwrap();

        assert!(lm.is_locked_by_other(1, rid(0), b));
        assert!(lm.is_locked_by_other(1, rid(1), b));

        lm.unlock_all_records(1, a);
        assert!(!lm.is_locked_by_other(1, rid(0), b));
    }

    #[test]
    fn test_wait_until_released() {
        let lm = Arc::new(manager());
        let a = SessionId::new(1);
        let b = SessionId::new(2);

        lm.lock_record(1, rid(0), a, LockBias::SingleWait).unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = std::thread::spawn(move || lm2.lock_record(1, rid(0), b, LockBias::SingleWait));

        std::thread::sleep(Duration::from_millis(20));
        lm.unlock_record(1, rid(0), a);

        waiter.join().unwrap().unwrap();
        assert!(lm.is_locked_by_other(1, rid(0), a));
    }

    #[test]
    fn test_deadlock_aborts_one_waiter() {
        let lm = Arc::new(manager());
        let a = SessionId::new(1);
        let b = SessionId::new(2);
        lm.note_session_start(a);
        lm.note_session_start(b);

        lm.lock_record(1, rid(0), a, LockBias::MultiWait).unwrap();
        lm.lock_record(1, rid(1), b, LockBias::MultiWait).unwrap();

        // The engine aborts a deadlock victim, releasing its locks; the
        // threads mirror that so the survivor can finish.
        let lm_a = Arc::clone(&lm);
        let t1 = std::thread::spawn(move || {
            let result = lm_a.lock_record(1, rid(1), a, LockBias::MultiWait);
            if result.is_err() {
                lm_a.release_session(a);
            }
            result
        });
        let lm_b = Arc::clone(&lm);
        let t2 = std::thread::spawn(move || {
            let result = lm_b.lock_record(1, rid(0), b, LockBias::MultiWait);
            if result.is_err() {
                lm_b.release_session(b);
            }
            result
        });

        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();

        // Exactly one side dies with Deadlock; the other acquires.
        let deadlocks = [&r1, &r2]
            .iter()
            .filter(|r| matches!(r, Err(e) if e.status() == StatusCode::Deadlock))
            .count();
        assert_eq!(deadlocks, 1);
        assert_eq!([&r1, &r2].iter().filter(|r| r.is_ok()).count(), 1);
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let lm = Arc::new(manager());
        let a = SessionId::new(1);
        let b = SessionId::new(2);

        lm.lock_record(1, rid(0), a, LockBias::SingleWait).unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = std::thread::spawn(move || lm2.lock_record(1, rid(0), b, LockBias::SingleWait));

        std::thread::sleep(Duration::from_millis(20));
        lm.cancel_session(b);

        assert!(waiter.join().unwrap().is_err());
        // The holder is untouched.
        assert!(lm.is_locked_by_other(1, rid(0), b));
    }

    #[test]
    fn test_exclusive_open_conflicts() {
        let lm = manager();
        let a = SessionId::new(1);
        let b = SessionId::new(2);

        lm.open_file(1, a, false).unwrap();
        let err = lm.open_file(1, b, true).unwrap_err();
        assert_eq!(err.status(), StatusCode::FileAlreadyOpen);

        lm.close_file(1, a);
        lm.open_file(1, b, true).unwrap();

        let err = lm.open_file(1, a, false).unwrap_err();
        assert_eq!(err.status(), StatusCode::FileLocked);
    }

    #[test]
    fn test_release_session_clears_everything() {
        let lm = manager();
        let a = SessionId::new(1);

        lm.open_file(1, a, true).unwrap();
        lm.lock_record(1, rid(0), a, LockBias::MultiNoWait).unwrap();
        lm.lock_record(2, rid(3), a, LockBias::MultiNoWait).unwrap();

        lm.release_session(a);

        let b = SessionId::new(2);
        lm.open_file(1, b, true).unwrap();
        lm.lock_record(1, rid(0), b, LockBias::SingleNoWait).unwrap();
        lm.lock_record(2, rid(3), b, LockBias::SingleNoWait).unwrap();
    }
}
