//! The operation dispatcher.
//!
//! [`Engine::dispatch`] is the single entry point: validate the opcode,
//! resolve the position block where one is required, route to the
//! handler, and collapse any error into a wire status. Errors never
//! escape as anything but a status code in the response.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::{debug, warn};

use xtrieve_common::types::{RecordId, SessionId};
use xtrieve_common::{EngineConfig, StatusCode, XtrieveResult};
use xtrieve_txn::{LockBias, LockManager, TransactionManager};

use crate::files::{FileManager, OpenHandle};
use crate::position::PositionBlock;

/// Operation codes this engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// 0: open a file.
    Open,
    /// 1: close a handle.
    Close,
    /// 2: insert a record.
    Insert,
    /// 3: replace the current record.
    Update,
    /// 4: delete the current record.
    Delete,
    /// 5: position on an exact key value.
    GetEqual,
    /// 6: advance one entry in key order.
    GetNext,
    /// 7: step back one entry in key order.
    GetPrev,
    /// 8: first entry strictly greater than the key.
    GetGreater,
    /// 9: first entry greater than or equal to the key.
    GetGreaterOrEqual,
    /// 10: last entry strictly less than the key.
    GetLess,
    /// 11: last entry less than or equal to the key.
    GetLessOrEqual,
    /// 12: first entry of the index.
    GetFirst,
    /// 13: last entry of the index.
    GetLast,
    /// 14: create a file.
    Create,
    /// 15: file statistics.
    Stat,
    /// 19: begin a transaction.
    BeginTransaction,
    /// 20: commit a transaction.
    EndTransaction,
    /// 21: abort a transaction.
    AbortTransaction,
    /// 24: next record in physical order.
    StepNext,
    /// 27: release record locks.
    Unlock,
    /// 33: first record in physical order.
    StepFirst,
    /// 34: last record in physical order.
    StepLast,
    /// 35: previous record in physical order.
    StepPrev,
}

impl Opcode {
    /// Decodes a wire operation number.
    #[must_use]
    pub const fn from_wire(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Open),
            1 => Some(Self::Close),
            2 => Some(Self::Insert),
            3 => Some(Self::Update),
            4 => Some(Self::Delete),
            5 => Some(Self::GetEqual),
            6 => Some(Self::GetNext),
            7 => Some(Self::GetPrev),
            8 => Some(Self::GetGreater),
            9 => Some(Self::GetGreaterOrEqual),
            10 => Some(Self::GetLess),
            11 => Some(Self::GetLessOrEqual),
            12 => Some(Self::GetFirst),
            13 => Some(Self::GetLast),
            14 => Some(Self::Create),
            15 => Some(Self::Stat),
            19 => Some(Self::BeginTransaction),
            20 => Some(Self::EndTransaction),
            21 => Some(Self::AbortTransaction),
            24 => Some(Self::StepNext),
            27 => Some(Self::Unlock),
            33 => Some(Self::StepFirst),
            34 => Some(Self::StepLast),
            35 => Some(Self::StepPrev),
            _ => None,
        }
    }
}

/// One decoded request, mirroring the wire frame.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Wire operation number.
    pub operation: u16,
    /// Echoed position block (raw 128 bytes).
    pub position_block: Vec<u8>,
    /// Data buffer.
    pub data: Vec<u8>,
    /// Key buffer.
    pub key: Vec<u8>,
    /// Key number (also carries the open mode for Open).
    pub key_number: i16,
    /// File path (Open and Create).
    pub file_path: String,
    /// Lock bias.
    pub lock_bias: u16,
}

/// One response, mirroring the wire frame.
#[derive(Debug, Clone)]
pub struct Response {
    /// Wire status.
    pub status: StatusCode,
    /// Updated position block.
    pub position_block: Vec<u8>,
    /// Data buffer.
    pub data: Vec<u8>,
    /// Key buffer.
    pub key: Vec<u8>,
}

impl Response {
    /// A bare status response echoing `block`.
    #[must_use]
    pub fn status_only(status: StatusCode, block: Vec<u8>) -> Self {
        Self {
            status,
            position_block: block,
            data: Vec::new(),
            key: Vec::new(),
        }
    }
}

/// The engine: open files, locks, transactions, and the dispatch table.
pub struct Engine {
    pub(crate) files: FileManager,
    pub(crate) locks: LockManager,
    pub(crate) txns: TransactionManager,
    /// Sessions whose transaction died to a deadlock; their next End
    /// answers status 78.
    pub(crate) doomed: Mutex<HashSet<SessionId>>,
}

impl Engine {
    /// Creates an engine.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            locks: LockManager::new(config.deadlock_probe()),
            files: FileManager::new(config),
            txns: TransactionManager::new(),
            doomed: Mutex::new(HashSet::new()),
        }
    }

    /// Registers a new session.
    pub fn register_session(&self, session: SessionId) {
        self.locks.note_session_start(session);
    }

    /// Tears a session down: abort its transaction, release its locks,
    /// close its handles. Called when the connection drops.
    pub fn close_session(&self, session: SessionId) {
        if self.txns.is_active(session) {
            let _ = self.txns.abort(session);
        }
        for handle in self.files.session_handles(session) {
            let _ = self.files.close(&handle);
        }
        self.locks.release_session(session);
        self.doomed.lock().remove(&session);
    }

    /// Wakes the session if it is blocked in a lock wait (its in-flight
    /// request finishes with an error whose response is discarded).
    pub fn cancel_session(&self, session: SessionId) {
        self.locks.cancel_session(session);
    }

    /// Flushes every open file.
    pub fn shutdown(&self) {
        self.files.flush_all();
    }

    /// Executes one request for a session.
    pub fn dispatch(&self, session: SessionId, request: Request) -> Response {
        let Some(opcode) = Opcode::from_wire(request.operation) else {
            return Response::status_only(StatusCode::InvalidOperation, request.position_block.clone());
        };

        debug!(%session, ?opcode, "dispatch");

        let result = match opcode {
            Opcode::Open => self.op_open(session, &request),
            Opcode::Close => self.op_close(session, &request),
            Opcode::Create => self.op_create(session, &request),
            Opcode::Stat => self.op_stat(session, &request),
            Opcode::Insert => self.op_insert(session, &request),
            Opcode::Update => self.op_update(session, &request),
            Opcode::Delete => self.op_delete(session, &request),
            Opcode::Unlock => self.op_unlock(session, &request),
            Opcode::GetEqual
            | Opcode::GetNext
            | Opcode::GetPrev
            | Opcode::GetGreater
            | Opcode::GetGreaterOrEqual
            | Opcode::GetLess
            | Opcode::GetLessOrEqual
            | Opcode::GetFirst
            | Opcode::GetLast => self.op_keyed(session, opcode, &request),
            Opcode::StepFirst | Opcode::StepLast | Opcode::StepNext | Opcode::StepPrev => {
                self.op_step(session, opcode, &request)
            }
            Opcode::BeginTransaction => self.op_begin(session, &request),
            Opcode::EndTransaction => self.op_end(session, &request),
            Opcode::AbortTransaction => self.op_abort(session, &request),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                let status = e.status();
                if status == StatusCode::Deadlock {
                    self.resolve_deadlock(session);
                } else if !status.is_contention() && status != StatusCode::Success {
                    debug!(%session, ?opcode, %status, "operation failed");
                }
                Response::status_only(status, request.position_block.clone())
            }
        }
    }

    /// The session lost a deadlock: its transaction's changes vanish now,
    /// its locks drop so the survivor can proceed, and the next End
    /// answers 78.
    fn resolve_deadlock(&self, session: SessionId) {
        warn!(%session, "deadlock victim, aborting transaction");
        if self.txns.is_active(session) {
            let _ = self.txns.abort(session);
            self.doomed.lock().insert(session);
        }
        self.locks.release_records(session);
    }

    // =========================================================================
    // Shared helpers for the handlers
    // =========================================================================

    /// Decodes and resolves the request's position block.
    pub(crate) fn resolve_block(
        &self,
        session: SessionId,
        request: &Request,
    ) -> XtrieveResult<(std::sync::Arc<OpenHandle>, PositionBlock)> {
        let block = PositionBlock::decode(&request.position_block)
            .ok_or(xtrieve_common::XtrieveError::Status(StatusCode::FileNotOpen))?;
        let handle = self.files.resolve(&block, session)?;
        Ok((handle, block))
    }

    /// The lock bias in effect for a request: its own bias, or the
    /// transaction's default when the request carries none.
    pub(crate) fn effective_bias(&self, session: SessionId, request: &Request) -> LockBias {
        let bias = LockBias::from_wire(request.lock_bias);
        if bias != LockBias::None {
            return bias;
        }
        self.txns.default_bias(session).unwrap_or(LockBias::None)
    }

    /// Applies read-lock semantics for a record about to be returned:
    /// with no bias the record must simply not be held by someone else;
    /// with a bias the lock is acquired (waiting or not per the bias).
    pub(crate) fn claim_record(
        &self,
        session: SessionId,
        file_id: u64,
        record: RecordId,
        bias: LockBias,
    ) -> XtrieveResult<()> {
        if bias == LockBias::None {
            if self.locks.is_locked_by_other(file_id, record, session) {
                return Err(StatusCode::RecordLocked.into());
            }
            return Ok(());
        }
        self.locks.lock_record(file_id, record, session, bias)
    }

    /// Runs a mutating closure under the file's write latch.
    ///
    /// Inside a transaction the handlers record logical undo for every
    /// mutation (via [`Self::record_undo`]) and the changes stay in the
    /// cache until End. Outside one, the closure runs in an in-memory
    /// page-image undo scope, held entirely under the latch, so a
    /// failure rolls the file back to exactly its pre-operation state;
    /// a success is flushed before the response leaves.
    pub(crate) fn with_mutation<T>(
        &self,
        session: SessionId,
        handle: &OpenHandle,
        f: impl FnOnce() -> XtrieveResult<T>,
    ) -> XtrieveResult<T> {
        if handle.mode == crate::files::OpenMode::ReadOnly {
            return Err(StatusCode::Permission.into());
        }

        let store = &handle.descriptor.store;
        let in_txn = self.txns.is_active(session);

        if in_txn {
            self.txns.enlist(session, handle.descriptor.file_id, store)?;
            let _latch = store.latch().write();
            return f();
        }

        let _latch = store.latch().write();
        store.begin_undo()?;
        match f() {
            Ok(value) => {
                store.end_undo_keep()?;
                store.flush()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = store.abort_undo() {
                    warn!(path = %handle.descriptor.path.display(), ?abort_err, "operation rollback failed");
                    store.mark_unhealthy();
                }
                Err(e)
            }
        }
    }

    /// Records a mutation's inverse into the session's transaction. Call
    /// only from inside a `with_mutation` closure (the write latch must
    /// be held) and only when a transaction is active.
    pub(crate) fn record_undo(
        &self,
        session: SessionId,
        handle: &OpenHandle,
        record: xtrieve_txn::UndoRecord,
    ) -> XtrieveResult<()> {
        self.txns.record_undo(session, handle.descriptor.file_id, record)
    }
}
