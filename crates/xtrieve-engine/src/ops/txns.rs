//! Transaction control: Begin, End, Abort.
//!
//! A deadlock victim's transaction is rolled back the moment the
//! deadlock resolves; the session learns its fate from the status 78 its
//! next End (or the failed operation itself) reports.

use xtrieve_common::types::SessionId;
use xtrieve_common::{StatusCode, XtrieveResult};
use xtrieve_txn::LockBias;

use crate::dispatcher::{Engine, Request, Response};

impl Engine {
    pub(crate) fn op_begin(&self, session: SessionId, request: &Request) -> XtrieveResult<Response> {
        // A leftover deadlock verdict dies with the new transaction.
        self.doomed.lock().remove(&session);

        let bias = LockBias::from_wire(request.lock_bias);
        self.txns.begin(session, bias)?;
        self.locks.note_session_start(session);

        Ok(Response::status_only(StatusCode::Success, request.position_block.clone()))
    }

    pub(crate) fn op_end(&self, session: SessionId, request: &Request) -> XtrieveResult<Response> {
        if self.doomed.lock().remove(&session) {
            return Ok(Response::status_only(
                StatusCode::Deadlock,
                request.position_block.clone(),
            ));
        }

        let result = self.txns.commit(session);
        if !matches!(&result, Err(e) if e.status() == StatusCode::NoTransaction) {
            // Whether the commit published or aborted, the transaction is
            // over and its locks go with it.
            self.locks.release_records(session);
        }
        result?;

        Ok(Response::status_only(StatusCode::Success, request.position_block.clone()))
    }

    pub(crate) fn op_abort(&self, session: SessionId, request: &Request) -> XtrieveResult<Response> {
        if self.doomed.lock().remove(&session) {
            // The transaction is already gone; the abort is a no-op.
            return Ok(Response::status_only(
                StatusCode::Success,
                request.position_block.clone(),
            ));
        }

        let result = self.txns.abort(session);
        if !matches!(&result, Err(e) if e.status() == StatusCode::NoTransaction) {
            self.locks.release_records(session);
        }
        result?;

        Ok(Response::status_only(StatusCode::Success, request.position_block.clone()))
    }
}
