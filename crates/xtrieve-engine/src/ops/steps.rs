//! Physical-order traversal: Step First, Step Next, Step Prev, Step
//! Last. Index-agnostic: records come back in page/slot order with
//! deleted slots skipped.

use xtrieve_common::types::SessionId;
use xtrieve_common::{StatusCode, XtrieveResult};
use xtrieve_storage::record::RecordStore;

use crate::dispatcher::{Engine, Opcode, Request, Response};

impl Engine {
    pub(crate) fn op_step(
        &self,
        session: SessionId,
        opcode: Opcode,
        request: &Request,
    ) -> XtrieveResult<Response> {
        let (handle, mut block) = self.resolve_block(session, request)?;
        let store = &handle.descriptor.store;

        let target = {
            let _latch = handle.descriptor.store.latch().read();
            let rs = RecordStore::new(store);
            match opcode {
                Opcode::StepFirst => rs.first()?,
                Opcode::StepLast => rs.last()?,
                Opcode::StepNext => {
                    if !block.is_positioned() {
                        return Err(StatusCode::InvalidPositioning.into());
                    }
                    rs.next_after(block.record)?
                }
                Opcode::StepPrev => {
                    if !block.is_positioned() {
                        return Err(StatusCode::InvalidPositioning.into());
                    }
                    rs.prev_before(block.record)?
                }
                _ => unreachable!("non-step opcode routed to op_step"),
            }
        };

        let Some(record) = target else {
            block.unposition();
            return Ok(Response::status_only(StatusCode::EndOfFile, block.encode()));
        };

        let bias = self.effective_bias(session, request);
        self.claim_record(session, handle.descriptor.file_id, record, bias)?;

        let (data, sequence) = {
            let _latch = handle.descriptor.store.latch().read();
            let rs = RecordStore::new(store);
            (rs.read(record)?, rs.sequence(record)?)
        };

        // Keep the cursor's key value current so a keyed Get Next can
        // continue from a physical position.
        let key_value = {
            let fcr = store.fcr();
            usize::try_from(block.key_number)
                .ok()
                .and_then(|i| fcr.key(i))
                .map(|chain| {
                    let key = chain.extract(&data);
                    if chain.is_null(&key) {
                        Vec::new()
                    } else {
                        key
                    }
                })
                .unwrap_or_default()
        };

        block.position(block.key_number, record, sequence, &key_value);
        Ok(Response {
            status: StatusCode::Success,
            position_block: block.encode(),
            data,
            key: Vec::new(),
        })
    }
}
