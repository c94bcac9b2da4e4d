//! Keyed retrieval: Get Equal, Next, Prev, the range forms, and the
//! endpoints.
//!
//! Every comparison runs over `(key, insertion sequence)`, so Get Next
//! and Get Prev re-seek from the cursor's stored key and sequence rather
//! than trusting a leaf slot; page splits between calls cannot strand
//! the cursor. The tree search runs under the file's shared latch; a
//! requested record lock is taken after the latch drops and the record
//! is re-read once the lock is held.

use std::cmp::Ordering;

use xtrieve_common::types::SessionId;
use xtrieve_common::{StatusCode, XtrieveResult};
use xtrieve_storage::btree::{BTree, LeafEntry, TreeCursor};
use xtrieve_storage::record::RecordStore;

use crate::dispatcher::{Engine, Opcode, Request, Response};
use crate::position::PositionBlock;

impl Engine {
    pub(crate) fn op_keyed(
        &self,
        session: SessionId,
        opcode: Opcode,
        request: &Request,
    ) -> XtrieveResult<Response> {
        let (handle, mut block) = self.resolve_block(session, request)?;
        let store = &handle.descriptor.store;
        let key_count = store.fcr().keys.len();

        // Next/Prev continue from the cursor; everything else establishes
        // a fresh position on the request's key number.
        let key_number = match opcode {
            Opcode::GetNext | Opcode::GetPrev => {
                if !block.is_positioned() {
                    return Err(StatusCode::InvalidPositioning.into());
                }
                if request.key_number != block.key_number {
                    return Err(StatusCode::DifferentKeyNumber.into());
                }
                block.key_number
            }
            _ => request.key_number,
        };
        let index = usize::try_from(key_number)
            .ok()
            .filter(|i| *i < key_count)
            .ok_or(xtrieve_common::XtrieveError::Status(StatusCode::InvalidKeyNumber))?;

        let found = {
            let _latch = handle.descriptor.store.latch().read();
            let tree = BTree::new(store, index)?;
            self.seek(&tree, opcode, request, &block)?
        };

        let Some(entry) = found else {
            let status = match opcode {
                Opcode::GetEqual => StatusCode::KeyNotFound,
                _ => StatusCode::EndOfFile,
            };
            block.key_number = key_number;
            block.unposition();
            return Ok(Response::status_only(status, block.encode()));
        };

        let bias = self.effective_bias(session, request);
        self.claim_record(session, handle.descriptor.file_id, entry.record, bias)?;

        let data = {
            let _latch = handle.descriptor.store.latch().read();
            RecordStore::new(store).read(entry.record)?
        };

        block.position(key_number, entry.record, entry.sequence, &entry.key);
        Ok(Response {
            status: StatusCode::Success,
            position_block: block.encode(),
            data,
            key: entry.key,
        })
    }

    /// Positions per the opcode and returns the target entry, if any.
    fn seek(
        &self,
        tree: &BTree<'_>,
        opcode: Opcode,
        request: &Request,
        block: &PositionBlock,
    ) -> XtrieveResult<Option<LeafEntry>> {
        let cursor = match opcode {
            Opcode::GetFirst => tree.first()?,
            Opcode::GetLast => tree.last()?,
            Opcode::GetNext => tree.lower_bound(&block.key_value, block.sequence + 1)?,
            Opcode::GetPrev => {
                self.predecessor(tree, tree.lower_bound(&block.key_value, block.sequence)?)?
            }
            Opcode::GetEqual | Opcode::GetGreaterOrEqual => {
                tree.lower_bound(&probe(tree, request), 0)?
            }
            Opcode::GetGreater => tree.lower_bound(&probe(tree, request), u64::MAX)?,
            Opcode::GetLessOrEqual => {
                self.predecessor(tree, tree.lower_bound(&probe(tree, request), u64::MAX)?)?
            }
            Opcode::GetLess => {
                self.predecessor(tree, tree.lower_bound(&probe(tree, request), 0)?)?
            }
            _ => unreachable!("non-keyed opcode routed to op_keyed"),
        };

        let Some(cursor) = cursor else {
            return Ok(None);
        };
        let entry = cursor.entry(tree)?;

        // Get Equal insists on a match: full keys compare equal, shorter
        // probes match as a prefix.
        if opcode == Opcode::GetEqual {
            let raw = trimmed_probe(tree, request);
            let matched = if raw.len() == tree.key_len() {
                tree.chain().compare(&entry.key, raw) == Ordering::Equal
            } else {
                entry.key.starts_with(raw)
            };
            if !matched {
                return Ok(None);
            }
        }

        Ok(Some(entry))
    }

    /// The entry immediately before a lower bound; past-the-end means the
    /// very last entry.
    fn predecessor(
        &self,
        tree: &BTree<'_>,
        bound: Option<TreeCursor>,
    ) -> XtrieveResult<Option<TreeCursor>> {
        match bound {
            Some(cursor) => cursor.prev(tree),
            None => tree.last(),
        }
    }
}

/// The request's key buffer clipped to the declared key length.
fn trimmed_probe<'r>(tree: &BTree<'_>, request: &'r Request) -> &'r [u8] {
    &request.key[..request.key.len().min(tree.key_len())]
}

/// The probe padded out to the declared key length for positioning.
fn probe(tree: &BTree<'_>, request: &Request) -> Vec<u8> {
    tree.chain().pad_probe(trimmed_probe(tree, request))
}
