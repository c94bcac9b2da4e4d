//! Record mutation: Insert, Update, Delete, and Unlock.

use xtrieve_common::types::{KeyChain, SessionId};
use xtrieve_common::{StatusCode, XtrieveResult};
use xtrieve_storage::btree::BTree;
use xtrieve_storage::record::RecordStore;
use xtrieve_txn::{LockBias, UndoRecord};

use crate::dispatcher::{Engine, Request, Response};

impl Engine {
    pub(crate) fn op_insert(&self, session: SessionId, request: &Request) -> XtrieveResult<Response> {
        let (handle, mut block) = self.resolve_block(session, request)?;
        let store = &handle.descriptor.store;
        let in_txn = self.txns.is_active(session);

        let (record_length, chains) = {
            let fcr = store.fcr();
            (fcr.record_length as usize, fcr.keys.clone())
        };
        if request.data.len() < record_length {
            return Err(StatusCode::DataBufferTooShort.into());
        }

        let (record, sequence) = self.with_mutation(session, &handle, || {
            // Reject duplicates on unique keys before touching any page.
            for (key_number, chain) in chains.iter().enumerate() {
                let key = chain.extract(&request.data);
                if chain.is_null(&key) || chain.allows_duplicates() {
                    continue;
                }
                if BTree::new(store, key_number)?.contains_key(&key)? {
                    return Err(StatusCode::DuplicateKey.into());
                }
            }

            let (record, sequence) = RecordStore::new(store).insert(&request.data)?;
            for (key_number, chain) in chains.iter().enumerate() {
                let key = chain.extract(&request.data);
                if chain.is_null(&key) {
                    continue;
                }
                BTree::new(store, key_number)?.insert(&key, sequence, record)?;
            }

            if in_txn {
                self.record_undo(session, &handle, UndoRecord::Insert { record })?;
                // The new record stays locked until End so no other
                // session can see it before commit. Nobody else can hold
                // a record that did not exist a moment ago, so this
                // never waits despite running under the latch.
                self.locks
                    .lock_record(handle.descriptor.file_id, record, session, LockBias::MultiWait)?;
            }
            store.publish_fcr()?;
            Ok((record, sequence))
        })?;

        let key_value = current_key_value(&chains, block.key_number, &request.data);
        block.position(block.key_number, record, sequence, &key_value);
        Ok(Response::status_only(StatusCode::Success, block.encode()))
    }

    pub(crate) fn op_update(&self, session: SessionId, request: &Request) -> XtrieveResult<Response> {
        let (handle, mut block) = self.resolve_block(session, request)?;
        if !block.is_positioned() {
            return Err(StatusCode::InvalidPositioning.into());
        }
        let store = &handle.descriptor.store;
        let record = block.record;
        let in_txn = self.txns.is_active(session);

        let (record_length, chains) = {
            let fcr = store.fcr();
            (fcr.record_length as usize, fcr.keys.clone())
        };
        if request.data.len() < record_length {
            return Err(StatusCode::DataBufferTooShort.into());
        }

        self.claim_for_mutation(session, handle.descriptor.file_id, record, request)?;

        self.with_mutation(session, &handle, || {
            let rs = RecordStore::new(store);
            let old_data = rs.read(record)?;
            let sequence = rs.sequence(record)?;

            // Validate every key change before applying any of them.
            let mut changes = Vec::new();
            for (key_number, chain) in chains.iter().enumerate() {
                let old_key = chain.extract(&old_data);
                let new_key = chain.extract(&request.data);
                if old_key == new_key {
                    continue;
                }
                if !chain.is_modifiable() {
                    return Err(StatusCode::ModifiableKeyChanged.into());
                }
                let new_null = chain.is_null(&new_key);
                if !new_null
                    && !chain.allows_duplicates()
                    && BTree::new(store, key_number)?.contains_key(&new_key)?
                {
                    return Err(StatusCode::DuplicateKey.into());
                }
                changes.push((key_number, chain.clone(), old_key, new_key, new_null));
            }

            for (key_number, chain, old_key, new_key, new_null) in changes {
                let tree = BTree::new(store, key_number)?;
                if !chain.is_null(&old_key) {
                    tree.delete(&old_key, sequence, record)?;
                }
                if !new_null {
                    tree.insert(&new_key, sequence, record)?;
                }
            }

            rs.update(record, &request.data)?;
            if in_txn {
                self.record_undo(
                    session,
                    &handle,
                    UndoRecord::Update {
                        record,
                        before: old_data,
                    },
                )?;
            }
            store.publish_fcr()?;
            Ok(())
        })?;

        // The cursor stays on the record; refresh its key value.
        let sequence = block.sequence;
        let key_value = current_key_value(&chains, block.key_number, &request.data);
        block.position(block.key_number, record, sequence, &key_value);
        Ok(Response::status_only(StatusCode::Success, block.encode()))
    }

    pub(crate) fn op_delete(&self, session: SessionId, request: &Request) -> XtrieveResult<Response> {
        let (handle, mut block) = self.resolve_block(session, request)?;
        if !block.is_positioned() {
            return Err(StatusCode::InvalidPositioning.into());
        }
        let store = &handle.descriptor.store;
        let record = block.record;
        let file_id = handle.descriptor.file_id;
        let in_txn = self.txns.is_active(session);

        let chains = store.fcr().keys.clone();
        self.claim_for_mutation(session, file_id, record, request)?;

        self.with_mutation(session, &handle, || {
            let rs = RecordStore::new(store);
            let old_data = rs.read(record)?;
            let sequence = rs.sequence(record)?;

            for (key_number, chain) in chains.iter().enumerate() {
                let key = chain.extract(&old_data);
                if chain.is_null(&key) {
                    continue;
                }
                BTree::new(store, key_number)?.delete(&key, sequence, record)?;
            }

            rs.delete(record)?;
            if in_txn {
                self.record_undo(
                    session,
                    &handle,
                    UndoRecord::Delete {
                        before: old_data,
                        sequence,
                    },
                )?;
            }
            store.publish_fcr()?;
            Ok(())
        })?;

        // A lock on a record that no longer exists serves nobody.
        if !in_txn {
            self.locks.unlock_record(file_id, record, session);
        }

        block.unposition();
        Ok(Response::status_only(StatusCode::Success, block.encode()))
    }

    pub(crate) fn op_unlock(&self, session: SessionId, request: &Request) -> XtrieveResult<Response> {
        let (handle, block) = self.resolve_block(session, request)?;
        let file_id = handle.descriptor.file_id;

        match request.lock_bias as i16 {
            -1 => {
                self.locks.unlock_all_records(file_id, session);
            }
            -2 => {
                if !block.is_positioned() {
                    return Err(StatusCode::InvalidPositioning.into());
                }
                self.locks.unlock_record(file_id, block.record, session);
            }
            _ => return Err(StatusCode::InvalidOperation.into()),
        }

        Ok(Response::status_only(StatusCode::Success, request.position_block.clone()))
    }

    /// Lock handling before a mutation of `record`: with any bias (or
    /// inside a transaction) the exclusive lock is acquired and kept;
    /// without either, the record must merely not be held by another
    /// session.
    fn claim_for_mutation(
        &self,
        session: SessionId,
        file_id: u64,
        record: xtrieve_common::types::RecordId,
        request: &Request,
    ) -> XtrieveResult<()> {
        let mut bias = self.effective_bias(session, request);
        if bias == LockBias::None && self.txns.is_active(session) {
            bias = LockBias::MultiWait;
        }
        self.claim_record(session, file_id, record, bias)
    }
}

/// The current key value for a cursor's key number, empty when the key
/// number is out of range or the key is null.
fn current_key_value(chains: &[KeyChain], key_number: i16, data: &[u8]) -> Vec<u8> {
    let Ok(index) = usize::try_from(key_number) else {
        return Vec::new();
    };
    let Some(chain) = chains.get(index) else {
        return Vec::new();
    };
    let key = chain.extract(data);
    if chain.is_null(&key) {
        Vec::new()
    } else {
        key
    }
}
