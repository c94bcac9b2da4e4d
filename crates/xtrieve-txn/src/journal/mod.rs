//! Logical per-transaction undo.
//!
//! A transaction's mutations apply straight to the file's page cache,
//! protected by its record locks; what makes them revocable is a list of
//! inverse operations: delete what was inserted, restore what was
//! updated, re-insert what was deleted. Logical undo composes with
//! concurrent transactions on the same file: rolling one back walks the
//! ordinary record-store and index paths and touches only the victim's
//! own records, never whole pages another transaction may share.
//!
//! Each record is also appended (and fsynced) to a sidecar journal
//! `<file>.<txn id>.xlg` before the operation that produced it returns,
//! so that a crash can undo whatever uncommitted work reached disk (a
//! neighbour's commit may flush pages carrying this transaction's
//! changes). Journal layout: header `["XLOG"][format u16][txn id u64]
//! [session u64]`, then length-prefixed records.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use xtrieve_common::types::{PageId, RecordId};
use xtrieve_common::{StatusCode, XtrieveResult};
use xtrieve_storage::btree::BTree;
use xtrieve_storage::record::RecordStore;
use xtrieve_storage::PageStore;

const JOURNAL_SIGNATURE: [u8; 4] = *b"XLOG";
const JOURNAL_FORMAT: u16 = 1;
const JOURNAL_HEADER_SIZE: usize = 22;
const JOURNAL_SUFFIX: &str = "xlg";

const KIND_INSERT: u8 = 1;
const KIND_UPDATE: u8 = 2;
const KIND_DELETE: u8 = 3;

/// One undoable mutation, recorded before its operation completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoRecord {
    /// A record was inserted; undo deletes it.
    Insert {
        /// Address of the new record.
        record: RecordId,
    },
    /// A record was rewritten; undo restores the prior bytes.
    Update {
        /// Address of the record.
        record: RecordId,
        /// Full record bytes before the update.
        before: Vec<u8>,
    },
    /// A record was deleted; undo re-inserts it.
    Delete {
        /// Full record bytes before the delete.
        before: Vec<u8>,
        /// The record's insertion sequence, preserved across the
        /// re-insert so duplicate ordering does not shift.
        sequence: u64,
    },
}

impl UndoRecord {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Insert { record } => {
                out.push(KIND_INSERT);
                out.extend_from_slice(&record.page.as_u32().to_le_bytes());
                out.extend_from_slice(&record.slot.to_le_bytes());
            }
            Self::Update { record, before } => {
                out.push(KIND_UPDATE);
                out.extend_from_slice(&record.page.as_u32().to_le_bytes());
                out.extend_from_slice(&record.slot.to_le_bytes());
                out.extend_from_slice(&(before.len() as u32).to_le_bytes());
                out.extend_from_slice(before);
            }
            Self::Delete { before, sequence } => {
                out.push(KIND_DELETE);
                out.extend_from_slice(&sequence.to_le_bytes());
                out.extend_from_slice(&(before.len() as u32).to_le_bytes());
                out.extend_from_slice(before);
            }
        }
        out
    }

    fn decode(raw: &[u8]) -> Option<(Self, usize)> {
        let kind = *raw.first()?;
        match kind {
            KIND_INSERT => {
                let body = raw.get(1..7)?;
                let page = u32::from_le_bytes(body[0..4].try_into().unwrap());
                let slot = u16::from_le_bytes(body[4..6].try_into().unwrap());
                Some((
                    Self::Insert {
                        record: RecordId::new(PageId::new(page), slot),
                    },
                    7,
                ))
            }
            KIND_UPDATE => {
                let body = raw.get(1..11)?;
                let page = u32::from_le_bytes(body[0..4].try_into().unwrap());
                let slot = u16::from_le_bytes(body[4..6].try_into().unwrap());
                let len = u32::from_le_bytes(body[6..10].try_into().unwrap()) as usize;
                let before = raw.get(11..11 + len)?.to_vec();
                Some((
                    Self::Update {
                        record: RecordId::new(PageId::new(page), slot),
                        before,
                    },
                    11 + len,
                ))
            }
            KIND_DELETE => {
                let body = raw.get(1..13)?;
                let sequence = u64::from_le_bytes(body[0..8].try_into().unwrap());
                let len = u32::from_le_bytes(body[8..12].try_into().unwrap()) as usize;
                let before = raw.get(13..13 + len)?.to_vec();
                Some((Self::Delete { before, sequence }, 13 + len))
            }
            _ => None,
        }
    }
}

/// Journal path for one transaction against `base`.
#[must_use]
pub fn journal_path(base: &Path, txn_id: u64) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{txn_id}.{JOURNAL_SUFFIX}"));
    PathBuf::from(name)
}

/// Append-only logical undo journal for one transaction and one file.
pub struct TxnJournal {
    file: File,
    path: PathBuf,
}

impl TxnJournal {
    /// Creates the journal and writes its header.
    pub fn create(base: &Path, txn_id: u64, session_id: u64) -> XtrieveResult<Self> {
        let path = journal_path(base, txn_id);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut header = [0u8; JOURNAL_HEADER_SIZE];
        header[0..4].copy_from_slice(&JOURNAL_SIGNATURE);
        header[4..6].copy_from_slice(&JOURNAL_FORMAT.to_le_bytes());
        header[6..14].copy_from_slice(&txn_id.to_le_bytes());
        header[14..22].copy_from_slice(&session_id.to_le_bytes());
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(Self { file, path })
    }

    /// Appends one undo record and forces it to disk.
    pub fn append(&mut self, record: &UndoRecord) -> XtrieveResult<()> {
        self.file.write_all(&record.encode())?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Deletes the journal at transaction end.
    pub fn remove(self) -> XtrieveResult<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Reads a journal's records, oldest first, tolerating a torn tail.
pub fn read_records(path: &Path) -> XtrieveResult<Vec<UndoRecord>> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;

    if raw.len() < JOURNAL_HEADER_SIZE || raw[0..4] != JOURNAL_SIGNATURE {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    let mut at = JOURNAL_HEADER_SIZE;
    while at < raw.len() {
        let Some((record, consumed)) = UndoRecord::decode(&raw[at..]) else {
            // A torn tail record never covered an applied mutation.
            break;
        };
        records.push(record);
        at += consumed;
    }
    Ok(records)
}

/// Journals of transactions that never finished against `base`.
pub fn pending_journals(base: &Path) -> XtrieveResult<Vec<PathBuf>> {
    let Some(parent) = base.parent() else {
        return Ok(Vec::new());
    };
    let Some(file_name) = base.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{file_name}.");
    let suffix = format!(".{JOURNAL_SUFFIX}");

    let mut found = Vec::new();
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // Exactly `<file>.<txn id>.xlg`; a neighbouring file whose name
        // happens to extend ours must not match.
        let middle = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(&suffix));
        if middle.is_some_and(|m| !m.is_empty() && m.bytes().all(|b| b.is_ascii_digit())) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Applies undo records in reverse order through the record store and
/// indexes. Used both by a live abort and by crash recovery; during
/// recovery some effects may never have reached disk, so a missing
/// record is skipped and an already-present record is not re-inserted.
pub fn apply_undo(store: &PageStore, records: &[UndoRecord]) -> XtrieveResult<()> {
    let rs = RecordStore::new(store);
    let chains = store.fcr().keys.clone();

    for undo in records.iter().rev() {
        match undo {
            UndoRecord::Insert { record } => {
                let bytes = match rs.read(*record) {
                    Ok(bytes) => bytes,
                    Err(e) if e.status() == StatusCode::InvalidPositioning => continue,
                    Err(e) => return Err(e),
                };
                let sequence = rs.sequence(*record)?;
                for (key_number, chain) in chains.iter().enumerate() {
                    let key = chain.extract(&bytes);
                    if !chain.is_null(&key) {
                        BTree::new(store, key_number)?.delete(&key, sequence, *record)?;
                    }
                }
                rs.delete(*record)?;
            }
            UndoRecord::Update { record, before } => {
                let current = match rs.read(*record) {
                    Ok(bytes) => bytes,
                    Err(e) if e.status() == StatusCode::InvalidPositioning => continue,
                    Err(e) => return Err(e),
                };
                let sequence = rs.sequence(*record)?;
                for (key_number, chain) in chains.iter().enumerate() {
                    let current_key = chain.extract(&current);
                    let before_key = chain.extract(before);
                    if current_key == before_key {
                        continue;
                    }
                    let tree = BTree::new(store, key_number)?;
                    if !chain.is_null(&current_key) {
                        tree.delete(&current_key, sequence, *record)?;
                    }
                    if !chain.is_null(&before_key) {
                        tree.insert(&before_key, sequence, *record)?;
                    }
                }
                rs.update(*record, before)?;
            }
            UndoRecord::Delete { before, sequence } => {
                if record_with_sequence_exists(store, &chains, before, *sequence)? {
                    continue;
                }
                let record = rs.insert_with_sequence(before, *sequence)?;
                for (key_number, chain) in chains.iter().enumerate() {
                    let key = chain.extract(before);
                    if !chain.is_null(&key) {
                        BTree::new(store, key_number)?.insert(&key, *sequence, record)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// True if a record carrying this insertion sequence is still live,
/// meaning the deletion being undone never made it to disk.
fn record_with_sequence_exists(
    store: &PageStore,
    chains: &[xtrieve_common::types::KeyChain],
    bytes: &[u8],
    sequence: u64,
) -> XtrieveResult<bool> {
    // A keyed probe is cheap when any key is usable.
    for (key_number, chain) in chains.iter().enumerate() {
        let key = chain.extract(bytes);
        if chain.is_null(&key) {
            continue;
        }
        let tree = BTree::new(store, key_number)?;
        if let Some(cursor) = tree.lower_bound(&key, sequence)? {
            let entry = cursor.entry(&tree)?;
            return Ok(entry.sequence == sequence && chain.compare(&entry.key, &key).is_eq());
        }
        return Ok(false);
    }

    // No usable key: walk physical order.
    let rs = RecordStore::new(store);
    let mut cursor = rs.first()?;
    while let Some(record) = cursor {
        if rs.sequence(record)? == sequence {
            return Ok(true);
        }
        cursor = rs.next_after(record)?;
    }
    Ok(false)
}

/// Rolls back every unfinished transaction recorded against `store`'s
/// file, then flushes the result and removes the journals. Called once
/// when a file is first opened.
pub fn recover(store: &PageStore) -> XtrieveResult<()> {
    let journals = pending_journals(store.path())?;
    if journals.is_empty() {
        return Ok(());
    }

    for path in &journals {
        let records = read_records(path)?;
        warn!(
            journal = %path.display(),
            records = records.len(),
            "undoing unfinished transaction"
        );
        let _latch = store.latch().write();
        apply_undo(store, &records)?;
        store.publish_fcr()?;
    }

    // The undo must be durable before the journals disappear; a crash in
    // between just replays them (skips make that harmless).
    store.flush()?;
    store.sync()?;
    for path in journals {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use xtrieve_common::types::{KeyChain, KeyDescriptor, KeyFlags, KeyType};
    use xtrieve_storage::page::FileControlRecord;

    fn keyed_store(dir: &tempfile::TempDir, name: &str) -> PageStore {
        let chain = KeyChain::new(vec![KeyDescriptor::new(
            0,
            8,
            KeyFlags::empty(),
            KeyType::UnsignedBinary,
            0,
        )]);
        let fcr = FileControlRecord::new(32, 512, vec![chain]);
        PageStore::create(dir.path().join(name), fcr, 128).unwrap()
    }

    fn insert_keyed(store: &PageStore, key: u64) -> (RecordId, u64) {
        let mut bytes = vec![0u8; 32];
        bytes[..8].copy_from_slice(&key.to_le_bytes());
        let rs = RecordStore::new(store);
        let (record, sequence) = rs.insert(&bytes).unwrap();
        BTree::new(store, 0)
            .unwrap()
            .insert(&key.to_le_bytes(), sequence, record)
            .unwrap();
        (record, sequence)
    }

    fn lookup(store: &PageStore, key: u64) -> Option<RecordId> {
        let tree = BTree::new(store, 0).unwrap();
        let cursor = tree.lower_bound(&key.to_le_bytes(), 0).unwrap()?;
        let entry = cursor.entry(&tree).unwrap();
        (entry.key == key.to_le_bytes()).then_some(entry.record)
    }

    #[test]
    fn test_record_encoding_roundtrip() {
        let samples = vec![
            UndoRecord::Insert {
                record: RecordId::new(PageId::new(3), 7),
            },
            UndoRecord::Update {
                record: RecordId::new(PageId::new(1), 0),
                before: vec![1, 2, 3, 4],
            },
            UndoRecord::Delete {
                before: vec![9; 40],
                sequence: 77,
            },
        ];

        let mut raw = Vec::new();
        for sample in &samples {
            raw.extend_from_slice(&sample.encode());
        }

        let mut decoded = Vec::new();
        let mut at = 0;
        while at < raw.len() {
            let (record, consumed) = UndoRecord::decode(&raw[at..]).unwrap();
            decoded.push(record);
            at += consumed;
        }
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_journal_roundtrip_and_scan() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t.xtv");
        std::fs::write(&base, b"x").unwrap();

        let mut journal = TxnJournal::create(&base, 5, 2).unwrap();
        journal
            .append(&UndoRecord::Insert {
                record: RecordId::new(PageId::new(1), 0),
            })
            .unwrap();
        drop(journal);

        let pending = pending_journals(&base).unwrap();
        assert_eq!(pending.len(), 1);
        let records = read_records(&pending[0]).unwrap();
        assert_eq!(records.len(), 1);

        std::fs::remove_file(&pending[0]).unwrap();
        assert!(pending_journals(&base).unwrap().is_empty());
    }

    #[test]
    fn test_undo_insert_removes_record() {
        let dir = tempdir().unwrap();
        let store = keyed_store(&dir, "ui.xtv");

        let (record, _) = insert_keyed(&store, 10);
        apply_undo(&store, &[UndoRecord::Insert { record }]).unwrap();

        assert!(lookup(&store, 10).is_none());
        assert_eq!(store.fcr().record_count, 0);
    }

    #[test]
    fn test_undo_update_restores_bytes_and_keys() {
        let dir = tempdir().unwrap();
        let store = keyed_store(&dir, "uu.xtv");

        let (record, sequence) = insert_keyed(&store, 10);
        let before = RecordStore::new(&store).read(record).unwrap();

        // Rewrite with a different key, index maintained by hand as the
        // engine would.
        let mut after = before.clone();
        after[..8].copy_from_slice(&20u64.to_le_bytes());
        let tree = BTree::new(&store, 0).unwrap();
        tree.delete(&10u64.to_le_bytes(), sequence, record).unwrap();
        tree.insert(&20u64.to_le_bytes(), sequence, record).unwrap();
        RecordStore::new(&store).update(record, &after).unwrap();

        apply_undo(&store, &[UndoRecord::Update { record, before: before.clone() }]).unwrap();

        assert!(lookup(&store, 20).is_none());
        assert_eq!(lookup(&store, 10), Some(record));
        assert_eq!(RecordStore::new(&store).read(record).unwrap(), before);
    }

    #[test]
    fn test_undo_delete_reinserts_with_sequence() {
        let dir = tempdir().unwrap();
        let store = keyed_store(&dir, "ud.xtv");

        let (record, sequence) = insert_keyed(&store, 10);
        let before = RecordStore::new(&store).read(record).unwrap();

        let tree = BTree::new(&store, 0).unwrap();
        tree.delete(&10u64.to_le_bytes(), sequence, record).unwrap();
        RecordStore::new(&store).delete(record).unwrap();

        apply_undo(
            &store,
            &[UndoRecord::Delete { before: before.clone(), sequence }],
        )
        .unwrap();

        let revived = lookup(&store, 10).unwrap();
        assert_eq!(RecordStore::new(&store).sequence(revived).unwrap(), sequence);
        assert_eq!(store.fcr().record_count, 1);

        // Undoing a delete that never took effect is a no-op.
        apply_undo(&store, &[UndoRecord::Delete { before, sequence }]).unwrap();
        assert_eq!(store.fcr().record_count, 1);
    }

    #[test]
    fn test_undo_skips_missing_records() {
        let dir = tempdir().unwrap();
        let store = keyed_store(&dir, "um.xtv");

        // Neither the inserted nor the updated record ever reached this
        // file; recovery shrugs.
        apply_undo(
            &store,
            &[
                UndoRecord::Insert {
                    record: RecordId::new(PageId::new(7), 3),
                },
                UndoRecord::Update {
                    record: RecordId::new(PageId::new(7), 4),
                    before: vec![0; 32],
                },
            ],
        )
        .unwrap();
        assert_eq!(store.fcr().record_count, 0);
    }

    #[test]
    fn test_recover_applies_and_removes_journals() {
        let dir = tempdir().unwrap();
        let store = keyed_store(&dir, "rec.xtv");

        let (record, _) = insert_keyed(&store, 33);
        store.publish_fcr().unwrap();
        store.flush().unwrap();

        let mut journal = TxnJournal::create(store.path(), 9, 4).unwrap();
        journal.append(&UndoRecord::Insert { record }).unwrap();
        drop(journal);

        recover(&store).unwrap();

        assert!(lookup(&store, 33).is_none());
        assert!(pending_journals(store.path()).unwrap().is_empty());
    }
}
