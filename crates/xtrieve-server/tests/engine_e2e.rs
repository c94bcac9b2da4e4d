//! End-to-end engine scenarios driven through the dispatcher.

use std::sync::Arc;

use tempfile::TempDir;

use xtrieve_common::types::SessionId;
use xtrieve_common::EngineConfig;
use xtrieve_engine::{Engine, PositionBlock, Request, Response};

const OP_OPEN: u16 = 0;
const OP_CLOSE: u16 = 1;
const OP_INSERT: u16 = 2;
const OP_UPDATE: u16 = 3;
const OP_DELETE: u16 = 4;
const OP_GET_EQUAL: u16 = 5;
const OP_GET_NEXT: u16 = 6;
const OP_GET_PREV: u16 = 7;
const OP_GET_GREATER: u16 = 8;
const OP_GET_LE: u16 = 11;
const OP_GET_FIRST: u16 = 12;
const OP_GET_LAST: u16 = 13;
const OP_CREATE: u16 = 14;
const OP_STAT: u16 = 15;
const OP_BEGIN: u16 = 19;
const OP_END: u16 = 20;
const OP_ABORT: u16 = 21;
const OP_STEP_NEXT: u16 = 24;
const OP_UNLOCK: u16 = 27;
const OP_STEP_FIRST: u16 = 33;

/// One scripted client session against a shared engine.
struct Client {
    engine: Arc<Engine>,
    session: SessionId,
    block: Vec<u8>,
}

impl Client {
    fn new(engine: &Arc<Engine>, id: u64) -> Self {
        let session = SessionId::new(id);
        engine.register_session(session);
        Self {
            engine: Arc::clone(engine),
            session,
            block: vec![0u8; 128],
        }
    }

    fn call(&mut self, mut request: Request) -> Response {
        request.position_block = self.block.clone();
        let response = self.engine.dispatch(self.session, request);
        if response.status.as_u16() == 0 && response.position_block.len() == 128 {
            self.block = response.position_block.clone();
        } else if PositionBlock::decode(&response.position_block).is_some() {
            // Failed positioning ops still update the cursor state.
            self.block = response.position_block.clone();
        }
        response
    }

    fn create(&mut self, path: &str, record_length: u16, page_size: u16, keys: &[(u16, u16, u16)]) -> u16 {
        let mut data = Vec::new();
        data.extend_from_slice(&record_length.to_le_bytes());
        data.extend_from_slice(&page_size.to_le_bytes());
        data.extend_from_slice(&(keys.len() as u16).to_le_bytes());
        data.extend_from_slice(&[0u8; 4]);
        for (position, length, flags) in keys {
            data.extend_from_slice(&position.to_le_bytes());
            data.extend_from_slice(&length.to_le_bytes());
            data.extend_from_slice(&flags.to_le_bytes());
            data.push(14); // unsigned binary
            data.push(0);
            data.extend_from_slice(&[0u8; 8]);
        }
        self.call(Request {
            operation: OP_CREATE,
            data,
            file_path: path.to_string(),
            ..Default::default()
        })
        .status
        .as_u16()
    }

    fn open(&mut self, path: &str) -> u16 {
        self.call(Request {
            operation: OP_OPEN,
            key_number: -1,
            file_path: path.to_string(),
            ..Default::default()
        })
        .status
        .as_u16()
    }

    fn close(&mut self) -> u16 {
        self.call(Request {
            operation: OP_CLOSE,
            ..Default::default()
        })
        .status
        .as_u16()
    }

    fn insert(&mut self, data: Vec<u8>) -> u16 {
        self.call(Request {
            operation: OP_INSERT,
            data,
            ..Default::default()
        })
        .status
        .as_u16()
    }

    fn get(&mut self, operation: u16, key_number: i16, key: Vec<u8>, lock_bias: u16) -> Response {
        self.call(Request {
            operation,
            key,
            key_number,
            lock_bias,
            ..Default::default()
        })
    }

    fn stat(&mut self) -> Response {
        self.call(Request {
            operation: OP_STAT,
            ..Default::default()
        })
    }

    fn simple(&mut self, operation: u16) -> u16 {
        self.call(Request {
            operation,
            ..Default::default()
        })
        .status
        .as_u16()
    }
}

/// A 100-byte record whose first 8 bytes hold `key` little-endian.
fn record(key: u64) -> Vec<u8> {
    let mut data = vec![0u8; 100];
    data[..8].copy_from_slice(&key.to_le_bytes());
    data
}

fn record_with_marker(key: u64, marker: u8) -> Vec<u8> {
    let mut data = record(key);
    data[50] = marker;
    data
}

fn stat_record_count(response: &Response) -> u32 {
    // Header (10) + one descriptor entry per segment (16 each), then the
    // record count.
    let entries = u16::from_le_bytes(response.data[4..6].try_into().unwrap()) as usize;
    let at = 10 + entries * 16;
    u32::from_le_bytes(response.data[at..at + 4].try_into().unwrap())
}

fn engine() -> (TempDir, Arc<Engine>) {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(Engine::new(EngineConfig {
        cache_pages: 64,
        deadlock_probe_ms: 5,
    }));
    (dir, engine)
}

fn path_in(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

// =============================================================================
// Scenario 1: create, insert, read back by key.
// =============================================================================

#[test]
fn test_create_insert_read() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "s1.xtv");

    assert_eq!(client.create(&path, 100, 4096, &[(0, 8, 0)]), 0);
    assert_eq!(client.open(&path), 0);
    assert_eq!(client.insert(record(1)), 0);

    let response = client.get(OP_GET_EQUAL, 0, 1u64.to_le_bytes().to_vec(), 0);
    assert_eq!(response.status.as_u16(), 0);
    assert_eq!(response.data.len(), 100);
    assert_eq!(&response.data[..8], &1u64.to_le_bytes());
    assert_eq!(response.key, 1u64.to_le_bytes().to_vec());
}

// =============================================================================
// Scenario 2: duplicate insert on a unique key changes nothing.
// =============================================================================

#[test]
fn test_duplicate_on_unique_key() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "s2.xtv");

    client.create(&path, 100, 4096, &[(0, 8, 0)]);
    client.open(&path);
    assert_eq!(client.insert(record(1)), 0);
    assert_eq!(client.insert(record(1)), 5);

    let stat = client.stat();
    assert_eq!(stat.status.as_u16(), 0);
    assert_eq!(stat_record_count(&stat), 1);
}

// =============================================================================
// Scenario 3: ordered iteration over keys inserted out of order.
// =============================================================================

#[test]
fn test_ordered_iteration() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "s3.xtv");

    client.create(&path, 100, 4096, &[(0, 8, 0)]);
    client.open(&path);
    for key in [3u64, 1, 5, 2, 4] {
        assert_eq!(client.insert(record(key)), 0);
    }

    let first = client.get(OP_GET_FIRST, 0, Vec::new(), 0);
    assert_eq!(first.status.as_u16(), 0);
    assert_eq!(&first.data[..8], &1u64.to_le_bytes());

    for expected in [2u64, 3, 4, 5] {
        let next = client.get(OP_GET_NEXT, 0, Vec::new(), 0);
        assert_eq!(next.status.as_u16(), 0);
        assert_eq!(&next.data[..8], &expected.to_le_bytes());
    }

    let past_end = client.get(OP_GET_NEXT, 0, Vec::new(), 0);
    assert_eq!(past_end.status.as_u16(), 9);

    // The cursor is unpositioned now; Update must fail with status 8.
    let update = client.call(Request {
        operation: OP_UPDATE,
        data: record(9),
        ..Default::default()
    });
    assert_eq!(update.status.as_u16(), 8);
}

// =============================================================================
// Scenario 4: transaction abort erases the transaction's inserts.
// =============================================================================

#[test]
fn test_transaction_abort() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "s4.xtv");

    client.create(&path, 100, 4096, &[(0, 8, 0)]);
    client.open(&path);
    assert_eq!(client.insert(record(1)), 0);
    let before = stat_record_count(&client.stat());

    assert_eq!(
        client
            .call(Request {
                operation: OP_BEGIN,
                lock_bias: 100,
                ..Default::default()
            })
            .status
            .as_u16(),
        0
    );
    assert_eq!(client.insert(record(10)), 0);
    assert_eq!(client.insert(record(11)), 0);
    assert_eq!(client.simple(OP_ABORT), 0);

    let lookup = client.get(OP_GET_EQUAL, 0, 10u64.to_le_bytes().to_vec(), 0);
    assert_eq!(lookup.status.as_u16(), 4);
    assert_eq!(stat_record_count(&client.stat()), before);

    // And the survivors are still reachable.
    let lookup = client.get(OP_GET_EQUAL, 0, 1u64.to_le_bytes().to_vec(), 0);
    assert_eq!(lookup.status.as_u16(), 0);
}

// =============================================================================
// Scenario 5: deadlock between two sessions aborts the younger one.
// =============================================================================

#[test]
fn test_deadlock_detection() {
    let (dir, engine) = engine();
    let path = path_in(&dir, "s5.xtv");

    let mut setup = Client::new(&engine, 1);
    setup.create(&path, 100, 4096, &[(0, 8, 0)]);
    setup.open(&path);
    setup.insert(record_with_marker(1, 0));
    setup.insert(record_with_marker(2, 0));
    setup.close();

    let mut s1 = Client::new(&engine, 2);
    let mut s2 = Client::new(&engine, 3);
    assert_eq!(s1.open(&path), 0);
    assert_eq!(s2.open(&path), 0);

    // Each session updates its own record inside a transaction,
    // acquiring the record's exclusive lock.
    assert_eq!(s1.simple(OP_BEGIN), 0);
    assert_eq!(s1.get(OP_GET_EQUAL, 0, 1u64.to_le_bytes().to_vec(), 0).status.as_u16(), 0);
    assert_eq!(
        s1.call(Request {
            operation: OP_UPDATE,
            data: record_with_marker(1, 0x11),
            ..Default::default()
        })
        .status
        .as_u16(),
        0
    );

    assert_eq!(s2.simple(OP_BEGIN), 0);
    assert_eq!(s2.get(OP_GET_EQUAL, 0, 2u64.to_le_bytes().to_vec(), 0).status.as_u16(), 0);
    assert_eq!(
        s2.call(Request {
            operation: OP_UPDATE,
            data: record_with_marker(2, 0x22),
            ..Default::default()
        })
        .status
        .as_u16(),
        0
    );

    // Now each waits for the other's record: a cycle.
    let t1 = std::thread::spawn(move || {
        let status = s1.get(OP_GET_EQUAL, 0, 2u64.to_le_bytes().to_vec(), 100).status.as_u16();
        (s1, status)
    });
    let t2 = std::thread::spawn(move || {
        let status = s2.get(OP_GET_EQUAL, 0, 1u64.to_le_bytes().to_vec(), 100).status.as_u16();
        (s2, status)
    });

    let (mut s1, r1) = t1.join().unwrap();
    let (mut s2, r2) = t2.join().unwrap();

    let deadlocked = [r1, r2].iter().filter(|&&s| s == 78).count();
    assert_eq!(deadlocked, 1, "exactly one session loses ({r1}, {r2})");

    // The victim's End reports the deadlock; the survivor commits.
    let (e1, e2) = (s1.simple(OP_END), s2.simple(OP_END));
    assert!(
        (r1 == 78 && e1 == 78 && e2 == 0) || (r2 == 78 && e2 == 78 && e1 == 0),
        "end statuses: {e1}, {e2}"
    );

    // The victim's update vanished; the survivor's is durable.
    let mut check = Client::new(&engine, 4);
    check.open(&path);
    let a = check.get(OP_GET_EQUAL, 0, 1u64.to_le_bytes().to_vec(), 0);
    let b = check.get(OP_GET_EQUAL, 0, 2u64.to_le_bytes().to_vec(), 0);
    if r1 == 78 {
        assert_eq!(a.data[50], 0x00);
        assert_eq!(b.data[50], 0x22);
    } else {
        assert_eq!(a.data[50], 0x11);
        assert_eq!(b.data[50], 0x00);
    }
}

// =============================================================================
// Scenario 6: a commit interrupted mid-flush rolls back on reopen.
// =============================================================================

#[test]
fn test_crash_consistency() {
    let (dir, engine) = engine();
    let path = path_in(&dir, "s6.xtv");

    let mut client = Client::new(&engine, 1);
    client.create(&path, 100, 4096, &[(0, 8, 0)]);
    client.open(&path);
    for key in 1..=3u64 {
        assert_eq!(client.insert(record(key)), 0);
    }
    assert_eq!(client.close(), 0);

    // Simulate a crash: a transaction inserted a fourth record, its
    // undo journal is durable, the dirty pages were flushed (as a
    // neighbouring commit would), and then the process died before the
    // transaction ever committed.
    {
        use xtrieve_storage::btree::BTree;
        use xtrieve_storage::record::RecordStore;
        use xtrieve_storage::PageStore;
        use xtrieve_txn::journal::{TxnJournal, UndoRecord};

        let store = PageStore::open(std::path::Path::new(&path), true, 64).unwrap();
        let (rid, seq) = RecordStore::new(&store).insert(&record(4)).unwrap();
        BTree::new(&store, 0)
            .unwrap()
            .insert(&4u64.to_le_bytes(), seq, rid)
            .unwrap();
        store.publish_fcr().unwrap();

        let mut journal = TxnJournal::create(store.path(), 99, 1).unwrap();
        journal.append(&UndoRecord::Insert { record: rid }).unwrap();
        drop(journal);

        store.flush().unwrap();
        store.sync().unwrap();
        // Dropped here: the journal stays behind, the transaction never
        // ended.
    }

    let mut reopened = Client::new(&engine, 2);
    assert_eq!(reopened.open(&path), 0);
    let stat = reopened.stat();
    assert_eq!(stat_record_count(&stat), 3);

    // The unfinished insert is gone from the index; the committed three
    // survive.
    let gone = reopened.get(OP_GET_EQUAL, 0, 4u64.to_le_bytes().to_vec(), 0);
    assert_eq!(gone.status.as_u16(), 4);
    for key in 1..=3u64 {
        let found = reopened.get(OP_GET_EQUAL, 0, key.to_le_bytes().to_vec(), 0);
        assert_eq!(found.status.as_u16(), 0);
    }
}

// =============================================================================
// Boundary behavior and smaller properties.
// =============================================================================

#[test]
fn test_page_fills_then_grows() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "fill.xtv");

    // 512-byte pages hold only a few 100-byte records each, so this
    // spills across several data pages.
    client.create(&path, 100, 512, &[(0, 8, 0)]);
    client.open(&path);
    for key in 0..10u64 {
        assert_eq!(client.insert(record(key)), 0, "insert {key}");
    }
    assert_eq!(stat_record_count(&client.stat()), 10);
}

#[test]
fn test_open_close_reopen_preserves_count() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "counts.xtv");

    client.create(&path, 100, 1024, &[(0, 8, 0)]);
    client.open(&path);
    for key in 0..6u64 {
        client.insert(record(key));
    }
    // Delete two of them.
    for key in [1u64, 3] {
        let got = client.get(OP_GET_EQUAL, 0, key.to_le_bytes().to_vec(), 0);
        assert_eq!(got.status.as_u16(), 0);
        assert_eq!(client.simple(OP_DELETE), 0);
    }
    client.close();

    let mut again = Client::new(&engine, 2);
    again.open(&path);
    assert_eq!(stat_record_count(&again.stat()), 4);
    let gone = again.get(OP_GET_EQUAL, 0, 3u64.to_le_bytes().to_vec(), 0);
    assert_eq!(gone.status.as_u16(), 4);
}

#[test]
fn test_range_positioning() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "range.xtv");

    client.create(&path, 100, 1024, &[(0, 8, 0)]);
    client.open(&path);
    for key in [10u64, 20, 30, 40] {
        client.insert(record(key));
    }

    let gt = client.get(OP_GET_GREATER, 0, 20u64.to_le_bytes().to_vec(), 0);
    assert_eq!(&gt.data[..8], &30u64.to_le_bytes());

    let le = client.get(OP_GET_LE, 0, 25u64.to_le_bytes().to_vec(), 0);
    assert_eq!(&le.data[..8], &20u64.to_le_bytes());

    let last = client.get(OP_GET_LAST, 0, Vec::new(), 0);
    assert_eq!(&last.data[..8], &40u64.to_le_bytes());

    let prev = client.get(OP_GET_PREV, 0, Vec::new(), 0);
    assert_eq!(&prev.data[..8], &30u64.to_le_bytes());

    // Walking off the front reports end-of-file.
    client.get(OP_GET_PREV, 0, Vec::new(), 0);
    client.get(OP_GET_PREV, 0, Vec::new(), 0);
    let off_front = client.get(OP_GET_PREV, 0, Vec::new(), 0);
    assert_eq!(off_front.status.as_u16(), 9);
}

#[test]
fn test_physical_steps() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "steps.xtv");

    client.create(&path, 100, 1024, &[(0, 8, 0)]);
    client.open(&path);
    for key in [5u64, 1, 9] {
        client.insert(record(key));
    }

    // Physical order is insertion order here (no deletes yet).
    let first = client.call(Request {
        operation: OP_STEP_FIRST,
        ..Default::default()
    });
    assert_eq!(first.status.as_u16(), 0);
    assert_eq!(&first.data[..8], &5u64.to_le_bytes());

    let next = client.call(Request {
        operation: OP_STEP_NEXT,
        ..Default::default()
    });
    assert_eq!(&next.data[..8], &1u64.to_le_bytes());

    let next = client.call(Request {
        operation: OP_STEP_NEXT,
        ..Default::default()
    });
    assert_eq!(&next.data[..8], &9u64.to_le_bytes());

    let done = client.call(Request {
        operation: OP_STEP_NEXT,
        ..Default::default()
    });
    assert_eq!(done.status.as_u16(), 9);
}

#[test]
fn test_record_locks_between_sessions() {
    let (dir, engine) = engine();
    let path = path_in(&dir, "locks.xtv");

    let mut s1 = Client::new(&engine, 1);
    s1.create(&path, 100, 1024, &[(0, 8, 0)]);
    s1.open(&path);
    s1.insert(record(1));

    let mut s2 = Client::new(&engine, 2);
    s2.open(&path);

    // S1 reads with a no-wait single lock.
    let locked = s1.get(OP_GET_EQUAL, 0, 1u64.to_le_bytes().to_vec(), 200);
    assert_eq!(locked.status.as_u16(), 0);

    // S2 cannot read it, locked or unlocked bias.
    assert_eq!(
        s2.get(OP_GET_EQUAL, 0, 1u64.to_le_bytes().to_vec(), 200).status.as_u16(),
        84
    );
    assert_eq!(
        s2.get(OP_GET_EQUAL, 0, 1u64.to_le_bytes().to_vec(), 0).status.as_u16(),
        84
    );

    // Unlock-all releases it.
    assert_eq!(
        s1.call(Request {
            operation: OP_UNLOCK,
            lock_bias: (-1i16) as u16,
            ..Default::default()
        })
        .status
        .as_u16(),
        0
    );
    assert_eq!(
        s2.get(OP_GET_EQUAL, 0, 1u64.to_le_bytes().to_vec(), 0).status.as_u16(),
        0
    );
}

#[test]
fn test_unlock_current_while_unpositioned() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "u.xtv");

    client.create(&path, 100, 1024, &[(0, 8, 0)]);
    client.open(&path);

    let response = client.call(Request {
        operation: OP_UNLOCK,
        lock_bias: (-2i16) as u16,
        ..Default::default()
    });
    assert_eq!(response.status.as_u16(), 8);
}

#[test]
fn test_stale_position_block_rejected() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "stale.xtv");

    client.create(&path, 100, 1024, &[(0, 8, 0)]);
    client.open(&path);
    let stale = client.block.clone();
    client.close();

    // The old block no longer resolves.
    client.block = stale;
    assert_eq!(client.stat().status.as_u16(), 3);
}

#[test]
fn test_invalid_opcode_and_key_number() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "bad.xtv");

    client.create(&path, 100, 1024, &[(0, 8, 0)]);
    client.open(&path);

    assert_eq!(client.simple(200), 1);

    let bad_key = client.get(OP_GET_EQUAL, 5, 1u64.to_le_bytes().to_vec(), 0);
    assert_eq!(bad_key.status.as_u16(), 6);
}

#[test]
fn test_transaction_status_codes() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "txn.xtv");

    client.create(&path, 100, 1024, &[(0, 8, 0)]);
    client.open(&path);

    assert_eq!(client.simple(OP_END), 37);
    assert_eq!(client.simple(OP_BEGIN), 0);
    assert_eq!(client.simple(OP_BEGIN), 36);
    assert_eq!(client.simple(OP_END), 0);
}

#[test]
fn test_close_inside_transaction_aborts() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "closeabort.xtv");

    client.create(&path, 100, 1024, &[(0, 8, 0)]);
    client.open(&path);
    assert_eq!(client.simple(OP_BEGIN), 0);
    assert_eq!(client.insert(record(42)), 0);
    assert_eq!(client.close(), 0);

    // The transaction died with the close.
    assert_eq!(client.simple(OP_END), 37);

    let mut check = Client::new(&engine, 2);
    check.open(&path);
    assert_eq!(stat_record_count(&check.stat()), 0);
}

#[test]
fn test_variable_length_tail_roundtrip() {
    let (dir, engine) = engine();
    let mut client = Client::new(&engine, 1);
    let path = path_in(&dir, "var.xtv");

    client.create(&path, 100, 512, &[(0, 8, 0)]);
    client.open(&path);

    let mut data = record(77);
    data.extend((0..3000u32).map(|i| (i % 253) as u8));
    assert_eq!(client.insert(data.clone()), 0);

    let got = client.get(OP_GET_EQUAL, 0, 77u64.to_le_bytes().to_vec(), 0);
    assert_eq!(got.status.as_u16(), 0);
    assert_eq!(got.data, data);
}
