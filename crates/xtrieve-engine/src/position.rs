//! Position blocks.
//!
//! The 128-byte handle a client echoes verbatim with every request. It
//! hides the server-side identifiers: which open handle the request is
//! for, the generation stamped at Open (so a stale block from before a
//! reconnect is rejected), and the cursor: key number, current record
//! address, its insertion sequence, and the current key value. Keeping
//! the key value plus sequence rather than a leaf slot means the cursor
//! survives page splits: Get Next simply re-seeks past `(key, seq)`.
//!
//! Layout:
//!
//! ```text
//! 0    2   magic 0x5058 ("PX")
//! 2    4   handle id
//! 6    4   generation
//! 10   2   key number (i16)
//! 12   1   cursor state (0 unpositioned, 1 positioned)
//! 13   1   key value length
//! 14   4   record page
//! 18   2   record slot
//! 20   8   insertion sequence
//! 28   100 key value bytes, zero padded
//! ```

use xtrieve_common::constants::POSITION_BLOCK_SIZE;
use xtrieve_common::types::{PageId, RecordId};

const BLOCK_MAGIC: u16 = 0x5058;

/// Longest key value the block can carry.
pub const MAX_CURSOR_KEY: usize = 100;

/// Whether the cursor names a current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CursorState {
    /// No current record; positioning operations only.
    Unpositioned = 0,
    /// A current record exists.
    Positioned = 1,
}

/// Decoded position block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionBlock {
    /// Open-handle id assigned at Open.
    pub handle: u32,
    /// Generation stamped at Open; must match on every use.
    pub generation: u32,
    /// Key number the cursor was established on.
    pub key_number: i16,
    /// Cursor state.
    pub state: CursorState,
    /// Current record address (meaningful when positioned).
    pub record: RecordId,
    /// Current record's insertion sequence.
    pub sequence: u64,
    /// Current key value under `key_number`.
    pub key_value: Vec<u8>,
}

impl PositionBlock {
    /// A fresh block for a newly opened handle.
    #[must_use]
    pub fn fresh(handle: u32, generation: u32) -> Self {
        Self {
            handle,
            generation,
            key_number: 0,
            state: CursorState::Unpositioned,
            record: RecordId::new(PageId::NONE, 0),
            sequence: 0,
            key_value: Vec::new(),
        }
    }

    /// Positions the cursor on a record.
    pub fn position(&mut self, key_number: i16, record: RecordId, sequence: u64, key_value: &[u8]) {
        self.key_number = key_number;
        self.state = CursorState::Positioned;
        self.record = record;
        self.sequence = sequence;
        self.key_value = key_value[..key_value.len().min(MAX_CURSOR_KEY)].to_vec();
    }

    /// Clears the cursor, keeping the handle and key number.
    pub fn unposition(&mut self) {
        self.state = CursorState::Unpositioned;
        self.record = RecordId::new(PageId::NONE, 0);
        self.sequence = 0;
        self.key_value.clear();
    }

    /// True when a current record exists.
    #[inline]
    #[must_use]
    pub fn is_positioned(&self) -> bool {
        self.state == CursorState::Positioned
    }

    /// Encodes into the fixed 128-byte wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut block = vec![0u8; POSITION_BLOCK_SIZE];
        block[0..2].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
        block[2..6].copy_from_slice(&self.handle.to_le_bytes());
        block[6..10].copy_from_slice(&self.generation.to_le_bytes());
        block[10..12].copy_from_slice(&self.key_number.to_le_bytes());
        block[12] = self.state as u8;
        let key_len = self.key_value.len().min(MAX_CURSOR_KEY);
        block[13] = key_len as u8;
        block[14..18].copy_from_slice(&self.record.page.as_u32().to_le_bytes());
        block[18..20].copy_from_slice(&self.record.slot.to_le_bytes());
        block[20..28].copy_from_slice(&self.sequence.to_le_bytes());
        block[28..28 + key_len].copy_from_slice(&self.key_value[..key_len]);
        block
    }

    /// Decodes an echoed block. `None` when the bytes were never a block
    /// this server issued.
    #[must_use]
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < POSITION_BLOCK_SIZE {
            return None;
        }
        if u16::from_le_bytes(raw[0..2].try_into().unwrap()) != BLOCK_MAGIC {
            return None;
        }

        let handle = u32::from_le_bytes(raw[2..6].try_into().unwrap());
        let generation = u32::from_le_bytes(raw[6..10].try_into().unwrap());
        let key_number = i16::from_le_bytes(raw[10..12].try_into().unwrap());
        let state = match raw[12] {
            1 => CursorState::Positioned,
            _ => CursorState::Unpositioned,
        };
        let key_len = (raw[13] as usize).min(MAX_CURSOR_KEY);
        let page = PageId::new(u32::from_le_bytes(raw[14..18].try_into().unwrap()));
        let slot = u16::from_le_bytes(raw[18..20].try_into().unwrap());
        let sequence = u64::from_le_bytes(raw[20..28].try_into().unwrap());
        let key_value = raw[28..28 + key_len].to_vec();

        Some(Self {
            handle,
            generation,
            key_number,
            state,
            record: RecordId::new(page, slot),
            sequence,
            key_value,
        })
    }
}
