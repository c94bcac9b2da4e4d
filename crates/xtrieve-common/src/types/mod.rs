//! Core types shared across the engine.

pub mod ids;
pub mod keys;

pub use ids::{PageId, RecordId, SessionId, TxnId};
pub use keys::{KeyChain, KeyDescriptor, KeyFlags, KeyType};
