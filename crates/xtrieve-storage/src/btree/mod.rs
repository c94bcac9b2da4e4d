//! B+ tree indexes.
//!
//! One independent tree per declared key. Leaves hold `(key, record id,
//! insertion sequence)` entries chained through bidirectional sibling
//! links; internal nodes hold `(key, sequence, child)` separators. The
//! insertion sequence is part of every comparison, which makes the
//! ordering total: duplicate keys enumerate in insertion order and a
//! cursor can always re-find its position after a split.

pub mod cursor;
pub mod node;
pub mod tree;

pub use cursor::TreeCursor;
pub use node::{IndexNode, InternalEntry, LeafEntry, NodeContents};
pub use tree::BTree;
