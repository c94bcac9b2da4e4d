//! On-disk storage for Xtrieve files.
//!
//! A file is a single ordered sequence of fixed-size pages. Page 0 is the
//! File Control Record; every other page is allocated on demand as a data
//! page, an index page, or a variable-length overflow page, or sits on the
//! free chain. This crate provides the layers from raw positioned I/O up
//! to the B+ tree:
//!
//! - [`file`]: positioned reads and writes on the backing file
//! - [`page`]: page header, FCR, slotted data pages, overflow pages
//! - [`cache`]: per-file page cache with pinning and LRU eviction
//! - [`store`]: page allocation, free chain, undo capture, flush ordering
//! - [`record`]: record encoding over data and overflow pages
//! - [`btree`]: one ordered index per declared key

pub mod btree;
pub mod cache;
pub mod file;
pub mod page;
pub mod record;
pub mod store;
pub mod undo;

pub use store::PageStore;
