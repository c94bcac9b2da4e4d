//! Page formats.
//!
//! Every page begins with the same 24-byte header; the body depends on the
//! page kind. See the submodules for the per-kind layouts.

pub mod checksum;
pub mod fcr;
pub mod header;
pub mod kinds;
pub mod overflow;
pub mod slotted;

pub use checksum::{compute_page_checksum, verify_checksum};
pub use fcr::FileControlRecord;
pub use header::{PageHeader, PageHeaderRef, PAGE_HEADER_SIZE};
pub use kinds::PageKind;
pub use overflow::OverflowPage;
pub use slotted::{DataPage, SlotId, SLOT_SIZE};
