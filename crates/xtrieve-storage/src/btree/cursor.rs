//! Tree cursors.
//!
//! A cursor is a `(leaf page, entry index)` pair. Advancing by one entry
//! crosses sibling links when it steps off either end of the leaf; the
//! walk skips any transiently empty leaf it encounters.

use xtrieve_common::types::PageId;
use xtrieve_common::{XtrieveError, XtrieveResult};

use super::node::{LeafEntry, NodeContents};
use super::tree::BTree;

/// Position of one entry in a tree's leaf level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeCursor {
    /// Leaf page holding the entry.
    pub leaf: PageId,
    /// Entry index within the leaf.
    pub index: usize,
}

impl TreeCursor {
    /// Creates a cursor.
    #[inline]
    #[must_use]
    pub fn new(leaf: PageId, index: usize) -> Self {
        Self { leaf, index }
    }

    /// Reads the entry under the cursor.
    pub fn entry(&self, tree: &BTree<'_>) -> XtrieveResult<LeafEntry> {
        let node = tree.load(self.leaf)?;
        node.leaf_entries()
            .get(self.index)
            .cloned()
            .ok_or_else(|| XtrieveError::corrupt("cursor points past leaf end"))
    }

    /// The position one entry forward, crossing leaf siblings.
    pub fn next(&self, tree: &BTree<'_>) -> XtrieveResult<Option<TreeCursor>> {
        let node = tree.load(self.leaf)?;
        if self.index + 1 < node.len() {
            return Ok(Some(TreeCursor::new(self.leaf, self.index + 1)));
        }

        let NodeContents::Leaf { next, .. } = &node.contents else {
            return Err(XtrieveError::corrupt("cursor on non-leaf page"));
        };
        let mut next = *next;
        while next.is_some() {
            let sibling = tree.load(next)?;
            if !sibling.is_empty() {
                return Ok(Some(TreeCursor::new(next, 0)));
            }
            let NodeContents::Leaf { next: n, .. } = &sibling.contents else {
                return Err(XtrieveError::corrupt("sibling link leaves the leaf level"));
            };
            next = *n;
        }
        Ok(None)
    }

    /// The position one entry backward, crossing leaf siblings.
    pub fn prev(&self, tree: &BTree<'_>) -> XtrieveResult<Option<TreeCursor>> {
        if self.index > 0 {
            return Ok(Some(TreeCursor::new(self.leaf, self.index - 1)));
        }

        let node = tree.load(self.leaf)?;
        let NodeContents::Leaf { prev, .. } = &node.contents else {
            return Err(XtrieveError::corrupt("cursor on non-leaf page"));
        };
        let mut prev = *prev;
        while prev.is_some() {
            let sibling = tree.load(prev)?;
            if !sibling.is_empty() {
                return Ok(Some(TreeCursor::new(prev, sibling.len() - 1)));
            }
            let NodeContents::Leaf { prev: p, .. } = &sibling.contents else {
                return Err(XtrieveError::corrupt("sibling link leaves the leaf level"));
            };
            prev = *p;
        }
        Ok(None)
    }
}
