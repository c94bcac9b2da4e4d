//! B+ tree operations.
//!
//! All comparisons use the pair `(key, insertion sequence)`, which is
//! unique per entry: duplicates under a non-unique key order by their
//! sequence, and every separator names an exact boundary. Leaves split at
//! the median and merge or redistribute below one quarter full; the root
//! collapses when an internal root loses its last separator.

use std::cmp::Ordering;

use xtrieve_common::types::{KeyChain, PageId, RecordId};
use xtrieve_common::{StatusCode, XtrieveError, XtrieveResult};

use crate::page::PageKind;
use crate::store::PageStore;

use super::cursor::TreeCursor;
use super::node::{IndexNode, InternalEntry, LeafEntry, NodeContents};

/// One B+ tree, bound to a key number of an open file.
pub struct BTree<'a> {
    store: &'a PageStore,
    key_number: usize,
    chain: KeyChain,
    key_len: usize,
    page_size: u16,
}

impl<'a> BTree<'a> {
    /// Opens the tree for `key_number`.
    pub fn new(store: &'a PageStore, key_number: usize) -> XtrieveResult<Self> {
        let chain = store
            .fcr()
            .key(key_number)
            .cloned()
            .ok_or(XtrieveError::Status(StatusCode::InvalidKeyNumber))?;
        let key_len = chain.total_length();
        Ok(Self {
            store,
            key_number,
            chain,
            key_len,
            page_size: store.page_size(),
        })
    }

    /// The key chain this tree orders by.
    #[inline]
    pub fn chain(&self) -> &KeyChain {
        &self.chain
    }

    /// Declared key length.
    #[inline]
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    fn root(&self) -> PageId {
        self.store.fcr().index_roots[self.key_number]
    }

    fn set_root(&self, root: PageId) {
        self.store.fcr_mut().index_roots[self.key_number] = root;
    }

    pub(crate) fn load(&self, page_id: PageId) -> XtrieveResult<IndexNode> {
        let page = self.store.read_owned(page_id)?;
        IndexNode::decode(&page, self.key_len)
    }

    fn write(&self, node: &IndexNode) -> XtrieveResult<()> {
        self.store.write_page(node.page_id, node.encode(self.page_size))
    }

    fn cmp_entry(&self, a_key: &[u8], a_seq: u64, b_key: &[u8], b_seq: u64) -> Ordering {
        self.chain.compare(a_key, b_key).then(a_seq.cmp(&b_seq))
    }

    fn min_fill(&self, node: &IndexNode) -> usize {
        (node.capacity(self.page_size) / 4).max(1)
    }

    /// Child position for `(key, seq)` inside an internal node:
    /// 0 = leftmost child, `i + 1` = child of `entries[i]`.
    fn child_position(&self, node: &IndexNode, key: &[u8], seq: u64) -> usize {
        let NodeContents::Internal { entries, .. } = &node.contents else {
            unreachable!("child_position on leaf");
        };
        let mut pos = 0;
        for (i, entry) in entries.iter().enumerate() {
            if self.cmp_entry(&entry.key, entry.sequence, key, seq) != Ordering::Greater {
                pos = i + 1;
            } else {
                break;
            }
        }
        pos
    }

    fn child_at(node: &IndexNode, pos: usize) -> PageId {
        let NodeContents::Internal { leftmost, entries } = &node.contents else {
            unreachable!("child_at on leaf");
        };
        if pos == 0 {
            *leftmost
        } else {
            entries[pos - 1].child
        }
    }

    fn descend(&self, key: &[u8], seq: u64) -> XtrieveResult<(Vec<(IndexNode, usize)>, IndexNode)> {
        let mut path = Vec::new();
        let mut current = self.load(self.root())?;
        while !current.is_leaf() {
            let pos = self.child_position(&current, key, seq);
            let child = Self::child_at(&current, pos);
            path.push((current, pos));
            current = self.load(child)?;
        }
        Ok((path, current))
    }

    /// Index of the first leaf entry `>= (key, seq)`.
    fn leaf_lower_bound(&self, leaf: &IndexNode, key: &[u8], seq: u64) -> usize {
        leaf.leaf_entries()
            .partition_point(|e| self.cmp_entry(&e.key, e.sequence, key, seq) == Ordering::Less)
    }

    // =========================================================================
    // Positioning
    // =========================================================================

    /// Cursor at the first entry `>= (key, seq)`, if any.
    pub fn lower_bound(&self, key: &[u8], seq: u64) -> XtrieveResult<Option<TreeCursor>> {
        if !self.root().is_some() {
            return Ok(None);
        }
        let (_, leaf) = self.descend(key, seq)?;
        let index = self.leaf_lower_bound(&leaf, key, seq);
        if index < leaf.len() {
            return Ok(Some(TreeCursor::new(leaf.page_id, index)));
        }

        // Past this leaf's last entry: the bound is the next leaf's first.
        let NodeContents::Leaf { next, .. } = &leaf.contents else {
            unreachable!();
        };
        let mut next = *next;
        while next.is_some() {
            let sibling = self.load(next)?;
            if !sibling.is_empty() {
                return Ok(Some(TreeCursor::new(sibling.page_id, 0)));
            }
            let NodeContents::Leaf { next: n, .. } = &sibling.contents else {
                unreachable!();
            };
            next = *n;
        }
        Ok(None)
    }

    /// Cursor on the leftmost entry.
    pub fn first(&self) -> XtrieveResult<Option<TreeCursor>> {
        if !self.root().is_some() {
            return Ok(None);
        }
        let mut node = self.load(self.root())?;
        while !node.is_leaf() {
            node = self.load(Self::child_at(&node, 0))?;
        }
        if node.is_empty() {
            return Ok(None);
        }
        Ok(Some(TreeCursor::new(node.page_id, 0)))
    }

    /// Cursor on the rightmost entry.
    pub fn last(&self) -> XtrieveResult<Option<TreeCursor>> {
        if !self.root().is_some() {
            return Ok(None);
        }
        let mut node = self.load(self.root())?;
        while !node.is_leaf() {
            node = self.load(Self::child_at(&node, node.len()))?;
        }
        if node.is_empty() {
            return Ok(None);
        }
        let index = node.len() - 1;
        Ok(Some(TreeCursor::new(node.page_id, index)))
    }

    /// True if any entry carries exactly this key value.
    pub fn contains_key(&self, key: &[u8]) -> XtrieveResult<bool> {
        match self.lower_bound(key, 0)? {
            Some(cursor) => {
                let entry = cursor.entry(self)?;
                Ok(self.chain.compare(&entry.key, key) == Ordering::Equal)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts an entry. Fails with `DuplicateKey` when the key already
    /// exists and the chain forbids duplicates.
    pub fn insert(&self, key: &[u8], sequence: u64, record: RecordId) -> XtrieveResult<()> {
        debug_assert_eq!(key.len(), self.key_len);

        if !self.chain.allows_duplicates() && self.contains_key(key)? {
            return Err(StatusCode::DuplicateKey.into());
        }

        if !self.root().is_some() {
            let page_id = self.store.allocate(PageKind::Index)?;
            let mut leaf = IndexNode::new_leaf(page_id, self.key_number as u16, self.key_len);
            leaf.leaf_entries_mut().push(LeafEntry {
                key: key.to_vec(),
                record,
                sequence,
            });
            self.write(&leaf)?;
            self.set_root(page_id);
            return Ok(());
        }

        let (path, mut leaf) = self.descend(key, sequence)?;
        let index = self.leaf_lower_bound(&leaf, key, sequence);
        leaf.leaf_entries_mut().insert(
            index,
            LeafEntry {
                key: key.to_vec(),
                record,
                sequence,
            },
        );

        if leaf.len() <= leaf.capacity(self.page_size) {
            return self.write(&leaf);
        }
        self.split_leaf(path, leaf)
    }

    fn split_leaf(&self, path: Vec<(IndexNode, usize)>, mut leaf: IndexNode) -> XtrieveResult<()> {
        let right_page = self.store.allocate(PageKind::Index)?;

        let mid = leaf.len() / 2;
        let right_entries = leaf.leaf_entries_mut().split_off(mid);
        let separator = (right_entries[0].key.clone(), right_entries[0].sequence);

        let NodeContents::Leaf { next: old_next, .. } = &leaf.contents else {
            unreachable!();
        };
        let old_next = *old_next;

        let right = IndexNode {
            page_id: right_page,
            key_number: self.key_number as u16,
            key_len: self.key_len,
            contents: NodeContents::Leaf {
                prev: leaf.page_id,
                next: old_next,
                entries: right_entries,
            },
        };

        if let NodeContents::Leaf { next, .. } = &mut leaf.contents {
            *next = right_page;
        }

        self.write(&leaf)?;
        self.write(&right)?;

        if old_next.is_some() {
            let mut after = self.load(old_next)?;
            if let NodeContents::Leaf { prev, .. } = &mut after.contents {
                *prev = right_page;
            }
            self.write(&after)?;
        }

        self.insert_separator(path, leaf.page_id, separator, right_page)
    }

    fn insert_separator(
        &self,
        mut path: Vec<(IndexNode, usize)>,
        mut left_page: PageId,
        mut separator: (Vec<u8>, u64),
        mut right_page: PageId,
    ) -> XtrieveResult<()> {
        loop {
            let Some((mut parent, pos)) = path.pop() else {
                // The split reached the old root; grow the tree by one level.
                let new_root = self.store.allocate(PageKind::Index)?;
                let mut root = IndexNode::new_internal(
                    new_root,
                    self.key_number as u16,
                    self.key_len,
                    left_page,
                );
                if let NodeContents::Internal { entries, .. } = &mut root.contents {
                    entries.push(InternalEntry {
                        key: separator.0,
                        sequence: separator.1,
                        child: right_page,
                    });
                }
                self.write(&root)?;
                self.set_root(new_root);
                return Ok(());
            };

            let NodeContents::Internal { entries, .. } = &mut parent.contents else {
                unreachable!();
            };
            entries.insert(
                pos,
                InternalEntry {
                    key: separator.0,
                    sequence: separator.1,
                    child: right_page,
                },
            );

            if parent.len() <= parent.capacity(self.page_size) {
                return self.write(&parent);
            }

            // Split the internal node; its median separator moves up.
            let new_right_page = self.store.allocate(PageKind::Index)?;
            let NodeContents::Internal { entries, .. } = &mut parent.contents else {
                unreachable!();
            };
            let mid = entries.len() / 2;
            let promoted = entries.remove(mid);
            let right_entries = entries.split_off(mid);

            let right = IndexNode {
                page_id: new_right_page,
                key_number: self.key_number as u16,
                key_len: self.key_len,
                contents: NodeContents::Internal {
                    leftmost: promoted.child,
                    entries: right_entries,
                },
            };

            self.write(&parent)?;
            self.write(&right)?;

            left_page = parent.page_id;
            separator = (promoted.key, promoted.sequence);
            right_page = new_right_page;
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Removes the entry `(key, sequence)`. Returns whether it was found.
    pub fn delete(&self, key: &[u8], sequence: u64, record: RecordId) -> XtrieveResult<bool> {
        debug_assert_eq!(key.len(), self.key_len);

        if !self.root().is_some() {
            return Ok(false);
        }

        let (path, mut leaf) = self.descend(key, sequence)?;
        let index = self.leaf_lower_bound(&leaf, key, sequence);
        {
            let entries = leaf.leaf_entries();
            let Some(entry) = entries.get(index) else {
                return Ok(false);
            };
            if self.cmp_entry(&entry.key, entry.sequence, key, sequence) != Ordering::Equal {
                return Ok(false);
            }
            if entry.record != record {
                return Err(XtrieveError::corrupt("index entry names unexpected record"));
            }
        }
        leaf.leaf_entries_mut().remove(index);

        if path.is_empty() {
            if leaf.is_empty() {
                self.store.free(leaf.page_id)?;
                self.set_root(PageId::NONE);
                return Ok(true);
            }
            self.write(&leaf)?;
            return Ok(true);
        }

        if leaf.len() >= self.min_fill(&leaf) {
            self.write(&leaf)?;
            return Ok(true);
        }

        self.rebalance(path, leaf)?;
        Ok(true)
    }

    fn rebalance(&self, mut path: Vec<(IndexNode, usize)>, node: IndexNode) -> XtrieveResult<()> {
        let (mut parent, pos) = path.pop().expect("rebalance needs a parent");

        let merged = if pos > 0 {
            let left_page = Self::child_at(&parent, pos - 1);
            let mut left = self.load(left_page)?;
            if left.len() > self.min_fill(&left) {
                self.borrow_from_left(&mut parent, pos, &mut left, node)?;
                return self.finish_parent(path, parent);
            }
            self.merge_nodes(&mut parent, pos - 1, left, node)?;
            true
        } else {
            let right_page = Self::child_at(&parent, pos + 1);
            let mut right = self.load(right_page)?;
            if right.len() > self.min_fill(&right) {
                self.borrow_from_right(&mut parent, pos, node, &mut right)?;
                return self.finish_parent(path, parent);
            }
            self.merge_nodes(&mut parent, pos, node, right)?;
            true
        };

        debug_assert!(merged);

        if path.is_empty() {
            // Parent is the root.
            if parent.is_empty() {
                let NodeContents::Internal { leftmost, .. } = parent.contents else {
                    unreachable!();
                };
                self.store.free(parent.page_id)?;
                self.set_root(leftmost);
                return Ok(());
            }
            return self.write(&parent);
        }

        if parent.len() >= self.min_fill(&parent) {
            return self.write(&parent);
        }
        self.write(&parent)?;
        self.rebalance(path, parent)
    }

    fn finish_parent(&self, _path: Vec<(IndexNode, usize)>, parent: IndexNode) -> XtrieveResult<()> {
        // Borrowing never changes the parent's entry count, so no further
        // rebalancing can be needed above it.
        self.write(&parent)
    }

    fn borrow_from_left(
        &self,
        parent: &mut IndexNode,
        pos: usize,
        left: &mut IndexNode,
        mut node: IndexNode,
    ) -> XtrieveResult<()> {
        let NodeContents::Internal { entries: parent_entries, .. } = &mut parent.contents else {
            unreachable!();
        };
        let separator = &mut parent_entries[pos - 1];

        match (&mut left.contents, &mut node.contents) {
            (
                NodeContents::Leaf { entries: left_entries, .. },
                NodeContents::Leaf { entries: node_entries, .. },
            ) => {
                let moved = left_entries.pop().expect("left sibling above minimum");
                node_entries.insert(0, moved);
                separator.key = node_entries[0].key.clone();
                separator.sequence = node_entries[0].sequence;
            }
            (
                NodeContents::Internal { entries: left_entries, .. },
                NodeContents::Internal { leftmost, entries: node_entries },
            ) => {
                let moved = left_entries.pop().expect("left sibling above minimum");
                node_entries.insert(
                    0,
                    InternalEntry {
                        key: separator.key.clone(),
                        sequence: separator.sequence,
                        child: *leftmost,
                    },
                );
                *leftmost = moved.child;
                separator.key = moved.key;
                separator.sequence = moved.sequence;
            }
            _ => unreachable!("siblings of mixed kinds"),
        }

        self.write(left)?;
        self.write(&node)
    }

    fn borrow_from_right(
        &self,
        parent: &mut IndexNode,
        pos: usize,
        mut node: IndexNode,
        right: &mut IndexNode,
    ) -> XtrieveResult<()> {
        let NodeContents::Internal { entries: parent_entries, .. } = &mut parent.contents else {
            unreachable!();
        };
        let separator = &mut parent_entries[pos];

        match (&mut node.contents, &mut right.contents) {
            (
                NodeContents::Leaf { entries: node_entries, .. },
                NodeContents::Leaf { entries: right_entries, .. },
            ) => {
                let moved = right_entries.remove(0);
                node_entries.push(moved);
                separator.key = right_entries[0].key.clone();
                separator.sequence = right_entries[0].sequence;
            }
            (
                NodeContents::Internal { entries: node_entries, .. },
                NodeContents::Internal { leftmost, entries: right_entries },
            ) => {
                node_entries.push(InternalEntry {
                    key: separator.key.clone(),
                    sequence: separator.sequence,
                    child: *leftmost,
                });
                let first = right_entries.remove(0);
                *leftmost = first.child;
                separator.key = first.key;
                separator.sequence = first.sequence;
            }
            _ => unreachable!("siblings of mixed kinds"),
        }

        self.write(&node)?;
        self.write(right)
    }

    /// Merges `right_node` into `left_node` and drops the separator at
    /// `sep_idx` from the parent. The right page is freed.
    fn merge_nodes(
        &self,
        parent: &mut IndexNode,
        sep_idx: usize,
        mut left_node: IndexNode,
        right_node: IndexNode,
    ) -> XtrieveResult<()> {
        let NodeContents::Internal { entries: parent_entries, .. } = &mut parent.contents else {
            unreachable!();
        };
        let separator = parent_entries.remove(sep_idx);
        debug_assert_eq!(separator.child, right_node.page_id);

        match (&mut left_node.contents, right_node.contents) {
            (
                NodeContents::Leaf { next, entries: left_entries, .. },
                NodeContents::Leaf { next: right_next, entries: right_entries, .. },
            ) => {
                left_entries.extend(right_entries);
                *next = right_next;
                if right_next.is_some() {
                    let mut after = self.load(right_next)?;
                    if let NodeContents::Leaf { prev, .. } = &mut after.contents {
                        *prev = left_node.page_id;
                    }
                    self.write(&after)?;
                }
            }
            (
                NodeContents::Internal { entries: left_entries, .. },
                NodeContents::Internal { leftmost: right_leftmost, entries: right_entries },
            ) => {
                left_entries.push(InternalEntry {
                    key: separator.key,
                    sequence: separator.sequence,
                    child: right_leftmost,
                });
                left_entries.extend(right_entries);
            }
            _ => unreachable!("siblings of mixed kinds"),
        }

        self.write(&left_node)?;
        self.store.free(right_node.page_id)
    }
}
