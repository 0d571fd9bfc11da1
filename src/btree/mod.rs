//! The B-tree: a page-per-node tree with fragmented-value support and leaf
//! merge/rebalance on delete.
//!
//! Descent, insertion, and removal are generalized to run against the
//! split-out [`crate::cache::NodeCache`] + [`crate::store::PageStore`] pair
//! instead of one monolithic store, and extended with fragmented values and
//! leaf-level merge/rebalance.

pub mod cursor;
pub mod fragment;
pub mod node;
pub mod registry;

use std::cmp::Ordering;

use crate::cache::{AccessMode, NodeCache, NodeGuard};
use crate::config::{BufferId, ItemPointer, Key, PageId, Value, FRAGMENT_THRESHOLD, MAX_KEY_LEN, MAX_VALUE_LEN, MERGE_THRESHOLD_PERCENT};
use crate::error::{Error, Result};
use crate::store::PageStore;

use fragment::FragmentChain;
use node::{decode_value, encode_fragmented, encode_inline, DecodedValue, NodePage};

/// Root page and height of one tree; trees are otherwise nameless here —
/// naming and the index-id registry live in [`registry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeMeta {
    pub root: PageId,
    pub height: u32,
}

/// A sync candidate handed back to the caller (the transaction/redo layer)
/// whenever the cache's dirty-list threshold is crossed mid-operation.
pub type SyncCandidate = (PageId, NodePage);

pub struct Tree<'a> {
    cache: &'a NodeCache,
    store: &'a PageStore,
}

impl<'a> Tree<'a> {
    pub fn new(cache: &'a NodeCache, store: &'a PageStore) -> Tree<'a> {
        Tree { cache, store }
    }

    fn merge_threshold_bytes() -> usize {
        NodePage::capacity_bytes() * MERGE_THRESHOLD_PERCENT as usize / 100
    }

    fn encode_value(&self, value: &Value, sync: &mut Vec<SyncCandidate>) -> Result<Vec<u8>> {
        let _ = sync;
        if value.len() > FRAGMENT_THRESHOLD {
            let first_segment = FragmentChain::new(self.store).write_new(value)?;
            Ok(encode_fragmented(value.len() as u64, first_segment))
        } else {
            Ok(encode_inline(value))
        }
    }

    fn decode_owned_value(&self, raw: &[u8]) -> Result<Value> {
        match decode_value(raw) {
            DecodedValue::Inline(v) => Ok(v),
            DecodedValue::Fragmented { total_len, first_segment } => {
                let mut out = vec![0u8; total_len as usize];
                FragmentChain::new(self.store).read_at(first_segment, total_len, 0, &mut out)?;
                Ok(out)
            }
        }
    }

    fn free_value_if_fragmented(&self, raw: &[u8]) -> Result<()> {
        if let DecodedValue::Fragmented { first_segment, .. } = decode_value(raw) {
            FragmentChain::new(self.store).delete_chain(first_segment)?;
        }
        Ok(())
    }

    /// Point lookup.
    pub fn find(&self, meta: &TreeMeta, key: &[u8]) -> Result<Option<Value>> {
        if meta.root == 0 {
            return Ok(None);
        }
        self.find_in(meta.root, key, meta.height)
    }

    fn find_in(&self, id: PageId, key: &[u8], height: u32) -> Result<Option<Value>> {
        let guard = self.cache.get(id, self.store, AccessMode::ReadOnly)?;
        let page = self.cache.read(&guard);
        let r = page.lower_bound(key);
        let n = page.get_n_items();
        if height == 1 {
            if r < n && page.compare_key(r, key) == Ordering::Equal {
                let (_, raw) = page.get_raw_item(r);
                drop(page);
                return self.decode_owned_value(&raw).map(Some);
            }
            Ok(None)
        } else {
            debug_assert!(r < n);
            let child = page.get_child(r);
            drop(page);
            self.find_in(child, key, height - 1)
        }
    }

    /// Insert or update `key`, minus the locking/undo/redo wrapper the
    /// transaction runtime adds around this.
    pub fn upsert(
        &self,
        meta: &mut TreeMeta,
        key: &Key,
        value: &Value,
        wal_flush_threshold: BufferId,
        sync: &mut Vec<SyncCandidate>,
    ) -> Result<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::out_of_bounds("key length out of range"));
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(Error::out_of_bounds("value length out of range"));
        }
        let encoded = self.encode_value(value, sync)?;
        if meta.root == 0 {
            meta.root = self.allocate_leaf(key, &encoded, wal_flush_threshold, sync)?;
            meta.height = 1;
        } else if let Some((split_key, new_pid)) =
            self.btree_insert(meta.root, key, &encoded, meta.height, wal_flush_threshold, sync)?
        {
            meta.root = self.allocate_internal(&split_key, new_pid, meta.root, wal_flush_threshold, sync)?;
            meta.height += 1;
        }
        Ok(())
    }

    /// Removes `key` if present; does nothing otherwise.
    pub fn remove(
        &self,
        meta: &mut TreeMeta,
        key: &Key,
        wal_flush_threshold: BufferId,
        sync: &mut Vec<SyncCandidate>,
    ) -> Result<()> {
        if meta.root == 0 {
            return Ok(());
        }
        let underflow = self.btree_remove(meta.root, key, meta.height, wal_flush_threshold, sync)?;
        if underflow {
            meta.root = 0;
            meta.height = 0;
            return Ok(());
        }
        if meta.height == 1 {
            // The root is a leaf with no siblings to merge into; if it just
            // emptied out, collapse the tree to empty explicitly.
            let guard = self.cache.get(meta.root, self.store, AccessMode::ReadOnly)?;
            let empty = self.cache.read(&guard).get_n_items() == 0;
            if empty {
                self.store.delete_page(guard.id);
                meta.root = 0;
                meta.height = 0;
            }
        }
        Ok(())
    }

    fn allocate_leaf(&self, key: &[u8], raw_value: &[u8], threshold: BufferId, sync: &mut Vec<SyncCandidate>) -> Result<PageId> {
        let id = self.store.alloc_page()?;
        let guard = self.cache.alloc(id)?;
        {
            let mut page = self.cache.write(&guard);
            *page = NodePage::new_leaf();
            let ok = page.insert_item(0, key, raw_value);
            debug_assert!(ok, "fresh leaf always has room for its first item");
        }
        if let Some(c) = self.cache.modify(&guard, threshold)? {
            sync.push(c);
        }
        Ok(id)
    }

    fn allocate_internal(&self, key: &[u8], left_child: PageId, right_child: PageId, threshold: BufferId, sync: &mut Vec<SyncCandidate>) -> Result<PageId> {
        let id = self.store.alloc_page()?;
        let guard = self.cache.alloc(id)?;
        {
            let mut page = self.cache.write(&guard);
            *page = NodePage::new_internal();
            debug_assert!(left_child != 0 && right_child != 0);
            page.insert_item(0, key, &left_child.to_be_bytes());
            page.insert_sentinel(1, &right_child.to_be_bytes());
        }
        if let Some(c) = self.cache.modify(&guard, threshold)? {
            sync.push(c);
        }
        Ok(id)
    }

    fn btree_insert(
        &self,
        id: PageId,
        key: &[u8],
        encoded_value: &[u8],
        height: u32,
        threshold: BufferId,
        sync: &mut Vec<SyncCandidate>,
    ) -> Result<Option<(Key, PageId)>> {
        let guard = self.cache.get(id, self.store, AccessMode::ReadWrite)?;
        let r = self.cache.read(&guard).lower_bound(key);
        if height == 1 {
            let n = self.cache.read(&guard).get_n_items();
            if r < n && self.cache.read(&guard).compare_key(r, key) == Ordering::Equal {
                let old_raw = {
                    let page = self.cache.read(&guard);
                    page.get_raw_item(r).1
                };
                self.free_value_if_fragmented(&old_raw)?;
                self.cache.write(&guard).remove_key(r, true);
            }
            self.insert_in_page(&guard, r, key, encoded_value, threshold, sync)
        } else {
            let child = self.cache.read(&guard).get_child(r);
            let overflow = self.btree_insert(child, key, encoded_value, height - 1, threshold, sync)?;
            match overflow {
                Some((split_key, child_pid)) => {
                    let child_bytes = child_pid.to_be_bytes();
                    self.insert_in_page(&guard, r, &split_key, &child_bytes, threshold, sync)
                }
                None => Ok(None),
            }
        }
    }

    /// Inserts at `ip`, splitting and fixing up leaf sibling pointers if the
    /// page is full.
    fn insert_in_page(
        &self,
        guard: &NodeGuard,
        ip: ItemPointer,
        key: &[u8],
        raw_value: &[u8],
        threshold: BufferId,
        sync: &mut Vec<SyncCandidate>,
    ) -> Result<Option<(Key, PageId)>> {
        {
            let mut page = self.cache.write(guard);
            if page.insert_item(ip, key, raw_value) {
                drop(page);
                if let Some(c) = self.cache.modify(guard, threshold)? {
                    sync.push(c);
                }
                return Ok(None);
            }
        }

        let is_leaf = self.cache.read(guard).is_leaf();
        let old_left = self.cache.read(guard).get_left_sibling();
        let new_id = self.store.alloc_page()?;
        let new_guard = self.cache.alloc(new_id)?;

        let last_key;
        {
            let mut page = self.cache.write(guard);
            let mut new_page = self.cache.write(&new_guard);
            *new_page = if is_leaf { NodePage::new_leaf() } else { NodePage::new_internal() };
            let split_ip = page.split(&mut new_page, ip);
            let ok = if ip > split_ip {
                page.insert_item(ip - split_ip - 1, key, raw_value)
            } else {
                new_page.insert_item(ip, key, raw_value)
            };
            debug_assert!(ok, "a freshly split page always has room for the overflowing item");
            if is_leaf {
                new_page.set_left_sibling(old_left);
                new_page.set_right_sibling(guard.id);
                page.set_left_sibling(new_id);
            }
            last_key = new_page.get_last_key();
        }

        if is_leaf && old_left != 0 {
            let left_guard = self.cache.get(old_left, self.store, AccessMode::ReadWrite)?;
            self.cache.write(&left_guard).set_right_sibling(new_id);
            if let Some(c) = self.cache.modify(&left_guard, threshold)? {
                sync.push(c);
            }
        }
        if let Some(c) = self.cache.modify(guard, threshold)? {
            sync.push(c);
        }
        if let Some(c) = self.cache.modify(&new_guard, threshold)? {
            sync.push(c);
        }
        Ok(Some((last_key, new_id)))
    }

    /// Removes `key` from the subtree rooted at `id`; returns `true` if this
    /// page was freed (merged into a sibling or emptied) and the parent must
    /// drop its pointer to it.
    fn btree_remove(&self, id: PageId, key: &[u8], height: u32, threshold: BufferId, sync: &mut Vec<SyncCandidate>) -> Result<bool> {
        let guard = self.cache.get(id, self.store, AccessMode::ReadWrite)?;
        let r = self.cache.read(&guard).lower_bound(key);

        if height == 1 {
            let n = self.cache.read(&guard).get_n_items();
            if r < n && self.cache.read(&guard).compare_key(r, key) == Ordering::Equal {
                let old_raw = self.cache.read(&guard).get_raw_item(r).1;
                self.free_value_if_fragmented(&old_raw)?;
                self.cache.write(&guard).remove_key(r, true);
                if let Some(c) = self.cache.modify(&guard, threshold)? {
                    sync.push(c);
                }
            } else {
                return Ok(false);
            }
            self.maybe_merge_leaf(&guard, threshold, sync)
        } else {
            let child = self.cache.read(&guard).get_child(r);
            let underflow = self.btree_remove(child, key, height - 1, threshold, sync)?;
            if underflow {
                self.cache.write(&guard).remove_key(r, false);
                if let Some(c) = self.cache.modify(&guard, threshold)? {
                    sync.push(c);
                }
            }
            if self.cache.read(&guard).get_n_items() == 0 {
                self.store.delete_page(id);
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }

    /// Merge/rebalance: a leaf below the utilisation threshold is folded
    /// wholesale into a sibling when the combined content fits in one page,
    /// preferring the right sibling. Internal nodes use the simpler "free
    /// only when fully empty" rule (see DESIGN.md).
    fn maybe_merge_leaf(&self, guard: &NodeGuard, threshold: BufferId, sync: &mut Vec<SyncCandidate>) -> Result<bool> {
        let (n_items, used, left_id, right_id) = {
            let page = self.cache.read(guard);
            (page.get_n_items(), page.used_bytes(), page.get_left_sibling(), page.get_right_sibling())
        };
        if n_items > 0 && used >= Self::merge_threshold_bytes() {
            return Ok(false);
        }

        if right_id != 0 {
            let right_guard = self.cache.get(right_id, self.store, AccessMode::ReadWrite)?;
            let fits = {
                let page = self.cache.read(guard);
                let right = self.cache.read(&right_guard);
                page.used_bytes() + right.used_bytes() <= NodePage::capacity_bytes()
            };
            if fits {
                let far_right;
                {
                    let page = self.cache.read(guard);
                    let mut right = self.cache.write(&right_guard);
                    let mut combined = NodePage::new_leaf();
                    combined.merge_from(&page);
                    combined.merge_from(&right);
                    combined.set_left_sibling(left_id);
                    far_right = right.get_right_sibling();
                    combined.set_right_sibling(far_right);
                    *right = combined;
                }
                if let Some(c) = self.cache.modify(&right_guard, threshold)? {
                    sync.push(c);
                }
                if left_id != 0 {
                    let left_guard = self.cache.get(left_id, self.store, AccessMode::ReadWrite)?;
                    self.cache.write(&left_guard).set_right_sibling(right_id);
                    if let Some(c) = self.cache.modify(&left_guard, threshold)? {
                        sync.push(c);
                    }
                }
                self.store.delete_page(guard.id);
                return Ok(true);
            }
        }

        if left_id != 0 {
            let left_guard = self.cache.get(left_id, self.store, AccessMode::ReadWrite)?;
            let fits = {
                let page = self.cache.read(guard);
                let left = self.cache.read(&left_guard);
                page.used_bytes() + left.used_bytes() <= NodePage::capacity_bytes()
            };
            if fits {
                let far_left;
                {
                    let page = self.cache.read(guard);
                    let mut left = self.cache.write(&left_guard);
                    far_left = left.get_left_sibling();
                    let mut combined = NodePage::new_leaf();
                    combined.merge_from(&left);
                    combined.merge_from(&page);
                    combined.set_left_sibling(far_left);
                    combined.set_right_sibling(right_id);
                    *left = combined;
                }
                if let Some(c) = self.cache.modify(&left_guard, threshold)? {
                    sync.push(c);
                }
                if right_id != 0 {
                    let right_guard = self.cache.get(right_id, self.store, AccessMode::ReadWrite)?;
                    self.cache.write(&right_guard).set_left_sibling(left_id);
                    if let Some(c) = self.cache.modify(&right_guard, threshold)? {
                        sync.push(c);
                    }
                }
                self.store.delete_page(guard.id);
                return Ok(true);
            }
        }

        // Below threshold (or empty) but no sibling merge was possible —
        // tolerate the underflow. An empty root with no siblings at all is
        // handled by the caller (`Tree::remove`), which owns collapsing the
        // whole tree to empty.
        Ok(false)
    }

    /// Verifies key ordering and counts items in the subtree; used by tests
    /// and the top-level `verify` operation.
    pub fn verify(&self, meta: &TreeMeta) -> Result<u64> {
        if meta.root == 0 {
            return Ok(0);
        }
        let mut prev_key: Key = Vec::new();
        self.traverse(meta.root, &mut prev_key, meta.height)
    }

    fn traverse(&self, id: PageId, prev_key: &mut Key, height: u32) -> Result<u64> {
        let guard = self.cache.get(id, self.store, AccessMode::ReadOnly)?;
        let n_items = self.cache.read(&guard).get_n_items();
        let mut count = 0u64;
        if height == 1 {
            for i in 0..n_items {
                let page = self.cache.read(&guard);
                if page.compare_key(i, prev_key) != Ordering::Less {
                    return Err(Error::Corrupt("leaf keys out of order".into()));
                }
                let k = page.get_key(i);
                drop(page);
                *prev_key = k;
            }
            count += n_items as u64;
        } else {
            for i in 0..n_items {
                let child = self.cache.read(&guard).get_child(i);
                count += self.traverse(child, prev_key, height - 1)?;
                let page = self.cache.read(&guard);
                let ord = page.compare_key(i, prev_key);
                if ord != Ordering::Less && ord != Ordering::Equal {
                    return Err(Error::Corrupt("internal separator out of order".into()));
                }
            }
        }
        Ok(count)
    }
}
