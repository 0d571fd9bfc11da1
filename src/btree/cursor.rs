//! Ordered iteration over one tree: `find_ge/gt/le/lt/nearby`, `next`/
//! `previous`, `skip`, `random`, `first`/`last`.
//!
//! Reuses the same root-to-leaf descent logic as the one-shot `find`, then
//! walks leaf-to-leaf via the sibling pointers `btree::mod` maintains across
//! splits and merges rather than re-descending from the root on every step.
//!
//! Cursor reads are not snapshot-isolated against a concurrent structural
//! change (split/merge) elsewhere in the tree; the lock manager above this
//! layer is what gives a transaction a consistent view of a key range.

use std::cmp::Ordering;

use rand::Rng;

use crate::cache::AccessMode;
use crate::config::{ItemPointer, Key, PageId, Value};
use crate::error::Result;

use super::{Tree, TreeMeta};

pub struct Cursor<'a, 'b> {
    tree: &'a Tree<'b>,
    leaf: PageId,
    ip: ItemPointer,
}

impl<'a, 'b> Cursor<'a, 'b> {
    pub fn new(tree: &'a Tree<'b>) -> Cursor<'a, 'b> {
        Cursor { tree, leaf: 0, ip: 0 }
    }

    pub fn is_positioned(&self) -> bool {
        self.leaf != 0
    }

    /// The key at the cursor's current position.
    pub fn key(&self) -> Result<Option<Key>> {
        if !self.is_positioned() {
            return Ok(None);
        }
        let guard = self.tree.cache.get(self.leaf, self.tree.store, AccessMode::ReadOnly)?;
        let page = self.tree.cache.read(&guard);
        Ok(Some(page.get_key(self.ip)))
    }

    /// The value at the cursor's current position, decoding a fragmented
    /// value if needed.
    pub fn value(&self) -> Result<Option<Value>> {
        if !self.is_positioned() {
            return Ok(None);
        }
        let raw = {
            let guard = self.tree.cache.get(self.leaf, self.tree.store, AccessMode::ReadOnly)?;
            let page = self.tree.cache.read(&guard);
            page.get_raw_item(self.ip).1
        };
        self.tree.decode_owned_value(&raw).map(Some)
    }

    fn unposition(&mut self) {
        self.leaf = 0;
        self.ip = 0;
    }

    /// Descends from the root, returning the leaf page id and the lower
    /// bound position of `key` within it.
    fn descend(&self, meta: &TreeMeta, key: &[u8]) -> Result<Option<(PageId, ItemPointer)>> {
        if meta.root == 0 {
            return Ok(None);
        }
        let mut id = meta.root;
        let mut height = meta.height;
        loop {
            let guard = self.tree.cache.get(id, self.tree.store, AccessMode::ReadOnly)?;
            let page = self.tree.cache.read(&guard);
            let r = page.lower_bound(key);
            if height == 1 {
                return Ok(Some((id, r)));
            }
            let child = page.get_child(r);
            height -= 1;
            drop(page);
            id = child;
        }
    }

    fn leaf_len(&self, leaf: PageId) -> Result<ItemPointer> {
        let guard = self.tree.cache.get(leaf, self.tree.store, AccessMode::ReadOnly)?;
        Ok(self.tree.cache.read(&guard).get_n_items())
    }

    fn leaf_siblings(&self, leaf: PageId) -> Result<(PageId, PageId)> {
        let guard = self.tree.cache.get(leaf, self.tree.store, AccessMode::ReadOnly)?;
        let page = self.tree.cache.read(&guard);
        Ok((page.get_left_sibling(), page.get_right_sibling()))
    }

    fn leaf_compare(&self, leaf: PageId, ip: ItemPointer, key: &[u8]) -> Result<Ordering> {
        let guard = self.tree.cache.get(leaf, self.tree.store, AccessMode::ReadOnly)?;
        Ok(self.tree.cache.read(&guard).compare_key(ip, key))
    }

    /// Positions on the first key >= `key`.
    pub fn find_ge(&mut self, meta: &TreeMeta, key: &[u8]) -> Result<bool> {
        match self.descend(meta, key)? {
            None => {
                self.unposition();
                Ok(false)
            }
            Some((leaf, r)) => {
                let n = self.leaf_len(leaf)?;
                if r < n {
                    self.leaf = leaf;
                    self.ip = r;
                    Ok(true)
                } else {
                    let (_, right) = self.leaf_siblings(leaf)?;
                    self.advance_to_leaf_start(right)
                }
            }
        }
    }

    /// Positions on the first key > `key`.
    pub fn find_gt(&mut self, meta: &TreeMeta, key: &[u8]) -> Result<bool> {
        if !self.find_ge(meta, key)? {
            return Ok(false);
        }
        if self.leaf_compare(self.leaf, self.ip, key)? == Ordering::Equal {
            return self.next();
        }
        Ok(true)
    }

    /// Positions on the last key <= `key`.
    pub fn find_le(&mut self, meta: &TreeMeta, key: &[u8]) -> Result<bool> {
        match self.descend(meta, key)? {
            None => {
                self.unposition();
                Ok(false)
            }
            Some((leaf, r)) => {
                let n = self.leaf_len(leaf)?;
                if r < n && self.leaf_compare(leaf, r, key)? == Ordering::Equal {
                    self.leaf = leaf;
                    self.ip = r;
                    Ok(true)
                } else if r > 0 {
                    self.leaf = leaf;
                    self.ip = r - 1;
                    Ok(true)
                } else {
                    let (left, _) = self.leaf_siblings(leaf)?;
                    self.retreat_to_leaf_end(left)
                }
            }
        }
    }

    /// Positions on the last key < `key`.
    pub fn find_lt(&mut self, meta: &TreeMeta, key: &[u8]) -> Result<bool> {
        match self.descend(meta, key)? {
            None => {
                self.unposition();
                Ok(false)
            }
            Some((leaf, r)) => {
                if r > 0 {
                    self.leaf = leaf;
                    self.ip = r - 1;
                    Ok(true)
                } else {
                    let (left, _) = self.leaf_siblings(leaf)?;
                    self.retreat_to_leaf_end(left)
                }
            }
        }
    }

    /// Like `find_ge`, but reuses the current leaf when `key` still falls
    /// within it instead of re-descending from the root; falls back to a
    /// full re-descend once the cached leaf no longer covers `key`.
    pub fn nearby(&mut self, meta: &TreeMeta, key: &[u8]) -> Result<bool> {
        if self.is_positioned() {
            let guard = self.tree.cache.get(self.leaf, self.tree.store, AccessMode::ReadOnly)?;
            let page = self.tree.cache.read(&guard);
            let n = page.get_n_items();
            if n > 0 {
                let lo = page.compare_key(0, key);
                let hi = page.compare_key(n - 1, key);
                if lo != Ordering::Greater && (hi == Ordering::Greater || hi == Ordering::Equal) {
                    let r = page.lower_bound(key);
                    drop(page);
                    self.ip = r;
                    return Ok(true);
                }
            }
        }
        self.find_ge(meta, key)
    }

    fn advance_to_leaf_start(&mut self, mut leaf: PageId) -> Result<bool> {
        while leaf != 0 {
            let n = self.leaf_len(leaf)?;
            if n > 0 {
                self.leaf = leaf;
                self.ip = 0;
                return Ok(true);
            }
            let (_, right) = self.leaf_siblings(leaf)?;
            leaf = right;
        }
        self.unposition();
        Ok(false)
    }

    fn retreat_to_leaf_end(&mut self, mut leaf: PageId) -> Result<bool> {
        while leaf != 0 {
            let n = self.leaf_len(leaf)?;
            if n > 0 {
                self.leaf = leaf;
                self.ip = n - 1;
                return Ok(true);
            }
            let (left, _) = self.leaf_siblings(leaf)?;
            leaf = left;
        }
        self.unposition();
        Ok(false)
    }

    pub fn next(&mut self) -> Result<bool> {
        if !self.is_positioned() {
            return Ok(false);
        }
        let n = self.leaf_len(self.leaf)?;
        if self.ip + 1 < n {
            self.ip += 1;
            return Ok(true);
        }
        let (_, right) = self.leaf_siblings(self.leaf)?;
        self.advance_to_leaf_start(right)
    }

    pub fn previous(&mut self) -> Result<bool> {
        if !self.is_positioned() {
            return Ok(false);
        }
        if self.ip > 0 {
            self.ip -= 1;
            return Ok(true);
        }
        let (left, _) = self.leaf_siblings(self.leaf)?;
        self.retreat_to_leaf_end(left)
    }

    /// Moves `n` positions forward (negative moves backward).
    pub fn skip(&mut self, mut n: i64) -> Result<bool> {
        let mut ok = self.is_positioned();
        while n > 0 && ok {
            ok = self.next()?;
            n -= 1;
        }
        while n < 0 && ok {
            ok = self.previous()?;
            n += 1;
        }
        Ok(ok)
    }

    pub fn first(&mut self, meta: &TreeMeta) -> Result<bool> {
        if meta.root == 0 {
            self.unposition();
            return Ok(false);
        }
        let mut id = meta.root;
        let mut height = meta.height;
        loop {
            let guard = self.tree.cache.get(id, self.tree.store, AccessMode::ReadOnly)?;
            let page = self.tree.cache.read(&guard);
            if height == 1 {
                if page.get_n_items() == 0 {
                    drop(page);
                    self.unposition();
                    return Ok(false);
                }
                self.leaf = id;
                self.ip = 0;
                return Ok(true);
            }
            let child = page.get_child(0);
            height -= 1;
            drop(page);
            id = child;
        }
    }

    pub fn last(&mut self, meta: &TreeMeta) -> Result<bool> {
        if meta.root == 0 {
            self.unposition();
            return Ok(false);
        }
        let mut id = meta.root;
        let mut height = meta.height;
        loop {
            let guard = self.tree.cache.get(id, self.tree.store, AccessMode::ReadOnly)?;
            let page = self.tree.cache.read(&guard);
            let n = page.get_n_items();
            if height == 1 {
                if n == 0 {
                    drop(page);
                    self.unposition();
                    return Ok(false);
                }
                self.leaf = id;
                self.ip = n - 1;
                return Ok(true);
            }
            let child = page.get_child(n - 1);
            height -= 1;
            drop(page);
            id = child;
        }
    }

    /// Positions on a uniformly-random leaf item, descending via a random
    /// child index at each level.
    pub fn random(&mut self, meta: &TreeMeta) -> Result<bool> {
        if meta.root == 0 {
            self.unposition();
            return Ok(false);
        }
        let mut rng = rand::thread_rng();
        let mut id = meta.root;
        let mut height = meta.height;
        loop {
            let guard = self.tree.cache.get(id, self.tree.store, AccessMode::ReadOnly)?;
            let page = self.tree.cache.read(&guard);
            let n = page.get_n_items();
            if n == 0 {
                drop(page);
                self.unposition();
                return Ok(false);
            }
            if height == 1 {
                self.leaf = id;
                self.ip = rng.gen_range(0..n);
                return Ok(true);
            }
            let child = page.get_child(rng.gen_range(0..n));
            height -= 1;
            drop(page);
            id = child;
        }
    }
}

/// Counts keys in `[lo, hi)`; `hi == None` means unbounded. A thin
/// cursor-driven helper.
pub fn count_range(tree: &Tree<'_>, meta: &TreeMeta, lo: &[u8], hi: Option<&[u8]>) -> Result<u64> {
    let mut cursor = Cursor::new(tree);
    if !cursor.find_ge(meta, lo)? {
        return Ok(0);
    }
    let mut n = 0u64;
    loop {
        match &cursor.key()? {
            Some(k) => {
                if let Some(hi) = hi {
                    if k.as_slice() >= hi {
                        break;
                    }
                }
                n += 1;
            }
            None => break,
        }
        if !cursor.next()? {
            break;
        }
    }
    Ok(n)
}
