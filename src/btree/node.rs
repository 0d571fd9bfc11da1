//! B-tree node format: a fixed-size page with a 2-byte item count, a type
//! byte, left/right sibling ids, a forward-growing key/value region and a
//! backward-growing sorted search vector of 2-byte offsets.
//!
//! The header carries sibling pointers and a type tag, and the value region
//! carries a one-byte inline/fragmented flag so large values can be
//! redirected to a fragment chain.

use std::cmp::Ordering;

use crate::config::{ItemPointer, PageId, PAGE_HEADER_SIZE, PAGE_SIZE, PID_SIZE};

pub const NODE_TYPE_LEAF: u8 = 0;
pub const NODE_TYPE_INTERNAL: u8 = 1;

/// One-byte tag prefixing every stored value: inline payload follows
/// directly, fragmented payload is an 8-byte total length + 8-byte first
/// segment `PageId`.
pub const VALUE_INLINE: u8 = 0;
pub const VALUE_FRAGMENTED: u8 = 1;

pub const FRAGMENT_DESCRIPTOR_LEN: usize = 1 + 8 + 8;

/// Control-byte value reserved for the +inf sentinel entry at the
/// right-most slot of an internal node; real key lengths run 0..=254
/// (see `MAX_KEY_LEN`), so this can never collide with a real key.
const SENTINEL_KEY_LEN: u8 = 255;

/// A stored control byte's physical key length: the sentinel carries zero
/// key bytes regardless of its reserved marker value.
fn key_phys_len(raw: u8) -> usize {
    if raw == SENTINEL_KEY_LEN {
        0
    } else {
        raw as usize
    }
}

#[derive(Clone)]
pub struct NodePage {
    pub data: [u8; PAGE_SIZE],
}

impl NodePage {
    pub fn new() -> NodePage {
        NodePage { data: [0u8; PAGE_SIZE] }
    }

    pub fn new_leaf() -> NodePage {
        let mut p = NodePage::new();
        p.set_type(NODE_TYPE_LEAF);
        p
    }

    pub fn new_internal() -> NodePage {
        let mut p = NodePage::new();
        p.set_type(NODE_TYPE_INTERNAL);
        p
    }

    pub fn is_leaf(&self) -> bool {
        self.get_type() == NODE_TYPE_LEAF
    }

    pub fn get_type(&self) -> u8 {
        self.data[2]
    }

    pub fn set_type(&mut self, t: u8) {
        self.data[2] = t;
    }

    pub fn get_left_sibling(&self) -> PageId {
        self.get_u64(3)
    }

    pub fn set_left_sibling(&mut self, pid: PageId) {
        self.set_u64(3, pid);
    }

    pub fn get_right_sibling(&self) -> PageId {
        self.get_u64(3 + PID_SIZE)
    }

    pub fn set_right_sibling(&mut self, pid: PageId) {
        self.set_u64(3 + PID_SIZE, pid);
    }

    fn get_offs(&self, ip: ItemPointer) -> usize {
        self.get_u16(PAGE_HEADER_SIZE + ip * 2) as usize
    }

    fn set_offs(&mut self, ip: ItemPointer, offs: usize) {
        self.set_u16(PAGE_HEADER_SIZE + ip * 2, offs as u16)
    }

    pub fn get_child(&self, ip: ItemPointer) -> PageId {
        let offs = self.get_offs(ip);
        let key_len = key_phys_len(self.data[offs]);
        self.get_u64(offs + key_len + 1)
    }

    pub fn get_key(&self, ip: ItemPointer) -> Vec<u8> {
        let offs = self.get_offs(ip);
        let key_len = key_phys_len(self.data[offs]);
        self.data[offs + 1..offs + 1 + key_len].to_vec()
    }

    pub fn get_last_key(&self) -> Vec<u8> {
        let n_items = self.get_n_items();
        self.get_key(n_items - 1)
    }

    /// Returns the raw value bytes, including the leading inline/fragmented
    /// tag (see module docs); callers decode it with [`decode_value`].
    pub fn get_raw_item(&self, ip: ItemPointer) -> (Vec<u8>, Vec<u8>) {
        let (item_offs, item_len) = self.get_item_offs_len(ip);
        let key_len = key_phys_len(self.data[item_offs]);
        (
            self.data[item_offs + 1..item_offs + 1 + key_len].to_vec(),
            self.data[item_offs + 1 + key_len..item_offs + item_len].to_vec(),
        )
    }

    fn get_item_offs_len(&self, ip: ItemPointer) -> (usize, usize) {
        let offs = self.get_offs(ip);
        let next_offs = if ip == 0 { PAGE_SIZE } else { self.get_offs(ip - 1) };
        debug_assert!(next_offs > offs);
        (offs, next_offs - offs)
    }

    pub fn set_u16(&mut self, offs: usize, data: u16) {
        self.copy(offs, &data.to_be_bytes());
    }

    pub fn set_u64(&mut self, offs: usize, data: u64) {
        self.copy(offs, &data.to_be_bytes());
    }

    pub fn get_u16(&self, offs: usize) -> u16 {
        u16::from_be_bytes(self.data[offs..offs + 2].try_into().unwrap())
    }

    pub fn get_u64(&self, offs: usize) -> u64 {
        u64::from_be_bytes(self.data[offs..offs + 8].try_into().unwrap())
    }

    pub fn get_n_items(&self) -> ItemPointer {
        self.get_u16(0) as ItemPointer
    }

    fn get_size(&self) -> ItemPointer {
        let n_items = self.get_n_items();
        if n_items == 0 {
            0
        } else {
            PAGE_SIZE - self.get_offs(n_items - 1)
        }
    }

    /// Bytes currently free for new items (below the header/search-vector
    /// and above the item region), used to decide whether a node is below
    /// the merge threshold.
    pub fn used_bytes(&self) -> usize {
        let n = self.get_n_items();
        n * 2 + self.get_size()
    }

    pub fn capacity_bytes() -> usize {
        PAGE_SIZE - PAGE_HEADER_SIZE
    }

    pub fn set_n_items(&mut self, n_items: ItemPointer) {
        self.set_u16(0, n_items as u16)
    }

    fn copy(&mut self, offs: usize, data: &[u8]) {
        let len = data.len();
        self.data[offs..offs + len].copy_from_slice(data);
    }

    pub fn compare_key(&self, ip: ItemPointer, key: &[u8]) -> Ordering {
        let offs = self.get_offs(ip);
        let raw = self.data[offs];
        if raw == SENTINEL_KEY_LEN {
            // special handling of +inf in right-most internal nodes
            Ordering::Less
        } else {
            key.cmp(&self.data[offs + 1..offs + 1 + raw as usize])
        }
    }

    /// Binary search for the first item whose key is >= `key`. Returns the
    /// insertion point (== n_items if all keys are smaller).
    pub fn lower_bound(&self, key: &[u8]) -> ItemPointer {
        let mut l: ItemPointer = 0;
        let mut r = self.get_n_items();
        while l < r {
            let m = (l + r) >> 1;
            if self.compare_key(m, key) == Ordering::Greater {
                l = m + 1;
            } else {
                r = m;
            }
        }
        l
    }

    pub fn remove_key(&mut self, ip: ItemPointer, leaf: bool) {
        let n_items = self.get_n_items();
        let size = self.get_size();
        let (item_offs, item_len) = self.get_item_offs_len(ip);
        for i in ip + 1..n_items {
            self.set_offs(i - 1, self.get_offs(i) + item_len);
        }
        let items_origin = PAGE_SIZE - size;
        if !leaf && n_items > 1 && ip + 1 == n_items {
            let prev_item_offs = item_offs + item_len;
            let key_len = key_phys_len(self.data[item_offs]);
            let prev_key_len = self.data[prev_item_offs] as usize;
            let new_offs = prev_item_offs + prev_key_len - key_len;
            self.set_offs(ip - 1, new_offs);
            self.data.copy_within(item_offs..item_offs + prev_key_len + 1, new_offs);
        } else {
            self.data.copy_within(items_origin..item_offs, items_origin + item_len);
        }
        self.set_n_items(n_items - 1);
    }

    /// Inserts an item if there is enough free space, otherwise returns false.
    pub fn insert_item(&mut self, ip: ItemPointer, key: &[u8], value: &[u8]) -> bool {
        self.insert_item_raw(ip, key.len() as u8, key, value)
    }

    /// Inserts the +inf sentinel entry at `ip`: no key bytes, control byte
    /// `SENTINEL_KEY_LEN`, `value` is the right child's `PageId`. The only
    /// entry format allowed to use the reserved sentinel control byte.
    pub fn insert_sentinel(&mut self, ip: ItemPointer, value: &[u8]) -> bool {
        self.insert_item_raw(ip, SENTINEL_KEY_LEN, &[], value)
    }

    fn insert_item_raw(&mut self, ip: ItemPointer, raw_key_len: u8, key: &[u8], value: &[u8]) -> bool {
        let n_items = self.get_n_items();
        let size = self.get_size();
        let key_len = key.len();
        let item_len = 1 + key_len + value.len();
        if (n_items + 1) * 2 + size + item_len <= PAGE_SIZE - PAGE_HEADER_SIZE {
            for i in (ip..n_items).rev() {
                self.set_offs(i + 1, self.get_offs(i) - item_len);
            }
            let item_offs = if ip != 0 { self.get_offs(ip - 1) - item_len } else { PAGE_SIZE - item_len };
            self.set_offs(ip, item_offs);
            let items_origin = PAGE_SIZE - size;
            self.data.copy_within(items_origin..item_offs + item_len, items_origin - item_len);
            self.data[item_offs] = raw_key_len;
            self.data[item_offs + 1..item_offs + 1 + key_len].copy_from_slice(key);
            self.data[item_offs + 1 + key_len..item_offs + item_len].copy_from_slice(value);
            self.set_n_items(n_items + 1);
            true
        } else {
            false
        }
    }

    /// Splits the page into two approximately equal parts. Smallest keys move
    /// to `new_page`, largest stay on `self`. Returns the split position.
    pub fn split(&mut self, new_page: &mut NodePage, ip: ItemPointer) -> ItemPointer {
        let n_items = self.get_n_items();
        let size = self.get_size();
        let mut r = n_items;

        if ip == r {
            r -= 1;
        } else {
            let margin = PAGE_SIZE - size / 2;
            let mut l: ItemPointer = 0;
            while l < r {
                let m = (l + r) >> 1;
                if self.get_offs(m) > margin {
                    l = m + 1;
                } else {
                    r = m;
                }
            }
            debug_assert!(l == r);
        }
        let moved_size = PAGE_SIZE - self.get_offs(r);

        new_page.data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + (r + 1) * 2]
            .copy_from_slice(&self.data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + (r + 1) * 2]);
        let dst = PAGE_SIZE - moved_size;
        new_page.data[dst..].copy_from_slice(&self.data[dst..]);

        for i in r + 1..n_items {
            self.set_offs(i - r - 1, self.get_offs(i) + moved_size);
        }
        let src = PAGE_SIZE - size;
        self.data.copy_within(src..dst, src + moved_size);
        new_page.set_n_items(r + 1);
        self.set_n_items(n_items - r - 1);
        new_page.set_type(self.get_type());
        r
    }

    /// Moves all items from `src` into `self`, appended at the end. Used by
    /// the merge half of merge/rebalance. Caller is responsible for ensuring
    /// the combined size fits.
    pub fn merge_from(&mut self, src: &NodePage) {
        let n = src.get_n_items();
        for i in 0..n {
            let (key, value) = src.get_raw_item(i);
            let ok = self.insert_item(self.get_n_items(), &key, &value);
            debug_assert!(ok, "merge_from caller must pre-check combined size fits");
        }
    }
}

/// Encodes an inline value with its leading tag byte.
pub fn encode_inline(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + value.len());
    out.push(VALUE_INLINE);
    out.extend_from_slice(value);
    out
}

/// Encodes a fragmented-value descriptor with its leading tag byte.
pub fn encode_fragmented(total_len: u64, first_segment: PageId) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAGMENT_DESCRIPTOR_LEN);
    out.push(VALUE_FRAGMENTED);
    out.extend_from_slice(&total_len.to_be_bytes());
    out.extend_from_slice(&first_segment.to_be_bytes());
    out
}

pub enum DecodedValue {
    Inline(Vec<u8>),
    Fragmented { total_len: u64, first_segment: PageId },
}

pub fn decode_value(raw: &[u8]) -> DecodedValue {
    match raw[0] {
        VALUE_INLINE => DecodedValue::Inline(raw[1..].to_vec()),
        VALUE_FRAGMENTED => {
            let total_len = u64::from_be_bytes(raw[1..9].try_into().unwrap());
            let first_segment = PageId::from_be_bytes(raw[9..17].try_into().unwrap());
            DecodedValue::Fragmented { total_len, first_segment }
        }
        other => panic!("corrupt value tag {other}"),
    }
}
