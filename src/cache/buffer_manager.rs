//! Slot bookkeeping for one node-cache partition: a hash-chained map from
//! `PageId` to slot, an LRU doubly-linked list, and two double-buffered
//! dirty lists the checkpoint coordinator toggles between.

use crate::config::{BufferId, PageId};
use crate::error::{Error, Result};
use crate::hash::scramble;

pub const PAGE_RAW: u16 = 1; // slot content is uninitialized
pub const PAGE_BUSY: u16 = 2; // slot is being loaded from disk
pub const PAGE_DIRTY: u16 = 4; // slot was modified since last flush
pub const PAGE_WAIT: u16 = 8; // some thread waits until the slot loads
pub const PAGE_SYNCED: u16 = 16; // dirty slot was written to the redo log

#[derive(Clone, Copy, Default)]
pub struct Slot {
    pub pid: PageId,
    collision: BufferId,
    pub lru_next: BufferId,
    pub lru_prev: BufferId,
    pub dirty_next: BufferId,
    pub dirty_prev: BufferId,
    /// Which of the two dirty-generation lists this slot belongs to, if any.
    pub dirty_tag: Option<u8>,
    pub access_count: u16,
    pub state: u16,
}

pub struct BufferManager {
    pub lru_head: BufferId,
    pub lru_tail: BufferId,

    pub free_slots: BufferId,
    /// Head of the dirty list for each of the two generations.
    pub dirty_heads: [BufferId; 2],
    /// The tag new dirties are filed under; toggled by the checkpointer.
    pub current_tag: u8,
    pub next_sync: BufferId,

    pub used: BufferId,
    pub pinned: BufferId,
    pub dirtied: BufferId,
    pub cached: BufferId,

    pub hash_table: Vec<BufferId>,
    pub slots: Vec<Slot>,
}

impl BufferManager {
    pub fn new(capacity: usize) -> BufferManager {
        BufferManager {
            lru_head: 0,
            lru_tail: 0,
            free_slots: 0,
            dirty_heads: [0, 0],
            current_tag: 0,
            next_sync: 0,
            used: 1, // slot 0 is reserved as a permanently-pinned sentinel
            pinned: 1,
            dirtied: 0,
            cached: 1,
            hash_table: vec![0; capacity.max(1)],
            slots: vec![Slot::default(); capacity.max(1)],
        }
    }

    pub fn unpin(&mut self, id: BufferId) {
        debug_assert_eq!(self.slots[id as usize].access_count, 1);
        self.slots[id as usize].access_count = 0;
        self.slots[id as usize].lru_next = self.lru_head;
        self.slots[id as usize].lru_prev = 0;
        self.pinned -= 1;
        if self.lru_head != 0 {
            self.slots[self.lru_head as usize].lru_prev = id;
        } else {
            self.lru_tail = id;
        }
        self.lru_head = id;
    }

    fn pin(&mut self, id: BufferId) {
        debug_assert_eq!(self.slots[id as usize].access_count, 0);
        let next = self.slots[id as usize].lru_next;
        let prev = self.slots[id as usize].lru_prev;
        if prev == 0 {
            self.lru_head = next;
        } else {
            self.slots[prev as usize].lru_next = next;
        }
        if next == 0 {
            self.lru_tail = prev;
        } else {
            self.slots[next as usize].lru_prev = prev;
        }
        self.pinned += 1;
    }

    fn insert(&mut self, id: BufferId) {
        let h = scramble(self.slots[id as usize].pid as u64) as usize % self.hash_table.len();
        self.slots[id as usize].collision = self.hash_table[h];
        self.hash_table[h] = id;
    }

    fn remove(&mut self, id: BufferId) {
        let h = scramble(self.slots[id as usize].pid as u64) as usize % self.hash_table.len();
        let mut p = self.hash_table[h];
        if p == id {
            self.hash_table[h] = self.slots[id as usize].collision;
        } else {
            while self.slots[p as usize].collision != id {
                p = self.slots[p as usize].collision;
            }
            self.slots[p as usize].collision = self.slots[id as usize].collision;
        }
    }

    /// Throws away a slot's cached content, used by transaction rollback to
    /// force reloading the durable page image. The slot must already be
    /// unlinked from the LRU list (true of anything pinned, e.g. a dirty
    /// node being discarded).
    pub fn throw_slot(&mut self, id: BufferId) {
        self.remove(id);
        self.slots[id as usize].lru_next = self.free_slots;
        self.free_slots = id;
        self.cached -= 1;
    }

    /// Evicts a clean, currently-unpinned slot straight out of the LRU
    /// list, used by manual eviction pressure.
    pub fn evict_from_lru(&mut self, id: BufferId) {
        debug_assert_eq!(self.slots[id as usize].access_count, 0);
        let next = self.slots[id as usize].lru_next;
        let prev = self.slots[id as usize].lru_prev;
        if prev == 0 {
            self.lru_head = next;
        } else {
            self.slots[prev as usize].lru_next = next;
        }
        if next == 0 {
            self.lru_tail = prev;
        } else {
            self.slots[next as usize].lru_prev = prev;
        }
        self.throw_slot(id);
    }

    /// Marks a slot dirty under the cache's current generation tag, pinning
    /// it until flush. Returns a slot that should be synced to the redo log
    /// first, if the dirty-list length crossed `wal_flush_threshold`.
    pub fn modify(&mut self, id: BufferId, wal_flush_threshold: BufferId) -> Result<Option<(BufferId, PageId)>> {
        debug_assert!(self.slots[id as usize].access_count > 0);
        let tag = self.current_tag;
        let mut next_sync: Option<(BufferId, PageId)> = None;
        if (self.slots[id as usize].state & PAGE_DIRTY) == 0 {
            self.slots[id as usize].access_count += 1;
            self.slots[id as usize].state = PAGE_DIRTY;
            self.dirtied += 1;
            if self.dirtied > wal_flush_threshold {
                let mut sync = self.next_sync;
                while sync != 0 {
                    if self.slots[sync as usize].access_count == 1 {
                        self.slots[sync as usize].state |= PAGE_SYNCED;
                        self.next_sync = self.slots[sync as usize].dirty_prev;
                        next_sync = Some((sync, self.slots[sync as usize].pid));
                        break;
                    }
                    sync = self.slots[sync as usize].dirty_prev;
                }
            }
        } else if self.slots[id as usize].dirty_tag == Some(tag) {
            // Already dirty under the current generation: re-link to the
            // front so it is the last one the checkpointer would have to
            // flush (it's being touched again).
            self.slots[id as usize].state &= !PAGE_SYNCED;
            let prev = self.slots[id as usize].dirty_prev;
            if prev == 0 {
                return Ok(None);
            }
            if self.next_sync == id {
                self.next_sync = prev;
            }
            let next = self.slots[id as usize].dirty_next;
            self.slots[prev as usize].dirty_next = next;
            if next != 0 {
                self.slots[next as usize].dirty_prev = prev;
            }
        } else {
            // Dirty under the OLD generation: leave it there for the
            // checkpointer to flush; this access merely keeps it pinned.
            return Ok(None);
        }
        let head = self.dirty_heads[tag as usize];
        if head != 0 {
            self.slots[head as usize].dirty_prev = id;
        }
        if self.next_sync == 0 {
            self.next_sync = id;
        }
        self.slots[id as usize].dirty_next = head;
        self.slots[id as usize].dirty_prev = 0;
        self.slots[id as usize].dirty_tag = Some(tag);
        self.dirty_heads[tag as usize] = id;
        Ok(next_sync)
    }

    pub fn release(&mut self, id: BufferId) {
        debug_assert!(self.slots[id as usize].access_count > 0);
        if self.slots[id as usize].access_count == 1 {
            debug_assert_eq!(self.slots[id as usize].state & PAGE_DIRTY, 0);
            self.unpin(id);
        } else {
            self.slots[id as usize].access_count -= 1;
        }
    }

    /// Finds the buffer holding `pid`, or allocates one, evicting the LRU
    /// clean slot if the cache is saturated.
    pub fn get_slot(&mut self, pid: PageId) -> Result<BufferId> {
        let hash = scramble(pid as u64) as usize % self.hash_table.len();
        let mut h = self.hash_table[hash];
        while h != 0 {
            if self.slots[h as usize].pid == pid {
                let access_count = self.slots[h as usize].access_count;
                if access_count == 0 {
                    self.pin(h);
                }
                self.slots[h as usize].access_count = access_count + 1;
                return Ok(h);
            }
            h = self.slots[h as usize].collision;
        }
        h = self.free_slots;
        if h != 0 {
            self.free_slots = self.slots[h as usize].lru_next;
            self.cached += 1;
            self.pinned += 1;
        } else {
            h = self.used;
            if (h as usize) < self.hash_table.len() {
                self.used += 1;
                self.cached += 1;
                self.pinned += 1;
            } else {
                let victim = self.lru_tail;
                if victim == 0 {
                    return Err(Error::OutOfBounds("node cache exhausted: all slots pinned or dirty".into()));
                }
                debug_assert_eq!(self.slots[victim as usize].access_count, 0);
                debug_assert_eq!(self.slots[victim as usize].state & PAGE_DIRTY, 0);
                self.pin(victim);
                self.remove(victim);
                h = victim;
            }
        }
        self.slots[h as usize].access_count = 1;
        self.slots[h as usize].pid = pid;
        self.slots[h as usize].state = PAGE_RAW;
        self.insert(h);
        Ok(h)
    }

    /// Pops one slot from the head of the given generation's dirty list,
    /// unlinking it, for the checkpointer to flush.
    pub fn pop_dirty(&mut self, tag: u8) -> Option<(BufferId, PageId)> {
        let id = self.dirty_heads[tag as usize];
        if id == 0 {
            return None;
        }
        let next = self.slots[id as usize].dirty_next;
        self.dirty_heads[tag as usize] = next;
        if next != 0 {
            self.slots[next as usize].dirty_prev = 0;
        }
        self.slots[id as usize].dirty_tag = None;
        self.slots[id as usize].state = 0;
        if self.next_sync == id {
            self.next_sync = 0;
        }
        self.unpin(id);
        Some((id, self.slots[id as usize].pid))
    }

    pub fn dirty_count(&self, tag: u8) -> usize {
        let mut n = 0;
        let mut id = self.dirty_heads[tag as usize];
        while id != 0 {
            n += 1;
            id = self.slots[id as usize].dirty_next;
        }
        n
    }
}
