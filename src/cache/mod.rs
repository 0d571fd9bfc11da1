//! The node cache: a fixed-capacity pool of B-tree page slots, evicted by
//! approximate LRU, with a checkpoint-toggled dirty generation.
//!
//! Each slot's content lives behind an `RwLock<NodePage>`, which doubles as
//! a shared/exclusive node latch without a bespoke latch type. Optional
//! sharding into `partitions` independent [`buffer_manager::BufferManager`]s
//! lets the cache scale across more concurrent writers than a single
//! partition's lock would allow.

pub mod buffer_manager;

use std::iter;
use std::sync::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::btree::node::NodePage;
use crate::config::{BufferId, PageId, N_BUSY_EVENTS};
use crate::error::Result;
use crate::hash::scramble;
use crate::store::PageStore;

use buffer_manager::{BufferManager, PAGE_BUSY, PAGE_DIRTY, PAGE_RAW, PAGE_WAIT};

#[derive(PartialEq, Eq, Clone, Copy)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

struct Partition {
    bm: Mutex<BufferManager>,
    pool: Vec<RwLock<NodePage>>,
    busy_events: [Condvar; N_BUSY_EVENTS],
}

pub struct NodeCache {
    partitions: Vec<Partition>,
    shift: u32,
}

/// A pinned, possibly-latched reference to one cached node. Releases the
/// pin on drop.
pub struct NodeGuard<'a> {
    cache: &'a NodeCache,
    partition: usize,
    buf: BufferId,
    pub id: PageId,
}

impl<'a> Drop for NodeGuard<'a> {
    fn drop(&mut self) {
        self.cache.release(self.partition, self.buf);
    }
}

impl NodeCache {
    pub fn new(capacity_pages: usize, partitions: usize) -> NodeCache {
        assert!(partitions.is_power_of_two());
        let per_partition = (capacity_pages / partitions).max(2);
        let parts = (0..partitions)
            .map(|_| Partition {
                bm: Mutex::new(BufferManager::new(per_partition)),
                pool: iter::repeat_with(|| RwLock::new(NodePage::new())).take(per_partition).collect(),
                busy_events: [(); N_BUSY_EVENTS].map(|_| Condvar::new()),
            })
            .collect();
        NodeCache { partitions: parts, shift: partitions.trailing_zeros() }
    }

    fn partition_for(&self, id: PageId) -> usize {
        if self.partitions.len() == 1 {
            0
        } else {
            (scramble(id as u64) >> (64 - self.shift)) as usize % self.partitions.len()
        }
    }

    fn release(&self, partition: usize, buf: BufferId) {
        let mut bm = self.partitions[partition].bm.lock().unwrap();
        bm.release(buf);
    }

    /// Reads (or waits for a concurrent read of) `id` into the cache,
    /// returning a pinned guard. A second thread racing on the same miss
    /// waits on a condvar rather than issuing a duplicate disk read.
    pub fn get<'a>(&'a self, id: PageId, store: &PageStore, mode: AccessMode) -> Result<NodeGuard<'a>> {
        let part_idx = self.partition_for(id);
        let part = &self.partitions[part_idx];
        let mut bm = part.bm.lock().unwrap();
        let buf = bm.get_slot(id)?;
        if (bm.slots[buf as usize].state & PAGE_BUSY) != 0 {
            bm.slots[buf as usize].state |= PAGE_WAIT;
            loop {
                bm = part.busy_events[buf as usize % N_BUSY_EVENTS].wait(bm).unwrap();
                if (bm.slots[buf as usize].state & PAGE_BUSY) == 0 {
                    break;
                }
            }
        } else if (bm.slots[buf as usize].state & PAGE_RAW) != 0 {
            if mode != AccessMode::WriteOnly {
                bm.slots[buf as usize].state = PAGE_BUSY;
                drop(bm);
                {
                    let mut page = part.pool[buf as usize].write().unwrap();
                    store.read_page(id, &mut page.data)?;
                }
                bm = part.bm.lock().unwrap();
                if (bm.slots[buf as usize].state & PAGE_WAIT) != 0 {
                    part.busy_events[buf as usize % N_BUSY_EVENTS].notify_all();
                }
            }
            bm.slots[buf as usize].state = 0;
        }
        Ok(NodeGuard { cache: self, partition: part_idx, buf, id })
    }

    /// Allocates a fresh, zeroed slot for a page id the page store has
    /// already minted, without reading from disk.
    pub fn alloc<'a>(&'a self, id: PageId) -> Result<NodeGuard<'a>> {
        let part_idx = self.partition_for(id);
        let part = &self.partitions[part_idx];
        let mut bm = part.bm.lock().unwrap();
        let buf = bm.get_slot(id)?;
        {
            let mut page = part.pool[buf as usize].write().unwrap();
            *page = NodePage::new();
        }
        bm.slots[buf as usize].state = 0;
        Ok(NodeGuard { cache: self, partition: part_idx, buf, id })
    }

    pub fn read(&self, guard: &NodeGuard) -> RwLockReadGuard<'_, NodePage> {
        self.partitions[guard.partition].pool[guard.buf as usize].read().unwrap()
    }

    pub fn write(&self, guard: &NodeGuard) -> RwLockWriteGuard<'_, NodePage> {
        self.partitions[guard.partition].pool[guard.buf as usize].write().unwrap()
    }

    /// Marks the node behind `guard` dirty under the cache's current
    /// generation tag, returning a sync candidate when the dirty-list
    /// length just crossed `wal_flush_threshold`; the candidate is handed
    /// off for an early physical flush by the caller.
    pub fn modify(&self, guard: &NodeGuard, wal_flush_threshold: BufferId) -> Result<Option<(PageId, NodePage)>> {
        let part = &self.partitions[guard.partition];
        let mut bm = part.bm.lock().unwrap();
        let candidate = bm.modify(guard.buf, wal_flush_threshold)?;
        drop(bm);
        Ok(match candidate {
            Some((buf, pid)) => Some((pid, part.pool[buf as usize].read().unwrap().clone())),
            None => None,
        })
    }

    /// Discards every dirty node in every partition, forcing a reload from
    /// disk on next access. Used by transaction rollback.
    pub fn discard_all_dirty(&self) {
        for part in &self.partitions {
            let mut bm = part.bm.lock().unwrap();
            for tag in [0u8, 1u8] {
                while let Some((buf, _)) = bm.pop_dirty(tag) {
                    bm.throw_slot(buf);
                }
            }
        }
    }

    /// Swaps the writer-visible dirty tag, called by the checkpoint
    /// coordinator just before it flushes the now-inactive generation.
    pub fn swap_dirty_tag(&self) -> u8 {
        let mut old = 0u8;
        for part in &self.partitions {
            let mut bm = part.bm.lock().unwrap();
            old = bm.current_tag;
            bm.current_tag = 1 - bm.current_tag;
        }
        old
    }

    /// Flushes every node still carrying `tag` through `store`, draining
    /// that generation's dirty list to empty.
    pub fn flush_dirty(&self, tag: u8, store: &PageStore) -> Result<usize> {
        let mut flushed = 0;
        for part in &self.partitions {
            loop {
                let popped = {
                    let mut bm = part.bm.lock().unwrap();
                    bm.pop_dirty(tag)
                };
                match popped {
                    Some((buf, pid)) => {
                        let page = part.pool[buf as usize].read().unwrap();
                        store.write_page(pid, &page.data)?;
                        flushed += 1;
                    }
                    None => break,
                }
            }
        }
        Ok(flushed)
    }

    pub fn dirty_count(&self, tag: u8) -> usize {
        self.partitions.iter().map(|p| p.bm.lock().unwrap().dirty_count(tag)).sum()
    }

    /// Best-effort manual eviction of one clean, unpinned node; mainly
    /// useful for tests that want to exercise the eviction path directly.
    pub fn evict_one(&self) -> bool {
        for part in &self.partitions {
            let mut bm = part.bm.lock().unwrap();
            let victim = bm.lru_tail;
            if victim != 0 && (bm.slots[victim as usize].state & PAGE_DIRTY) == 0 {
                bm.evict_from_lru(victim);
                return true;
            }
        }
        false
    }
}
