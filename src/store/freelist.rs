//! Free page tracking: allocation pops a released id first, only extending
//! the file when none are available. Deletes are staged into `pending` and
//! folded into the durable free list only once the commit that deleted them
//! durably lands — a page freed by an uncommitted transaction must not be
//! handed out again before that commit is durable.

use crate::config::{PageId, MAX_NON_DATA_PID, PID_SIZE, USIZE_SIZE};

#[derive(Debug, Clone, Default)]
pub struct FreeList {
    max_pid: PageId,
    released: Vec<PageId>,
    /// Pages deleted by transactions not yet durably committed.
    pending: Vec<PageId>,
}

impl FreeList {
    pub fn new() -> Self {
        FreeList { max_pid: MAX_NON_DATA_PID, released: Vec::new(), pending: Vec::new() }
    }

    pub fn with_max_pid(max_pid: PageId) -> Self {
        FreeList { max_pid, released: Vec::new(), pending: Vec::new() }
    }

    pub fn max_pid(&self) -> PageId {
        self.max_pid
    }

    /// Pop a free id, extending the logical file if none is available.
    pub fn alloc(&mut self) -> PageId {
        if let Some(pid) = self.released.pop() {
            pid
        } else {
            self.max_pid += 1;
            self.max_pid
        }
    }

    /// Immediately reusable.
    pub fn recycle(&mut self, pid: PageId) {
        self.released.push(pid);
    }

    /// Staged for release only once the deleting commit is durable.
    pub fn stage_delete(&mut self, pid: PageId) {
        self.pending.push(pid);
    }

    /// Folds staged deletes into the durable free list; called once the
    /// commit containing them is durable.
    pub fn fold_pending(&mut self) {
        self.released.append(&mut self.pending);
    }

    /// Drops staged deletes without folding them, used on rollback.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    pub fn serialize_into(&self, page: &mut [u8]) {
        let mut pos = 0usize;
        page[pos..pos + PID_SIZE].copy_from_slice(&self.max_pid.to_be_bytes());
        pos += PID_SIZE;
        page[pos..pos + USIZE_SIZE].copy_from_slice(&self.released.len().to_be_bytes());
        pos += USIZE_SIZE;
        for pid in &self.released {
            page[pos..pos + PID_SIZE].copy_from_slice(&pid.to_be_bytes());
            pos += PID_SIZE;
        }
    }

    pub fn deserialize_from(page: &[u8]) -> Self {
        let mut pos = 0usize;
        let max_pid = PageId::from_be_bytes(page[pos..pos + PID_SIZE].try_into().unwrap());
        pos += PID_SIZE;
        let n = usize::from_be_bytes(page[pos..pos + USIZE_SIZE].try_into().unwrap());
        pos += USIZE_SIZE;
        let mut released = Vec::with_capacity(n);
        for _ in 0..n {
            released.push(PageId::from_be_bytes(page[pos..pos + PID_SIZE].try_into().unwrap()));
            pos += PID_SIZE;
        }
        FreeList { max_pid, released, pending: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_prefers_released_pages() {
        let mut fl = FreeList::with_max_pid(1);
        fl.recycle(5);
        assert_eq!(fl.alloc(), 5);
        assert_eq!(fl.alloc(), 2); // extends past max_pid
    }

    #[test]
    fn staged_deletes_are_not_reusable_until_folded() {
        let mut fl = FreeList::with_max_pid(1);
        fl.stage_delete(7);
        assert_eq!(fl.alloc(), 2);
        fl.fold_pending();
        assert_eq!(fl.alloc(), 7);
    }

    #[test]
    fn round_trips_through_serialize() {
        let mut fl = FreeList::with_max_pid(10);
        fl.recycle(3);
        fl.recycle(4);
        let mut buf = vec![0u8; 128];
        fl.serialize_into(&mut buf);
        let back = FreeList::deserialize_from(&buf);
        assert_eq!(back.max_pid(), 10);
    }
}
