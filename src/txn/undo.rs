//! In-memory logical undo log. Rolling back by discarding dirty cache
//! buffers only works if nothing reaches the data file before the whole
//! transaction commits; here the checkpoint coordinator can flush a
//! transaction's dirty pages to the data file mid-transaction (the
//! double-buffered dirty tag), so rollback instead re-applies the inverse of
//! each operation through the B-tree layer. Scoped to the lifetime of one
//! in-progress transaction; nothing here is itself persisted (a crash
//! mid-transaction leaves nothing committed to undo, so there is nothing for
//! recovery to redo for it either).

use crate::config::{IndexId, Key, Value};

/// One entry: what to do to undo a single B-tree mutation.
#[derive(Debug, Clone)]
pub enum UndoEntry {
    /// The key didn't exist before; undo by removing it.
    Inserted { index_id: IndexId, key: Key },
    /// The key held `old_value` before; undo by restoring it.
    Updated { index_id: IndexId, key: Key, old_value: Value },
    /// The key held `old_value` before a removal; undo by restoring it.
    Deleted { index_id: IndexId, key: Key, old_value: Value },
}

#[derive(Default)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    pub fn new() -> UndoLog {
        UndoLog::default()
    }

    pub fn push(&mut self, entry: UndoEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drains entries in LIFO order for replay during rollback. A savepoint
    /// marker is just a remembered length; `drain_to` undoes everything
    /// recorded after it.
    pub fn drain_to(&mut self, savepoint: usize) -> Vec<UndoEntry> {
        self.entries.split_off(savepoint).into_iter().rev().collect()
    }

    pub fn savepoint(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
