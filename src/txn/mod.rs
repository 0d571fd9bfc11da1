//! Transaction runtime: a `Transaction` rolls back on drop if never
//! explicitly committed, with a durability mode, a lock list released at
//! transaction end, a logical undo log, and savepoint-style scopes layered
//! on top.

pub mod pending;
pub mod undo;

use std::time::Duration;

use crate::btree::{Tree, TreeMeta};
use crate::config::{BufferId, DurabilityMode, IndexId, Key, Value};
use crate::error::{Error, Result};
use crate::redo::RedoOp;
use crate::Database;

use undo::{UndoEntry, UndoLog};

const WAL_FLUSH_THRESHOLD: BufferId = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    InProgress,
    Committed,
    RolledBack,
}

/// A read/write transaction. Row-level locks ([`crate::lock::LockManager`])
/// are held for the transaction's entire lifetime and are what actually
/// serialize and deadlock-detect concurrent writers; several transactions
/// can be `InProgress` at once. `db.registry`'s write lock is taken only for
/// the brief span of an individual structural B-tree mutation (see
/// DESIGN.md), so it never blocks a second transaction from starting or
/// from holding its own row locks concurrently.
pub struct Transaction<'a> {
    db: &'a Database,
    status: TransactionStatus,
    txn_id: u64,
    durability: DurabilityMode,
    lock_timeout: Duration,
    undo: UndoLog,
    locks_held: Vec<(IndexId, Key)>,
    redo_entered: bool,
    attachment: Option<String>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(db: &'a Database, txn_id: u64, durability: DurabilityMode, lock_timeout: Duration) -> Transaction<'a> {
        Transaction {
            db,
            status: TransactionStatus::InProgress,
            txn_id,
            durability,
            lock_timeout,
            undo: UndoLog::new(),
            locks_held: Vec::new(),
            redo_entered: false,
            attachment: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.txn_id
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Attaches a human-readable name surfaced in lock-conflict errors.
    pub fn set_attachment(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.db.lock_mgr.set_attachment(self.txn_id, name.clone());
        self.attachment = Some(name);
    }

    pub fn set_durability(&mut self, mode: DurabilityMode) {
        self.durability = mode;
    }

    fn ensure_in_progress(&self) -> Result<()> {
        if self.status != TransactionStatus::InProgress {
            return Err(Error::out_of_bounds("transaction is no longer in progress"));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.db.replication.is_replica() {
            return Err(Error::UnmodifiableReplica);
        }
        Ok(())
    }

    /// Wraps a lock acquisition so a deadlock or timeout is also reported
    /// through the event listener before propagating.
    fn lock_exclusive(&mut self, index_id: IndexId, key: &[u8]) -> Result<()> {
        match self.db.lock_mgr.lock_exclusive(self.txn_id, index_id, key, self.lock_timeout) {
            Ok(()) => {
                self.locks_held.push((index_id, key.to_vec()));
                Ok(())
            }
            Err(e) => {
                self.report_lock_error(&e);
                Err(e)
            }
        }
    }

    fn lock_shared(&mut self, index_id: IndexId, key: &[u8]) -> Result<()> {
        match self.db.lock_mgr.lock_shared(self.txn_id, index_id, key, self.lock_timeout) {
            Ok(()) => {
                self.locks_held.push((index_id, key.to_vec()));
                Ok(())
            }
            Err(e) => {
                self.report_lock_error(&e);
                Err(e)
            }
        }
    }

    fn report_lock_error(&self, e: &Error) {
        match e {
            Error::Deadlock(_) => self.db.listener.on_event(&crate::event::Event::DeadlockDetected { txn_id: self.txn_id }),
            Error::LockTimeout { .. } => self.db.listener.on_event(&crate::event::Event::LockTimeout { txn_id: self.txn_id }),
            _ => {}
        }
    }

    fn tree(&self) -> Tree<'_> {
        Tree::new(&self.db.state.cache, &self.db.state.store)
    }

    fn log(&mut self, op: RedoOp) -> Result<()> {
        if let Some(redo) = &self.db.state.redo {
            redo.append(&op, self.durability)?;
        }
        Ok(())
    }

    fn ensure_entered(&mut self) -> Result<()> {
        if !self.redo_entered {
            self.log(RedoOp::TxnEnter { txn_id: self.txn_id })?;
            self.redo_entered = true;
        }
        Ok(())
    }

    fn meta_for(&self, index_id: IndexId) -> Result<TreeMeta> {
        Ok(self.db.registry.read().unwrap().get(index_id).ok_or(Error::NoSuchValue)?.meta)
    }

    /// Runs `f` against `index_id`'s current tree meta, holding the
    /// registry's write lock only for `f`'s duration so the structural
    /// mutation it performs and the meta update it produces land
    /// atomically, without serializing the rest of the transaction against
    /// other concurrently `InProgress` transactions.
    fn mutate_tree<F>(&self, index_id: IndexId, f: F) -> Result<()>
    where
        F: FnOnce(&Tree<'_>, &mut TreeMeta) -> Result<()>,
    {
        let mut registry = self.db.registry.write().unwrap();
        let mut meta = registry.get(index_id).ok_or(Error::NoSuchValue)?.meta;
        f(&self.tree(), &mut meta)?;
        if let Some(entry) = registry.get_mut(index_id) {
            entry.meta = meta;
        }
        Ok(())
    }

    /// Reads `key` in `index_id`'s tree, taking a shared row lock first.
    pub fn get(&mut self, index_id: IndexId, key: &[u8]) -> Result<Option<Value>> {
        self.ensure_in_progress()?;
        self.lock_shared(index_id, key)?;
        let meta = self.meta_for(index_id)?;
        self.tree().find(&meta, key)
    }

    /// Inserts or updates `key` in `index_id`'s tree.
    pub fn store(&mut self, index_id: IndexId, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_in_progress()?;
        self.ensure_writable()?;
        self.lock_exclusive(index_id, key)?;
        self.ensure_entered()?;

        let key_owned = key.to_vec();
        let value_owned = value.to_vec();
        let mut old_value = None;
        let mut sync = Vec::new();
        self.mutate_tree(index_id, |tree, meta| {
            old_value = tree.find(meta, &key_owned)?;
            tree.upsert(meta, &key_owned, &value_owned, WAL_FLUSH_THRESHOLD, &mut sync)
        })?;
        self.flush_sync_candidates(sync)?;

        self.log(RedoOp::TxnStore { txn_id: self.txn_id, index_id, key: key.to_vec(), value: Some(value.to_vec()) })?;
        match old_value {
            None => self.undo.push(UndoEntry::Inserted { index_id, key: key.to_vec() }),
            Some(old) => self.undo.push(UndoEntry::Updated { index_id, key: key.to_vec(), old_value: old }),
        }
        Ok(())
    }

    /// Removes `key` from `index_id`'s tree, a no-op if absent.
    pub fn remove(&mut self, index_id: IndexId, key: &[u8]) -> Result<()> {
        self.ensure_in_progress()?;
        self.ensure_writable()?;
        self.lock_exclusive(index_id, key)?;

        let key_owned = key.to_vec();
        let mut old_value = None;
        let mut sync = Vec::new();
        self.mutate_tree(index_id, |tree, meta| {
            old_value = tree.find(meta, &key_owned)?;
            if old_value.is_some() {
                tree.remove(meta, &key_owned, WAL_FLUSH_THRESHOLD, &mut sync)?;
            }
            Ok(())
        })?;
        let Some(old_value) = old_value else {
            return Ok(());
        };
        self.ensure_entered()?;
        self.flush_sync_candidates(sync)?;

        self.log(RedoOp::TxnStore { txn_id: self.txn_id, index_id, key: key.to_vec(), value: None })?;
        self.undo.push(UndoEntry::Deleted { index_id, key: key.to_vec(), old_value });
        Ok(())
    }

    /// Early physical flush of nodes that crossed the dirty-list threshold
    /// mid-transaction, independent of the logical redo log and the
    /// periodic checkpoint. A subsequent checkpoint harmlessly rewrites the
    /// same page if it's still tagged dirty.
    fn flush_sync_candidates(&self, sync: Vec<(crate::config::PageId, crate::btree::node::NodePage)>) -> Result<()> {
        for (pid, page) in sync {
            self.db.state.store.write_page(pid, &page.data)?;
        }
        Ok(())
    }

    /// Marks a savepoint; `exit_scope(savepoint, false)` rolls back only
    /// what happened since.
    pub fn enter_scope(&self) -> usize {
        self.undo.savepoint()
    }

    pub fn exit_scope(&mut self, savepoint: usize, commit: bool) -> Result<()> {
        self.ensure_in_progress()?;
        if commit {
            return Ok(());
        }
        let entries = self.undo.drain_to(savepoint);
        self.undo_entries(entries)
    }

    fn undo_entries(&mut self, entries: Vec<UndoEntry>) -> Result<()> {
        for entry in entries {
            match entry {
                UndoEntry::Inserted { index_id, key } => {
                    let mut sync = Vec::new();
                    self.mutate_tree(index_id, |tree, meta| tree.remove(meta, &key, WAL_FLUSH_THRESHOLD, &mut sync))?;
                    self.flush_sync_candidates(sync)?;
                }
                UndoEntry::Updated { index_id, key, old_value } | UndoEntry::Deleted { index_id, key, old_value } => {
                    let mut sync = Vec::new();
                    self.mutate_tree(index_id, |tree, meta| tree.upsert(meta, &key, &old_value, WAL_FLUSH_THRESHOLD, &mut sync))?;
                    self.flush_sync_candidates(sync)?;
                }
            }
        }
        Ok(())
    }

    fn release_locks(&mut self) {
        for (index_id, key) in self.locks_held.drain(..) {
            self.db.lock_mgr.unlock(self.txn_id, index_id, &key);
        }
        self.db.lock_mgr.clear_attachment(self.txn_id);
    }

    /// Traverses every registered tree, validating search-vector ordering
    /// and returning the total key count.
    pub fn verify(&mut self) -> Result<u64> {
        self.ensure_in_progress()?;
        let registry = self.db.registry.read().unwrap();
        let ids: Vec<IndexId> = registry.index_ids().collect();
        let tree = self.tree();
        let mut total = 0u64;
        for id in ids {
            let meta = registry.get(id).unwrap().meta;
            total += tree.verify(&meta)?;
        }
        Ok(total)
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_in_progress()?;
        if self.redo_entered {
            self.log(RedoOp::TxnCommitFinal { txn_id: self.txn_id })?;
        }
        self.db.registry.read().unwrap().save(&self.db.state.store)?;
        let position = match &self.db.state.redo {
            Some(redo) => redo.position()?,
            None => 0,
        };
        self.db.pending.lock().unwrap().push(self.txn_id, position);
        self.db.checkpointer.note_committed_txn(self.txn_id);
        if self.redo_entered {
            self.db.replication.confirm(position, self.durability)?;
        }
        self.release_locks();
        self.status = TransactionStatus::Committed;
        self.db.listener.on_event(&crate::event::Event::TransactionCommitted { txn_id: self.txn_id });
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_in_progress()?;
        let entries = self.undo.drain_to(0);
        self.undo_entries(entries)?;
        if self.redo_entered {
            self.log(RedoOp::TxnRollbackFinal { txn_id: self.txn_id })?;
        }
        self.release_locks();
        self.status = TransactionStatus::RolledBack;
        self.db.listener.on_event(&crate::event::Event::TransactionRolledBack { txn_id: self.txn_id });
        Ok(())
    }
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        if self.status == TransactionStatus::InProgress {
            let _ = self.rollback();
        }
    }
}
