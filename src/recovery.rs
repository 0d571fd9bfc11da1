//! Crash recovery: replays the redo log into the B-tree on open, reapplying
//! every transaction whose commit record was reached and discarding the
//! buffered writes of any transaction that was still in flight when the
//! process stopped.
//!
//! Logical replay rather than page-image replay: each transaction's stores
//! are buffered by id as the log is walked and only pushed through
//! [`crate::btree::Tree`] once that transaction's final record is seen, so
//! recovery reconstructs committed state from the last durable B-tree shape
//! on disk rather than depending on which dirty cache pages happened to be
//! flushed before the crash.

use std::collections::HashMap;

use crate::btree::registry::Registry;
use crate::btree::Tree;
use crate::cache::NodeCache;
use crate::config::{BufferId, IndexId, Key, TxnId, Value};
use crate::error::Result;
use crate::redo::RedoOp;
use crate::store::PageStore;

const RECOVERY_FLUSH_THRESHOLD: BufferId = BufferId::MAX;

/// Replays `ops` (as produced by [`crate::redo::RedoLog::replay`]) against
/// `registry`, returning the highest transaction id observed so the caller
/// can seed the next id past it. A transaction that entered the log but
/// never reached a final record is left out of `registry` entirely — it's
/// rolled back by omission, the same outcome `crate::txn::undo` documents
/// for an explicit rollback.
pub(crate) fn apply(ops: &[RedoOp], cache: &NodeCache, store: &PageStore, registry: &mut Registry) -> Result<TxnId> {
    let tree = Tree::new(cache, store);
    let mut pending: HashMap<TxnId, Vec<(IndexId, Key, Option<Value>)>> = HashMap::new();
    let mut highest_txn_id: TxnId = 0;

    for op in ops {
        match op {
            RedoOp::TxnEnter { txn_id } => {
                highest_txn_id = highest_txn_id.max(*txn_id);
                pending.entry(*txn_id).or_default();
            }
            RedoOp::TxnStore { txn_id, index_id, key, value } => {
                highest_txn_id = highest_txn_id.max(*txn_id);
                pending.entry(*txn_id).or_default().push((*index_id, key.clone(), value.clone()));
            }
            RedoOp::TxnCommitFinal { txn_id } => {
                highest_txn_id = highest_txn_id.max(*txn_id);
                if let Some(writes) = pending.remove(txn_id) {
                    replay_writes(&tree, store, registry, writes)?;
                }
            }
            RedoOp::TxnRollbackFinal { txn_id } => {
                highest_txn_id = highest_txn_id.max(*txn_id);
                pending.remove(txn_id);
            }
            RedoOp::TxnStoreCommitFinal { txn_id, index_id, key, value } => {
                highest_txn_id = highest_txn_id.max(*txn_id);
                replay_writes(&tree, store, registry, vec![(*index_id, key.clone(), value.clone())])?;
            }
            RedoOp::Store { index_id, key, value } | RedoOp::StoreNoLock { index_id, key, value } => {
                replay_writes(&tree, store, registry, vec![(*index_id, key.clone(), value.clone())])?;
            }
            RedoOp::RenameIndex { index_id, name } => {
                let _ = registry.rename(*index_id, name.clone());
            }
            RedoOp::DeleteIndex { index_id } => {
                let _ = registry.drop_index(*index_id);
            }
            RedoOp::Timestamp(_)
            | RedoOp::Reset
            | RedoOp::Shutdown
            | RedoOp::Close
            | RedoOp::EndFile
            | RedoOp::TxnRollback { .. }
            | RedoOp::TxnCommit { .. }
            | RedoOp::TxnCustom { .. }
            | RedoOp::TxnCustomLock { .. } => {}
        }
    }
    Ok(highest_txn_id)
}

fn replay_writes(
    tree: &Tree<'_>,
    store: &PageStore,
    registry: &mut Registry,
    writes: Vec<(IndexId, Key, Option<Value>)>,
) -> Result<()> {
    for (index_id, key, value) in writes {
        let Some(entry) = registry.get(index_id) else { continue };
        let mut meta = entry.meta;
        let mut sync = Vec::new();
        match value {
            Some(value) => tree.upsert(&mut meta, &key, &value, RECOVERY_FLUSH_THRESHOLD, &mut sync)?,
            None => tree.remove(&mut meta, &key, RECOVERY_FLUSH_THRESHOLD, &mut sync)?,
        }
        for (pid, page) in sync {
            store.write_page(pid, &page.data)?;
        }
        if let Some(e) = registry.get_mut(index_id) {
            e.meta = meta;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::TreeMeta;
    use crate::store::crypto::NoopCrypto;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn fresh_store(path: &std::path::Path) -> PageStore {
        PageStore::open(path, Arc::new(NoopCrypto)).unwrap()
    }

    #[test]
    fn committed_txn_is_replayed_and_uncommitted_is_dropped() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir.path().join("db"));
        let cache = NodeCache::new(16, 1);
        let mut registry = Registry::fresh();
        let index_id = registry.create(None).unwrap();

        let ops = vec![
            RedoOp::TxnEnter { txn_id: 1 },
            RedoOp::TxnStore { txn_id: 1, index_id, key: b"a".to_vec(), value: Some(b"1".to_vec()) },
            RedoOp::TxnCommitFinal { txn_id: 1 },
            RedoOp::TxnEnter { txn_id: 2 },
            RedoOp::TxnStore { txn_id: 2, index_id, key: b"b".to_vec(), value: Some(b"2".to_vec()) },
        ];

        let highest = apply(&ops, &cache, &store, &mut registry).unwrap();
        assert_eq!(highest, 2);

        let tree = Tree::new(&cache, &store);
        let meta = registry.get(index_id).unwrap().meta;
        assert_eq!(tree.find(&meta, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.find(&meta, b"b").unwrap(), None);
    }

    #[test]
    fn rolled_back_txn_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir.path().join("db"));
        let cache = NodeCache::new(16, 1);
        let mut registry = Registry::fresh();
        let index_id = registry.create(None).unwrap();

        let ops = vec![
            RedoOp::TxnEnter { txn_id: 1 },
            RedoOp::TxnStore { txn_id: 1, index_id, key: b"a".to_vec(), value: Some(b"1".to_vec()) },
            RedoOp::TxnRollbackFinal { txn_id: 1 },
        ];

        apply(&ops, &cache, &store, &mut registry).unwrap();
        let meta = registry.get(index_id).unwrap().meta;
        assert_eq!(meta.root, TreeMeta::default().root);
    }
}
