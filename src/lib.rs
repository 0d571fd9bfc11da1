//! Embedded, transactional key/value storage engine core.
//!
//! A page store (`store`), a node cache (`cache`), the B-tree operations
//! layer (`btree`), a row lock manager (`lock`), a logical redo log
//! (`redo`), a transaction runtime (`txn`), and a checkpoint coordinator
//! (`checkpoint`), tied together by [`Database`].

pub mod btree;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod hash;
pub mod lock;
pub mod redo;
mod recovery;
pub mod replication;
pub mod store;
pub mod txn;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use btree::registry::Registry;
use btree::Tree;
use cache::NodeCache;
use checkpoint::{CheckpointState, Checkpointer};
use event::{Event, EventListener, NoopEventListener};
use lock::LockManager;
use redo::RedoLog;
use replication::{NoopReplicationManager, ReplicationManager};
use store::crypto::{Crypto, NoopCrypto, XorStreamCrypto};
use store::PageStore;
use txn::pending::PendingTxnQueue;

pub use config::{DatabaseConfig, DurabilityMode, IndexId, Key, TxnId, Value};
pub use error::{DeadlockSet, Error, LockInfo, Result};
pub use txn::{Transaction, TransactionStatus};

/// An open database: the page store, node cache, row lock table, redo log,
/// tree registry, and checkpoint coordinator, reached only through
/// [`Transaction`] (for read/write work) or [`Database::view`] (autocommit
/// reads).
pub struct Database {
    pub(crate) state: Arc<CheckpointState>,
    pub(crate) lock_mgr: LockManager,
    pub(crate) registry: RwLock<Registry>,
    next_txn_id: AtomicU64,
    pub(crate) pending: Mutex<PendingTxnQueue>,
    config: DatabaseConfig,
    pub(crate) checkpointer: Checkpointer,
    pub(crate) replication: Box<dyn ReplicationManager>,
    pub(crate) listener: Box<dyn EventListener>,
}

impl Database {
    pub fn open(config: DatabaseConfig) -> Result<Database> {
        let codec: Arc<dyn Crypto> = match config.encryption_key {
            Some(key) => Arc::new(XorStreamCrypto::new(key)),
            None => Arc::new(NoopCrypto),
        };
        let store = PageStore::open(&config.db_path, codec)?;
        let mut registry = Registry::load(&store)?;
        let cache = NodeCache::new(config.cache_capacity_pages, config.cache_partitions);
        let redo = match &config.redo_log_path {
            Some(path) => Some(RedoLog::open(path)?),
            None => None,
        };

        // Reapply whatever the redo log holds past the last checkpoint:
        // committed transactions are replayed into the registry's trees,
        // transactions that never reached a final record are dropped by
        // omission (see `recovery`).
        let mut recovered_txn_id = 0;
        let mut recovered = false;
        if let Some(redo) = &redo {
            let ops = RedoLog::replay(redo.path())?;
            if !ops.is_empty() {
                recovered_txn_id = recovery::apply(&ops, &cache, &store, &mut registry)?;
                registry.save(&store)?;
                recovered = true;
            }
        }

        let state = Arc::new(CheckpointState { store, cache, redo });
        if recovered {
            // Flush the pages recovery just dirtied, stamp a fresh
            // superblock, and reset the redo log now that its contents are
            // durable again in the data file.
            checkpoint::run_once(&state, recovered_txn_id)?;
        }
        let checkpointer = Checkpointer::spawn(state.clone(), &config);
        if recovered_txn_id > 0 {
            checkpointer.note_committed_txn(recovered_txn_id);
        }
        let bucket_count = (config.cache_capacity_pages / 4).max(16);

        Ok(Database {
            state,
            lock_mgr: LockManager::new(bucket_count),
            registry: RwLock::new(registry),
            next_txn_id: AtomicU64::new(recovered_txn_id + 1),
            pending: Mutex::new(PendingTxnQueue::new()),
            config,
            checkpointer,
            replication: Box::new(NoopReplicationManager),
            listener: Box::new(NoopEventListener),
        })
    }

    pub fn set_replication_manager(&mut self, mgr: Box<dyn ReplicationManager>) {
        self.replication = mgr;
    }

    pub fn set_event_listener(&mut self, listener: Box<dyn EventListener>) {
        self.listener = listener;
    }

    /// Starts a read/write transaction at the database's default
    /// durability mode.
    pub fn begin(&self) -> Transaction<'_> {
        self.begin_with_durability(self.config.default_durability)
    }

    pub fn begin_with_durability(&self, durability: DurabilityMode) -> Transaction<'_> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        Transaction::new(self, txn_id, durability, self.config.default_lock_timeout)
    }

    /// Autocommit read, bypassing the row lock table and the undo log
    /// entirely — a lock-free snapshot read of whatever is currently
    /// committed.
    pub fn view(&self, index_id: IndexId, key: &[u8]) -> Result<Option<Value>> {
        let registry = self.registry.read().unwrap();
        let meta = registry.get(index_id).ok_or(Error::NoSuchValue)?.meta;
        Tree::new(&self.state.cache, &self.state.store).find(&meta, key)
    }

    pub fn create_index(&self, name: Option<&str>) -> Result<IndexId> {
        let mut registry = self.registry.write().unwrap();
        let id = registry.create(name.map(str::to_string))?;
        registry.save(&self.state.store)?;
        drop(registry);
        self.listener.on_event(&Event::IndexCreated { index_id: id, name: name.map(str::to_string) });
        Ok(id)
    }

    pub fn drop_index(&self, index_id: IndexId) -> Result<()> {
        let mut registry = self.registry.write().unwrap();
        registry.drop_index(index_id)?;
        registry.save(&self.state.store)?;
        drop(registry);
        self.listener.on_event(&Event::IndexDropped { index_id });
        Ok(())
    }

    pub fn find_index(&self, name: &str) -> Option<IndexId> {
        self.registry.read().unwrap().find_by_name(name)
    }

    /// Runs an out-of-band checkpoint regardless of the periodic timer or
    /// its thresholds.
    pub fn checkpoint(&self) -> Result<usize> {
        self.listener.on_event(&Event::CheckpointBegin);
        let flushed = self.checkpointer.checkpoint_now()?;
        self.listener.on_event(&Event::CheckpointComplete { pages_flushed: flushed });
        Ok(flushed)
    }

    pub fn suspend_checkpoints(&self) {
        self.checkpointer.suspend();
    }

    pub fn resume_checkpoints(&self) {
        self.checkpointer.resume();
    }

    /// Releases every transaction whose commit position is now known
    /// durable, returning their ids.
    pub fn confirm_up_to(&self, redo_position: u64) -> Vec<TxnId> {
        self.pending.lock().unwrap().confirm_up_to(redo_position)
    }

    pub fn close(&self) -> Result<()> {
        self.state.store.close()
    }
}
