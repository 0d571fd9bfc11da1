//! Checkpoint coordinator: a periodic background flush on top of
//! [`crate::cache::NodeCache`]'s double-buffered dirty tags and
//! [`crate::store::PageStore::commit`].

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cache::NodeCache;
use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::redo::RedoLog;
use crate::store::PageStore;

/// The pieces a checkpoint touches, shared between `Database` and the
/// background checkpoint thread via `Arc`.
pub struct CheckpointState {
    pub store: PageStore,
    pub cache: NodeCache,
    pub redo: Option<RedoLog>,
}

/// Runs the checkpoint sequence:
/// 1. bail out if checkpointing is currently suspended,
/// 2. snapshot the redo position/last txn id to stamp into the superblock,
/// 3. swap the writer-visible dirty tag,
/// 4. flush the now-inactive generation's dirty nodes,
/// 5. commit (under the page store's own exclusive commit lock),
/// 6. truncate the redo log now that its contents are durable in the data
///    file,
/// 7. return, leaving the suspend counter untouched (callers bracket their
///    own suspend/resume).
pub(crate) fn run_once(state: &CheckpointState, last_txn_id: u64) -> Result<usize> {
    let redo_position = match &state.redo {
        Some(redo) => redo.position()?,
        None => 0,
    };
    let old_tag = state.cache.swap_dirty_tag();
    let mut flushed = 0usize;
    state.store.commit(&redo_position.to_be_bytes(), redo_position, last_txn_id, || {
        flushed = state.cache.flush_dirty(old_tag, &state.store)?;
        Ok(())
    })?;
    if let Some(redo) = &state.redo {
        redo.reset()?;
    }
    Ok(flushed)
}

/// Background checkpoint driver: a periodic timer plus a dirty-byte-count
/// and time-since-last-checkpoint threshold — whichever condition trips
/// first triggers a checkpoint.
pub struct Checkpointer {
    state: Arc<CheckpointState>,
    suspend: Arc<AtomicIsize>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Condvar>,
    wake_lock: Arc<Mutex<()>>,
    last_txn_id: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    pub fn spawn(state: Arc<CheckpointState>, config: &DatabaseConfig) -> Checkpointer {
        let suspend = Arc::new(AtomicIsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Condvar::new());
        let wake_lock = Arc::new(Mutex::new(()));
        let last_txn_id = Arc::new(AtomicU64::new(0));

        let handle = if config.checkpoint_rate_enabled {
            let state = state.clone();
            let suspend = suspend.clone();
            let shutdown = shutdown.clone();
            let wake = wake.clone();
            let wake_lock = wake_lock.clone();
            let last_txn_id = last_txn_id.clone();
            let rate = config.checkpoint_rate;
            let size_threshold = config.checkpoint_size_threshold;
            let delay_threshold = config.checkpoint_delay_threshold;
            Some(thread::spawn(move || {
                let mut last_run = Instant::now();
                loop {
                    let guard = wake_lock.lock().unwrap();
                    let (_guard, _timeout) = wake.wait_timeout(guard, rate).unwrap();
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    if suspend.load(Ordering::Acquire) > 0 {
                        continue;
                    }
                    let dirty_bytes =
                        (state.cache.dirty_count(0) + state.cache.dirty_count(1)) as u64 * crate::config::PAGE_SIZE as u64;
                    let due_by_size = dirty_bytes >= size_threshold;
                    let due_by_delay = last_run.elapsed() >= delay_threshold;
                    if due_by_size || due_by_delay {
                        let _ = run_once(&state, last_txn_id.load(Ordering::Acquire));
                        last_run = Instant::now();
                    }
                }
            }))
        } else {
            None
        };

        Checkpointer { state, suspend, shutdown, wake, wake_lock, last_txn_id, handle }
    }

    /// Increments the suspend counter; the background thread skips
    /// checkpointing while it's above zero.
    pub fn suspend(&self) {
        self.suspend.fetch_add(1, Ordering::AcqRel);
    }

    pub fn resume(&self) {
        self.suspend.fetch_sub(1, Ordering::AcqRel);
    }

    /// Records the most recently committed transaction id, stamped into the
    /// next checkpoint's superblock.
    pub fn note_committed_txn(&self, txn_id: u64) {
        self.last_txn_id.store(txn_id, Ordering::Release);
    }

    /// Forces an out-of-band checkpoint regardless of thresholds.
    pub fn checkpoint_now(&self) -> Result<usize> {
        run_once(&self.state, self.last_txn_id.load(Ordering::Acquire))
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::crypto::NoopCrypto;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn state(dir: &std::path::Path) -> Arc<CheckpointState> {
        let store = PageStore::open(&dir.join("db"), Arc::new(NoopCrypto)).unwrap();
        let cache = NodeCache::new(16, 1);
        Arc::new(CheckpointState { store, cache, redo: None })
    }

    #[test]
    fn manual_checkpoint_runs_without_a_background_thread() {
        let dir = tempdir().unwrap();
        let st = state(dir.path());
        let mut config = DatabaseConfig::new(dir.path().join("db"));
        config.checkpoint_rate_enabled = false;
        let checkpointer = Checkpointer::spawn(st, &config);
        assert_eq!(checkpointer.checkpoint_now().unwrap(), 0);
    }

    #[test]
    fn suspend_resume_round_trips() {
        let dir = tempdir().unwrap();
        let st = state(dir.path());
        let mut config = DatabaseConfig::new(dir.path().join("db"));
        config.checkpoint_rate_enabled = false;
        let checkpointer = Checkpointer::spawn(st, &config);
        checkpointer.suspend();
        checkpointer.resume();
        assert_eq!(checkpointer.suspend.load(Ordering::Acquire), 0);
    }
}
