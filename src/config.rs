//! Shared types and the `DatabaseConfig` builder.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// PageId (u64) takes 8 bytes to store.
pub const PID_SIZE: usize = 8;
/// Page size in bytes. Fixed at compile time (see DESIGN.md open question on
/// runtime-configurable page sizes).
pub const PAGE_SIZE: usize = 8192;
/// 64 bit target.
pub const USIZE_SIZE: usize = 8;

/// Fixed node header: item count (2B) + type (1B) + left/right sibling ids.
pub const PAGE_HEADER_SIZE: usize = 2 + 1 + PID_SIZE + PID_SIZE;

pub type PageId = u64;
pub type BufferId = u32;
/// Offset within page, as an index into the search vector.
pub type ItemPointer = usize;

pub type IndexId = u64;
pub type TxnId = u64;

pub const SUPERBLOCK_0: PageId = 0;
pub const SUPERBLOCK_1: PageId = 1;
/// The free list lives at a fixed, reserved page rather than a page
/// discovered via the superblock's `free_list_head` chain (kept simple, one
/// page, a single bookkeeping page in the style of a single meta page).
pub const FREELIST_PID: PageId = 2;
/// The tree registry (index-id -> name/root/height) lives at a fixed,
/// reserved page too, one page's worth of trees (see DESIGN.md open
/// question on a multi-page registry chain).
pub const REGISTRY_PID: PageId = 3;
/// Highest page id reserved for the store's own bookkeeping; ids above this
/// are free for indexes and fragments.
pub const MAX_NON_DATA_PID: PageId = REGISTRY_PID;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// Number of condition variables used for waiting on in-flight page reads.
pub const N_BUSY_EVENTS: usize = 8;

pub const METADATA_SIZE: usize = 4 * 4;

pub const MAX_VALUE_LEN: usize = 64 * 1024 * 1024;
/// One less than `u8::MAX`: the control byte value 255 is reserved as the
/// +inf sentinel for the right-most entry of an internal node, so a real
/// key's length must never collide with it.
pub const MAX_KEY_LEN: usize = u8::MAX as usize - 1;

/// Values longer than this are stored out-of-line as a fragmented value
/// chain instead of inline in the leaf.
pub const FRAGMENT_THRESHOLD: usize = PAGE_SIZE / 4;

/// Node utilisation below this percentage triggers merge/rebalance on
/// delete.
pub const MERGE_THRESHOLD_PERCENT: u8 = 25;

/// Durability modes a writer may choose for a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Flush the redo log to disk before returning; strongest guarantee.
    Sync,
    /// Write to the OS but do not fsync.
    NoSync,
    /// Leave the record in the in-process buffer until full or checkpoint.
    NoFlush,
    /// Do not write to redo at all; only a checkpoint persists the change.
    NoRedo,
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::Sync
    }
}

/// Builder for the knobs a `Database::open` call needs.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub db_path: PathBuf,
    pub redo_log_path: Option<PathBuf>,
    pub cache_capacity_pages: usize,
    pub cache_partitions: usize,
    pub checkpoint_rate: Duration,
    /// A negative/disabled checkpoint rate is modeled here as `false`.
    pub checkpoint_rate_enabled: bool,
    pub checkpoint_size_threshold: u64,
    pub checkpoint_delay_threshold: Duration,
    pub max_checkpoint_threads: usize,
    pub default_lock_timeout: Duration,
    pub default_durability: DurabilityMode,
    pub encryption_key: Option<[u8; 32]>,
}

impl DatabaseConfig {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        DatabaseConfig {
            db_path: db_path.as_ref().to_path_buf(),
            redo_log_path: None,
            cache_capacity_pages: 128 * 1024,
            cache_partitions: 1,
            checkpoint_rate: Duration::from_secs(1),
            checkpoint_rate_enabled: true,
            checkpoint_size_threshold: 1024 * 1024 * 1024,
            checkpoint_delay_threshold: Duration::from_secs(60),
            max_checkpoint_threads: 1,
            default_lock_timeout: Duration::from_secs(10),
            default_durability: DurabilityMode::Sync,
            encryption_key: None,
        }
    }

    pub fn with_redo_log(mut self, path: impl AsRef<Path>) -> Self {
        self.redo_log_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_cache_capacity_pages(mut self, n: usize) -> Self {
        self.cache_capacity_pages = n.max(self.cache_partitions.max(1));
        self
    }

    pub fn with_cache_partitions(mut self, n: usize) -> Self {
        assert!(n.is_power_of_two(), "cache partitions must be a power of two");
        self.cache_partitions = n;
        self
    }

    pub fn with_checkpoint_rate(mut self, rate: Duration) -> Self {
        self.checkpoint_rate = rate;
        self.checkpoint_rate_enabled = true;
        self
    }

    /// Disables the periodic checkpoint timer entirely.
    pub fn without_periodic_checkpoint(mut self) -> Self {
        self.checkpoint_rate_enabled = false;
        self
    }

    pub fn with_max_checkpoint_threads(mut self, n: usize) -> Self {
        self.max_checkpoint_threads = n.max(1);
        self
    }

    pub fn with_default_lock_timeout(mut self, timeout: Duration) -> Self {
        self.default_lock_timeout = timeout;
        self
    }

    pub fn with_default_durability(mut self, mode: DurabilityMode) -> Self {
        self.default_durability = mode;
        self
    }

    pub fn with_encryption_key(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(key);
        self
    }
}
