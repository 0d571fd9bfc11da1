//! The page store: durable fixed-size page allocation, recycling, and
//! crash-consistent commit. Node caching lives separately in
//! [`crate::cache::NodeCache`].

pub mod crypto;
pub mod freelist;
pub mod superblock;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use fs2::FileExt as _;

use crate::config::{PageId, FREELIST_PID, MAX_NON_DATA_PID, PAGE_SIZE, REGISTRY_PID, SUPERBLOCK_0, SUPERBLOCK_1};
use crate::error::{Error, Result};
use crate::store::crypto::{Crypto, NoopCrypto};
use crate::store::freelist::FreeList;
use crate::store::superblock::Superblock;

struct State {
    freelist: FreeList,
    /// Which of SUPERBLOCK_0/SUPERBLOCK_1 is currently authoritative.
    active_slot: u8,
    redo_position: u64,
    last_txn_id: u64,
    extra_data: [u8; superblock::EXTRA_DATA_LEN],
}

pub struct PageStore {
    file: File,
    /// Guards the exact ordering of a commit against concurrent page writes.
    /// Ordinary page writes take the shared side; `commit` takes the
    /// exclusive side.
    commit_lock: RwLock<()>,
    state: Mutex<State>,
    codec: Arc<dyn Crypto>,
}

impl PageStore {
    pub fn open(path: &Path, codec: Arc<dyn Crypto>) -> Result<PageStore> {
        let existed = path.exists();
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::Corrupt("database file is already locked by another process".into()))?;

        let (state, file) = if existed && file.metadata()?.len() >= PAGE_SIZE as u64 * 4 {
            Self::recover_state(file)?
        } else {
            Self::init_fresh(file)?
        };

        Ok(PageStore { file, commit_lock: RwLock::new(()), state: Mutex::new(state), codec })
    }

    fn init_fresh(file: File) -> Result<(State, File)> {
        let sb = Superblock::fresh();
        let encoded = sb.encode();
        file.write_all_at(&encoded, SUPERBLOCK_0 as u64 * PAGE_SIZE as u64)?;
        file.write_all_at(&encoded, SUPERBLOCK_1 as u64 * PAGE_SIZE as u64)?;
        let freelist = FreeList::with_max_pid(MAX_NON_DATA_PID);
        let mut freelist_buf = [0u8; PAGE_SIZE];
        freelist.serialize_into(&mut freelist_buf);
        file.write_all_at(&freelist_buf, FREELIST_PID as u64 * PAGE_SIZE as u64)?;
        // Zeroed registry page; `Registry::load` treats a magic mismatch as
        // "no trees yet" rather than corruption.
        let registry_buf = [0u8; PAGE_SIZE];
        file.write_all_at(&registry_buf, REGISTRY_PID as u64 * PAGE_SIZE as u64)?;
        file.sync_all()?;
        let state = State {
            freelist,
            active_slot: 0,
            redo_position: 0,
            last_txn_id: 0,
            extra_data: [0u8; superblock::EXTRA_DATA_LEN],
        };
        Ok((state, file))
    }

    fn recover_state(file: File) -> Result<(State, File)> {
        let mut buf0 = [0u8; PAGE_SIZE];
        let mut buf1 = [0u8; PAGE_SIZE];
        file.read_exact_at(&mut buf0, SUPERBLOCK_0 as u64 * PAGE_SIZE as u64)?;
        file.read_exact_at(&mut buf1, SUPERBLOCK_1 as u64 * PAGE_SIZE as u64)?;
        let sb0 = Superblock::decode(&buf0);
        let sb1 = Superblock::decode(&buf1);
        let (slot, sb) = match (sb0, sb1) {
            (Ok(a), Ok(b)) => {
                if b.redo_position >= a.redo_position {
                    (1u8, b)
                } else {
                    (0u8, a)
                }
            }
            (Ok(a), Err(_)) => (0u8, a),
            (Err(_), Ok(b)) => (1u8, b),
            (Err(e), Err(_)) => return Err(e),
        };
        // The free list is kept at the fixed `FREELIST_PID` page rather than
        // a chain discovered via `free_list_head` (one page's worth of ids
        // is plenty for this core; a real multi-page chain is the same
        // extension `pagedata.rs`'s fragment chains already demonstrate).
        let mut page = [0u8; PAGE_SIZE];
        file.read_exact_at(&mut page, FREELIST_PID as u64 * PAGE_SIZE as u64)?;
        let freelist = FreeList::deserialize_from(&page);
        let state = State {
            freelist,
            active_slot: slot,
            redo_position: sb.redo_position,
            last_txn_id: sb.last_txn_id,
            extra_data: sb.extra_data,
        };
        Ok((state, file))
    }

    /// Allocates a fresh page id, preferring the free list over extending
    /// the file.
    pub fn alloc_page(&self) -> Result<PageId> {
        let mut state = self.state.lock().unwrap();
        Ok(state.freelist.alloc())
    }

    pub fn write_page(&self, id: PageId, bytes: &[u8; PAGE_SIZE]) -> Result<()> {
        let _guard = self.commit_lock.read().unwrap();
        let mut encoded = [0u8; PAGE_SIZE];
        self.codec.encrypt_page(id, bytes, &mut encoded);
        self.file.write_all_at(&encoded, id as u64 * PAGE_SIZE as u64)?;
        Ok(())
    }

    pub fn read_page(&self, id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let _guard = self.commit_lock.read().unwrap();
        self.file.read_exact_at(buf, id as u64 * PAGE_SIZE as u64)?;
        self.codec.decrypt_page(id, buf);
        Ok(())
    }

    /// Installs a page image directly, bypassing the node cache's dirty
    /// pipeline. Used by recovery/replication to apply a page that arrived
    /// as a complete image rather than through a live `Node`.
    pub fn cache_page(&self, id: PageId, bytes: &[u8; PAGE_SIZE]) -> Result<()> {
        self.write_page(id, bytes)
    }

    /// Stages `id` for release; it only becomes reusable once the commit
    /// containing this delete is durable.
    pub fn delete_page(&self, id: PageId) {
        let mut state = self.state.lock().unwrap();
        state.freelist.stage_delete(id);
    }

    /// Immediately reusable page.
    pub fn recycle_page(&self, id: PageId) {
        let mut state = self.state.lock().unwrap();
        state.freelist.recycle(id);
    }

    pub fn read_extra_commit_data(&self, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock().unwrap();
        let n = buf.len().min(state.extra_data.len());
        buf[..n].copy_from_slice(&state.extra_data[..n]);
        Ok(())
    }

    pub fn redo_position(&self) -> u64 {
        self.state.lock().unwrap().redo_position
    }

    pub fn last_txn_id(&self) -> u64 {
        self.state.lock().unwrap().last_txn_id
    }

    /// Runs the commit protocol:
    /// 1. take the exclusive commit lock,
    /// 2. invoke `prepare`, which must flush any remaining dirty pages,
    /// 3-5. flush the file, write the inactive superblock, flush again,
    /// 6. release the lock.
    ///
    /// `header_bytes` becomes the new superblock's extra commit data (the
    /// checkpoint coordinator uses this to stash the redo position it
    /// captured before the flush).
    pub fn commit(
        &self,
        header_bytes: &[u8],
        redo_position: u64,
        last_txn_id: u64,
        prepare: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let _guard = self.commit_lock.write().unwrap();
        prepare()?;
        self.file.sync_data()?;

        let mut state = self.state.lock().unwrap();
        let next_slot = 1 - state.active_slot;
        let mut extra = [0u8; superblock::EXTRA_DATA_LEN];
        let n = header_bytes.len().min(extra.len());
        extra[..n].copy_from_slice(&header_bytes[..n]);

        let mut freelist_buf = [0u8; PAGE_SIZE];
        state.freelist.fold_pending();
        state.freelist.serialize_into(&mut freelist_buf);
        self.file.write_all_at(&freelist_buf, FREELIST_PID as u64 * PAGE_SIZE as u64)?;

        let sb = Superblock {
            page_size: PAGE_SIZE as u32,
            page_count: state.freelist.max_pid() as u64 + 1,
            free_list_head: FREELIST_PID,
            redo_position,
            last_txn_id,
            extra_data: extra,
        };
        let encoded = sb.encode();
        let slot_pid = if next_slot == 0 { SUPERBLOCK_0 } else { SUPERBLOCK_1 };
        self.file.write_all_at(&encoded, slot_pid as u64 * PAGE_SIZE as u64)?;
        self.file.sync_data()?;

        state.active_slot = next_slot;
        state.redo_position = redo_position;
        state.last_txn_id = last_txn_id;
        state.extra_data = extra;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
