//! Fragmented values: a chain of dedicated pages for values too large to
//! store inline in a leaf. Each fragment page reserves its first `PID_SIZE`
//! bytes for the next segment's `PageId` (0 = end of chain); the rest holds
//! data.
//!
//! `Stream` buffers small `write(pos, buf)` calls into whole-page updates
//! and refuses further use once `close`d via the `io_state` token — cloning
//! a `Stream` and using the clone after the original closed fails instead of
//! silently writing past end-of-file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{PageId, PAGE_SIZE, PID_SIZE};
use crate::error::{Error, Result};
use crate::store::PageStore;

pub const SEGMENT_CAPACITY: usize = PAGE_SIZE - PID_SIZE;

/// Allocates/reads/writes a value's fragment chain directly against the
/// page store. Bypasses the node cache: fragment pages aren't B-tree nodes
/// and don't need LRU/latch bookkeeping, only the page store's raw I/O.
pub struct FragmentChain<'a> {
    store: &'a PageStore,
}

impl<'a> FragmentChain<'a> {
    pub fn new(store: &'a PageStore) -> Self {
        FragmentChain { store }
    }

    /// Writes `value` as a new chain, returning the first segment's PageId.
    pub fn write_new(&self, value: &[u8]) -> Result<PageId> {
        let mut segments = Vec::new();
        for chunk in value.chunks(SEGMENT_CAPACITY) {
            segments.push(self.store.alloc_page()?);
            let _ = chunk;
        }
        if segments.is_empty() {
            segments.push(self.store.alloc_page()?);
        }
        for (i, chunk) in value.chunks(SEGMENT_CAPACITY).enumerate().chain(if value.is_empty() {
            Some((0, &value[..]))
        } else {
            None
        }) {
            let mut page = [0u8; PAGE_SIZE];
            let next = segments.get(i + 1).copied().unwrap_or(0);
            page[0..PID_SIZE].copy_from_slice(&next.to_be_bytes());
            page[PID_SIZE..PID_SIZE + chunk.len()].copy_from_slice(chunk);
            self.store.write_page(segments[i], &page)?;
        }
        Ok(segments[0])
    }

    /// Frees every page in the chain starting at `first`.
    pub fn delete_chain(&self, first: PageId) -> Result<()> {
        let mut cur = first;
        while cur != 0 {
            let mut page = [0u8; PAGE_SIZE];
            self.store.read_page(cur, &mut page)?;
            let next = PageId::from_be_bytes(page[0..PID_SIZE].try_into().unwrap());
            self.store.delete_page(cur);
            cur = next;
        }
        Ok(())
    }

    /// Reads `len` bytes starting at `pos` from the chain rooted at `first`,
    /// which is known to hold `total_len` bytes total.
    pub fn read_at(&self, first: PageId, total_len: u64, pos: u64, out: &mut [u8]) -> Result<usize> {
        if pos >= total_len {
            return Ok(0);
        }
        let want = out.len().min((total_len - pos) as usize);
        let mut read = 0usize;
        let mut seg_index = pos / SEGMENT_CAPACITY as u64;
        let mut seg_offset = (pos % SEGMENT_CAPACITY as u64) as usize;
        let mut cur = first;
        let mut i = 0u64;
        while read < want {
            if cur == 0 {
                return Err(Error::NoSuchValue);
            }
            let mut page = [0u8; PAGE_SIZE];
            self.store.read_page(cur, &mut page)?;
            let next = PageId::from_be_bytes(page[0..PID_SIZE].try_into().unwrap());
            if i == seg_index {
                let avail = SEGMENT_CAPACITY - seg_offset;
                let n = avail.min(want - read);
                out[read..read + n]
                    .copy_from_slice(&page[PID_SIZE + seg_offset..PID_SIZE + seg_offset + n]);
                read += n;
                seg_offset = 0;
            }
            cur = next;
            i += 1;
            seg_index = seg_index.max(i.saturating_sub(1));
        }
        Ok(read)
    }

    /// Overwrites `buf` at `pos` in the chain rooted at `first`; the chain
    /// must already cover `[pos, pos+buf.len())` (growth is handled by the
    /// B-tree layer re-writing the whole value when it grows past the
    /// existing chain's length).
    pub fn write_at(&self, first: PageId, pos: u64, buf: &[u8]) -> Result<()> {
        let mut seg_index = pos / SEGMENT_CAPACITY as u64;
        let mut seg_offset = (pos % SEGMENT_CAPACITY as u64) as usize;
        let mut written = 0usize;
        let mut cur = first;
        let mut i = 0u64;
        while written < buf.len() {
            if cur == 0 {
                return Err(Error::OutOfBounds("fragment write past end of chain".into()));
            }
            let mut page = [0u8; PAGE_SIZE];
            self.store.read_page(cur, &mut page)?;
            let next = PageId::from_be_bytes(page[0..PID_SIZE].try_into().unwrap());
            if i == seg_index {
                let avail = SEGMENT_CAPACITY - seg_offset;
                let n = avail.min(buf.len() - written);
                page[PID_SIZE + seg_offset..PID_SIZE + seg_offset + n]
                    .copy_from_slice(&buf[written..written + n]);
                self.store.write_page(cur, &page)?;
                written += n;
                seg_offset = 0;
                seg_index += 1;
            }
            cur = next;
            i += 1;
        }
        Ok(())
    }
}

/// Invalidated once the owning value/handle is closed; any reader or
/// writer created against a `Stream` fails if this token has flipped.
#[derive(Clone)]
pub struct IoState(Arc<AtomicBool>);

impl IoState {
    pub fn new() -> Self {
        IoState(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A streaming reader/writer over one fragmented value, buffering small
/// writes into whole-page updates.
pub struct Stream<'a> {
    chain: FragmentChain<'a>,
    first_segment: PageId,
    total_len: u64,
    io_state: IoState,
    buffer: Vec<u8>,
    buffer_pos: u64,
}

impl<'a> Stream<'a> {
    pub fn open(store: &'a PageStore, first_segment: PageId, total_len: u64, io_state: IoState) -> Self {
        Stream { chain: FragmentChain::new(store), first_segment, total_len, io_state, buffer: Vec::new(), buffer_pos: 0 }
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn read(&self, pos: u64, out: &mut [u8]) -> Result<usize> {
        if !self.io_state.is_open() {
            return Err(Error::Closed);
        }
        self.chain.read_at(self.first_segment, self.total_len, pos, out)
    }

    /// Buffers `buf` at `pos`; flushes automatically once a full page's
    /// worth has accumulated contiguously, issuing a single page update per
    /// full buffer.
    pub fn write(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        if !self.io_state.is_open() {
            return Err(Error::Closed);
        }
        if pos + buf.len() as u64 > self.total_len {
            return Err(Error::OutOfBounds("write past fragmented value length".into()));
        }
        if !self.buffer.is_empty() && pos != self.buffer_pos + self.buffer.len() as u64 {
            self.flush()?;
        }
        if self.buffer.is_empty() {
            self.buffer_pos = pos;
        }
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= SEGMENT_CAPACITY {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.chain.write_at(self.first_segment, self.buffer_pos, &self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.io_state.close();
        Ok(())
    }
}
