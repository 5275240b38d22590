//! Two-tier byte buffers with pooled small chunks.
//!
//! A `StreamBuf` holds one contiguous allocation and tracks a consumed
//! prefix: bytes `[0, offset)` have been handed to a syscall and may be
//! overwritten, bytes `[offset, len)` are pending. Small buffers borrow a
//! chunk from the shared `ChunkPool` and return it on drop; `bigify`
//! upgrades to a heap allocation when a handshake header or a reassembled
//! record outgrows the small tier.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::error::{ProxyError, Result};

/// Small tier: one pool chunk, enough for a full SOCKS5 handshake and
/// most single reads.
pub const SMALL_BUF_SIZE: usize = 2048;

/// Big tier ceiling. A ciphertext read plus record overhead never
/// exceeds this.
pub const BIG_BUF_SIZE: usize = 32 * 1024;

/// Freelist of small chunks. Chunks are recycled lazily; `drain` frees
/// the cached arenas wholesale (invoked after an ACL reload).
pub struct ChunkPool {
    free: ArrayQueue<Box<[u8]>>,
}

impl ChunkPool {
    pub fn new(max_cached: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(max_cached.max(1)),
        })
    }

    fn take(&self) -> Box<[u8]> {
        self.free
            .pop()
            .unwrap_or_else(|| vec![0u8; SMALL_BUF_SIZE].into_boxed_slice())
    }

    fn put(&self, chunk: Box<[u8]>) {
        // Queue full: let the chunk drop.
        let _ = self.free.push(chunk);
    }

    pub fn cached(&self) -> usize {
        self.free.len()
    }

    /// Free every cached chunk.
    pub fn drain(&self) {
        while self.free.pop().is_some() {}
    }
}

pub struct StreamBuf {
    data: Option<Box<[u8]>>,
    big: bool,
    offset: usize,
    len: usize,
    big_cap: usize,
    pool: Arc<ChunkPool>,
}

impl StreamBuf {
    pub fn small(pool: &Arc<ChunkPool>) -> Self {
        Self {
            data: Some(pool.take()),
            big: false,
            offset: 0,
            len: 0,
            big_cap: BIG_BUF_SIZE,
            pool: pool.clone(),
        }
    }

    pub fn with_big_cap(pool: &Arc<ChunkPool>, big_cap: usize) -> Self {
        let mut buf = Self::small(pool);
        buf.big_cap = big_cap.max(SMALL_BUF_SIZE);
        buf
    }

    fn data(&self) -> &[u8] {
        self.data.as_deref().expect("buffer backing present")
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().expect("buffer backing present")
    }

    pub fn capacity(&self) -> usize {
        self.data().len()
    }

    pub fn is_big(&self) -> bool {
        self.big
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no unsent bytes remain.
    pub fn is_empty(&self) -> bool {
        self.offset == self.len
    }

    /// The pending region `[offset, len)`.
    pub fn unsent(&self) -> &[u8] {
        &self.data()[self.offset..self.len]
    }

    /// Writable tail `[len, capacity)` for the next read syscall.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.data_mut()[len..]
    }

    /// Account `n` bytes appended by a read into `spare_mut`.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.capacity());
        self.len += n;
    }

    /// Mark `n` unsent bytes as delivered. Resets to the buffer start
    /// once everything is consumed so the full capacity is reusable.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.offset + n <= self.len);
        self.offset += n;
        if self.offset == self.len {
            self.offset = 0;
            self.len = 0;
        }
    }

    pub fn clear(&mut self) {
        self.offset = 0;
        self.len = 0;
    }

    /// Move the pending region to the buffer start.
    pub fn compact(&mut self) {
        if self.offset > 0 {
            let (offset, len) = (self.offset, self.len);
            self.data_mut().copy_within(offset..len, 0);
            self.len -= offset;
            self.offset = 0;
        }
    }

    /// Guarantee at least `min` writable bytes in `spare_mut`, compacting
    /// and upgrading tiers as needed.
    pub fn ensure_spare(&mut self, min: usize) -> Result<()> {
        if self.capacity() - self.len >= min {
            return Ok(());
        }
        self.compact();
        if self.capacity() - self.len >= min {
            return Ok(());
        }
        if !self.big {
            self.bigify()?;
        }
        if self.capacity() - self.len >= min {
            Ok(())
        } else {
            Err(ProxyError::OutOfMemory)
        }
    }

    /// Append bytes, upgrading to the big tier when the small one is
    /// full. Fails with `OutOfMemory` past the big ceiling.
    pub fn extend_from_slice(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_spare(src.len())?;
        let len = self.len;
        self.data_mut()[len..len + src.len()].copy_from_slice(src);
        self.len += src.len();
        Ok(())
    }

    /// Insert bytes in front of the pending region.
    pub fn prepend(&mut self, src: &[u8]) -> Result<()> {
        let total = src.len() + (self.len - self.offset);
        if total > self.big_cap {
            return Err(ProxyError::OutOfMemory);
        }
        if total > self.capacity() {
            self.bigify()?;
        } else {
            self.compact();
        }
        let pending = self.len - self.offset;
        debug_assert_eq!(self.offset, 0);
        self.data_mut().copy_within(0..pending, src.len());
        self.data_mut()[..src.len()].copy_from_slice(src);
        self.len = total;
        Ok(())
    }

    /// Replace the whole content, as after an in-place transform.
    pub fn set_content(&mut self, src: &[u8]) -> Result<()> {
        self.clear();
        self.extend_from_slice(src)
    }

    /// Upgrade to the big tier, preserving `[offset, len)` byte for byte
    /// at the front of the new allocation. No-op when already big.
    pub fn bigify(&mut self) -> Result<()> {
        if self.big {
            return Ok(());
        }
        if self.len - self.offset > self.big_cap {
            return Err(ProxyError::OutOfMemory);
        }
        let mut fresh = vec![0u8; self.big_cap].into_boxed_slice();
        let pending = self.len - self.offset;
        fresh[..pending].copy_from_slice(self.unsent());
        let small = self.data.replace(fresh).expect("buffer backing present");
        self.pool.put(small);
        self.big = true;
        self.offset = 0;
        self.len = pending;
        Ok(())
    }

    /// Downgrade back to a pool chunk. Returns false (and leaves the
    /// buffer untouched) when the pending bytes do not fit the small
    /// tier.
    pub fn unbigify(&mut self) -> bool {
        if !self.big {
            return true;
        }
        let pending = self.len - self.offset;
        if pending > SMALL_BUF_SIZE {
            return false;
        }
        let mut fresh = self.pool.take();
        fresh[..pending].copy_from_slice(self.unsent());
        self.data = Some(fresh);
        self.big = false;
        self.offset = 0;
        self.len = pending;
        true
    }
}

impl Drop for StreamBuf {
    fn drop(&mut self) {
        if !self.big {
            if let Some(chunk) = self.data.take() {
                self.pool.put(chunk);
            }
        }
    }
}

impl std::fmt::Debug for StreamBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuf")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("big", &self.big)
            .finish()
    }
}
