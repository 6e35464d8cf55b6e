//! Process-wide pool of reusable byte buffers.
//!
//! Every streaming stage leases its per-chunk buffers here instead of
//! allocating. A lease is exclusive until the [`PooledBuffer`] is dropped,
//! which returns the allocation on every exit path (errors and cancellation
//! included). Buffers flagged sensitive are zeroized before they go back.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use zeroize::Zeroize;

/// Free buffers kept by the global pool
const DEFAULT_MAX_RETAINED: usize = 64;

/// Buffers larger than this are released to the allocator instead of retained
const DEFAULT_MAX_BUFFER_LEN: usize = 4 * 1024 * 1024;

static GLOBAL: OnceLock<BufferPool> = OnceLock::new();

/// Shared buffer pool. Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    max_retained: usize,
    max_buffer_len: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(max_retained: usize, max_buffer_len: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(max_retained)),
                max_retained,
                max_buffer_len,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// The process-wide pool.
    pub fn global() -> &'static BufferPool {
        GLOBAL.get_or_init(|| BufferPool::new(DEFAULT_MAX_RETAINED, DEFAULT_MAX_BUFFER_LEN))
    }

    /// Lease a zero-filled buffer of exactly `len` bytes.
    pub fn lease(&self, len: usize) -> PooledBuffer {
        let mut buf = {
            let mut free = self.inner.free.lock();
            match free.iter().position(|b| b.capacity() >= len) {
                Some(i) => free.swap_remove(i),
                None => free.pop().unwrap_or_default(),
            }
        };
        buf.clear();
        buf.resize(len, 0);
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            buf,
            pool: self.clone(),
            sensitive: false,
        }
    }

    /// Buffers currently leased out.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Buffers parked in the free list.
    pub fn retained(&self) -> usize {
        self.inner.free.lock().len()
    }

    fn give_back(&self, mut buf: Vec<u8>, sensitive: bool) {
        if sensitive {
            buf.zeroize();
        }
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
        if buf.capacity() > self.inner.max_buffer_len {
            return;
        }
        let mut free = self.inner.free.lock();
        if free.len() < self.inner.max_retained {
            free.push(buf);
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("outstanding", &self.outstanding())
            .field("max_retained", &self.inner.max_retained)
            .field("max_buffer_len", &self.inner.max_buffer_len)
            .finish()
    }
}

/// A leased buffer. Returned to its pool on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: BufferPool,
    sensitive: bool,
}

impl PooledBuffer {
    /// Shorten the visible length (e.g. after a short read).
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Zeroize the contents when the lease ends.
    pub fn set_sensitive(&mut self) {
        self.sensitive = true;
    }

    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.give_back(buf, self.sensitive);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("sensitive", &self.sensitive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_zero_filled() {
        let pool = BufferPool::new(4, 1024);
        {
            let mut buf = pool.lease(16);
            buf.copy_from_slice(&[0xAB; 16]);
        }
        let buf = pool.lease(16);
        assert_eq!(&buf[..], &[0u8; 16]);
    }

    #[test]
    fn test_outstanding_tracks_leases() {
        let pool = BufferPool::new(4, 1024);
        let a = pool.lease(8);
        let b = pool.lease(8);
        assert_eq!(pool.outstanding(), 2);
        drop(a);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.retained(), 1);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.retained(), 2);
    }

    #[test]
    fn test_reuses_allocation() {
        let pool = BufferPool::new(4, 1024);
        let ptr = {
            let buf = pool.lease(256);
            buf.as_ptr()
        };
        let buf = pool.lease(128);
        assert_eq!(buf.as_ptr(), ptr);
        assert_eq!(buf.len(), 128);
    }

    #[test]
    fn test_oversized_buffers_not_retained() {
        let pool = BufferPool::new(4, 64);
        drop(pool.lease(1024));
        assert_eq!(pool.retained(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_retention_capped() {
        let pool = BufferPool::new(2, 1024);
        let leases: Vec<_> = (0..5).map(|_| pool.lease(8)).collect();
        drop(leases);
        assert_eq!(pool.retained(), 2);
    }

    #[test]
    fn test_truncate_and_sensitive() {
        let pool = BufferPool::new(2, 1024);
        let mut buf = pool.lease(32);
        buf.set_sensitive();
        buf.truncate(10);
        assert_eq!(buf.len(), 10);
        assert!(buf.is_sensitive());
    }

    #[test]
    fn test_concurrent_leases() {
        let pool = BufferPool::new(16, 4096);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.lease(64 + i);
                        buf[0] = i as u8;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
