use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// Pool of chunk-sized buffers for streaming writes.
///
/// Cloning is cheap and clones share the same free list, so one pool can
/// back several drivers and the background part-upload tasks. The pool
/// grows on demand and never shrinks.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    chunk_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    /// Shared all-zero chunk used for gap filling.
    zeros: Bytes,
}

impl BufferPool {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                chunk_size,
                free: Mutex::new(Vec::new()),
                zeros: Bytes::from(vec![0u8; chunk_size]),
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Checks out a buffer of exactly `chunk_size` bytes.
    ///
    /// Contents are unspecified; callers overwrite or zero what they use.
    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.chunk_size]);
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// A full chunk of zeros.
    pub fn zeros(&self) -> Bytes {
        self.inner.zeros.clone()
    }

    /// Number of buffers currently waiting in the free list.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.fill(0);
        self.inner.free.lock().push(buf);
    }
}

/// A buffer checked out of a `BufferPool`; returned zeroed when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: BufferPool,
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
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_chunk_sized() {
        let pool = BufferPool::new(1024);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 1024);
        assert_eq!(pool.zeros().len(), 1024);
        assert!(pool.zeros().iter().all(|b| *b == 0));
    }

    #[test]
    fn released_buffers_are_zeroed_and_reused() {
        let pool = BufferPool::new(16);
        {
            let mut buf = pool.acquire();
            buf.fill(0xAB);
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.acquire();
        assert_eq!(pool.idle(), 0);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn pool_grows_on_demand() {
        let pool = BufferPool::new(8);
        let held: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
        assert_eq!(pool.idle(), 0);
        drop(held);
        assert_eq!(pool.idle(), 4);
    }

    #[test]
    fn clones_share_one_free_list() {
        let pool = BufferPool::new(8);
        let other = pool.clone();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = other.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.acquire();
                        buf[0] = 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.idle() >= 1 && pool.idle() <= 8);
    }
}
