//! Shared Buffer Pool
//!
//! Pre-allocated descriptors handed out in bulk to rings and taken back when
//! nobody else claims them.

use crate::buffer::{BufferDescriptor, DescChain, DescQueue, RingId};
use crossbeam::queue::ArrayQueue;
use std::fmt;
use xlr_common::{RingError, RingResult};

/// Direction a pool serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Receive buffers
    Rx,
    /// Transmit buffers
    Tx,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => write!(f, "rx"),
            Self::Tx => write!(f, "tx"),
        }
    }
}

/// Buffer pool (pre-allocated, lock-free)
pub struct BufferPool {
    kind: PoolKind,
    /// Free list
    free: ArrayQueue<BufferDescriptor>,
    /// Pool size
    size: usize,
    /// Bytes per buffer
    buf_size: usize,
}

impl BufferPool {
    /// Create a pool of `size` buffers of `buf_size` bytes each
    pub fn new(kind: PoolKind, size: usize, buf_size: usize) -> Self {
        let free = ArrayQueue::new(size.max(1));
        for i in 0..size {
            // Capacity equals size, the push cannot fail
            let _ = free.push(BufferDescriptor::new(i as u32, buf_size));
        }
        tracing::debug!(%kind, size, buf_size, "buffer pool created");

        Self {
            kind,
            free,
            size,
            buf_size,
        }
    }

    /// Pool direction
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Take exactly `count` buffers stamped with `owner`, or none at all
    pub fn get_buffers(&self, owner: Option<RingId>, count: usize) -> RingResult<DescQueue> {
        let mut out = DescQueue::with_capacity(count);
        for _ in 0..count {
            match self.free.pop() {
                Some(mut buf) => {
                    buf.set_owner(owner);
                    out.push_back(buf);
                }
                None => {
                    tracing::debug!(
                        kind = %self.kind,
                        requested = count,
                        available = out.len(),
                        "buffer pool exhausted"
                    );
                    self.put_buffers(out);
                    return Err(RingError::PoolExhausted);
                }
            }
        }
        Ok(out)
    }

    /// Return one buffer
    #[inline]
    pub fn put_one(&self, mut buf: BufferDescriptor) {
        buf.reset();
        if self.free.push(buf).is_err() {
            tracing::warn!(kind = %self.kind, "buffer returned to a full pool, discarding");
        }
    }

    /// Return a queue of buffers
    pub fn put_buffers(&self, bufs: DescQueue) {
        for buf in bufs {
            self.put_one(buf);
        }
    }

    /// Return a chain of buffers
    pub fn put_chain(&self, chain: DescChain) {
        for buf in chain {
            self.put_one(buf);
        }
    }

    /// Get available count
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Get pool size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes per buffer
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_get() {
        let pool = BufferPool::new(PoolKind::Rx, 64, 2048);
        assert_eq!(pool.available(), 64);

        let owner = Some(RingId::next());
        let bufs = pool.get_buffers(owner, 10).unwrap();
        assert_eq!(bufs.len(), 10);
        assert!(bufs.iter().all(|b| b.owner() == owner));
        assert_eq!(pool.available(), 54);
    }

    #[test]
    fn test_get_is_all_or_nothing() {
        let pool = BufferPool::new(PoolKind::Tx, 8, 256);
        assert!(matches!(
            pool.get_buffers(None, 9),
            Err(RingError::PoolExhausted)
        ));
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_put_resets() {
        let pool = BufferPool::new(PoolKind::Tx, 4, 256);
        let owner = Some(RingId::next());
        let mut bufs = pool.get_buffers(owner, 4).unwrap();
        let mut first = bufs.pop_front().unwrap();
        assert!(first.append(b"payload"));
        pool.put_one(first);
        pool.put_chain(bufs.into_iter().collect());
        assert_eq!(pool.available(), 4);

        let again = pool.get_buffers(None, 4).unwrap();
        assert!(again.iter().all(|b| b.is_empty() && b.owner().is_none()));
    }
}
