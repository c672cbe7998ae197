//! Packet buffer descriptors
//!
//! A descriptor is owned by exactly one ring at a time and moves between
//! rings, the pool and the caller by value.
//!
//! # Design
//!
//! - Owner tag stamped by the ring that allocated the buffer
//! - Owned sequences instead of intrusive `next` pointers
//! - `DescChain` hands out same-owner runs so routing cost scales with the
//!   number of ownership changes

use bytes::BytesMut;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a ring (member or bond)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RingId(u64);

static NEXT_RING_ID: AtomicU64 = AtomicU64::new(1);

impl RingId {
    /// Allocate a fresh process-unique id
    pub fn next() -> Self {
        Self(NEXT_RING_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    #[inline(always)]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ring#{}", self.0)
    }
}

/// Packet buffer descriptor
pub struct BufferDescriptor {
    /// Index in the pool that created it
    index: u32,
    /// Ring currently owning the buffer
    owner: Option<RingId>,
    /// Buffer size
    size: usize,
    /// Packet data
    payload: BytesMut,
}

impl BufferDescriptor {
    /// Create a detached descriptor with `capacity` bytes of room
    pub fn new(index: u32, capacity: usize) -> Self {
        Self {
            index,
            owner: None,
            size: capacity,
            payload: BytesMut::with_capacity(capacity),
        }
    }

    /// Pool index
    #[inline(always)]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Owning ring
    #[inline(always)]
    pub fn owner(&self) -> Option<RingId> {
        self.owner
    }

    /// Stamp the owning ring
    #[inline(always)]
    pub fn set_owner(&mut self, owner: Option<RingId>) {
        self.owner = owner;
    }

    /// Packet data
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// Mutable packet data
    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Data length
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Total room in the buffer
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Append bytes, failing when they do not fit
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if self.payload.len() + bytes.len() > self.size {
            return false;
        }
        self.payload.extend_from_slice(bytes);
        true
    }

    /// Expose the whole buffer for a device read; follow with `truncate`
    pub fn fill_area(&mut self) -> &mut [u8] {
        self.payload.resize(self.size, 0);
        &mut self.payload
    }

    /// Shorten the data to `len` bytes
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.payload.truncate(len);
    }

    /// Reset for reuse by the pool
    #[inline]
    pub fn reset(&mut self) {
        self.payload.clear();
        self.owner = None;
    }
}

impl fmt::Debug for BufferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferDescriptor")
            .field("index", &self.index)
            .field("owner", &self.owner)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// FIFO of descriptors (RX reuse lists)
#[derive(Debug, Default)]
pub struct DescQueue(VecDeque<BufferDescriptor>);

impl DescQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self(VecDeque::new())
    }

    /// Empty queue with room for `n`
    pub fn with_capacity(n: usize) -> Self {
        Self(VecDeque::with_capacity(n))
    }

    /// Append at the tail
    #[inline]
    pub fn push_back(&mut self, buf: BufferDescriptor) {
        self.0.push_back(buf);
    }

    /// Put back at the head
    #[inline]
    pub fn push_front(&mut self, buf: BufferDescriptor) {
        self.0.push_front(buf);
    }

    /// Take from the head
    #[inline]
    pub fn pop_front(&mut self) -> Option<BufferDescriptor> {
        self.0.pop_front()
    }

    /// Number of buffers
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate front to back
    pub fn iter(&self) -> impl Iterator<Item = &BufferDescriptor> {
        self.0.iter()
    }

    /// Move every buffer of `other` to the tail
    pub fn append(&mut self, other: &mut DescQueue) {
        self.0.append(&mut other.0);
    }
}

impl FromIterator<BufferDescriptor> for DescQueue {
    fn from_iter<I: IntoIterator<Item = BufferDescriptor>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for DescQueue {
    type Item = BufferDescriptor;
    type IntoIter = std::collections::vec_deque::IntoIter<BufferDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Ordered chain of descriptors (TX release lists)
#[derive(Debug, Default)]
pub struct DescChain(VecDeque<BufferDescriptor>);

impl DescChain {
    /// Empty chain
    pub fn new() -> Self {
        Self(VecDeque::new())
    }

    /// Chain of a single buffer
    pub fn single(buf: BufferDescriptor) -> Self {
        let mut chain = Self::new();
        chain.push(buf);
        chain
    }

    /// Link a buffer at the end
    #[inline]
    pub fn push(&mut self, buf: BufferDescriptor) {
        self.0.push_back(buf);
    }

    /// Unlink the head
    #[inline]
    pub fn pop_front(&mut self) -> Option<BufferDescriptor> {
        self.0.pop_front()
    }

    /// Owner of the head buffer
    #[inline]
    pub fn head_owner(&self) -> Option<Option<RingId>> {
        self.0.front().map(BufferDescriptor::owner)
    }

    /// Detach the leading run of buffers that share the head's owner
    pub fn take_run(&mut self) -> Option<(Option<RingId>, DescChain)> {
        let owner = self.head_owner()?;
        let run = self.0.iter().take_while(|b| b.owner == owner).count();
        Some((owner, Self(self.0.drain(..run).collect())))
    }

    /// Splice `other` onto the end
    #[inline]
    pub fn splice(&mut self, other: &mut DescChain) {
        self.0.append(&mut other.0);
    }

    /// Number of buffers
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate head to tail
    pub fn iter(&self) -> impl Iterator<Item = &BufferDescriptor> {
        self.0.iter()
    }
}

impl FromIterator<BufferDescriptor> for DescChain {
    fn from_iter<I: IntoIterator<Item = BufferDescriptor>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for DescChain {
    type Item = BufferDescriptor;
    type IntoIter = std::collections::vec_deque::IntoIter<BufferDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(index: u32, owner: Option<RingId>) -> BufferDescriptor {
        let mut buf = BufferDescriptor::new(index, 64);
        buf.set_owner(owner);
        buf
    }

    #[test]
    fn test_ring_ids_unique() {
        let a = RingId::next();
        let b = RingId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_descriptor_data() {
        let mut buf = BufferDescriptor::new(0, 16);
        assert!(buf.append(&[0x45, 0x00]));
        assert_eq!(buf.len(), 2);
        assert!(!buf.append(&[0u8; 15]));

        let area = buf.fill_area();
        assert_eq!(area.len(), 16);
        area[0] = 0xff;
        buf.truncate(4);
        assert_eq!(buf.data(), &[0xff, 0x00, 0x00, 0x00]);

        buf.set_owner(Some(RingId::next()));
        buf.reset();
        assert!(buf.is_empty());
        assert!(buf.owner().is_none());
    }

    #[test]
    fn test_take_run() {
        let a = Some(RingId::next());
        let b = Some(RingId::next());
        let mut chain: DescChain = [owned(0, a), owned(1, a), owned(2, b), owned(3, a)]
            .into_iter()
            .collect();

        let (owner, run) = chain.take_run().unwrap();
        assert_eq!(owner, a);
        assert_eq!(run.iter().map(|b| b.index()).collect::<Vec<_>>(), vec![0, 1]);

        let (owner, run) = chain.take_run().unwrap();
        assert_eq!(owner, b);
        assert_eq!(run.len(), 1);

        let (_, mut last) = chain.take_run().unwrap();
        assert!(chain.take_run().is_none());

        let mut joined = DescChain::single(owned(9, a));
        joined.splice(&mut last);
        assert_eq!(joined.iter().map(|b| b.index()).collect::<Vec<_>>(), vec![9, 3]);
        assert!(last.is_empty());
    }

    #[test]
    fn test_queue_fifo() {
        let mut q: DescQueue = (0..3).map(|i| owned(i, None)).collect();
        let head = q.pop_front().unwrap();
        assert_eq!(head.index(), 0);
        q.push_front(head);
        assert_eq!(q.iter().map(|b| b.index()).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
