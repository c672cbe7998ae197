//! Scriptable member ring for bond tests

use crate::buffer::{BufferDescriptor, DescChain, DescQueue, RingId};
use crate::pool::BufferPool;
use crate::ring::{ChannelFd, CqKind, CqModeration, PhysicalRing, RateLimit, RingKind, TxAttr};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use xlr_common::{FlowTuple, RingError, RingResult, SinkId};

pub struct MockRing {
    id: RingId,
    parent: Option<RingId>,
    kind: RingKind,
    tx_pool: Arc<BufferPool>,
    rx_pool: Arc<BufferPool>,

    pub up: AtomicBool,
    pub attach_ok: AtomicBool,
    pub rules: Mutex<HashSet<(FlowTuple, SinkId)>>,
    /// Poll result: packets, or an errno
    pub poll_result: Mutex<Result<usize, i32>>,
    pub arm_result: Mutex<Result<usize, i32>>,
    pub arm_calls: Mutex<Vec<CqKind>>,
    pub polls: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub sent: Mutex<Vec<u32>>,
    pub released: AtomicUsize,
    pub reclaim_ok: AtomicBool,
    pub reclaimed: Mutex<Vec<u32>>,
    pub rx_accept: AtomicBool,
    pub rx_frames: Mutex<Vec<Vec<u8>>>,
    pub tx_inline: AtomicU32,
    pub moderation: Mutex<CqModeration>,
    pub pushed_moderation: Mutex<Vec<CqModeration>>,
    pub adapts: AtomicUsize,
    pub rate_limit_ok: AtomicBool,
    pub rate_limits: AtomicUsize,
    pub retransmissions: AtomicUsize,
    pub dummy_send: AtomicBool,
}

impl MockRing {
    pub fn new(parent: RingId, rx_pool: Arc<BufferPool>, tx_pool: Arc<BufferPool>) -> Self {
        Self {
            id: RingId::next(),
            parent: Some(parent),
            kind: RingKind::Ethernet,
            tx_pool,
            rx_pool,
            up: AtomicBool::new(true),
            attach_ok: AtomicBool::new(true),
            rules: Mutex::new(HashSet::new()),
            poll_result: Mutex::new(Ok(0)),
            arm_result: Mutex::new(Ok(0)),
            arm_calls: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            released: AtomicUsize::new(0),
            reclaim_ok: AtomicBool::new(true),
            reclaimed: Mutex::new(Vec::new()),
            rx_accept: AtomicBool::new(true),
            rx_frames: Mutex::new(Vec::new()),
            tx_inline: AtomicU32::new(220),
            moderation: Mutex::new(CqModeration::default()),
            pushed_moderation: Mutex::new(Vec::new()),
            adapts: AtomicUsize::new(0),
            rate_limit_ok: AtomicBool::new(true),
            rate_limits: AtomicUsize::new(0),
            retransmissions: AtomicUsize::new(0),
            dummy_send: AtomicBool::new(false),
        }
    }

    pub fn with_kind(mut self, kind: RingKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn set_poll(&self, result: Result<usize, i32>) {
        *self.poll_result.lock() = result;
    }

    pub fn set_arm(&self, result: Result<usize, i32>) {
        *self.arm_result.lock() = result;
    }

    fn poll_once(&self) -> RingResult<usize> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        (*self.poll_result.lock()).map_err(|errno| RingError::Hardware { errno })
    }
}

impl PhysicalRing for MockRing {
    fn id(&self) -> RingId {
        self.id
    }

    fn kind(&self) -> RingKind {
        self.kind
    }

    fn parent(&self) -> Option<RingId> {
        self.parent
    }

    fn attach_flow(&self, tuple: &FlowTuple, sink: SinkId) -> bool {
        if !self.attach_ok.load(Ordering::Relaxed) {
            return false;
        }
        self.rules.lock().insert((*tuple, sink));
        true
    }

    fn detach_flow(&self, tuple: &FlowTuple, sink: SinkId) -> bool {
        self.rules.lock().remove(&(*tuple, sink))
    }

    fn poll_rx(&self, poll_sn: &mut u64) -> RingResult<usize> {
        *poll_sn += 1;
        self.poll_once()
    }

    fn drain(&self) -> RingResult<usize> {
        self.poll_once()
    }

    fn wait_and_process(&self, _channel: ChannelFd, poll_sn: &mut u64) -> RingResult<usize> {
        *poll_sn += 1;
        self.poll_once()
    }

    fn arm_notifications(&self, kind: CqKind, _poll_sn: u64) -> RingResult<usize> {
        self.arm_calls.lock().push(kind);
        (*self.arm_result.lock()).map_err(|errno| RingError::Hardware { errno })
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    fn start(&self) {
        self.starts.fetch_add(1, Ordering::Relaxed);
        self.up.store(true, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::Relaxed);
        self.up.store(false, Ordering::Relaxed);
    }

    fn get_tx_buffers(&self, _block: bool, count: usize) -> Option<DescQueue> {
        self.tx_pool.get_buffers(Some(self.id), count).ok()
    }

    fn release_tx_buffers(&self, chain: DescChain, _accounting: bool, _trylock: bool) -> usize {
        let n = chain.len();
        self.released.fetch_add(n, Ordering::Relaxed);
        self.tx_pool.put_chain(chain);
        n
    }

    fn reclaim_rx_buffers(&self, bufs: DescQueue) -> Result<(), DescQueue> {
        if !self.reclaim_ok.load(Ordering::Relaxed) {
            return Err(bufs);
        }
        self.reclaimed.lock().extend(bufs.iter().map(BufferDescriptor::index));
        self.rx_pool.put_buffers(bufs);
        Ok(())
    }

    fn send(&self, buf: BufferDescriptor, _attr: TxAttr) {
        self.sent.lock().push(buf.index());
        self.tx_pool.put_one(buf);
    }

    fn rx_process_buffer(&self, buf: BufferDescriptor) -> Result<(), BufferDescriptor> {
        if !self.rx_accept.load(Ordering::Relaxed) {
            return Err(buf);
        }
        self.rx_frames.lock().push(buf.data().to_vec());
        self.rx_pool.put_one(buf);
        Ok(())
    }

    fn max_tx_inline(&self) -> u32 {
        self.tx_inline.load(Ordering::Relaxed)
    }

    fn cq_moderation(&self) -> CqModeration {
        *self.moderation.lock()
    }

    fn set_cq_moderation(&self, moderation: CqModeration) {
        *self.moderation.lock() = moderation;
    }

    fn modify_cq_moderation(&self, moderation: CqModeration) {
        self.pushed_moderation.lock().push(moderation);
    }

    fn adapt_cq_moderation(&self) {
        self.adapts.fetch_add(1, Ordering::Relaxed);
    }

    fn modify_rate_limit(&self, _cfg: &RateLimit) -> RingResult<()> {
        self.rate_limits.fetch_add(1, Ordering::Relaxed);
        if self.rate_limit_ok.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(RingError::Unsupported("packet pacing".into()))
        }
    }

    fn is_rate_limit_supported(&self, _cfg: &RateLimit) -> bool {
        self.rate_limit_ok.load(Ordering::Relaxed)
    }

    fn inc_tx_retransmissions(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    fn rx_channel_fd(&self) -> ChannelFd {
        ChannelFd(100 + self.id.as_u64() as i32)
    }

    fn hw_dummy_send_support(&self, _buf: &BufferDescriptor) -> bool {
        self.dummy_send.load(Ordering::Relaxed)
    }

    fn return_single_to_owner_tx(&self, buf: BufferDescriptor) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.tx_pool.put_one(buf);
    }
}
