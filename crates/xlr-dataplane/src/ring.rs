//! Ring contracts
//!
//! A hardware ring (one NIC port/queue) is consumed through [`PhysicalRing`].
//! The bond aggregates several of them behind the same vocabulary.

use crate::buffer::{BufferDescriptor, DescChain, DescQueue, RingId};
use std::fmt;
use xlr_common::{FlowTuple, RingResult, SinkId};

/// Flavour of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingKind {
    /// Plain Ethernet queue pair
    Ethernet,
    /// InfiniBand queue pair
    InfiniBand,
    /// Ethernet queue pair in multi-packet receive mode
    MpRqEthernet,
    /// Software ring backed by a TAP device
    TapBacked,
}

impl RingKind {
    /// Kinds that can be slots of a bond
    #[inline]
    pub fn is_hardware(self) -> bool {
        !matches!(self, Self::TapBacked)
    }
}

/// Completion queue direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CqKind {
    /// Receive completions
    Rx,
    /// Transmit completions
    Tx,
}

impl fmt::Display for CqKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => write!(f, "rx"),
            Self::Tx => write!(f, "tx"),
        }
    }
}

/// Interrupt moderation of a completion queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CqModeration {
    /// Period in microseconds
    pub period_usec: u32,
    /// Completion count
    pub count: u32,
}

impl CqModeration {
    /// Create a moderation setting
    pub const fn new(period_usec: u32, count: u32) -> Self {
        Self { period_usec, count }
    }
}

/// Packet pacing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimit {
    /// Rate in kbps, 0 disables pacing
    pub rate_kbps: u32,
    /// Maximum burst in bytes
    pub max_burst_bytes: u32,
    /// Typical packet size in bytes
    pub typical_pkt_bytes: u16,
}

/// Transmit attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct TxAttr(u32);

impl TxAttr {
    /// Caller may block for a free slot
    pub const BLOCK: u32 = 1 << 0;
    /// Offload the L3 checksum
    pub const L3_CSUM: u32 = 1 << 1;
    /// Offload the L4 checksum
    pub const L4_CSUM: u32 = 1 << 2;
    /// Dummy send (no wire output)
    pub const DUMMY: u32 = 1 << 3;
    /// Segmentation offload
    pub const TSO: u32 = 1 << 4;
    /// Payload is referenced, not copied
    pub const ZEROCOPY: u32 = 1 << 5;

    /// Attributes from raw bits
    #[inline(always)]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Check if flag is set
    #[inline(always)]
    pub const fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    /// Set flag
    #[inline(always)]
    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    /// Raw bits
    #[inline(always)]
    pub const fn bits(&self) -> u32 {
        self.0
    }
}

/// Notification channel descriptor of a completion queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ChannelFd(pub i32);

/// Outcome of a try-lock guarded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Attempt<T> {
    /// The lock was taken and the operation ran
    Done(T),
    /// Another thread holds the lock; retry later
    Busy,
}

impl<T> Attempt<T> {
    /// True when the lock was held elsewhere
    #[inline]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// The result, if the operation ran
    #[inline]
    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(v) => Some(v),
            Self::Busy => None,
        }
    }

    /// Map the inner value
    #[inline]
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Attempt<U> {
        match self {
            Self::Done(v) => Attempt::Done(f(v)),
            Self::Busy => Attempt::Busy,
        }
    }
}

/// What happened to a transmitted buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDisposition {
    /// Posted on the active member
    Sent,
    /// Silently dropped (ownership changed under a failover)
    Dropped,
}

/// One hardware transmit/receive ring
///
/// Counts returned by the poll family are packets (or bytes for software
/// rings); errors carry the errno of the failing queue.
pub trait PhysicalRing: Send + Sync {
    /// Ring identity
    fn id(&self) -> RingId;

    /// Ring flavour
    fn kind(&self) -> RingKind;

    /// Id of the bond this ring belongs to
    fn parent(&self) -> Option<RingId>;

    /// Register a flow rule steering matching packets to `sink`
    fn attach_flow(&self, tuple: &FlowTuple, sink: SinkId) -> bool;

    /// Remove a flow rule
    fn detach_flow(&self, tuple: &FlowTuple, sink: SinkId) -> bool;

    /// Poll receive completions and deliver them
    fn poll_rx(&self, poll_sn: &mut u64) -> RingResult<usize>;

    /// Drain every pending receive completion
    fn drain(&self) -> RingResult<usize>;

    /// Consume the channel event and process completions
    fn wait_and_process(&self, channel: ChannelFd, poll_sn: &mut u64) -> RingResult<usize>;

    /// Arm completion notifications
    fn arm_notifications(&self, kind: CqKind, poll_sn: u64) -> RingResult<usize>;

    /// Link and queue pair are up
    fn is_up(&self) -> bool;

    /// Bring the queue pair up (may block on hardware)
    fn start(&self);

    /// Bring the queue pair down
    fn stop(&self);

    /// Take transmit buffers owned by this ring
    fn get_tx_buffers(&self, block: bool, count: usize) -> Option<DescQueue>;

    /// Give transmit buffers back; returns how many were accounted
    fn release_tx_buffers(&self, chain: DescChain, accounting: bool, trylock: bool) -> usize;

    /// Re-post receive buffers; refusal hands them back
    fn reclaim_rx_buffers(&self, bufs: DescQueue) -> Result<(), DescQueue>;

    /// Post a buffer for transmission
    fn send(&self, buf: BufferDescriptor, attr: TxAttr);

    /// Feed a received frame into the packet path; refusal hands it back
    fn rx_process_buffer(&self, buf: BufferDescriptor) -> Result<(), BufferDescriptor>;

    /// Largest inline payload the send queue accepts
    fn max_tx_inline(&self) -> u32;

    /// Current receive moderation
    fn cq_moderation(&self) -> CqModeration;

    /// Record a moderation without touching hardware
    fn set_cq_moderation(&self, moderation: CqModeration);

    /// Push a moderation to hardware
    fn modify_cq_moderation(&self, moderation: CqModeration);

    /// Re-tune moderation from observed traffic
    fn adapt_cq_moderation(&self);

    /// Apply packet pacing
    fn modify_rate_limit(&self, cfg: &RateLimit) -> RingResult<()>;

    /// Whether pacing with `cfg` is supported
    fn is_rate_limit_supported(&self, cfg: &RateLimit) -> bool;

    /// Count a retransmission
    fn inc_tx_retransmissions(&self);

    /// Receive completion channel
    fn rx_channel_fd(&self) -> ChannelFd;

    /// Whether a dummy send of `buf` can be offloaded
    fn hw_dummy_send_support(&self, buf: &BufferDescriptor) -> bool;

    /// Return one completed transmit buffer
    fn return_single_to_owner_tx(&self, buf: BufferDescriptor);

    /// True when `buf` was allocated by this ring
    #[inline]
    fn owns(&self, buf: &BufferDescriptor) -> bool {
        buf.owner() == Some(self.id())
    }
}

/// Completion sink for buffers handed back by the hardware
pub trait BufferOwner {
    /// Receive buffers finished by the socket layer
    fn return_rx_buffers(&self, bufs: DescQueue);

    /// Transmit buffers whose completions arrived
    fn return_tx_buffers(&self, chain: DescChain);

    /// Receive buffer completed with error
    fn rx_completion_with_error(&self, buf: BufferDescriptor);

    /// Transmit buffer completed with error
    fn tx_completion_with_error(&self, buf: BufferDescriptor);
}
