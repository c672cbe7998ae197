//! Cyclic buffer ring
//!
//! Turns stride records into zero-copy completions over one contiguous
//! receive buffer. A completion covers consecutive packets of a single work
//! queue; when a work queue runs out of strides it is re-posted and the ring
//! moves on to the next one.
//!
//! ```text
//!   EMPTY ──good record──▶ ACCUMULATING ──min reached / WQ end / bad──▶ emit ──▶ EMPTY
//!                              │    ▲
//!                     no data  └────┘ (kept for the next read)
//! ```

use super::cqe::{CqeSource, MpCompletionQueue, MpPacket, MpPoll};
use super::layout::{CyclicLayout, MpRqCaps};
use crate::profile::CyclicRingAttr;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use xlr_common::{RingError, RingResult};

/// Receive queue that accepts re-posted work queues
pub trait ReceiveQueue: Send {
    /// Post `count` work queues starting at `wq_index`
    fn post_recv(&mut self, wq_index: u32, count: u32) -> RingResult<()>;
}

/// Device clock
pub trait HwClock: Send + Sync {
    /// Convert device ticks to time since the epoch
    fn to_system_time(&self, ticks: u64) -> Duration;
}

/// Free-running clock of known frequency anchored at an epoch offset
#[derive(Debug, Clone, Copy)]
pub struct KhzClock {
    khz: u64,
    epoch_offset: Duration,
}

impl KhzClock {
    /// Clock ticking at `khz` whose tick 0 is `epoch_offset` after the epoch
    pub fn new(khz: u64, epoch_offset: Duration) -> RingResult<Self> {
        if khz == 0 {
            return Err(RingError::Config("device clock frequency is zero".into()));
        }
        Ok(Self { khz, epoch_offset })
    }
}

impl HwClock for KhzClock {
    fn to_system_time(&self, ticks: u64) -> Duration {
        let nanos = u128::from(ticks) * 1_000_000 / u128::from(self.khz);
        let since_start = Duration::new(
            (nanos / 1_000_000_000) as u64,
            (nanos % 1_000_000_000) as u32,
        );
        self.epoch_offset + since_start
    }
}

/// Read mode of a cyclic read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Return immediately when nothing is ready
    NonBlocking,
    /// Wait for data (not supported)
    Blocking,
}

/// Optional completion fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct CompletionMask(u32);

impl CompletionMask {
    /// Fill the header location
    pub const HDR_PTR: u32 = 1 << 0;
    /// Fill the hardware timestamp
    pub const TIMESTAMP: u32 = 1 << 1;

    /// Mask from raw bits
    #[inline(always)]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Check if flag is set
    #[inline(always)]
    pub const fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// Arguments of a cyclic read
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    /// Packets to wait for before emitting
    pub min: usize,
    /// Packets to drain opportunistically
    pub max: usize,
    /// Read mode
    pub mode: ReadMode,
    /// Optional fields
    pub mask: CompletionMask,
}

impl ReadRequest {
    /// Non-blocking read of `min..=max` packets
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min,
            max,
            mode: ReadMode::NonBlocking,
            mask: CompletionMask::default(),
        }
    }

    /// Request optional fields
    pub fn with_mask(mut self, mask: CompletionMask) -> Self {
        self.mask = mask;
        self
    }
}

/// A run of packets in the cyclic buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Buffer offset of the first packet
    pub payload_offset: usize,
    /// Bytes covered
    pub payload_len: usize,
    /// Packets covered
    pub packets: usize,
    /// Header location (offset, length), when requested
    pub headers: Option<(usize, usize)>,
    /// Hardware timestamp of the first packet, when requested
    pub hw_timestamp: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    offset: usize,
    bytes: usize,
    packets: usize,
    timestamp: Option<Duration>,
}

/// Result of an inner drain loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopOutcome {
    /// Queue ran dry before the limit
    Empty,
    /// Limit reached, more may be waiting
    Continue,
    /// Error, bad record or work-queue end
    Stop,
}

/// Multi-packet receive ring over a cyclic buffer
pub struct CyclicBufferRing<S: CqeSource, Q: ReceiveQueue> {
    cq: MpCompletionQueue<S>,
    rq: Q,
    clock: Arc<dyn HwClock>,
    layout: CyclicLayout,
    buffer: BytesMut,
    curr_wq: u32,
    stride_counter: u32,
    pending: Option<Pending>,
}

impl<S: CqeSource, Q: ReceiveQueue> CyclicBufferRing<S, Q> {
    /// Allocate the buffer and post every work queue
    pub fn new(
        attr: &CyclicRingAttr,
        caps: &MpRqCaps,
        source: S,
        mut rq: Q,
        clock: Arc<dyn HwClock>,
    ) -> RingResult<Self> {
        let layout = CyclicLayout::compute(attr, caps)?;
        let cq = MpCompletionQueue::new(source, layout.stride_log)?;
        rq.post_recv(0, layout.wq_count)?;
        tracing::info!(
            buffer_size = layout.buffer_size,
            strides_log = layout.strides_log,
            stride_log = layout.stride_log,
            wq_count = layout.wq_count,
            "cyclic buffer ring created"
        );

        Ok(Self {
            cq,
            rq,
            clock,
            layout,
            buffer: BytesMut::zeroed(layout.buffer_size),
            curr_wq: 0,
            stride_counter: 0,
            pending: None,
        })
    }

    /// Buffer layout
    pub fn layout(&self) -> &CyclicLayout {
        &self.layout
    }

    /// Work queue currently being consumed
    pub fn current_wq(&self) -> u32 {
        self.curr_wq
    }

    /// Strides consumed from the current work queue
    pub fn stride_counter(&self) -> u32 {
        self.stride_counter
    }

    /// Packets folded into the pending completion
    pub fn pending_packets(&self) -> usize {
        self.pending.map_or(0, |p| p.packets)
    }

    /// Receive queue
    pub fn receive_queue(&self) -> &Q {
        &self.rq
    }

    /// Completion queue
    pub fn completion_queue(&self) -> &MpCompletionQueue<S> {
        &self.cq
    }

    /// Cyclic buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Cyclic buffer, for the device side to write into
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Payload bytes of a completion
    pub fn payload(&self, completion: &Completion) -> Option<&[u8]> {
        let end = completion.payload_offset.checked_add(completion.payload_len)?;
        self.buffer.get(completion.payload_offset..end)
    }

    /// Read the next completion
    ///
    /// Returns `Ok(None)` when nothing is ready yet; a partially gathered
    /// completion is kept for the next call. A bad or filler record closes
    /// the gathered run. An unexpected opcode is reported as
    /// [`RingError::BadCompletion`].
    pub fn read(&mut self, req: &ReadRequest) -> RingResult<Option<Completion>> {
        if req.min > req.max || req.max == 0 || req.mode != ReadMode::NonBlocking {
            tracing::debug!(min = req.min, max = req.max, mode = ?req.mode, "illegal cyclic read arguments");
            return Err(RingError::InvalidArgument(format!(
                "min {} max {} mode {:?}: only non-blocking reads with 0 < min <= max are supported",
                req.min, req.max, req.mode
            )));
        }

        let pkt = match self.cq.poll(&mut self.stride_counter) {
            MpPoll::Empty => return Ok(None),
            MpPoll::Error { opcode } => {
                tracing::debug!(opcode, "cyclic read hit a bad completion");
                return Err(RingError::BadCompletion { opcode });
            }
            MpPoll::Packet(pkt) => pkt,
        };

        // A bad record ends the run, the next packet is not contiguous
        if pkt.flags.is_bad() {
            if self.wq_exhausted() {
                self.reload_wq();
            }
            return Ok(self.emit(req.mask));
        }

        self.accumulate(&pkt, req.mask);

        if self.wq_exhausted() {
            self.reload_wq();
        } else {
            match self.mp_loop(req.min) {
                LoopOutcome::Continue => {
                    self.mp_loop(req.max);
                }
                LoopOutcome::Empty => return Ok(None),
                LoopOutcome::Stop => {}
            }
        }

        Ok(self.emit(req.mask))
    }

    fn accumulate(&mut self, pkt: &MpPacket, mask: CompletionMask) {
        match self.pending.as_mut() {
            Some(p) => {
                p.packets += 1;
                p.bytes += usize::from(pkt.size);
            }
            None => {
                let timestamp = mask
                    .has(CompletionMask::TIMESTAMP)
                    .then(|| self.clock.to_system_time(pkt.timestamp));
                self.pending = Some(Pending {
                    offset: self.layout.wq_base(self.curr_wq) + pkt.offset as usize,
                    bytes: usize::from(pkt.size),
                    packets: 1,
                    timestamp,
                });
            }
        }
    }

    /// Keep decoding while fewer than `limit` packets are pending
    fn mp_loop(&mut self, limit: usize) -> LoopOutcome {
        while self.pending_packets() < limit {
            let pkt = match self.cq.poll(&mut self.stride_counter) {
                MpPoll::Empty => {
                    tracing::trace!("no packet found");
                    return LoopOutcome::Empty;
                }
                MpPoll::Error { opcode } => {
                    tracing::debug!(opcode, "drain loop hit a bad completion");
                    return LoopOutcome::Stop;
                }
                MpPoll::Packet(pkt) => pkt,
            };
            if pkt.flags.is_bad() {
                if self.wq_exhausted() {
                    self.reload_wq();
                }
                return LoopOutcome::Stop;
            }
            if let Some(p) = self.pending.as_mut() {
                p.bytes += usize::from(pkt.size);
                p.packets += 1;
            }
            if self.wq_exhausted() {
                self.reload_wq();
                return LoopOutcome::Stop;
            }
        }
        LoopOutcome::Continue
    }

    #[inline]
    fn wq_exhausted(&self) -> bool {
        self.stride_counter >= self.layout.strides_per_wq()
    }

    /// Re-post the current work queue and move to the next one
    fn reload_wq(&mut self) {
        if let Err(e) = self.rq.post_recv(self.curr_wq, 1) {
            tracing::warn!(wq = self.curr_wq, error = %e, "failed to re-post work queue");
        }
        self.curr_wq = (self.curr_wq + 1) % self.layout.wq_count;
        self.stride_counter = 0;
    }

    fn emit(&mut self, mask: CompletionMask) -> Option<Completion> {
        let p = self.pending.take()?;
        let completion = Completion {
            payload_offset: p.offset,
            payload_len: p.bytes,
            packets: p.packets,
            headers: mask
                .has(CompletionMask::HDR_PTR)
                .then_some((p.offset, p.bytes)),
            hw_timestamp: p.timestamp,
        };
        tracing::trace!(
            offset = p.offset,
            bytes = p.bytes,
            packets = p.packets,
            wq = self.curr_wq,
            "returning completion"
        );
        Some(completion)
    }
}
