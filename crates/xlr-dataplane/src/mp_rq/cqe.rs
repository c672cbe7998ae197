//! Multi-packet completion records
//!
//! One CQE64 reports a packet written into one or more strides of a posted
//! receive buffer. All multi-byte fields are big-endian.
//!
//! CQE64 layout (fields used here):
//! - offset 28: hds_ip_ext (1B) - bit 1 L3 checksum ok, bit 2 L4 checksum ok
//! - offset 44: byte_cnt (4B) - [15:0] bytes, [30:16] strides, [31] filler
//! - offset 48: timestamp (8B)
//! - offset 60: wqe_counter (2B) - first stride of the packet
//! - offset 63: op_own (1B) - opcode[7:4] | owner_bit[0]

use parking_lot::Mutex;
use std::sync::Arc;
use xlr_common::{RingError, RingResult};

/// Size of one completion record
pub const CQE_SIZE: usize = 64;

/// Largest stride the decoder accepts, so a 16-bit stride index times the
/// stride size stays within `u32`
pub const MAX_STRIDE_LOG: u8 = 16;

const HDS_IP_EXT_OFFSET: usize = 28;
const BYTE_CNT_OFFSET: usize = 44;
const TIMESTAMP_OFFSET: usize = 48;
const WQE_COUNTER_OFFSET: usize = 60;
const OP_OWN_OFFSET: usize = 63;

const CQE_L3_OK: u8 = 1 << 1;
const CQE_L4_OK: u8 = 1 << 2;

const BYTE_CNT_MASK: u32 = 0x0000_FFFF;
const STRIDES_MASK: u32 = 0x7FFF_0000;
const STRIDES_SHIFT: u32 = 16;
const FILLER_MASK: u32 = 0x8000_0000;

/// CQE opcode values
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqeOpcode {
    /// Requester completion
    Req = 0x00,
    /// Responder RDMA write with immediate
    RespRdmaWriteImm = 0x01,
    /// Responder send
    RespSend = 0x02,
    /// Responder send with immediate
    RespSendImm = 0x03,
    /// Responder send with invalidate
    RespSendInv = 0x04,
    /// Requester error
    ReqErr = 0x0d,
    /// Responder error
    RespErr = 0x0e,
    /// Not yet written by hardware
    Invalid = 0x0f,
}

impl CqeOpcode {
    /// Decode the opcode nibble
    pub fn from_nibble(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Req),
            0x01 => Some(Self::RespRdmaWriteImm),
            0x02 => Some(Self::RespSend),
            0x03 => Some(Self::RespSendImm),
            0x04 => Some(Self::RespSendInv),
            0x0d => Some(Self::ReqErr),
            0x0e => Some(Self::RespErr),
            0x0f => Some(Self::Invalid),
            _ => None,
        }
    }
}

/// Raw CQE64 copied out of completion memory
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cqe64([u8; CQE_SIZE]);

impl Default for Cqe64 {
    fn default() -> Self {
        Self::invalid()
    }
}

impl std::fmt::Debug for Cqe64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cqe64")
            .field("opcode", &self.opcode())
            .field("owner", &self.owner())
            .field("byte_cnt", &format_args!("{:#010x}", self.byte_cnt()))
            .field("wqe_counter", &self.wqe_counter())
            .finish()
    }
}

impl Cqe64 {
    /// Record as left by a freshly created queue
    pub const fn invalid() -> Self {
        let mut raw = [0u8; CQE_SIZE];
        raw[OP_OWN_OFFSET] = (CqeOpcode::Invalid as u8) << 4;
        Self(raw)
    }

    /// Wrap raw bytes
    pub const fn from_bytes(raw: [u8; CQE_SIZE]) -> Self {
        Self(raw)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; CQE_SIZE] {
        &self.0
    }

    /// Start building a record
    pub fn builder() -> Cqe64Builder {
        Cqe64Builder::default()
    }

    #[inline(always)]
    fn be_u16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.0[at], self.0[at + 1]])
    }

    #[inline(always)]
    fn be_u32(&self, at: usize) -> u32 {
        u32::from_be_bytes([self.0[at], self.0[at + 1], self.0[at + 2], self.0[at + 3]])
    }

    /// op_own byte
    #[inline(always)]
    pub fn op_own(&self) -> u8 {
        self.0[OP_OWN_OFFSET]
    }

    /// Opcode nibble
    #[inline(always)]
    pub fn opcode(&self) -> u8 {
        self.op_own() >> 4
    }

    /// Owner bit
    #[inline(always)]
    pub fn owner(&self) -> bool {
        self.op_own() & 1 != 0
    }

    /// Checksum status bits
    #[inline(always)]
    pub fn hds_ip_ext(&self) -> u8 {
        self.0[HDS_IP_EXT_OFFSET]
    }

    /// Combined byte count, stride count and filler bit
    #[inline(always)]
    pub fn byte_cnt(&self) -> u32 {
        self.be_u32(BYTE_CNT_OFFSET)
    }

    /// Hardware timestamp in device ticks
    #[inline(always)]
    pub fn timestamp(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]);
        u64::from_be_bytes(raw)
    }

    /// Index of the first stride
    #[inline(always)]
    pub fn wqe_counter(&self) -> u16 {
        self.be_u16(WQE_COUNTER_OFFSET)
    }
}

/// Encoder for completion records (device side, loopback and tests)
#[derive(Debug, Clone, Copy)]
pub struct Cqe64Builder {
    opcode: u8,
    owner: bool,
    bytes: u16,
    strides: u16,
    filler: bool,
    l3_ok: bool,
    l4_ok: bool,
    timestamp: u64,
    wqe_counter: u16,
}

impl Default for Cqe64Builder {
    fn default() -> Self {
        Self {
            opcode: CqeOpcode::RespSend as u8,
            owner: false,
            bytes: 0,
            strides: 1,
            filler: false,
            l3_ok: true,
            l4_ok: true,
            timestamp: 0,
            wqe_counter: 0,
        }
    }
}

impl Cqe64Builder {
    /// Opcode nibble
    pub fn opcode(mut self, opcode: u8) -> Self {
        self.opcode = opcode & 0x0f;
        self
    }

    /// Owner bit
    pub fn owner(mut self, owner: bool) -> Self {
        self.owner = owner;
        self
    }

    /// Packet bytes
    pub fn bytes(mut self, bytes: u16) -> Self {
        self.bytes = bytes;
        self
    }

    /// Strides consumed (15 bits)
    pub fn strides(mut self, strides: u16) -> Self {
        self.strides = strides & 0x7fff;
        self
    }

    /// Filler record
    pub fn filler(mut self, filler: bool) -> Self {
        self.filler = filler;
        self
    }

    /// Checksum verdicts
    pub fn checksums(mut self, l3_ok: bool, l4_ok: bool) -> Self {
        self.l3_ok = l3_ok;
        self.l4_ok = l4_ok;
        self
    }

    /// Device timestamp
    pub fn timestamp(mut self, ticks: u64) -> Self {
        self.timestamp = ticks;
        self
    }

    /// First stride index
    pub fn wqe_counter(mut self, counter: u16) -> Self {
        self.wqe_counter = counter;
        self
    }

    /// Encode
    pub fn build(self) -> Cqe64 {
        let mut raw = [0u8; CQE_SIZE];
        let mut hds = 0u8;
        if self.l3_ok {
            hds |= CQE_L3_OK;
        }
        if self.l4_ok {
            hds |= CQE_L4_OK;
        }
        raw[HDS_IP_EXT_OFFSET] = hds;

        let mut byte_cnt = u32::from(self.bytes) | (u32::from(self.strides) << STRIDES_SHIFT);
        if self.filler {
            byte_cnt |= FILLER_MASK;
        }
        raw[BYTE_CNT_OFFSET..BYTE_CNT_OFFSET + 4].copy_from_slice(&byte_cnt.to_be_bytes());
        raw[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8].copy_from_slice(&self.timestamp.to_be_bytes());
        raw[WQE_COUNTER_OFFSET..WQE_COUNTER_OFFSET + 2]
            .copy_from_slice(&self.wqe_counter.to_be_bytes());
        raw[OP_OWN_OFFSET] = (self.opcode << 4) | u8::from(self.owner);
        Cqe64(raw)
    }
}

/// Completion memory the decoder reads from
pub trait CqeSource: Send {
    /// Number of records (power of two)
    fn entries(&self) -> u32;

    /// Copy of the record in slot `index`
    fn load(&self, index: u32) -> Cqe64;
}

impl<T: CqeSource + Sync + ?Sized> CqeSource for Arc<T> {
    fn entries(&self) -> u32 {
        (**self).entries()
    }

    fn load(&self, index: u32) -> Cqe64 {
        (**self).load(index)
    }
}

/// Completion memory in host RAM with a producer cursor
///
/// The producer side writes records with the owner bit the consumer expects
/// for that lap of the ring.
#[derive(Debug)]
pub struct CqeMemory {
    inner: Mutex<CqeMemoryInner>,
    entries: u32,
}

#[derive(Debug)]
struct CqeMemoryInner {
    records: Vec<Cqe64>,
    pi: u32,
}

impl CqeMemory {
    /// Ring of `entries` invalid records
    pub fn new(entries: u32) -> RingResult<Self> {
        if entries == 0 || !entries.is_power_of_two() {
            return Err(RingError::InvalidArgument(format!(
                "completion ring size {entries} is not a power of two"
            )));
        }
        Ok(Self {
            inner: Mutex::new(CqeMemoryInner {
                records: vec![Cqe64::invalid(); entries as usize],
                pi: 0,
            }),
            entries,
        })
    }

    /// Write the next record, stamping the owner bit for the current lap
    pub fn produce(&self, builder: Cqe64Builder) {
        let mut inner = self.inner.lock();
        let pi = inner.pi;
        let slot = (pi & (self.entries - 1)) as usize;
        inner.records[slot] = builder.owner(pi & self.entries != 0).build();
        inner.pi = pi.wrapping_add(1);
    }

    /// Overwrite a slot verbatim
    pub fn store(&self, index: u32, cqe: Cqe64) {
        let mut inner = self.inner.lock();
        let slot = (index & (self.entries - 1)) as usize;
        inner.records[slot] = cqe;
    }

    /// Producer index
    pub fn producer_index(&self) -> u32 {
        self.inner.lock().pi
    }
}

impl CqeSource for CqeMemory {
    fn entries(&self) -> u32 {
        self.entries
    }

    fn load(&self, index: u32) -> Cqe64 {
        self.inner.lock().records[(index & (self.entries - 1)) as usize]
    }
}

/// Per-packet receive flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct MpFlags(u32);

impl MpFlags {
    /// IP header checksum verified
    pub const IP_CSUM_OK: u32 = 1 << 0;
    /// TCP/UDP checksum verified
    pub const L4_CSUM_OK: u32 = 1 << 1;
    /// Record must not be delivered
    pub const BAD_PACKET: u32 = 1 << 31;

    const GOOD: u32 = Self::IP_CSUM_OK | Self::L4_CSUM_OK;

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

    /// Bad-packet flag set
    #[inline(always)]
    pub const fn is_bad(&self) -> bool {
        self.has(Self::BAD_PACKET)
    }

    /// Raw bits
    #[inline(always)]
    pub const fn bits(&self) -> u32 {
        self.0
    }
}

/// Decoded stride record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpPacket {
    /// Packet bytes, 1 for bad records
    pub size: u16,
    /// Byte offset of the packet within its work queue
    pub offset: u32,
    /// Receive flags
    pub flags: MpFlags,
    /// Device timestamp
    pub timestamp: u64,
}

/// Outcome of one decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpPoll {
    /// No record owned by software
    Empty,
    /// Record with an unexpected opcode; the consumer index is left in place
    Error {
        /// Opcode nibble
        opcode: u8,
    },
    /// A packet (possibly flagged bad)
    Packet(MpPacket),
}

/// Completion queue of a multi-packet receive queue
pub struct MpCompletionQueue<S: CqeSource> {
    source: S,
    /// Consumer index
    ci: u32,
    cq_size: u32,
    stride_size: u32,
}

impl<S: CqeSource> MpCompletionQueue<S> {
    /// Decoder over `source` for strides of `1 << stride_log` bytes
    pub fn new(source: S, stride_log: u8) -> RingResult<Self> {
        let cq_size = source.entries();
        if cq_size == 0 || !cq_size.is_power_of_two() {
            return Err(RingError::InvalidArgument(format!(
                "completion ring size {cq_size} is not a power of two"
            )));
        }
        if stride_log > MAX_STRIDE_LOG {
            return Err(RingError::InvalidArgument(format!(
                "stride log {stride_log} above {MAX_STRIDE_LOG}"
            )));
        }
        let stride_size = 1u32 << stride_log;
        Ok(Self {
            source,
            ci: 0,
            cq_size,
            stride_size,
        })
    }

    /// Consumer index
    pub fn consumer_index(&self) -> u32 {
        self.ci
    }

    /// Bytes per stride
    pub fn stride_size(&self) -> u32 {
        self.stride_size
    }

    /// Completion memory
    pub fn source(&self) -> &S {
        &self.source
    }

    #[inline(always)]
    fn owned_cqe(&self) -> Option<Cqe64> {
        let cqe = self.source.load(self.ci & (self.cq_size - 1));
        let sw_owner = self.ci & self.cq_size != 0;
        if cqe.opcode() != CqeOpcode::Invalid as u8 && cqe.owner() == sw_owner {
            Some(cqe)
        } else {
            None
        }
    }

    /// Decode the record at the consumer index
    ///
    /// Strides consumed by the record are added to `strides_used`.
    #[inline]
    pub fn poll(&mut self, strides_used: &mut u32) -> MpPoll {
        let Some(cqe) = self.owned_cqe() else {
            return MpPoll::Empty;
        };

        let opcode = cqe.opcode();
        if opcode != CqeOpcode::RespSend as u8 {
            tracing::debug!(opcode, ci = self.ci, "unexpected completion opcode");
            return MpPoll::Error { opcode };
        }

        let byte_strides = cqe.byte_cnt();
        *strides_used += (byte_strides & STRIDES_MASK) >> STRIDES_SHIFT;

        let mut flags = MpFlags::default();
        let mut size;
        let mut offset = 0;
        if byte_strides & FILLER_MASK == 0 {
            size = (byte_strides & BYTE_CNT_MASK) as u16;
            offset = u32::from(cqe.wqe_counter()) * self.stride_size;
            let hds = cqe.hds_ip_ext();
            if hds & CQE_L3_OK != 0 {
                flags.set(MpFlags::IP_CSUM_OK);
            }
            if hds & CQE_L4_OK != 0 {
                flags.set(MpFlags::L4_CSUM_OK);
            }
            if flags.bits() != MpFlags::GOOD {
                flags.set(MpFlags::BAD_PACKET);
                size = 1;
            }
        } else {
            flags.set(MpFlags::BAD_PACKET);
            size = 1;
        }

        self.ci = self.ci.wrapping_add(1);
        tracing::trace!(size, strides_used = *strides_used, offset, flags = flags.bits(), "stride record");

        MpPoll::Packet(MpPacket {
            size,
            offset,
            flags,
            timestamp: cqe.timestamp(),
        })
    }
}

impl<S: CqeSource> Drop for MpCompletionQueue<S> {
    fn drop(&mut self) {
        let mut strides = 0;
        let mut drained = 0usize;
        while let MpPoll::Packet(_) = self.poll(&mut strides) {
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!(drained, "completion queue drained on teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn queue(entries: u32) -> (Arc<CqeMemory>, MpCompletionQueue<Arc<CqeMemory>>) {
        let mem = Arc::new(CqeMemory::new(entries).unwrap());
        let cq = MpCompletionQueue::new(Arc::clone(&mem), 7).unwrap();
        (mem, cq)
    }

    #[test]
    fn test_layout_offsets() {
        let cqe = Cqe64::builder()
            .bytes(0x1234)
            .strides(3)
            .timestamp(0x0102_0304_0506_0708)
            .wqe_counter(0xabcd)
            .owner(true)
            .build();
        let raw = cqe.as_bytes();
        assert_eq!(raw[28], 0b110);
        assert_eq!(&raw[44..48], &[0x00, 0x03, 0x12, 0x34]);
        assert_eq!(&raw[48..56], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&raw[60..62], &[0xab, 0xcd]);
        assert_eq!(raw[63], 0x21);
    }

    #[test]
    fn test_empty_has_no_side_effects() {
        let (_mem, mut cq) = queue(8);
        let mut strides = 5;
        assert_eq!(cq.poll(&mut strides), MpPoll::Empty);
        assert_eq!(strides, 5);
        assert_eq!(cq.consumer_index(), 0);
    }

    #[test]
    fn test_good_record() {
        let (mem, mut cq) = queue(8);
        mem.produce(Cqe64::builder().bytes(60).strides(1).wqe_counter(4).timestamp(99));

        let mut strides = 0;
        let MpPoll::Packet(pkt) = cq.poll(&mut strides) else {
            panic!("expected a packet");
        };
        assert_eq!(pkt.size, 60);
        assert_eq!(pkt.offset, 4 * 128);
        assert_eq!(pkt.timestamp, 99);
        assert!(!pkt.flags.is_bad());
        assert!(pkt.flags.has(MpFlags::IP_CSUM_OK));
        assert_eq!(strides, 1);
        assert_eq!(cq.consumer_index(), 1);
    }

    #[test]
    fn test_bad_checksum() {
        let (mem, mut cq) = queue(8);
        mem.produce(Cqe64::builder().bytes(60).strides(2).checksums(true, false));

        let mut strides = 0;
        let MpPoll::Packet(pkt) = cq.poll(&mut strides) else {
            panic!("expected a packet");
        };
        assert!(pkt.flags.is_bad());
        assert!(pkt.flags.has(MpFlags::IP_CSUM_OK));
        assert_eq!(pkt.size, 1);
        assert_eq!(strides, 2);
    }

    #[test]
    fn test_wrong_opcode_not_consumed() {
        let (mem, mut cq) = queue(8);
        mem.produce(Cqe64::builder().opcode(CqeOpcode::RespErr as u8));

        let mut strides = 0;
        assert_eq!(cq.poll(&mut strides), MpPoll::Error { opcode: 0x0e });
        assert_eq!(cq.poll(&mut strides), MpPoll::Error { opcode: 0x0e });
        assert_eq!(cq.consumer_index(), 0);
        assert_eq!(strides, 0);
    }

    #[test]
    fn test_owner_bit_across_laps() {
        let (mem, mut cq) = queue(2);
        let mut strides = 0;
        for round in 0..3u16 {
            mem.produce(Cqe64::builder().bytes(10 + round));
            mem.produce(Cqe64::builder().bytes(20 + round));
            assert!(matches!(cq.poll(&mut strides), MpPoll::Packet(p) if p.size == 10 + round));
            assert!(matches!(cq.poll(&mut strides), MpPoll::Packet(p) if p.size == 20 + round));
            // Slot still holds the previous lap's record
            assert_eq!(cq.poll(&mut strides), MpPoll::Empty);
        }
        assert_eq!(cq.consumer_index(), 6);
    }

    #[test]
    fn test_rejects_bad_ring_size() {
        assert!(CqeMemory::new(0).is_err());
        assert!(CqeMemory::new(6).is_err());
    }

    #[test]
    fn test_stride_log_bounded() {
        let mem = Arc::new(CqeMemory::new(8).unwrap());
        assert!(MpCompletionQueue::new(Arc::clone(&mem), MAX_STRIDE_LOG + 1).is_err());

        // Largest stride at the largest counter still fits the offset
        let mut cq = MpCompletionQueue::new(Arc::clone(&mem), MAX_STRIDE_LOG).unwrap();
        mem.produce(Cqe64::builder().wqe_counter(u16::MAX).bytes(64));
        let mut strides = 0;
        match cq.poll(&mut strides) {
            MpPoll::Packet(p) => assert_eq!(p.offset, u32::from(u16::MAX) << MAX_STRIDE_LOG),
            other => panic!("expected a packet, got {other:?}"),
        }
    }

    #[test]
    fn test_drop_with_pending_records() {
        let (mem, cq) = queue(8);
        for _ in 0..3 {
            mem.produce(Cqe64::builder().bytes(64));
        }
        mem.produce(Cqe64::builder().filler(true));
        drop(cq);
        assert_eq!(mem.producer_index(), 4);
    }

    proptest! {
        #[test]
        fn prop_filler_always_bad(bytes in any::<u16>(), strides in 0u16..0x8000, l3 in any::<bool>(), l4 in any::<bool>()) {
            let (mem, mut cq) = queue(4);
            mem.produce(
                Cqe64::builder()
                    .bytes(bytes)
                    .strides(strides)
                    .checksums(l3, l4)
                    .filler(true),
            );
            let mut used = 0;
            let MpPoll::Packet(pkt) = cq.poll(&mut used) else {
                panic!("expected a packet");
            };
            prop_assert!(pkt.flags.is_bad());
            prop_assert_eq!(pkt.size, 1);
            prop_assert_eq!(used, u32::from(strides));
        }
    }
}
