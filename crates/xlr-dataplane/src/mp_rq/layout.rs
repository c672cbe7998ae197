//! Cyclic buffer geometry
//!
//! Derives stride size, strides per work queue and work-queue count from the
//! application's request and the device's multi-packet capabilities.

use crate::profile::CyclicRingAttr;
use xlr_common::{RingError, RingResult};

/// Fewest work queues a cyclic ring posts
pub const MIN_MP_WQES: u32 = 4;
/// Most work queues a cyclic ring posts
pub const MAX_MP_WQES: u32 = 20;

/// Headroom added to each stride: Ethernet + IPv4 + UDP headers
const STRIDE_HEADROOM: u32 = 14 + 20 + 8;

/// Multi-packet receive capabilities of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpRqCaps {
    /// Device can create resource domains
    pub resource_domain: bool,
    /// Raw-packet queue pairs support multi-packet receive
    pub raw_packet_mp_rq: bool,
    /// log2 of the smallest stride in bytes
    pub min_stride_log: u8,
    /// log2 of the largest stride in bytes
    pub max_stride_log: u8,
    /// log2 of the fewest strides per work queue
    pub min_strides_log: u8,
    /// log2 of the most strides per work queue
    pub max_strides_log: u8,
}

/// Resolved cyclic buffer layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclicLayout {
    /// log2 of the stride size in bytes
    pub stride_log: u8,
    /// log2 of strides per work queue
    pub strides_log: u8,
    /// Number of work queues
    pub wq_count: u32,
    /// Total buffer bytes
    pub buffer_size: usize,
}

impl CyclicLayout {
    /// Compute the layout for `attr` on a device with `caps`
    pub fn compute(attr: &CyclicRingAttr, caps: &MpRqCaps) -> RingResult<Self> {
        if !caps.resource_domain {
            tracing::debug!("device doesn't support resource domain");
            return Err(RingError::Unsupported("resource domain".into()));
        }
        if !caps.raw_packet_mp_rq {
            tracing::debug!("mp_rq is not supported");
            return Err(RingError::Unsupported("multi-packet receive queue".into()));
        }

        let stride_bytes = attr
            .stride_bytes
            .checked_add(STRIDE_HEADROOM)
            .and_then(u32::checked_next_power_of_two)
            .ok_or_else(|| bad_params(attr, "stride too large"))?;
        let mut stride_log = stride_bytes.trailing_zeros() as u8;
        if stride_log < caps.min_stride_log {
            stride_log = caps.min_stride_log;
        }
        if stride_log > caps.max_stride_log {
            stride_log = caps.max_stride_log;
        }

        let max_wqe = 1u32
            .checked_shl(u32::from(caps.max_strides_log))
            .ok_or_else(|| bad_params(attr, "strides per work queue out of range"))?;
        let user_req_wq = attr.num / max_wqe;

        let (wq_count, strides_log) = if user_req_wq > 2 {
            (user_req_wq.min(MAX_MP_WQES), caps.max_strides_log)
        } else {
            let num = attr
                .num
                .checked_next_power_of_two()
                .ok_or_else(|| bad_params(attr, "packet count too large"))?;
            let log = (num / MIN_MP_WQES).checked_ilog2().unwrap_or(0) as u8;
            (MIN_MP_WQES, log.max(caps.min_strides_log))
        };

        let buffer_size = 1usize
            .checked_shl(u32::from(stride_log))
            .and_then(|s| s.checked_mul(1usize.checked_shl(u32::from(strides_log))?))
            .and_then(|s| s.checked_mul(wq_count as usize))
            .filter(|&s| s != 0)
            .ok_or_else(|| {
                tracing::error!(stride_log, strides_log, wq_count, "problem with buffer parameters");
                bad_params(attr, "bad cyclic buffer parameters")
            })?;

        let layout = Self {
            stride_log,
            strides_log,
            wq_count,
            buffer_size,
        };
        tracing::debug!(?layout, "cyclic buffer layout");
        Ok(layout)
    }

    /// Bytes per stride
    #[inline]
    pub fn stride_size(&self) -> usize {
        1 << self.stride_log
    }

    /// Strides per work queue
    #[inline]
    pub fn strides_per_wq(&self) -> u32 {
        1 << self.strides_log
    }

    /// Bytes per work queue
    #[inline]
    pub fn wq_bytes(&self) -> usize {
        self.stride_size() << self.strides_log
    }

    /// Offset of work queue `wq` within the buffer
    #[inline]
    pub fn wq_base(&self, wq: u32) -> usize {
        self.wq_bytes() * wq as usize
    }
}

fn bad_params(attr: &CyclicRingAttr, what: &str) -> RingError {
    RingError::Config(format!(
        "{what} (num {}, stride_bytes {})",
        attr.num, attr.stride_bytes
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> MpRqCaps {
        MpRqCaps {
            resource_domain: true,
            raw_packet_mp_rq: true,
            min_stride_log: 6,
            max_stride_log: 13,
            min_strides_log: 9,
            max_strides_log: 16,
        }
    }

    fn attr(num: u32, stride_bytes: u32) -> CyclicRingAttr {
        CyclicRingAttr {
            num,
            stride_bytes,
            hdr_bytes: None,
        }
    }

    #[test]
    fn test_small_ring_uses_min_wqes() {
        let layout = CyclicLayout::compute(&attr(65536, 1400), &caps()).unwrap();
        // 1400 + 42 rounds up to 2048
        assert_eq!(layout.stride_log, 11);
        assert_eq!(layout.wq_count, MIN_MP_WQES);
        // 65536 / 4 = 2^14 strides per queue
        assert_eq!(layout.strides_log, 14);
        assert_eq!(layout.buffer_size, 2048 * (1 << 14) * 4);
    }

    #[test]
    fn test_large_ring_caps_wq_count() {
        let layout = CyclicLayout::compute(&attr(1 << 24, 64), &caps()).unwrap();
        assert_eq!(layout.stride_log, 7);
        assert_eq!(layout.strides_log, 16);
        assert_eq!(layout.wq_count, MAX_MP_WQES);

        let layout = CyclicLayout::compute(&attr(5 << 16, 64), &caps()).unwrap();
        assert_eq!(layout.wq_count, 5);
    }

    #[test]
    fn test_caps_clamp() {
        let layout = CyclicLayout::compute(&attr(16, 1), &caps()).unwrap();
        assert_eq!(layout.stride_log, 6);
        assert_eq!(layout.strides_log, 9);

        let layout = CyclicLayout::compute(&attr(16, 60_000), &caps()).unwrap();
        assert_eq!(layout.stride_log, 13);
    }

    #[test]
    fn test_zero_packets() {
        let layout = CyclicLayout::compute(&attr(0, 64), &caps()).unwrap();
        assert_eq!(layout.strides_log, caps().min_strides_log);
    }

    #[test]
    fn test_requires_capabilities() {
        let mut c = caps();
        c.resource_domain = false;
        assert!(matches!(
            CyclicLayout::compute(&attr(1024, 64), &c),
            Err(RingError::Unsupported(_))
        ));

        let mut c = caps();
        c.raw_packet_mp_rq = false;
        assert!(matches!(
            CyclicLayout::compute(&attr(1024, 64), &c),
            Err(RingError::Unsupported(_))
        ));
    }

    #[test]
    fn test_wq_offsets() {
        let layout = CyclicLayout::compute(&attr(1024, 64), &caps()).unwrap();
        assert_eq!(layout.wq_base(0), 0);
        assert_eq!(layout.wq_base(3), 3 * layout.wq_bytes());
        assert_eq!(layout.wq_bytes() * layout.wq_count as usize, layout.buffer_size);
    }
}
