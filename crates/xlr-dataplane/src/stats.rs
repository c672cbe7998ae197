//! Bond Statistics
//!
//! Lock-free counters for the aggregation layer. Counters that matter to
//! operators are mirrored to the `metrics` facade.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Per-bond stats (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct BondStats {
    /// Transmits dropped because ownership changed under a failover
    pub ha_drops: AtomicU64,
    /// Poll/drain/arm calls skipped because the path lock was held
    pub busy_skips: AtomicU64,
    /// Buffers routed back to a pool because no member owned them
    pub orphaned: AtomicU64,
    /// Frames delivered from the tap fallback
    pub tap_rx_packets: AtomicU64,
    /// Bytes delivered from the tap fallback
    pub tap_rx_bytes: AtomicU64,
    /// Buffers held in the tap RX cache
    pub tap_rx_buffers: AtomicI64,
}

impl BondStats {
    #[inline(always)]
    pub fn record_ha_drop(&self) {
        self.ha_drops.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("xlr_bond_ha_drops_total").increment(1);
    }

    #[inline(always)]
    pub fn record_busy(&self) {
        self.busy_skips.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_orphans(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.orphaned.fetch_add(count as u64, Ordering::Relaxed);
        metrics::counter!("xlr_bond_orphaned_buffers_total").increment(count as u64);
    }

    /// A tap frame was consumed from the cache and delivered
    #[inline(always)]
    pub fn record_tap_rx(&self, bytes: u64) {
        self.tap_rx_packets.fetch_add(1, Ordering::Relaxed);
        self.tap_rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.tap_rx_buffers.fetch_sub(1, Ordering::Relaxed);
        metrics::counter!("xlr_tap_rx_bytes_total").increment(bytes);
    }

    #[inline(always)]
    pub fn set_tap_rx_buffers(&self, count: usize) {
        self.tap_rx_buffers.store(count as i64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BondStatsSnapshot {
        BondStatsSnapshot {
            ha_drops: self.ha_drops.load(Ordering::Relaxed),
            busy_skips: self.busy_skips.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            tap_rx_packets: self.tap_rx_packets.load(Ordering::Relaxed),
            tap_rx_bytes: self.tap_rx_bytes.load(Ordering::Relaxed),
            tap_rx_buffers: self.tap_rx_buffers.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BondStatsSnapshot {
    pub ha_drops: u64,
    pub busy_skips: u64,
    pub orphaned: u64,
    pub tap_rx_packets: u64,
    pub tap_rx_bytes: u64,
    pub tap_rx_buffers: i64,
}
