//! Bonded Ring
//!
//! Presents up to [`MAX_BOND_MEMBERS`] hardware rings as one logical ring.
//!
//! # Design
//!
//! - Members are fixed at construction; failover only rewrites the active set
//! - `active[i]` names the member carrying slot `i`; gaps are filled from
//!   neighbouring active slots so every slot has a carrier while any member
//!   is up
//! - RX and TX paths have their own locks; pollers never wait on them
//! - Returned buffers are routed to the member that allocated them
//!
//! ```text
//!            ┌──────────────── RingBond ────────────────┐
//!  attach ──▶│ rx_lock ─▶ members[0..N] (all)           │
//!  poll   ──▶│ try rx_lock ─▶ tap ─▶ members (up)       │
//!  send   ──▶│ active[id] ─▶ owner? send : release      │
//!  release ─▶│ partition by owner ─▶ members / pool     │
//!            └──────────────────────────────────────────┘
//! ```

mod hash;
#[cfg(test)]
mod mock;
mod routing;
mod tap;

pub use hash::{xmit_hash, HashInput, ETH_P_8021Q, ETH_P_IP};
pub use routing::{partition_chain, partition_queue, Partition};
pub use tap::{
    FlowAction, FlowAgent, FlowMatch, FlowMessage, TapDevice, TapFallback, AGENT_PROTOCOL_VERSION,
};

use crate::buffer::{BufferDescriptor, DescChain, DescQueue, RingId};
use crate::pool::BufferPool;
use crate::ring::{
    Attempt, BufferOwner, ChannelFd, CqKind, CqModeration, PhysicalRing, RateLimit, TxAttr,
    TxDisposition,
};
use crate::stats::BondStats;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use xlr_common::{BondMode, BondSpec, FlowTuple, RingConfig, RingError, RingResult, SinkId};

/// Hard cap on bond members
pub const MAX_BOND_MEMBERS: usize = 10;

/// Shared buffer pools
#[derive(Debug, Clone)]
pub struct BondPools {
    /// Receive pool
    pub rx: Arc<BufferPool>,
    /// Transmit pool
    pub tx: Arc<BufferPool>,
}

/// State guarded by the RX path lock
#[derive(Debug, Default)]
struct RxPathState {
    /// Buffers reserved for tap reads
    tap_cache: DescQueue,
}

/// Bonded ring
pub struct RingBond {
    id: RingId,
    spec: BondSpec,
    config: RingConfig,
    members: Vec<Arc<dyn PhysicalRing>>,
    /// Slot -> member index
    active: RwLock<Vec<Option<usize>>>,
    rx_lock: Mutex<RxPathState>,
    tx_lock: Mutex<()>,
    min_tx_inline: u32,
    pools: BondPools,
    tap: Option<TapFallback>,
    tap_readable: AtomicBool,
    stats: BondStats,
}

impl RingBond {
    /// Create a bond over `members`
    ///
    /// Members must have been created with `id` as their parent.
    /// `active_slaves[i]` tells whether member `i` starts active.
    pub fn new(
        id: RingId,
        spec: BondSpec,
        config: RingConfig,
        members: Vec<Arc<dyn PhysicalRing>>,
        active_slaves: &[bool],
        pools: BondPools,
    ) -> RingResult<Self> {
        if members.len() > MAX_BOND_MEMBERS {
            error!(
                count = members.len(),
                max = MAX_BOND_MEMBERS,
                "error creating bond ring with more than {} resources",
                MAX_BOND_MEMBERS
            );
            return Err(RingError::TooManyMembers {
                count: members.len(),
                max: MAX_BOND_MEMBERS,
            });
        }
        if members.is_empty() {
            error!("error creating bond ring without resources");
            return Err(RingError::NoMembers);
        }
        if active_slaves.len() != members.len() {
            return Err(RingError::InvalidArgument(format!(
                "{} activity flags for {} members",
                active_slaves.len(),
                members.len()
            )));
        }

        let min_tx_inline = members
            .iter()
            .map(|m| m.max_tx_inline())
            .min()
            .unwrap_or(0);

        let mut active: Vec<Option<usize>> = active_slaves
            .iter()
            .enumerate()
            .map(|(i, &up)| up.then_some(i))
            .collect();
        close_gaps(&mut active);

        info!(
            bond = %id,
            members = members.len(),
            mode = ?spec.mode,
            policy = ?spec.xmit_hash_policy,
            "bond ring created"
        );

        Ok(Self {
            id,
            spec,
            config,
            members,
            active: RwLock::new(active),
            rx_lock: Mutex::new(RxPathState::default()),
            tx_lock: Mutex::new(()),
            min_tx_inline,
            pools,
            tap: None,
            tap_readable: AtomicBool::new(false),
            stats: BondStats::default(),
        })
    }

    /// Poll a TAP device before the members (paravirtualized NICs)
    pub fn with_tap_fallback(mut self, tap: TapFallback) -> Self {
        info!(bond = %self.id, ?tap, "tap fallback attached");
        self.tap = Some(tap);
        self
    }

    /// Bond identity
    pub fn id(&self) -> RingId {
        self.id
    }

    /// Bond shape
    pub fn spec(&self) -> &BondSpec {
        &self.spec
    }

    /// Member rings in slot order
    pub fn members(&self) -> &[Arc<dyn PhysicalRing>] {
        &self.members
    }

    /// Copy of the active set
    pub fn active_slots(&self) -> Vec<Option<usize>> {
        self.active.read().clone()
    }

    /// Counters
    pub fn stats(&self) -> &BondStats {
        &self.stats
    }

    fn member_ids(&self) -> Vec<RingId> {
        self.members.iter().map(|m| m.id()).collect()
    }

    // =========================================================================
    // Flow registration
    // =========================================================================

    /// Register a flow on every member
    ///
    /// Returns false when any member refused; members that accepted keep the
    /// rule.
    pub fn attach_flow(&self, tuple: &FlowTuple, sink: SinkId) -> bool {
        let _rx = self.rx_lock.lock();

        if let Some(tap) = &self.tap {
            if !tap.device.is_open() {
                warn!(bond = %self.id, "tap device closed, ignoring attach");
                return false;
            }
        }

        let ret = self
            .members
            .iter()
            .fold(true, |ok, m| m.attach_flow(tuple, sink) && ok);

        if ret {
            if let Some(tap) = &self.tap {
                if tap.announce(FlowAction::Add, tuple).is_err() {
                    return false;
                }
            }
        }
        ret
    }

    /// Remove a flow from every member
    pub fn detach_flow(&self, tuple: &FlowTuple, sink: SinkId) -> bool {
        let _rx = self.rx_lock.lock();

        if let Some(tap) = &self.tap {
            if !tap.device.is_open() {
                return false;
            }
        }

        let ret = self
            .members
            .iter()
            .fold(true, |ok, m| m.detach_flow(tuple, sink) && ok);

        if ret {
            if let Some(tap) = &self.tap {
                if tap.announce(FlowAction::Del, tuple).is_err() {
                    return false;
                }
            }
        }
        ret
    }

    // =========================================================================
    // Failover
    // =========================================================================

    /// Apply a new set of member link states
    pub fn reconfigure(&self, states: &[bool], poll_sn: u64) -> RingResult<()> {
        if states.len() != self.members.len() {
            return Err(RingError::InvalidArgument(format!(
                "{} link states for {} members",
                states.len(),
                self.members.len()
            )));
        }
        debug!(bond = %self.id, ?states, "ring restart");

        let rx = self.rx_lock.lock();
        let tx = self.tx_lock.lock();

        let current = {
            let mut active = self.active.write();
            let previously_active = active[0];

            for (i, (&up, member)) in states.iter().zip(&self.members).enumerate() {
                if up {
                    debug!(bond = %self.id, slot = i, "ring active");
                    member.start();
                    active[i] = Some(i);
                } else {
                    debug!(bond = %self.id, slot = i, "ring inactive");
                    member.stop();
                    active[i] = None;
                }
            }
            close_gaps(&mut active);
            (previously_active, active[0])
        };

        if self.spec.mode == BondMode::ActiveBackup && self.config.cq_moderation_enable {
            if let (previously_active, Some(now)) = current {
                let moderation = match previously_active {
                    Some(prev) => self.members[prev].cq_moderation(),
                    None => CqModeration::new(
                        self.config.cq_moderation_period_usec,
                        self.config.cq_moderation_count,
                    ),
                };
                let member = &self.members[now];
                member.set_cq_moderation(moderation);
                member.modify_cq_moderation(moderation);
            }
        }

        if let Err(e) = self.arm_members(CqKind::Rx, poll_sn) {
            debug!(bond = %self.id, errno = e.errno(), "failed arming rx cq");
        }
        if let Err(e) = self.arm_members(CqKind::Tx, poll_sn) {
            debug!(bond = %self.id, errno = e.errno(), "failed arming tx cq");
        }

        drop(tx);
        drop(rx);
        info!(bond = %self.id, active = ?self.active_slots(), "ring restart done");
        Ok(())
    }

    // =========================================================================
    // Transmit
    // =========================================================================

    /// Slot id for a flow
    pub fn select_id(&self, key: &HashInput) -> usize {
        if self.spec.mode != BondMode::Lag8023ad {
            return 0;
        }
        let id = xmit_hash(self.spec.xmit_hash_policy, key, self.members.len());
        trace!(bond = %self.id, policy = ?self.spec.xmit_hash_policy, ?key, id, "select id");
        id
    }

    /// Member currently carrying slot `id`
    fn active_member(&self, id: usize) -> Option<&Arc<dyn PhysicalRing>> {
        let slot = self.active.read().get(id).copied().flatten()?;
        self.members.get(slot)
    }

    /// Send `buf` on slot `id`
    ///
    /// A buffer allocated by a member that no longer carries the slot is
    /// released instead of sent.
    pub fn transmit(&self, id: usize, buf: BufferDescriptor, attr: TxAttr) -> TxDisposition {
        let buf = match self.active_member(id) {
            Some(member) if member.owns(&buf) => {
                member.send(buf, attr);
                return TxDisposition::Sent;
            }
            _ => buf,
        };

        trace!(bond = %self.id, id, index = buf.index(), "silent packet drop (HA event?)");
        self.stats.record_ha_drop();
        match self.members.get(id) {
            Some(member) if member.owns(&buf) => {
                member.release_tx_buffers(DescChain::single(buf), true, false);
            }
            _ => {
                self.release_tx_buffers(DescChain::single(buf), true, false);
            }
        }
        TxDisposition::Dropped
    }

    /// Send a buffer the caller keeps a reference to
    ///
    /// On a failover the buffer is handed back and the caller frees it.
    pub fn transmit_or_return(
        &self,
        id: usize,
        buf: BufferDescriptor,
        block: bool,
    ) -> Result<(), BufferDescriptor> {
        match self.active_member(id) {
            Some(member) if member.owns(&buf) => {
                let mut attr = TxAttr::default();
                if block {
                    attr.set(TxAttr::BLOCK);
                }
                member.send(buf, attr);
                Ok(())
            }
            _ => {
                trace!(bond = %self.id, id, index = buf.index(), "silent packet drop (HA event?)");
                self.stats.record_ha_drop();
                Err(buf)
            }
        }
    }

    /// Take transmit buffers for slot `id`
    pub fn get_tx_buffers(&self, id: usize, block: bool, count: usize) -> Option<DescQueue> {
        match self.active_member(id) {
            Some(member) => member.get_tx_buffers(block, count),
            None => self.members.get(id)?.get_tx_buffers(block, count),
        }
    }

    /// Whether a dummy send of `buf` on slot `id` can be offloaded
    pub fn hw_dummy_send_support(&self, id: usize, buf: &BufferDescriptor) -> bool {
        if let Some(member) = self.active_member(id) {
            if member.owns(buf) {
                return member.hw_dummy_send_support(buf);
            }
        }
        match self.members.get(id) {
            Some(member) if member.owns(buf) => member.hw_dummy_send_support(buf),
            _ => false,
        }
    }

    /// Count a retransmission on slot `id`
    pub fn inc_tx_retransmissions(&self, id: usize) {
        if let Some(member) = self.active_member(id) {
            member.inc_tx_retransmissions();
        }
    }

    /// Smallest inline size over all members
    pub fn max_tx_inline(&self) -> u32 {
        self.min_tx_inline
    }

    // =========================================================================
    // Buffer return
    // =========================================================================

    /// Give transmit buffers back to their owners
    ///
    /// Returns the sum of what the members accounted.
    pub fn release_tx_buffers(&self, chain: DescChain, accounting: bool, trylock: bool) -> usize {
        let Partition {
            per_member,
            orphans,
        } = partition_chain(&self.member_ids(), chain);

        let released = per_member
            .into_iter()
            .enumerate()
            .filter(|(_, c)| !c.is_empty())
            .map(|(i, c)| self.members[i].release_tx_buffers(c, accounting, trylock))
            .sum();

        if !orphans.is_empty() {
            self.stats.record_orphans(orphans.len());
            self.pools.tx.put_chain(orphans);
        }
        released
    }

    /// Re-post receive buffers to their owners
    pub fn reclaim_rx_buffers(&self, queue: DescQueue) -> bool {
        let partition = partition_queue(&self.member_ids(), queue);
        let orphans = partition.orphans;

        for (i, q) in partition.per_member.into_iter().enumerate() {
            if q.is_empty() {
                continue;
            }
            if let Err(refused) = self.members[i].reclaim_rx_buffers(q) {
                self.pools.rx.put_buffers(refused);
            }
        }

        if !orphans.is_empty() {
            self.stats.record_orphans(orphans.len());
            self.pools.rx.put_buffers(orphans);
        }
        true
    }

    /// Return one completed transmit buffer to its owner
    pub fn return_single_to_owner_tx(&self, buf: BufferDescriptor) {
        match self.members.iter().find(|m| m.owns(&buf)) {
            Some(member) => member.return_single_to_owner_tx(buf),
            None => {
                self.stats.record_orphans(1);
                self.pools.tx.put_one(buf);
            }
        }
    }

    // =========================================================================
    // Receive
    // =========================================================================

    /// Signal that the TAP device has data
    pub fn notify_tap_readable(&self) {
        self.tap_readable.store(true, Ordering::Release);
    }

    /// Poll receive completions on every up member
    pub fn poll_rx(&self, poll_sn: &mut u64) -> Attempt<RingResult<usize>> {
        let Some(mut rx) = self.rx_lock.try_lock() else {
            return self.busy();
        };
        let tap_bytes = self.poll_tap_locked(&mut rx);
        Attempt::Done(self.accumulate(tap_bytes, |m| m.poll_rx(poll_sn)))
    }

    /// Drain every up member
    pub fn drain(&self) -> Attempt<RingResult<usize>> {
        let Some(mut rx) = self.rx_lock.try_lock() else {
            return self.busy();
        };
        let tap_bytes = self.poll_tap_locked(&mut rx);
        Attempt::Done(self.accumulate(tap_bytes, |m| m.drain()))
    }

    /// Consume channel events and process completions on every up member
    pub fn wait_and_process(
        &self,
        channel: ChannelFd,
        poll_sn: &mut u64,
    ) -> Attempt<RingResult<usize>> {
        let Some(mut rx) = self.rx_lock.try_lock() else {
            return self.busy();
        };
        let tap_bytes = self.poll_tap_locked(&mut rx);
        Attempt::Done(self.accumulate(tap_bytes, |m| m.wait_and_process(channel, poll_sn)))
    }

    /// Sum positive member results; with nothing to report, hand back the
    /// last member's result as is
    fn accumulate<F>(&self, tap_bytes: usize, mut op: F) -> RingResult<usize>
    where
        F: FnMut(&dyn PhysicalRing) -> RingResult<usize>,
    {
        let mut total = tap_bytes;
        let mut last = Ok(0);
        for member in self.members.iter().filter(|m| m.is_up()) {
            last = op(member.as_ref());
            if let Ok(n) = &last {
                total += n;
            }
        }
        if total > 0 {
            Ok(total)
        } else {
            last
        }
    }

    fn poll_tap_locked(&self, state: &mut RxPathState) -> usize {
        let Some(tap) = &self.tap else {
            return 0;
        };
        if !self.tap_readable.load(Ordering::Acquire) {
            return 0;
        }
        if state.tap_cache.is_empty() && !self.refill_tap_cache(state) {
            return 0;
        }
        let Some(mut buf) = state.tap_cache.pop_front() else {
            return 0;
        };

        let mut bytes = 0;
        match tap.device.read_frame(buf.fill_area()) {
            Ok(len) if len > 0 => {
                buf.truncate(len);
                match self.members[0].rx_process_buffer(buf) {
                    Ok(()) => {
                        bytes = len;
                        self.stats.record_tap_rx(len as u64);
                    }
                    Err(mut rejected) => {
                        rejected.truncate(0);
                        state.tap_cache.push_front(rejected);
                    }
                }
            }
            res => {
                if let Err(e) = res {
                    trace!(bond = %self.id, error = %e, "tap read returned no frame");
                }
                buf.truncate(0);
                state.tap_cache.push_front(buf);
            }
        }

        self.tap_readable.store(false, Ordering::Release);
        tap.device.rearm();
        bytes
    }

    fn refill_tap_cache(&self, state: &mut RxPathState) -> bool {
        let level = self.config.qp_compensation_level;
        trace!(bond = %self.id, level, "allocating additional buffers for internal use");
        match self.pools.rx.get_buffers(Some(self.id), level) {
            Ok(mut bufs) => {
                state.tap_cache.append(&mut bufs);
                self.stats.set_tap_rx_buffers(state.tap_cache.len());
                true
            }
            Err(e) => {
                trace!(bond = %self.id, error = %e, "no buffers for the tap cache");
                false
            }
        }
    }

    // =========================================================================
    // Notifications and tuning
    // =========================================================================

    /// Arm completion notifications on every up member
    ///
    /// Stops at the first member error.
    pub fn arm_notifications(&self, kind: CqKind, poll_sn: u64) -> Attempt<RingResult<usize>> {
        match kind {
            CqKind::Rx => match self.rx_lock.try_lock() {
                Some(_rx) => Attempt::Done(self.arm_members(kind, poll_sn)),
                None => self.busy(),
            },
            CqKind::Tx => match self.tx_lock.try_lock() {
                Some(_tx) => Attempt::Done(self.arm_members(kind, poll_sn)),
                None => self.busy(),
            },
        }
    }

    fn busy<T>(&self) -> Attempt<T> {
        self.stats.record_busy();
        Attempt::Busy
    }

    fn arm_members(&self, kind: CqKind, poll_sn: u64) -> RingResult<usize> {
        let mut total = 0;
        for member in self.members.iter().filter(|m| m.is_up()) {
            total += member.arm_notifications(kind, poll_sn)?;
        }
        Ok(total)
    }

    /// Re-tune moderation on every up member
    pub fn adapt_cq_moderation(&self) {
        for member in self.members.iter().filter(|m| m.is_up()) {
            member.adapt_cq_moderation();
        }
    }

    /// Apply pacing to every member
    pub fn modify_rate_limit(&self, cfg: &RateLimit) -> RingResult<()> {
        for member in &self.members {
            if let Err(e) = member.modify_rate_limit(cfg) {
                debug!(bond = %self.id, member = %member.id(), error = %e, "rate limit not applied");
            }
        }
        Ok(())
    }

    /// Pacing with `cfg` is supported by every member
    pub fn is_rate_limit_supported(&self, cfg: &RateLimit) -> bool {
        self.members.iter().all(|m| m.is_rate_limit_supported(cfg))
    }

    /// One receive channel per member
    pub fn rx_channel_fds(&self) -> Vec<ChannelFd> {
        self.members.iter().map(|m| m.rx_channel_fd()).collect()
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// `ring` is a hardware member of this bond
    pub fn is_member(&self, ring: &dyn PhysicalRing) -> bool {
        ring.kind().is_hardware() && ring.parent() == Some(self.id)
    }

    /// `ring` currently carries slot `id`
    pub fn is_active_member(&self, ring: &dyn PhysicalRing, id: usize) -> bool {
        self.active_member(id).map(|m| m.id()) == Some(ring.id())
    }
}

impl Drop for RingBond {
    fn drop(&mut self) {
        let cache = std::mem::take(&mut self.rx_lock.get_mut().tap_cache);
        if !cache.is_empty() {
            debug!(bond = %self.id, buffers = cache.len(), "returning tap buffers");
            self.pools.rx.put_buffers(cache);
        }
    }
}

impl std::fmt::Debug for RingBond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBond")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("members", &self.members.len())
            .field("active", &*self.active.read())
            .finish()
    }
}

/// Completions are always delivered to the member that owns the buffer
impl BufferOwner for RingBond {
    fn return_rx_buffers(&self, _bufs: DescQueue) {
        panic!("programming error: rx buffers returned to bond {}", self.id);
    }

    fn return_tx_buffers(&self, _chain: DescChain) {
        panic!("programming error: tx buffers returned to bond {}", self.id);
    }

    fn rx_completion_with_error(&self, _buf: BufferDescriptor) {
        panic!("programming error: rx error completion on bond {}", self.id);
    }

    fn tx_completion_with_error(&self, _buf: BufferDescriptor) {
        panic!("programming error: tx error completion on bond {}", self.id);
    }
}

/// Fill empty slots from active neighbours
///
/// Walks backwards from the first active slot, wrapping, so each gap takes
/// the nearest active slot after it.
pub fn close_gaps(active: &mut [Option<usize>]) {
    let n = active.len();
    let Some(first) = active.iter().position(Option::is_some) else {
        return;
    };
    let mut current = active[first];
    let mut i = first;
    for _ in 1..n {
        i = if i == 0 { n - 1 } else { i - 1 };
        match active[i] {
            Some(_) => current = active[i],
            None => active[i] = current,
        }
    }
}
