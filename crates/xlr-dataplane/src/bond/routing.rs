//! Buffer-ownership routing
//!
//! Sorts returned buffers back to the member that allocated them. Buffers
//! nobody owns end up in a separate bucket for the shared pool.

use crate::buffer::{DescChain, DescQueue, RingId};

/// Buffers split by owning member
#[derive(Debug)]
pub struct Partition<T> {
    /// One bucket per member slot
    pub per_member: Vec<T>,
    /// Buffers no member owns
    pub orphans: T,
}

/// Split a reuse queue by owner
///
/// Probing starts at the slot that matched last, so runs from one member
/// cost a single comparison each.
pub fn partition_queue(members: &[RingId], mut queue: DescQueue) -> Partition<DescQueue> {
    let n = members.len();
    let mut per_member: Vec<DescQueue> = (0..n).map(|_| DescQueue::new()).collect();
    let mut orphans = DescQueue::new();
    let mut last_found = 0;

    while let Some(buf) = queue.pop_front() {
        let owner = buf.owner();
        let hit = (0..n)
            .map(|step| (last_found + step) % n)
            .find(|&slot| owner == Some(members[slot]));
        match hit {
            Some(slot) => {
                per_member[slot].push_back(buf);
                last_found = slot;
            }
            None => {
                tracing::trace!(owner = ?owner, "no matching ring to return buffer");
                orphans.push_back(buf);
            }
        }
    }

    Partition {
        per_member,
        orphans,
    }
}

/// Split a release chain by owner, one lookup per same-owner run
pub fn partition_chain(members: &[RingId], mut chain: DescChain) -> Partition<DescChain> {
    let mut per_member: Vec<DescChain> = (0..members.len()).map(|_| DescChain::new()).collect();
    let mut orphans = DescChain::new();

    while let Some((owner, mut run)) = chain.take_run() {
        match members.iter().position(|&m| owner == Some(m)) {
            Some(slot) => per_member[slot].splice(&mut run),
            None => {
                tracing::debug!(owner = ?owner, len = run.len(), "no matching ring to return buffers");
                orphans.splice(&mut run);
            }
        }
    }

    Partition {
        per_member,
        orphans,
    }
}
