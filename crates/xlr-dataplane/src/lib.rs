//! XLR Ring Data Plane
//!
//! Receive/transmit ring plumbing for kernel-bypass NICs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         socket layer                             │
//! └───────────────┬───────────────────────────────┬──────────────────┘
//!                 │ attach / poll / send          │ read
//!                 ▼                               ▼
//! ┌───────────────────────────────┐   ┌──────────────────────────────┐
//! │           RingBond            │   │      CyclicBufferRing        │
//! │                               │   │                              │
//! │  active[N] ─▶ member rings    │   │  MpCompletionQueue ─▶ CQEs   │
//! │  ownership routing ─▶ pools   │   │  strides ─▶ WQ reload        │
//! │  tap fallback (optional)      │   │                              │
//! └───────┬──────────┬────────────┘   └──────────────┬───────────────┘
//!         ▼          ▼                               ▼
//!   ┌──────────┐ ┌──────────┐                ┌──────────────┐
//!   │ member 0 │ │ member N │                │ MP-RQ + CQ   │
//!   └──────────┘ └──────────┘                └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`bond`]: link aggregation, failover and buffer routing over member rings
//! - [`mp_rq`]: multi-packet completion decoding and the cyclic-buffer consumer
//! - [`profile`]: registry of ring profiles handed out by key
//! - [`pool`] / [`buffer`]: buffer descriptors and the shared pools

#![warn(missing_docs)]

pub mod bond;
pub mod buffer;
pub mod mp_rq;
pub mod pool;
pub mod profile;
pub mod ring;
pub mod stats;

pub use bond::{BondPools, RingBond, MAX_BOND_MEMBERS};
pub use buffer::{BufferDescriptor, DescChain, DescQueue, RingId};
pub use mp_rq::{CyclicBufferRing, MpCompletionQueue};
pub use pool::{BufferPool, PoolKind};
pub use profile::{CyclicRingAttr, ProfileKey, RingProfile, RingProfiles};
pub use ring::{Attempt, BufferOwner, CqKind, PhysicalRing, RingKind, TxAttr, TxDisposition};
pub use stats::{BondStats, BondStatsSnapshot};
