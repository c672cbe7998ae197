//! Ring profiles
//!
//! Applications describe the ring they want once, get back a key, and pass
//! the key when sockets are bound. Key 0 is never issued.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const FIRST_PROFILE_KEY: u64 = 1;

/// Cyclic-buffer ring request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclicRingAttr {
    /// Packets the buffer should hold
    pub num: u32,
    /// Bytes of payload per packet
    pub stride_bytes: u32,
    /// Bytes of header split off each packet, when requested
    #[serde(default)]
    pub hdr_bytes: Option<u32>,
}

/// Shape of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingProfile {
    /// Regular per-packet ring
    Packet,
    /// Multi-packet cyclic buffer ring
    CyclicBuffer(CyclicRingAttr),
}

impl Default for RingProfile {
    fn default() -> Self {
        Self::Packet
    }
}

impl RingProfile {
    /// Short type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Packet => "XLR_PKTS_RING",
            Self::CyclicBuffer(_) => "XLR_CB_RING",
        }
    }
}

impl fmt::Display for RingProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Packet => write!(f, "{}", self.type_name()),
            Self::CyclicBuffer(attr) => write!(
                f,
                "{} packets_num:{} stride_bytes:{} hdr size:{}",
                self.type_name(),
                attr.num,
                attr.stride_bytes,
                attr.hdr_bytes.unwrap_or(0)
            ),
        }
    }
}

/// Handle of a registered profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ProfileKey(pub u64);

/// Registry of ring profiles
#[derive(Debug)]
pub struct RingProfiles {
    profiles: DashMap<ProfileKey, Arc<RingProfile>>,
    next_key: AtomicU64,
}

impl Default for RingProfiles {
    fn default() -> Self {
        Self::new()
    }
}

impl RingProfiles {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            profiles: DashMap::new(),
            next_key: AtomicU64::new(FIRST_PROFILE_KEY),
        }
    }

    /// Register a profile and return its key
    pub fn add_profile(&self, profile: RingProfile) -> ProfileKey {
        let key = ProfileKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(key = key.0, %profile, "ring profile added");
        self.profiles.insert(key, Arc::new(profile));
        key
    }

    /// Look a profile up
    pub fn get_profile(&self, key: ProfileKey) -> Option<Arc<RingProfile>> {
        self.profiles.get(&key).map(|p| Arc::clone(p.value()))
    }

    /// Number of registered profiles
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
