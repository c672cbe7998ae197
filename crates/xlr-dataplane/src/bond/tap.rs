//! Tap fallback for paravirtualized bonding
//!
//! On paravirtualized NICs part of the traffic reaches the guest through the
//! synthetic interface instead of the accelerated path. The bond reads those
//! frames from a TAP device and tells a control-plane agent which TCP flows
//! to redirect there.

use serde::{Deserialize, Serialize};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use xlr_common::{FlowTuple, RingResult};

/// Version of the agent flow message
pub const AGENT_PROTOCOL_VERSION: u8 = 1;

/// Non-blocking TAP device
pub trait TapDevice: Send + Sync {
    /// Device is open and usable
    fn is_open(&self) -> bool;

    /// Read one frame into `buf`
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Re-arm the one-shot readiness notification
    fn rearm(&self);
}

/// Control-plane agent redirecting flows to the TAP device
pub trait FlowAgent: Send + Sync {
    /// Deliver a flow message
    fn send_flow_message(&self, msg: &FlowMessage) -> RingResult<()>;
}

/// Flow rule change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowAction {
    /// Install a redirect rule
    Add,
    /// Remove a redirect rule
    Del,
}

/// Flow match carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowMatch {
    /// TCP listen side
    Tcp3 {
        /// Destination address
        dst_ip: Ipv4Addr,
        /// Destination port
        dst_port: u16,
    },
    /// TCP connected side
    Tcp5 {
        /// Source address
        src_ip: Ipv4Addr,
        /// Source port
        src_port: u16,
        /// Destination address
        dst_ip: Ipv4Addr,
        /// Destination port
        dst_port: u16,
    },
}

impl From<&FlowTuple> for FlowMatch {
    fn from(t: &FlowTuple) -> Self {
        if t.is_3_tuple() {
            Self::Tcp3 {
                dst_ip: t.dst_ip,
                dst_port: t.dst_port,
            }
        } else {
            Self::Tcp5 {
                src_ip: t.src_ip,
                src_port: t.src_port,
                dst_ip: t.dst_ip,
                dst_port: t.dst_port,
            }
        }
    }
}

/// Message sent to the flow agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMessage {
    /// Protocol version
    pub version: u8,
    /// Sender process
    pub pid: u32,
    /// Add or delete
    pub action: FlowAction,
    /// Synthetic interface index
    pub if_index: u32,
    /// TAP interface index
    pub tap_index: u32,
    /// Flow match
    pub flow: FlowMatch,
}

/// TAP device plus the agent that steers flows to it
pub struct TapFallback {
    /// TAP device
    pub device: Box<dyn TapDevice>,
    /// Flow agent
    pub agent: Arc<dyn FlowAgent>,
    /// Interface index of the synthetic NIC
    pub netvsc_if_index: u32,
    /// Interface index of the TAP device
    pub tap_if_index: u32,
}

impl TapFallback {
    /// Build the agent message for `tuple`
    pub fn flow_message(&self, action: FlowAction, tuple: &FlowTuple) -> FlowMessage {
        FlowMessage {
            version: AGENT_PROTOCOL_VERSION,
            pid: std::process::id(),
            action,
            if_index: self.netvsc_if_index,
            tap_index: self.tap_if_index,
            flow: FlowMatch::from(tuple),
        }
    }

    /// Tell the agent about a TCP flow; other protocols need no rule
    pub(crate) fn announce(&self, action: FlowAction, tuple: &FlowTuple) -> RingResult<()> {
        if !tuple.is_tcp() {
            return Ok(());
        }
        let msg = self.flow_message(action, tuple);
        self.agent.send_flow_message(&msg).map_err(|e| {
            tracing::warn!(?action, flow = %tuple, error = %e, "tc rule update failed");
            e
        })
    }
}

impl std::fmt::Debug for TapFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapFallback")
            .field("open", &self.device.is_open())
            .field("netvsc_if_index", &self.netvsc_if_index)
            .field("tap_if_index", &self.tap_if_index)
            .finish()
    }
}
