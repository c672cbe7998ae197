//! Flow classification tuples
//!
//! A flow rule is either a 3-tuple (listen side: destination address, port
//! and protocol) or a full 5-tuple (connected side).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// L4 protocol of a flow rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Protocol {
    /// TCP
    Tcp = 6,
    /// UDP
    Udp = 17,
}

/// 3-tuple or 5-tuple flow rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowTuple {
    /// Destination IP
    pub dst_ip: Ipv4Addr,
    /// Destination port
    pub dst_port: u16,
    /// Source IP (unspecified for a 3-tuple)
    pub src_ip: Ipv4Addr,
    /// Source port (0 for a 3-tuple)
    pub src_port: u16,
    /// L4 protocol
    pub protocol: Protocol,
}

impl FlowTuple {
    /// Create a 3-tuple rule
    #[inline]
    pub const fn three(dst_ip: Ipv4Addr, dst_port: u16, protocol: Protocol) -> Self {
        Self {
            dst_ip,
            dst_port,
            src_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            protocol,
        }
    }

    /// Create a 5-tuple rule
    #[inline]
    pub const fn five(
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            dst_ip,
            dst_port,
            src_ip,
            src_port,
            protocol,
        }
    }

    /// True when the rule matches on destination only
    #[inline]
    pub fn is_3_tuple(&self) -> bool {
        self.src_ip.is_unspecified() && self.src_port == 0
    }

    /// True for TCP rules
    #[inline]
    pub fn is_tcp(&self) -> bool {
        self.protocol == Protocol::Tcp
    }

    /// True for UDP rules
    #[inline]
    pub fn is_udp(&self) -> bool {
        self.protocol == Protocol::Udp
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        if self.is_3_tuple() {
            write!(f, "{} dst:{}:{}", proto, self.dst_ip, self.dst_port)
        } else {
            write!(
                f,
                "{} dst:{}:{} src:{}:{}",
                proto, self.dst_ip, self.dst_port, self.src_ip, self.src_port
            )
        }
    }
}

/// Opaque handle of the packet sink a flow delivers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SinkId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_shape() {
        let listen = FlowTuple::three(Ipv4Addr::new(10, 0, 0, 1), 80, Protocol::Tcp);
        assert!(listen.is_3_tuple());
        assert!(listen.is_tcp());

        let conn = FlowTuple::five(
            Ipv4Addr::new(192, 168, 1, 1),
            40000,
            Ipv4Addr::new(10, 0, 0, 1),
            80,
            Protocol::Udp,
        );
        assert!(!conn.is_3_tuple());
        assert!(conn.is_udp());
    }

    #[test]
    fn test_display() {
        let listen = FlowTuple::three(Ipv4Addr::new(10, 0, 0, 1), 80, Protocol::Tcp);
        assert_eq!(listen.to_string(), "tcp dst:10.0.0.1:80");
    }
}
