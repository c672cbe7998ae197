//! 802.3ad transmit hashing
//!
//! Fields are folded in wire (network) byte order, as they sit in the frame
//! headers. Callers pass host-order values; conversion happens here.

use xlr_common::XmitHashPolicy;

/// IPv4 ethertype
pub const ETH_P_IP: u16 = 0x0800;
/// 802.1Q ethertype
pub const ETH_P_8021Q: u16 = 0x8100;

/// Addressing fields a transmit hash is computed over (host order)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HashInput {
    /// Source MAC
    pub src_mac: [u8; 6],
    /// Destination MAC
    pub dst_mac: [u8; 6],
    /// Outer ethertype
    pub eth_type: u16,
    /// Ethertype behind an 802.1Q tag
    pub encap_type: u16,
    /// Source IPv4 address
    pub src_ip: u32,
    /// Destination IPv4 address
    pub dst_ip: u32,
    /// Source L4 port
    pub src_port: u16,
    /// Destination L4 port
    pub dst_port: u16,
}

/// `eth_type` in host order
#[inline(always)]
fn l2_hash(key: &HashInput, eth_type: u16) -> u32 {
    u32::from(key.dst_mac[5] ^ key.src_mac[5]) ^ u32::from(eth_type.to_be())
}

#[inline(always)]
fn fold_ips(mut hash: u32, key: &HashInput) -> u32 {
    hash ^= key.dst_ip.to_be() ^ key.src_ip.to_be();
    hash ^= hash >> 16;
    hash ^= hash >> 8;
    hash
}

/// Slot in `[0, members)` for a flow
///
/// `members` must be non-zero.
#[inline]
pub fn xmit_hash(policy: XmitHashPolicy, key: &HashInput, members: usize) -> usize {
    let eth_type = if policy.looks_through_vlan() && key.eth_type == ETH_P_8021Q {
        key.encap_type
    } else {
        key.eth_type
    };

    if eth_type != ETH_P_IP {
        return l2_hash(key, eth_type) as usize % members;
    }

    let hash = match policy {
        XmitHashPolicy::Layer2 => l2_hash(key, eth_type),
        XmitHashPolicy::Layer2_3 | XmitHashPolicy::Encap2_3 => {
            fold_ips(l2_hash(key, eth_type), key)
        }
        XmitHashPolicy::Layer3_4 | XmitHashPolicy::Encap3_4 => {
            let ports =
                u32::from(key.src_port.to_be()) | (u32::from(key.dst_port.to_be()) << 16);
            fold_ips(ports, key)
        }
    };
    hash as usize % members
}
