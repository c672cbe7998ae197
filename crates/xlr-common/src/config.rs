//! Ring and bond configuration
//!
//! Defaults match the values the data path ships with; every field can be
//! overridden from JSON or from `XLR_*` environment variables.

use crate::{RingError, RingResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Process-wide ring settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingConfig {
    /// Enable completion-queue interrupt moderation
    #[serde(default = "default_moderation_enable")]
    pub cq_moderation_enable: bool,
    /// Moderation period in microseconds
    #[serde(default = "default_moderation_period")]
    pub cq_moderation_period_usec: u32,
    /// Moderation completion count
    #[serde(default = "default_moderation_count")]
    pub cq_moderation_count: u32,
    /// Buffers fetched per refill of an internal RX cache
    #[serde(default = "default_compensation_level")]
    pub qp_compensation_level: usize,
    /// RX buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub rx_buffer_size: usize,
    /// TX buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub tx_buffer_size: usize,
}

fn default_moderation_enable() -> bool {
    true
}

fn default_moderation_period() -> u32 {
    50
}

fn default_moderation_count() -> u32 {
    48
}

fn default_compensation_level() -> usize {
    256
}

fn default_buffer_size() -> usize {
    2048
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            cq_moderation_enable: default_moderation_enable(),
            cq_moderation_period_usec: default_moderation_period(),
            cq_moderation_count: default_moderation_count(),
            qp_compensation_level: default_compensation_level(),
            rx_buffer_size: default_buffer_size(),
            tx_buffer_size: default_buffer_size(),
        }
    }
}

impl RingConfig {
    /// Defaults overridden by `XLR_*` environment variables
    pub fn from_env() -> RingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> RingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup("XLR_CQ_MODERATION_ENABLE") {
            cfg.cq_moderation_enable = parse_flag("XLR_CQ_MODERATION_ENABLE", &v)?;
        }
        override_num(&lookup, "XLR_CQ_MODERATION_PERIOD_USEC", &mut cfg.cq_moderation_period_usec)?;
        override_num(&lookup, "XLR_CQ_MODERATION_COUNT", &mut cfg.cq_moderation_count)?;
        override_num(&lookup, "XLR_QP_COMPENSATION_LEVEL", &mut cfg.qp_compensation_level)?;
        override_num(&lookup, "XLR_RX_BUF_SIZE", &mut cfg.rx_buffer_size)?;
        override_num(&lookup, "XLR_TX_BUF_SIZE", &mut cfg.tx_buffer_size)?;
        tracing::debug!(?cfg, "ring configuration loaded");
        Ok(cfg)
    }
}

fn override_num<F, T>(lookup: &F, key: &str, slot: &mut T) -> RingResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(v) = lookup(key) {
        *slot = v
            .trim()
            .parse()
            .map_err(|_| RingError::Config(format!("{key}: invalid value {v:?}")))?;
    }
    Ok(())
}

fn parse_flag(key: &str, v: &str) -> RingResult<bool> {
    match v.trim() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(RingError::Config(format!("{key}: invalid flag {other:?}"))),
    }
}

/// Bonding mode of an aggregate ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BondMode {
    /// One member carries traffic, the others stand by
    ActiveBackup,
    /// 802.3ad link aggregation with hash-based distribution
    Lag8023ad,
}

/// Transmit hash policy, ordered as the kernel bonding driver numbers them
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XmitHashPolicy {
    /// MAC addresses and ethertype
    Layer2,
    /// L4 ports and IP addresses
    Layer3_4,
    /// MAC addresses, ethertype and IP addresses
    Layer2_3,
    /// Inner L2/L3 of encapsulated frames
    Encap2_3,
    /// Inner L3/L4 of encapsulated frames
    Encap3_4,
}

impl XmitHashPolicy {
    /// Policies that look through an 802.1Q tag at the inner ethertype
    #[inline]
    pub fn looks_through_vlan(self) -> bool {
        self > Self::Layer2_3
    }
}

/// Shape of a bond ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondSpec {
    /// Bonding mode
    pub mode: BondMode,
    /// Transmit hash policy (LAG mode only)
    #[serde(default = "default_policy")]
    pub xmit_hash_policy: XmitHashPolicy,
    /// MTU of the bond interface
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

fn default_policy() -> XmitHashPolicy {
    XmitHashPolicy::Layer2
}

fn default_mtu() -> u32 {
    1500
}

impl BondSpec {
    /// Active-backup bond
    pub fn active_backup() -> Self {
        Self {
            mode: BondMode::ActiveBackup,
            xmit_hash_policy: default_policy(),
            mtu: default_mtu(),
        }
    }

    /// 802.3ad bond with the given hash policy
    pub fn lag(policy: XmitHashPolicy) -> Self {
        Self {
            mode: BondMode::Lag8023ad,
            xmit_hash_policy: policy,
            mtu: default_mtu(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = RingConfig::default();
        assert!(cfg.cq_moderation_enable);
        assert_eq!(cfg.cq_moderation_period_usec, 50);
        assert_eq!(cfg.cq_moderation_count, 48);
        assert_eq!(cfg.qp_compensation_level, 256);
    }

    #[test]
    fn test_json_with_defaults() {
        let cfg: RingConfig =
            serde_json::from_str(r#"{"cq_moderation_enable": false, "cq_moderation_count": 16}"#)
                .unwrap();
        assert!(!cfg.cq_moderation_enable);
        assert_eq!(cfg.cq_moderation_count, 16);
        assert_eq!(cfg.cq_moderation_period_usec, 50);

        let spec: BondSpec =
            serde_json::from_str(r#"{"mode": "lag8023ad", "xmit_hash_policy": "layer3_4"}"#)
                .unwrap();
        assert_eq!(spec.mode, BondMode::Lag8023ad);
        assert_eq!(spec.xmit_hash_policy, XmitHashPolicy::Layer3_4);
        assert_eq!(spec.mtu, 1500);
    }

    #[test]
    fn test_lookup_overrides() {
        let env: HashMap<&str, &str> = [
            ("XLR_CQ_MODERATION_ENABLE", "0"),
            ("XLR_CQ_MODERATION_PERIOD_USEC", "100"),
            ("XLR_QP_COMPENSATION_LEVEL", " 64 "),
        ]
        .into_iter()
        .collect();
        let cfg = RingConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert!(!cfg.cq_moderation_enable);
        assert_eq!(cfg.cq_moderation_period_usec, 100);
        assert_eq!(cfg.qp_compensation_level, 64);
        assert_eq!(cfg.cq_moderation_count, 48);
    }

    #[test]
    fn test_lookup_rejects_garbage() {
        let err = RingConfig::from_lookup(|k| {
            (k == "XLR_CQ_MODERATION_COUNT").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, RingError::Config(_)));
    }

    #[test]
    fn test_vlan_policies() {
        assert!(!XmitHashPolicy::Layer2.looks_through_vlan());
        assert!(!XmitHashPolicy::Layer3_4.looks_through_vlan());
        assert!(!XmitHashPolicy::Layer2_3.looks_through_vlan());
        assert!(XmitHashPolicy::Encap2_3.looks_through_vlan());
        assert!(XmitHashPolicy::Encap3_4.looks_through_vlan());
    }
}
