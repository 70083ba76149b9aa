//! Configuration for bonding jetty contexts and the topology they run on.
//!
//! Both structures are plain serde types; loading them from disk is the
//! caller's business.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::connection::{ConnLimits, MAX_BITMAP_SIZE, MAX_SO_QUEUE_SIZE, RECV_WND_SIZE};
use crate::error::{BondError, Result};
use crate::jetty::MAX_DEV_NUM;
use crate::scheduler::BondingMode;
use crate::topo::{TopoNode, TopologyMap};

fn default_wr_buf_size() -> usize {
    1024
}

fn default_hdr_slots() -> u32 {
    4096
}

fn default_conn_table_size() -> usize {
    64
}

fn default_window_size() -> u32 {
    RECV_WND_SIZE
}

fn default_seq_space() -> u32 {
    MAX_BITMAP_SIZE
}

fn default_so_queue_capacity() -> usize {
    MAX_SO_QUEUE_SIZE
}

fn default_max_members() -> usize {
    MAX_DEV_NUM
}

/// Configuration for one bonding jetty context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondConfig {
    /// Path selection mode
    #[serde(default)]
    pub mode: BondingMode,

    /// Bucket count of each work-request buffer.
    #[serde(default = "default_wr_buf_size")]
    pub wr_buf_size: usize,

    /// Header scratch slots per direction. Bounds the number of outstanding
    /// header-carrying sends, and of posted receives.
    #[serde(default = "default_hdr_slots")]
    pub hdr_slots: u32,

    /// Bucket count of the virtual-connection table.
    #[serde(default = "default_conn_table_size")]
    pub conn_table_size: usize,

    /// Receive and send window size.
    #[serde(default = "default_window_size")]
    pub window_size: u32,

    /// Sequence space the windows slide over. Must exceed `window_size`.
    #[serde(default = "default_seq_space")]
    pub seq_space: u32,

    /// Capacity of each strongly-ordered queue.
    #[serde(default = "default_so_queue_capacity")]
    pub so_queue_capacity: usize,

    /// Upper bound on member devices.
    #[serde(default = "default_max_members")]
    pub max_members: usize,
}

impl Default for BondConfig {
    fn default() -> Self {
        Self {
            mode: BondingMode::default(),
            wr_buf_size: default_wr_buf_size(),
            hdr_slots: default_hdr_slots(),
            conn_table_size: default_conn_table_size(),
            window_size: default_window_size(),
            seq_space: default_seq_space(),
            so_queue_capacity: default_so_queue_capacity(),
            max_members: default_max_members(),
        }
    }
}

impl BondConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| {
            error!(%msg, "invalid bond configuration");
            Err(BondError::InvalidParameter(msg))
        };
        if self.window_size == 0 {
            return fail("window_size must be non-zero".into());
        }
        if self.window_size >= self.seq_space {
            return fail(format!(
                "window_size ({}) must be smaller than seq_space ({})",
                self.window_size, self.seq_space
            ));
        }
        if self.wr_buf_size == 0 || self.conn_table_size == 0 {
            return fail("table sizes must be non-zero".into());
        }
        if self.hdr_slots == 0 {
            return fail("hdr_slots must be non-zero".into());
        }
        if self.so_queue_capacity == 0 {
            return fail("so_queue_capacity must be non-zero".into());
        }
        if self.max_members == 0 || self.max_members > MAX_DEV_NUM {
            return fail(format!(
                "max_members must be in 1..={MAX_DEV_NUM}, got {}",
                self.max_members
            ));
        }
        Ok(())
    }

    pub fn conn_limits(&self) -> ConnLimits {
        ConnLimits {
            seq_space: self.seq_space,
            window_size: self.window_size,
            so_queue_capacity: self.so_queue_capacity,
        }
    }
}

/// Serialized form of a topology node list
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub nodes: Vec<TopoNode>,
}

impl TopologyConfig {
    pub fn into_map(self) -> Result<TopologyMap> {
        TopologyMap::new(self.nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bond_config_default() {
        let config = BondConfig::default();
        assert_eq!(config.mode, BondingMode::RoundRobin);
        assert_eq!(config.window_size, 1 << 12);
        assert_eq!(config.seq_space, 1 << 24);
        assert_eq!(config.so_queue_capacity, 65535);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_windows() {
        let config = BondConfig {
            window_size: 16,
            seq_space: 16,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BondError::InvalidParameter(_))
        ));

        let config = BondConfig {
            max_members: MAX_DEV_NUM + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BondConfig {
            hdr_slots: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bond_config_from_toml() {
        let config: BondConfig = toml::from_str(
            r#"
            mode = "direct-preferred"
            window_size = 64
            seq_space = 1024
            "#,
        )
        .unwrap();
        assert_eq!(config.mode, BondingMode::DirectPreferred);
        assert_eq!(config.window_size, 64);
        // Unset fields fall back to defaults.
        assert_eq!(config.wr_buf_size, 1024);
        assert_eq!(config.conn_limits().seq_space, 1024);
    }

    #[test]
    fn test_topology_config_from_toml() {
        let config: TopologyConfig = toml::from_str(
            r#"
            [[nodes]]
            bonding_eid = "fe80::1"
            is_current = true
            [[nodes.planes]]
            primary_eid = "fe80::101"
            ports = [{ eid = "fe80::11", peer_eid = "fe80::21" }]

            [[nodes]]
            bonding_eid = "fe80::2"
            [[nodes.planes]]
            ports = [{ eid = "fe80::21", peer_eid = "fe80::11" }]
            "#,
        )
        .unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert!(config.nodes[0].is_current);

        let map = config.into_map().unwrap();
        assert!(map.has_direct_route(&"fe80::2".parse().unwrap()));
    }

    #[test]
    fn test_topology_config_rejects_bad_eid() {
        let result: std::result::Result<TopologyConfig, _> = toml::from_str(
            r#"
            [[nodes]]
            bonding_eid = "nope"
            "#,
        );
        assert!(result.is_err());
    }
}
