//! Static fabric topology and the direct routes derived from it.
//!
//! A topology is a list of nodes. Each node has one bonding endpoint id and
//! a fixed number of planes, each plane a handful of ports. A port may
//! record the endpoint id of the port it is cabled to. When that peer port
//! belongs to another node in the list, the two ports form a direct
//! (single-hop) route between the bonding devices.
//!
//! The map is built once and never patched. A topology change means building
//! a new map and swapping it in.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::error::{BondError, Result};
use crate::hash_table::{HashTable, TableNode};

pub const EID_LEN: usize = 16;
/// Ports per plane.
pub const MAX_PORT_NUM: usize = 9;
/// Upper bound on direct routes towards one target.
pub const MAX_ALL_PORT_NUM: usize = 18;
pub const MAX_NODE_NUM: usize = 16;
/// Planes (I/O dies) per node.
pub const PLANE_NUM: usize = 2;

const DIRECT_ROUTE_HASH_SEED: u64 = 9_819_876;

/// Endpoint identifier. Written as an IPv6 address in configuration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Eid([u8; EID_LEN]);

impl Eid {
    pub const fn from_bytes(bytes: [u8; EID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; EID_LEN] {
        &self.0
    }

    /// The all-zero id marks an unused slot.
    pub fn is_empty(&self) -> bool {
        self.0 == [0; EID_LEN]
    }

    /// The id as four native-endian 32-bit words.
    pub fn words(&self) -> [u32; 4] {
        let mut out = [0u32; 4];
        for (w, chunk) in out.iter_mut().zip(self.0.chunks_exact(4)) {
            *w = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        out
    }
}

impl From<Ipv6Addr> for Eid {
    fn from(addr: Ipv6Addr) -> Self {
        Self(addr.octets())
    }
}

impl FromStr for Eid {
    type Err = BondError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<Ipv6Addr>()
            .map(Self::from)
            .map_err(|e| BondError::invalid(format!("invalid eid {s:?}: {e}")))
    }
}

impl TryFrom<String> for Eid {
    type Error = BondError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Eid> for String {
    fn from(eid: Eid) -> Self {
        eid.to_string()
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ipv6Addr::from(self.0).fmt(f)
    }
}

impl fmt::Debug for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eid({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortInfo {
    pub eid: Eid,
    /// Port at the other end of the cable, if known.
    #[serde(default)]
    pub peer_eid: Eid,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlaneInfo {
    #[serde(default)]
    pub primary_eid: Eid,
    #[serde(default)]
    pub ports: Vec<PortInfo>,
    #[serde(default)]
    pub socket_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopoNode {
    pub bonding_eid: Eid,
    #[serde(default)]
    pub planes: Vec<PlaneInfo>,
    /// Exactly one node in a topology describes the local host.
    #[serde(default)]
    pub is_current: bool,
}

impl TopoNode {
    fn port(&self, plane: usize, port: usize) -> Option<&PortInfo> {
        self.planes.get(plane)?.ports.get(port)
    }

    /// Bonding id, any plane primary id or any port id equals `eid`.
    fn owns(&self, eid: &Eid) -> bool {
        if !self.bonding_eid.is_empty() && self.bonding_eid == *eid {
            return true;
        }
        self.planes.iter().any(|plane| {
            (!plane.primary_eid.is_empty() && plane.primary_eid == *eid)
                || plane.ports.iter().any(|p| !p.eid.is_empty() && p.eid == *eid)
        })
    }
}

/// Position of a port inside a [`TopologyMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortLocator {
    pub node: usize,
    pub plane: usize,
    pub port: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectRoute {
    pub local: PortLocator,
    pub remote: PortLocator,
}

/// Every direct route from the current node to one target bonding device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectRouteEntry {
    routes: Vec<DirectRoute>,
}

impl DirectRouteEntry {
    /// Record a route. A local port already routed to this target is
    /// rejected with [`BondError::Collision`].
    pub fn push(&mut self, route: DirectRoute) -> Result<()> {
        if self.routes.iter().any(|r| r.local == route.local) {
            return Err(BondError::Collision("direct route entry"));
        }
        if self.routes.len() >= MAX_ALL_PORT_NUM {
            return Err(BondError::Capacity {
                what: "direct route entry",
                capacity: MAX_ALL_PORT_NUM,
            });
        }
        self.routes.push(route);
        Ok(())
    }

    pub fn routes(&self) -> &[DirectRoute] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

struct DirectRouteNode {
    bonding_eid: Eid,
    entry: DirectRouteEntry,
}

impl TableNode for DirectRouteNode {
    type Key = Eid;

    fn key(&self) -> &Eid {
        &self.bonding_eid
    }

    fn hash_key(key: &Eid) -> u32 {
        xxh3_64_with_seed(key.as_bytes(), DIRECT_ROUTE_HASH_SEED) as u32
    }

    fn matches(&self, key: &Eid) -> bool {
        self.bonding_eid == *key
    }
}

pub struct TopologyMap {
    nodes: Vec<TopoNode>,
    current: usize,
    direct: HashTable<DirectRouteNode>,
}

impl fmt::Debug for TopologyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyMap")
            .field("nodes", &self.nodes.len())
            .field("current", &self.current)
            .field("direct_targets", &self.direct.len())
            .finish()
    }
}

impl TopologyMap {
    /// Validate the node list and derive the direct-route table.
    pub fn new(nodes: Vec<TopoNode>) -> Result<Self> {
        if nodes.is_empty() || nodes.len() > MAX_NODE_NUM {
            error!(count = nodes.len(), "invalid topology node count");
            return Err(BondError::invalid(format!(
                "topology must have 1..={MAX_NODE_NUM} nodes, got {}",
                nodes.len()
            )));
        }
        for node in &nodes {
            if node.planes.len() > PLANE_NUM {
                return Err(BondError::invalid(format!(
                    "node {} has {} planes, at most {PLANE_NUM} supported",
                    node.bonding_eid,
                    node.planes.len()
                )));
            }
            if let Some(plane) = node.planes.iter().find(|p| p.ports.len() > MAX_PORT_NUM) {
                return Err(BondError::invalid(format!(
                    "node {} has a plane with {} ports, at most {MAX_PORT_NUM} supported",
                    node.bonding_eid,
                    plane.ports.len()
                )));
            }
        }
        let Some(current) = nodes.iter().position(|n| n.is_current) else {
            error!("topology has no current node");
            return Err(BondError::invalid("topology has no current node"));
        };

        let map = Self {
            nodes,
            current,
            direct: HashTable::new("direct route table", MAX_NODE_NUM),
        };
        map.build_direct_routes()?;
        debug!(
            nodes = map.nodes.len(),
            targets = map.direct.len(),
            "built topology map"
        );
        Ok(map)
    }

    /// Find the port on any other node, same plane, whose id is `peer`.
    fn find_peer_port(&self, plane: usize, peer: &Eid) -> Option<PortLocator> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.current)
            .find_map(|(node, info)| {
                let ports = &info.planes.get(plane)?.ports;
                ports
                    .iter()
                    .position(|p| !p.eid.is_empty() && p.eid == *peer)
                    .map(|port| PortLocator { node, plane, port })
            })
    }

    fn build_direct_routes(&self) -> Result<()> {
        let cur = &self.nodes[self.current];
        let mut table = self.direct.write();
        for (plane_idx, plane) in cur.planes.iter().enumerate() {
            for (port_idx, port) in plane.ports.iter().enumerate() {
                if port.eid.is_empty() || port.peer_eid.is_empty() {
                    continue;
                }
                let Some(remote) = self.find_peer_port(plane_idx, &port.peer_eid) else {
                    continue;
                };
                let route = DirectRoute {
                    local: PortLocator {
                        node: self.current,
                        plane: plane_idx,
                        port: port_idx,
                    },
                    remote,
                };
                let target = self.nodes[remote.node].bonding_eid;
                let hash = DirectRouteNode::hash_key(&target);
                if let Some(existing) = table.lookup_mut(&target, hash) {
                    match existing.entry.push(route) {
                        Ok(()) | Err(BondError::Collision(_)) => {}
                        Err(e) => {
                            error!(%target, "direct route entry full");
                            return Err(e);
                        }
                    }
                    continue;
                }
                let mut entry = DirectRouteEntry::default();
                entry.push(route)?;
                table.insert_with_hash(
                    DirectRouteNode {
                        bonding_eid: target,
                        entry,
                    },
                    hash,
                )?;
                debug!(%target, plane = plane_idx, port = port_idx, "direct route");
            }
        }
        Ok(())
    }

    pub fn nodes(&self) -> &[TopoNode] {
        &self.nodes
    }

    pub fn current_node(&self) -> &TopoNode {
        &self.nodes[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Bonding id of the node that owns `target_eid` as its bonding, primary
    /// or port id.
    pub fn bonding_eid_for(&self, target_eid: &Eid) -> Option<Eid> {
        self.nodes
            .iter()
            .find(|n| n.owns(target_eid))
            .map(|n| n.bonding_eid)
    }

    pub fn node_by_bonding_eid(&self, bonding_eid: &Eid) -> Option<&TopoNode> {
        self.nodes.iter().find(|n| n.bonding_eid == *bonding_eid)
    }

    pub fn has_direct_route(&self, bonding_eid: &Eid) -> bool {
        self.direct.contains(bonding_eid)
    }

    /// Snapshot of the direct routes towards `bonding_eid`.
    pub fn direct_routes(&self, bonding_eid: &Eid) -> Option<DirectRouteEntry> {
        self.direct.lookup_with(bonding_eid, |n| n.entry.clone())
    }

    /// Number of targets reachable over at least one direct route.
    pub fn direct_target_count(&self) -> usize {
        self.direct.len()
    }

    pub fn port_eid(&self, at: PortLocator) -> Option<Eid> {
        self.nodes
            .get(at.node)?
            .port(at.plane, at.port)
            .map(|p| p.eid)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn eid(last: u8) -> Eid {
        let mut b = [0u8; EID_LEN];
        b[0] = 0xfe;
        b[15] = last;
        Eid::from_bytes(b)
    }

    fn port(own: u8, peer: u8) -> PortInfo {
        PortInfo {
            eid: eid(own),
            peer_eid: if peer == 0 { Eid::default() } else { eid(peer) },
        }
    }

    fn node(bonding: u8, ports: Vec<PortInfo>, is_current: bool) -> TopoNode {
        TopoNode {
            bonding_eid: eid(bonding),
            planes: vec![PlaneInfo {
                primary_eid: eid(bonding + 100),
                ports,
                socket_id: 0,
            }],
            is_current,
        }
    }

    /// Two nodes, one plane, one port each, cabled to each other.
    pub(crate) fn two_node_topology() -> Vec<TopoNode> {
        vec![
            node(1, vec![port(11, 21)], true),
            node(2, vec![port(21, 11)], false),
        ]
    }

    #[test]
    fn test_eid_parse_display() {
        let e: Eid = "fe80::1".parse().unwrap();
        assert_eq!(e.to_string(), "fe80::1");
        assert!(!e.is_empty());
        assert!(Eid::default().is_empty());
        assert!("not-an-eid".parse::<Eid>().is_err());
    }

    #[test]
    fn test_two_node_direct_route() {
        let map = TopologyMap::new(two_node_topology()).unwrap();
        let b = eid(2);
        assert!(map.has_direct_route(&b));
        assert!(!map.has_direct_route(&eid(1)));

        let entry = map.direct_routes(&b).unwrap();
        assert_eq!(entry.len(), 1);
        let route = entry.routes()[0];
        assert_eq!(
            route.local,
            PortLocator {
                node: 0,
                plane: 0,
                port: 0
            }
        );
        assert_eq!(
            route.remote,
            PortLocator {
                node: 1,
                plane: 0,
                port: 0
            }
        );
        assert_eq!(map.port_eid(route.local), Some(eid(11)));
        assert_eq!(map.port_eid(route.remote), Some(eid(21)));
    }

    #[test]
    fn test_create_rejects_bad_lists() {
        assert!(matches!(
            TopologyMap::new(vec![]),
            Err(BondError::InvalidParameter(_))
        ));

        let no_current = vec![node(1, vec![], false), node(2, vec![], false)];
        assert!(TopologyMap::new(no_current).is_err());

        let too_many: Vec<_> = (0..=MAX_NODE_NUM as u8)
            .map(|i| node(i + 1, vec![], i == 0))
            .collect();
        assert!(TopologyMap::new(too_many).is_err());

        let wide = vec![node(1, (0..10).map(|i| port(i + 10, 0)).collect(), true)];
        assert!(TopologyMap::new(wide).is_err());
    }

    #[test]
    fn test_multiple_routes_to_same_target() {
        let nodes = vec![
            node(1, vec![port(11, 21), port(12, 22), port(13, 0)], true),
            node(2, vec![port(21, 11), port(22, 12)], false),
            node(3, vec![port(31, 0)], false),
        ];
        let map = TopologyMap::new(nodes).unwrap();
        assert_eq!(map.direct_target_count(), 1);
        assert_eq!(map.direct_routes(&eid(2)).unwrap().len(), 2);
        assert!(!map.has_direct_route(&eid(3)));
    }

    #[test]
    fn test_peer_must_be_on_same_plane() {
        let mut nodes = two_node_topology();
        // Move B's port to its second plane.
        let ports = std::mem::take(&mut nodes[1].planes[0].ports);
        nodes[1].planes.push(PlaneInfo {
            ports,
            ..PlaneInfo::default()
        });
        let map = TopologyMap::new(nodes).unwrap();
        assert!(!map.has_direct_route(&eid(2)));
    }

    #[test]
    fn test_entry_rejects_duplicate_local_port() {
        let loc = PortLocator {
            node: 0,
            plane: 0,
            port: 0,
        };
        let mut entry = DirectRouteEntry::default();
        entry
            .push(DirectRoute {
                local: loc,
                remote: loc,
            })
            .unwrap();
        assert_eq!(
            entry.push(DirectRoute {
                local: loc,
                remote: loc,
            }),
            Err(BondError::Collision("direct route entry"))
        );
        assert_eq!(entry.len(), 1);
    }

    #[test]
    fn test_entry_capacity() {
        let mut entry = DirectRouteEntry::default();
        for port in 0..MAX_ALL_PORT_NUM {
            let loc = PortLocator {
                node: 0,
                plane: port / MAX_PORT_NUM,
                port: port % MAX_PORT_NUM,
            };
            entry.push(DirectRoute { local: loc, remote: loc }).unwrap();
        }
        let extra = PortLocator {
            node: 1,
            plane: 0,
            port: 0,
        };
        assert!(matches!(
            entry.push(DirectRoute {
                local: extra,
                remote: extra
            }),
            Err(BondError::Capacity { .. })
        ));
    }

    #[test]
    fn test_bonding_eid_lookup() {
        let map = TopologyMap::new(two_node_topology()).unwrap();
        // Port id of B resolves to B's bonding id.
        assert_eq!(map.bonding_eid_for(&eid(21)), Some(eid(2)));
        // Primary id of A.
        assert_eq!(map.bonding_eid_for(&eid(101)), Some(eid(1)));
        assert_eq!(map.bonding_eid_for(&eid(2)), Some(eid(2)));
        assert_eq!(map.bonding_eid_for(&eid(99)), None);

        assert!(map.node_by_bonding_eid(&eid(2)).is_some());
        assert!(map.node_by_bonding_eid(&eid(21)).is_none());
        assert_eq!(map.current_node().bonding_eid, eid(1));
    }
}
