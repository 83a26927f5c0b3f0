//! Node records.
//!
//! Every peer the local node has heard of, including itself, is one
//! [`ClusterNode`] keyed by its [`NodeName`]. Master/replica relationships
//! are stored as names and resolved through the registry in
//! [`ClusterState`](crate::ClusterState).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Instant;

use rand::Rng;

use crate::slots::SlotBitmap;
use crate::{ClusterError, LinkId};

/// Length in bytes of a node name.
pub const NAME_LEN: usize = 20;

/// Offset added to the client port to get the default bus port.
pub const BUS_PORT_OFFSET: u16 = 10000;

/// 160-bit node identifier, shown as 40 lowercase hex characters.
///
/// Ordering is byte-wise, which matches the ordering of the hex form; it is
/// used to break config epoch ties.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeName([u8; NAME_LEN]);

impl NodeName {
    /// The all-zero name, used on the wire for "no master".
    pub const NULL: NodeName = NodeName([0; NAME_LEN]);

    /// Generates a random name.
    pub fn random() -> Self {
        let mut bytes = [0u8; NAME_LEN];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NAME_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NAME_LEN] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0; NAME_LEN]
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        self.to_string()[..8].to_owned()
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeName({})", self.short())
    }
}

impl FromStr for NodeName {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClusterError::InvalidName(s.to_owned());
        if s.len() != NAME_LEN * 2 || !s.is_ascii() {
            return Err(invalid());
        }
        let mut bytes = [0u8; NAME_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

bitflags::bitflags! {
    /// Node flags. The bit values are the ones carried on the bus.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u16 {
        const PRIMARY = 1 << 0;
        const REPLICA = 1 << 1;
        /// Suspected failing by the local node.
        const PFAIL = 1 << 2;
        /// Failure confirmed by a quorum of masters.
        const FAIL = 1 << 3;
        const MYSELF = 1 << 4;
        /// First contact not yet completed; the name may be provisional.
        const HANDSHAKE = 1 << 5;
        /// Address unknown.
        const NOADDR = 1 << 6;
        /// Send MEET instead of PING on the next contact.
        const MEET = 1 << 7;
        /// Master that had replicas at some point.
        const MIGRATE_TO = 1 << 8;
        /// Replica that never attempts automatic failover.
        const NOFAILOVER = 1 << 9;
    }
}

impl fmt::Display for NodeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(NodeFlags, &str); 8] = [
            (NodeFlags::MYSELF, "myself"),
            (NodeFlags::PRIMARY, "master"),
            (NodeFlags::REPLICA, "slave"),
            (NodeFlags::PFAIL, "fail?"),
            (NodeFlags::FAIL, "fail"),
            (NodeFlags::HANDSHAKE, "handshake"),
            (NodeFlags::NOADDR, "noaddr"),
            (NodeFlags::NOFAILOVER, "nofailover"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "noflags")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

/// Where a node can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAddr {
    /// `None` until learned.
    pub ip: Option<IpAddr>,
    /// Client port.
    pub port: u16,
    /// Cluster bus port.
    pub cport: u16,
}

impl NodeAddr {
    pub fn new(ip: Option<IpAddr>, port: u16, cport: u16) -> Self {
        Self { ip, port, cport }
    }

    /// Address with the bus port at the default offset from the client port.
    pub fn from_client(addr: SocketAddr) -> Self {
        Self {
            ip: Some(addr.ip()),
            port: addr.port(),
            cport: addr.port().wrapping_add(BUS_PORT_OFFSET),
        }
    }

    /// Client address used in redirects. Unknown ips render as `0.0.0.0`.
    pub fn client_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), self.port)
    }

    /// Bus address, if the ip is known.
    pub fn bus_addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.cport))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            Some(ip) => write!(f, "{}@{}", SocketAddr::new(ip, self.port), self.cport),
            None => write!(f, ":{}@{}", self.port, self.cport),
        }
    }
}

/// State of the outbound bus connection to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLink {
    /// A connect was requested and hasn't resolved yet.
    Connecting { since: Instant },
    /// Connected; messages for the node go out on this link.
    Up { link: LinkId, since: Instant },
}

/// A master's claim, learned through gossip, that a node is failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailReport {
    pub reporter: NodeName,
    pub time: Instant,
}

/// What was observed about a node, merged into the registry by
/// [`ClusterState::upsert`](crate::ClusterState::upsert).
#[derive(Debug, Clone, Copy)]
pub struct NodeObservation {
    pub name: NodeName,
    pub addr: Option<NodeAddr>,
    pub flags: NodeFlags,
    pub config_epoch: u64,
}

/// A known node.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub name: NodeName,
    pub flags: NodeFlags,
    pub addr: NodeAddr,
    /// Slots served, meaningful for masters only.
    pub slots: SlotBitmap,
    /// Replicas of this node, in the order they were learned.
    pub replicas: Vec<NodeName>,
    /// The master this node replicates, if any.
    pub replicates: Option<NodeName>,
    pub created: Instant,
    pub ping_sent: Option<Instant>,
    pub pong_received: Option<Instant>,
    pub fail_time: Option<Instant>,
    /// Last time the local node voted for a replica of this master.
    pub voted_time: Option<Instant>,
    pub repl_offset_time: Option<Instant>,
    pub orphaned_time: Option<Instant>,
    pub repl_offset: u64,
    pub config_epoch: u64,
    pub fail_reports: Vec<FailReport>,
    /// Slots served when FAIL was set; zero means nothing to fail over.
    pub(crate) slots_at_fail: u16,
    pub link: Option<NodeLink>,
}

impl ClusterNode {
    pub fn new(name: NodeName, flags: NodeFlags, addr: NodeAddr, now: Instant) -> Self {
        Self {
            name,
            flags,
            addr,
            slots: SlotBitmap::new(),
            replicas: Vec::new(),
            replicates: None,
            created: now,
            ping_sent: None,
            pong_received: None,
            fail_time: None,
            voted_time: None,
            repl_offset_time: None,
            orphaned_time: None,
            repl_offset: 0,
            config_epoch: 0,
            fail_reports: Vec::new(),
            slots_at_fail: 0,
            link: None,
        }
    }

    pub fn is_myself(&self) -> bool {
        self.flags.contains(NodeFlags::MYSELF)
    }

    pub fn is_primary(&self) -> bool {
        self.flags.contains(NodeFlags::PRIMARY)
    }

    pub fn is_replica(&self) -> bool {
        self.flags.contains(NodeFlags::REPLICA)
    }

    pub fn in_handshake(&self) -> bool {
        self.flags.contains(NodeFlags::HANDSHAKE)
    }

    pub fn has_addr(&self) -> bool {
        !self.flags.contains(NodeFlags::NOADDR)
    }

    pub fn timed_out(&self) -> bool {
        self.flags.contains(NodeFlags::PFAIL)
    }

    pub fn failed(&self) -> bool {
        self.flags.contains(NodeFlags::FAIL)
    }

    /// PFAIL or FAIL.
    pub fn is_failing(&self) -> bool {
        self.flags.intersects(NodeFlags::PFAIL | NodeFlags::FAIL)
    }

    /// A handshaken master serving at least one slot. Only these count
    /// toward failure and election quorums.
    pub fn is_voting_primary(&self) -> bool {
        self.is_primary()
            && !self.slots.is_empty()
            && !self.flags.intersects(NodeFlags::HANDSHAKE | NodeFlags::NOADDR)
    }

    /// Link id if the outbound link is up.
    pub fn link_id(&self) -> Option<LinkId> {
        match self.link {
            Some(NodeLink::Up { link, .. }) => Some(link),
            _ => None,
        }
    }

    pub(crate) fn set_primary_flags(&mut self) {
        self.flags.remove(NodeFlags::REPLICA);
        self.flags.insert(NodeFlags::PRIMARY);
    }

    pub(crate) fn set_replica_flags(&mut self) {
        self.flags
            .remove(NodeFlags::PRIMARY | NodeFlags::MIGRATE_TO);
        self.flags.insert(NodeFlags::REPLICA);
    }

    pub(crate) fn add_replica(&mut self, replica: NodeName) {
        if !self.replicas.contains(&replica) {
            self.replicas.push(replica);
            self.flags.insert(NodeFlags::MIGRATE_TO);
        }
    }

    pub(crate) fn remove_replica(&mut self, replica: &NodeName) {
        self.replicas.retain(|r| r != replica);
    }

    /// One CLUSTER NODES line, without the trailing newline.
    ///
    /// `extra` carries migration annotations for the local node, such as
    /// `[7->-<name>]`.
    pub fn to_cluster_nodes_line(&self, now: Instant, extra: &[String]) -> String {
        let millis_ago =
            |t: Option<Instant>| t.map(|t| now.saturating_duration_since(t).as_millis()).unwrap_or(0);
        let master = self
            .replicates
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_owned());
        let link_state = if self.is_myself() || self.link_id().is_some() {
            "connected"
        } else {
            "disconnected"
        };

        let mut line = format!(
            "{} {} {} {} {} {} {} {}",
            self.name,
            self.addr,
            self.flags,
            master,
            millis_ago(self.ping_sent),
            millis_ago(self.pong_received),
            self.config_epoch,
            link_state,
        );
        if self.is_primary() {
            for range in self.slots.ranges() {
                line.push(' ');
                line.push_str(&range.to_string());
            }
        }
        for annotation in extra {
            line.push(' ');
            line.push_str(annotation);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn name_hex_round_trip() {
        let name = NodeName::random();
        let hex = name.to_string();
        assert_eq!(hex.len(), 40);
        assert_eq!(hex.parse::<NodeName>().unwrap(), name);
        assert_eq!(name.short(), &hex[..8]);
    }

    #[test]
    fn name_rejects_bad_hex() {
        assert!("abc".parse::<NodeName>().is_err());
        assert!("zz".repeat(20).parse::<NodeName>().is_err());
        assert!(NodeName::NULL.is_null());
        assert!(!NodeName::from_bytes([1; NAME_LEN]).is_null());
    }

    #[test]
    fn names_order_like_their_hex() {
        let low: NodeName = "00ff".repeat(10).parse().unwrap();
        let high: NodeName = "0100".repeat(10).parse().unwrap();
        assert!(low < high);
        assert!(low.to_string() < high.to_string());
    }

    #[test]
    fn flags_display() {
        let flags = NodeFlags::MYSELF | NodeFlags::PRIMARY;
        assert_eq!(flags.to_string(), "myself,master");
        let flags = NodeFlags::REPLICA | NodeFlags::PFAIL | NodeFlags::NOADDR;
        assert_eq!(flags.to_string(), "slave,fail?,noaddr");
        assert_eq!(NodeFlags::empty().to_string(), "noflags");
    }

    #[test]
    fn addr_defaults() {
        let addr = NodeAddr::from_client("10.0.0.1:6379".parse().unwrap());
        assert_eq!(addr.cport, 16379);
        assert_eq!(addr.bus_addr(), Some("10.0.0.1:16379".parse().unwrap()));
        assert_eq!(addr.to_string(), "10.0.0.1:6379@16379");

        let unknown = NodeAddr::new(None, 7000, 17000);
        assert_eq!(unknown.bus_addr(), None);
        assert_eq!(unknown.client_addr(), "0.0.0.0:7000".parse().unwrap());
    }

    #[test]
    fn voting_primary_needs_slots_and_handshake() {
        let now = Instant::now();
        let addr = NodeAddr::from_client("127.0.0.1:7000".parse().unwrap());
        let mut node = ClusterNode::new(NodeName::random(), NodeFlags::PRIMARY, addr, now);
        assert!(!node.is_voting_primary());
        node.slots.insert(3);
        assert!(node.is_voting_primary());
        node.flags.insert(NodeFlags::HANDSHAKE);
        assert!(!node.is_voting_primary());
    }

    #[test]
    fn role_flag_switches() {
        let now = Instant::now();
        let addr = NodeAddr::from_client("127.0.0.1:7000".parse().unwrap());
        let mut node = ClusterNode::new(NodeName::random(), NodeFlags::PRIMARY, addr, now);
        node.add_replica(NodeName::random());
        assert!(node.flags.contains(NodeFlags::MIGRATE_TO));
        node.set_replica_flags();
        assert!(node.is_replica() && !node.is_primary());
        assert!(!node.flags.contains(NodeFlags::MIGRATE_TO));
        node.set_primary_flags();
        assert!(node.is_primary() && !node.is_replica());
    }

    #[test]
    fn nodes_line_format() {
        let now = Instant::now();
        let name: NodeName = "ab".repeat(20).parse().unwrap();
        let addr = NodeAddr::from_client("127.0.0.1:7000".parse().unwrap());
        let mut node = ClusterNode::new(name, NodeFlags::PRIMARY | NodeFlags::MYSELF, addr, now);
        node.config_epoch = 3;
        for slot in 0..=100 {
            node.slots.insert(slot);
        }
        node.slots.insert(200);
        node.pong_received = Some(now);

        let line = node.to_cluster_nodes_line(now + Duration::from_millis(25), &["[7->-x]".into()]);
        assert_eq!(
            line,
            format!("{name} 127.0.0.1:7000@17000 myself,master - 0 25 3 connected 0-100 200 [7->-x]")
        );
    }
}
