//! The local node's view of the cluster.
//!
//! [`ClusterState`] is the single context object for everything in this
//! crate: the node registry, the slot ownership table, the migration markers
//! and the scratch state for elections and manual failovers. Behaviour is
//! spread over several modules as `impl ClusterState` blocks; this one holds
//! the registry and slot table operations plus the introspection output.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::bus::{Action, BusLink};
use crate::election::{Election, ElectionState};
use crate::failover::ManualFailover;
use crate::message::MessageType;
use crate::slots::{check_slot, SlotMap, SLOT_COUNT};
use crate::topology::{NodeAddr, NodeFlags, NodeObservation};
use crate::{ClusterConfig, ClusterError, ClusterNode, LinkId, NodeName};

/// Overall cluster health as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealth {
    /// Every slot is served and a majority of masters is reachable.
    Ok,
    /// Requests are refused with CLUSTERDOWN.
    Fail,
}

impl ClusterHealth {
    pub(crate) fn wire_code(self) -> u8 {
        match self {
            ClusterHealth::Ok => 0,
            ClusterHealth::Fail => 1,
        }
    }

    pub(crate) fn from_wire(code: u8) -> Result<Self, ClusterError> {
        match code {
            0 => Ok(ClusterHealth::Ok),
            1 => Ok(ClusterHealth::Fail),
            other => Err(ClusterError::malformed(format!(
                "unknown cluster state {other}"
            ))),
        }
    }
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterHealth::Ok => write!(f, "ok"),
            ClusterHealth::Fail => write!(f, "fail"),
        }
    }
}

/// The complete state of the cluster as seen by one node.
#[derive(Debug)]
pub struct ClusterState {
    pub(crate) config: ClusterConfig,
    pub(crate) myself: NodeName,
    /// Highest epoch seen anywhere; never decreases.
    pub(crate) current_epoch: u64,
    /// Epoch of the last vote granted by this node.
    pub(crate) last_vote_epoch: u64,
    pub(crate) state: ClusterHealth,
    /// Every known node, the local one included.
    pub(crate) nodes: HashMap<NodeName, ClusterNode>,
    /// Forgotten names and when they may be re-learned.
    pub(crate) blacklist: HashMap<NodeName, Instant>,
    pub(crate) slots: SlotMap,
    pub(crate) migrating_to: SlotMap,
    pub(crate) importing_from: SlotMap,
    pub(crate) slot_keys: Box<[u64]>,
    pub(crate) links: HashMap<LinkId, BusLink>,
    pub(crate) election: Option<Election>,
    pub(crate) manual_failover: ManualFailover,
    /// Local replication offset, supplied by the host.
    pub(crate) repl_offset: u64,
    pub(crate) ticks: u64,
    pub(crate) stats_sent: [u64; MessageType::COUNT],
    pub(crate) stats_received: [u64; MessageType::COUNT],
}

impl ClusterState {
    /// Creates the state for a node that knows only itself, as a master with
    /// no slots.
    pub fn new(
        config: ClusterConfig,
        name: NodeName,
        addr: NodeAddr,
        now: Instant,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        if name.is_null() {
            return Err(ClusterError::InvalidName(name.to_string()));
        }
        let mut flags = NodeFlags::MYSELF | NodeFlags::PRIMARY;
        if config.replica_no_failover {
            flags |= NodeFlags::NOFAILOVER;
        }
        let myself = ClusterNode::new(name, flags, addr, now);

        Ok(Self {
            config,
            myself: name,
            current_epoch: 0,
            last_vote_epoch: 0,
            state: ClusterHealth::Fail,
            nodes: HashMap::from([(name, myself)]),
            blacklist: HashMap::new(),
            slots: SlotMap::new(),
            migrating_to: SlotMap::new(),
            importing_from: SlotMap::new(),
            slot_keys: vec![0; SLOT_COUNT as usize].into_boxed_slice(),
            links: HashMap::new(),
            election: None,
            manual_failover: ManualFailover::default(),
            repl_offset: 0,
            ticks: 0,
            stats_sent: [0; MessageType::COUNT],
            stats_received: [0; MessageType::COUNT],
        })
    }

    /// Assigns every slot to the local node. Used to start a one-node
    /// cluster that others then join.
    pub fn bootstrap(&mut self) -> Result<(), ClusterError> {
        let all: Vec<u16> = (0..SLOT_COUNT).collect();
        self.add_slots(&all)
    }

    // -- accessors --

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn myself_name(&self) -> NodeName {
        self.myself
    }

    pub fn myself(&self) -> &ClusterNode {
        &self.nodes[&self.myself]
    }

    pub(crate) fn myself_mut(&mut self) -> &mut ClusterNode {
        self.nodes
            .get_mut(&self.myself)
            .expect("local node is always registered")
    }

    pub fn node(&self, name: &NodeName) -> Option<&ClusterNode> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    pub fn last_vote_epoch(&self) -> u64 {
        self.last_vote_epoch
    }

    pub fn health(&self) -> ClusterHealth {
        self.state
    }

    pub fn slot_owner(&self, slot: u16) -> Option<NodeName> {
        self.slots.get(slot)
    }

    pub fn migrating_to(&self, slot: u16) -> Option<NodeName> {
        self.migrating_to.get(slot)
    }

    pub fn importing_from(&self, slot: u16) -> Option<NodeName> {
        self.importing_from.get(slot)
    }

    pub fn keys_in_slot(&self, slot: u16) -> u64 {
        self.slot_keys.get(slot as usize).copied().unwrap_or(0)
    }

    pub fn replication_offset(&self) -> u64 {
        self.repl_offset
    }

    /// Updates the local replication offset. The host calls this as its
    /// replication stream advances.
    pub fn set_replication_offset(&mut self, offset: u64) {
        self.repl_offset = offset;
    }

    /// Records that a key was stored in `slot`.
    pub fn key_added(&mut self, slot: u16) {
        if let Some(count) = self.slot_keys.get_mut(slot as usize) {
            *count += 1;
        }
    }

    /// Records that a key was removed from `slot`.
    pub fn key_removed(&mut self, slot: u16) {
        if let Some(count) = self.slot_keys.get_mut(slot as usize) {
            *count = count.saturating_sub(1);
        }
    }

    /// Masters serving slots, excluding nodes still in handshake or without
    /// an address.
    pub fn voting_primaries(&self) -> usize {
        self.nodes.values().filter(|n| n.is_voting_primary()).count()
    }

    /// Votes or failure reports needed for a strict majority of voting
    /// masters.
    pub fn quorum(&self) -> usize {
        self.voting_primaries() / 2 + 1
    }

    /// Number of masters that lost all their working replicas.
    pub fn orphaned_masters(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.orphaned_time.is_some())
            .count()
    }

    // -- registry --

    /// Raises `current_epoch` to `epoch` if it is behind.
    pub(crate) fn observe_epoch(&mut self, epoch: u64) {
        if epoch > self.current_epoch {
            debug!("current epoch {} -> {}", self.current_epoch, epoch);
            self.current_epoch = epoch;
        }
    }

    pub(crate) fn is_blacklisted(&mut self, name: &NodeName, now: Instant) -> bool {
        self.blacklist.retain(|_, until| *until > now);
        self.blacklist.contains_key(name)
    }

    /// Merges an observation into the registry, creating a provisional node
    /// if the name is new. Returns true if a node was created.
    ///
    /// The higher config epoch is kept, and a known role is never replaced:
    /// role changes only come from the node's own messages.
    pub fn upsert(&mut self, obs: NodeObservation, now: Instant) -> bool {
        self.observe_epoch(obs.config_epoch);
        let role = obs.flags & (NodeFlags::PRIMARY | NodeFlags::REPLICA);

        if let Some(node) = self.nodes.get_mut(&obs.name) {
            if let Some(addr) = obs.addr {
                if !node.is_myself() && node.addr != addr {
                    debug!("node {} address {} -> {}", obs.name.short(), node.addr, addr);
                    node.addr = addr;
                    node.flags.remove(NodeFlags::NOADDR);
                }
            }
            node.config_epoch = node.config_epoch.max(obs.config_epoch);
            if !node
                .flags
                .intersects(NodeFlags::PRIMARY | NodeFlags::REPLICA)
            {
                node.flags.insert(role);
            }
            return false;
        }

        if self.is_blacklisted(&obs.name, now) {
            debug!("ignoring blacklisted node {}", obs.name.short());
            return false;
        }

        let mut flags = obs.flags
            & (NodeFlags::PRIMARY
                | NodeFlags::REPLICA
                | NodeFlags::HANDSHAKE
                | NodeFlags::MEET
                | NodeFlags::NOADDR
                | NodeFlags::NOFAILOVER);
        let addr = obs.addr.unwrap_or_else(|| {
            flags |= NodeFlags::NOADDR;
            NodeAddr::new(None, 0, 0)
        });
        let mut node = ClusterNode::new(obs.name, flags, addr, now);
        node.config_epoch = obs.config_epoch;
        debug!("added node {} ({}) at {}", obs.name.short(), flags, addr);
        self.nodes.insert(obs.name, node);
        true
    }

    /// Claims `slot` for `node`.
    ///
    /// Fails if another node already serves the slot with an equal or
    /// higher config epoch. On success any migration marker for the slot is
    /// cleared.
    pub fn assign_slot(&mut self, slot: u16, node: &NodeName) -> Result<(), ClusterError> {
        check_slot(u32::from(slot))?;
        let claimant = self
            .nodes
            .get(node)
            .ok_or(ClusterError::NotFound(*node))?;
        if let Some(owner) = self.slots.get(slot).filter(|o| o != node) {
            let owner_epoch = self.nodes.get(&owner).map(|n| n.config_epoch).unwrap_or(0);
            if owner_epoch >= claimant.config_epoch {
                return Err(ClusterError::SlotOwnerConflict {
                    slot,
                    owner,
                    epoch: owner_epoch,
                });
            }
        }
        self.set_slot_owner(slot, Some(*node));
        self.migrating_to.set(slot, None);
        self.importing_from.set(slot, None);
        Ok(())
    }

    /// Moves `slot` to `owner` unconditionally, keeping the per-node bitmaps
    /// in step with the table.
    pub(crate) fn set_slot_owner(&mut self, slot: u16, owner: Option<NodeName>) {
        let previous = self.slots.set(slot, owner);
        if let Some(prev) = previous.and_then(|p| self.nodes.get_mut(&p)) {
            prev.slots.remove(slot);
        }
        if let Some(next) = owner.and_then(|o| self.nodes.get_mut(&o)) {
            next.slots.insert(slot);
        }
    }

    /// Releases every slot `name` serves.
    pub(crate) fn clear_node_slots(&mut self, name: &NodeName) {
        let owned: Vec<u16> = match self.nodes.get(name) {
            Some(node) => node.slots.iter().collect(),
            None => return,
        };
        for slot in owned {
            self.set_slot_owner(slot, None);
        }
    }

    /// Removes a node and every reference to it.
    ///
    /// Its slots become unassigned, its replicas lose their master, and
    /// fail reports it authored are dropped. The caller closes its link.
    pub fn remove(&mut self, name: &NodeName) -> Result<ClusterNode, ClusterError> {
        if *name == self.myself {
            return Err(ClusterError::IsMyself("remove"));
        }
        let node = self.nodes.remove(name).ok_or(ClusterError::NotFound(*name))?;

        self.slots.clear_node(name);
        self.migrating_to.clear_node(name);
        self.importing_from.clear_node(name);
        for other in self.nodes.values_mut() {
            other.fail_reports.retain(|r| r.reporter != *name);
            other.remove_replica(name);
            if other.replicates == Some(*name) {
                other.replicates = None;
            }
        }
        for link in self.links.values_mut() {
            if link.node == Some(*name) {
                link.node = None;
            }
        }
        if self.election.is_some() && self.myself().replicates.is_none() {
            self.election = None;
        }
        self.update_state();
        debug!("removed node {}", name.short());
        Ok(node)
    }

    /// Removes a node and blacklists its name so gossip can't bring it back
    /// for a while.
    pub fn forget(&mut self, name: &NodeName, now: Instant) -> Result<Vec<Action>, ClusterError> {
        if *name == self.myself {
            return Err(ClusterError::IsMyself("forget"));
        }
        if self.myself().replicates == Some(*name) {
            return Err(ClusterError::ForgetPrimary(*name));
        }
        let node = self.remove(name)?;
        self.blacklist.insert(*name, now + self.config.forget_ttl());
        info!("forgot node {}", name.short());

        let mut out = Vec::new();
        if let Some(link) = node.link_id() {
            self.links.remove(&link);
            out.push(Action::CloseLink { link });
        }
        self.update_state();
        Ok(out)
    }

    /// Starts a handshake with the node at `addr`. The node gets a
    /// provisional name until it answers.
    pub fn meet(&mut self, addr: NodeAddr, now: Instant) -> Result<NodeName, ClusterError> {
        if addr.ip.is_none() || addr.port == 0 || addr.cport == 0 {
            return Err(ClusterError::Configuration(format!("invalid node address {addr}")));
        }
        if let Some(pending) = self
            .nodes
            .values()
            .find(|n| n.in_handshake() && n.addr == addr)
        {
            return Ok(pending.name);
        }

        let name = NodeName::random();
        self.nodes.insert(
            name,
            ClusterNode::new(name, NodeFlags::HANDSHAKE | NodeFlags::MEET, addr, now),
        );
        info!("meeting node at {}", addr);
        Ok(name)
    }

    /// Makes the local node a replica of `primary`.
    pub fn replicate(&mut self, primary: &NodeName) -> Result<Vec<Action>, ClusterError> {
        if *primary == self.myself {
            return Err(ClusterError::IsMyself("replicate"));
        }
        let target = self
            .nodes
            .get(primary)
            .ok_or(ClusterError::NotFound(*primary))?;
        if !target.is_primary() {
            return Err(ClusterError::wrong_role("replica"));
        }
        if self.myself().is_primary() && !self.myself().slots.is_empty() {
            return Err(ClusterError::OwnsSlots);
        }

        let mut out = Vec::new();
        self.become_replica_of(primary, &mut out);
        self.update_state();
        Ok(out)
    }

    /// Switches the local node to replicate `primary` and tells the host to
    /// re-point replication.
    pub(crate) fn become_replica_of(&mut self, primary: &NodeName, out: &mut Vec<Action>) {
        let me = self.myself;
        self.set_node_replicates(&me, primary);
        for slot in 0..SLOT_COUNT {
            self.migrating_to.set(slot, None);
            self.importing_from.set(slot, None);
        }
        if self.manual_failover.replica.is_some() {
            out.push(Action::ResumeWrites);
        }
        self.manual_failover.reset();
        self.election = self.election.take().filter(|e| e.is_running()).map(|mut e| {
            info!("failover election for epoch {} lost", e.epoch);
            e.state = ElectionState::Lost;
            e
        });

        let addr = self.nodes.get(primary).map(|n| n.addr.client_addr());
        info!("now replicating {}", primary.short());
        out.push(Action::Replicate { primary: addr });
    }

    /// Records `name` as a master, detaching it from any previous master.
    pub(crate) fn set_node_primary(&mut self, name: &NodeName) {
        let old = match self.nodes.get_mut(name) {
            Some(node) => {
                node.set_primary_flags();
                node.replicates.take()
            }
            None => return,
        };
        if let Some(old) = old.and_then(|o| self.nodes.get_mut(&o)) {
            old.remove_replica(name);
        }
    }

    /// Records `name` as a replica of `primary`. A former master gives up
    /// its slots.
    pub(crate) fn set_node_replicates(&mut self, name: &NodeName, primary: &NodeName) {
        let (was_primary, old) = match self.nodes.get(name) {
            Some(node) => (node.is_primary(), node.replicates),
            None => return,
        };
        if was_primary {
            self.clear_node_slots(name);
        }
        if let Some(old) = old.filter(|o| o != primary) {
            if let Some(old) = self.nodes.get_mut(&old) {
                old.remove_replica(name);
            }
        }
        if let Some(node) = self.nodes.get_mut(name) {
            node.set_replica_flags();
            node.replicates = Some(*primary);
        }
        if let Some(primary) = self.nodes.get_mut(primary) {
            primary.add_replica(*name);
        }
    }

    /// Assigns unowned slots to the local node.
    pub fn add_slots(&mut self, slots: &[u16]) -> Result<(), ClusterError> {
        if !self.myself().is_primary() {
            return Err(ClusterError::wrong_role("replica"));
        }
        for &slot in slots {
            check_slot(u32::from(slot))?;
            if self.slots.get(slot).is_some() {
                return Err(ClusterError::SlotBusy(slot));
            }
        }
        let me = Some(self.myself);
        for &slot in slots {
            self.importing_from.set(slot, None);
            self.set_slot_owner(slot, me);
        }
        self.update_state();
        Ok(())
    }

    /// Unassigns slots, whoever owns them.
    pub fn del_slots(&mut self, slots: &[u16]) -> Result<(), ClusterError> {
        for &slot in slots {
            check_slot(u32::from(slot))?;
            if self.slots.get(slot).is_none() {
                return Err(ClusterError::SlotUnassigned(slot));
            }
        }
        for &slot in slots {
            self.set_slot_owner(slot, None);
            self.migrating_to.set(slot, None);
            self.importing_from.set(slot, None);
        }
        self.update_state();
        Ok(())
    }

    /// Gives the local node a fresh config epoch, greater than anything
    /// seen, without asking anyone.
    pub(crate) fn bump_config_epoch(&mut self) -> u64 {
        self.current_epoch += 1;
        let epoch = self.current_epoch;
        self.myself_mut().config_epoch = epoch;
        info!("config epoch bumped to {}", epoch);
        epoch
    }

    // -- health --

    /// Recomputes the cluster health.
    ///
    /// FAIL if coverage is required and some slot has no live owner, or if
    /// fewer than a majority of voting masters are reachable.
    pub(crate) fn update_state(&mut self) {
        let mut health = ClusterHealth::Ok;

        if self.config.require_full_coverage {
            let uncovered = !self.slots.is_complete()
                || self
                    .slots
                    .iter()
                    .any(|(_, owner)| self.nodes.get(&owner).map_or(true, |n| n.failed()));
            if uncovered {
                health = ClusterHealth::Fail;
            }
        }

        let size = self.voting_primaries();
        let reachable = self
            .nodes
            .values()
            .filter(|n| n.is_voting_primary() && !n.is_failing())
            .count();
        if size > 0 && reachable < size / 2 + 1 {
            health = ClusterHealth::Fail;
        }

        if health != self.state {
            match health {
                ClusterHealth::Ok => info!("cluster state changed: ok"),
                ClusterHealth::Fail => warn!("cluster state changed: fail"),
            }
            self.state = health;
        }
    }

    /// Tracks masters that had replicas and now have none that work.
    pub(crate) fn update_orphaned(&mut self, now: Instant) {
        let healthy_replicas: HashMap<NodeName, usize> =
            self.nodes
                .values()
                .filter(|n| n.is_replica() && !n.is_failing())
                .filter_map(|n| n.replicates)
                .fold(HashMap::new(), |mut acc, primary| {
                    *acc.entry(primary).or_insert(0) += 1;
                    acc
                });

        for node in self.nodes.values_mut() {
            let orphaned = node.is_primary()
                && !node.slots.is_empty()
                && node.flags.contains(NodeFlags::MIGRATE_TO)
                && !healthy_replicas.contains_key(&node.name);
            if !orphaned {
                node.orphaned_time = None;
            } else if node.orphaned_time.is_none() {
                warn!("master {} has no working replicas", node.name.short());
                node.orphaned_time = Some(now);
            }
        }
    }

    // -- introspection --

    /// CLUSTER INFO text.
    pub fn cluster_info(&self) -> String {
        let mut slots_ok = 0;
        let mut slots_pfail = 0;
        let mut slots_fail = 0;
        for (_, owner) in self.slots.iter() {
            match self.nodes.get(&owner) {
                Some(n) if n.failed() => slots_fail += 1,
                Some(n) if n.timed_out() => slots_pfail += 1,
                _ => slots_ok += 1,
            }
        }

        let mut info = format!(
            "cluster_state:{}\r\n\
             cluster_slots_assigned:{}\r\n\
             cluster_slots_ok:{}\r\n\
             cluster_slots_pfail:{}\r\n\
             cluster_slots_fail:{}\r\n\
             cluster_known_nodes:{}\r\n\
             cluster_size:{}\r\n\
             cluster_current_epoch:{}\r\n\
             cluster_my_epoch:{}\r\n\
             cluster_orphaned_masters:{}\r\n",
            self.state,
            self.slots.assigned_count(),
            slots_ok,
            slots_pfail,
            slots_fail,
            self.nodes.len(),
            self.voting_primaries(),
            self.current_epoch,
            self.my_epoch(),
            self.orphaned_masters(),
        );
        for ty in MessageType::ALL {
            let sent = self.stats_sent[ty.index()];
            if sent > 0 {
                info.push_str(&format!("cluster_stats_messages_{ty}_sent:{sent}\r\n"));
            }
        }
        for ty in MessageType::ALL {
            let received = self.stats_received[ty.index()];
            if received > 0 {
                info.push_str(&format!("cluster_stats_messages_{ty}_received:{received}\r\n"));
            }
        }
        info
    }

    /// The local node's config epoch, or its master's if it is a replica.
    pub(crate) fn my_epoch(&self) -> u64 {
        let me = self.myself();
        me.replicates
            .and_then(|p| self.nodes.get(&p))
            .map(|p| p.config_epoch)
            .unwrap_or(me.config_epoch)
    }

    /// CLUSTER NODES text, one line per node.
    pub fn cluster_nodes(&self, now: Instant) -> String {
        let mut lines: Vec<String> = self
            .nodes
            .values()
            .map(|node| {
                let extra = if node.is_myself() {
                    self.migration_annotations()
                } else {
                    Vec::new()
                };
                node.to_cluster_nodes_line(now, &extra)
            })
            .collect();
        lines.sort();
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    fn migration_annotations(&self) -> Vec<String> {
        let migrating = self
            .migrating_to
            .iter()
            .map(|(slot, dest)| format!("[{slot}->-{dest}]"));
        let importing = self
            .importing_from
            .iter()
            .map(|(slot, src)| format!("[{slot}-<-{src}]"));
        migrating.chain(importing).collect()
    }
}
