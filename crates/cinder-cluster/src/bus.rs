//! The I/O boundary of the cluster core.
//!
//! [`ClusterState`] never touches a socket. The host feeds it link events
//! and decoded messages, calls [`ClusterState::tick`] every
//! `cron_interval`, and carries out the [`Action`]s that come back. Every
//! entry point takes the current time so the whole core can run on a
//! simulated clock.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::message::{ClusterMessage, GossipEntry, Header, MessageBody, MessageType};
use crate::slots::SlotBitmap;
use crate::topology::{NodeAddr, NodeFlags, NodeLink};
use crate::{ClusterNode, ClusterState, NodeName};

/// Host-assigned identifier of one bus connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// What the core knows about a connection.
#[derive(Debug, Clone)]
pub(crate) struct BusLink {
    /// The node this link was opened to; `None` for inbound links.
    pub(crate) node: Option<NodeName>,
    /// Remote ip, used when a MEET doesn't announce one.
    pub(crate) peer: Option<IpAddr>,
    pub(crate) created: Instant,
}

/// Side effects requested by the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open an outbound link, then report back with
    /// [`ClusterState::link_connected`] or [`ClusterState::link_failed`].
    Connect { node: NodeName, addr: SocketAddr },
    Send { link: LinkId, message: ClusterMessage },
    CloseLink { link: LinkId },
    /// Stop accepting writes until `until` or [`Action::ResumeWrites`].
    PauseWrites { until: Instant },
    ResumeWrites,
    /// Replicate from `primary`, or stop replicating when `None`.
    Replicate { primary: Option<SocketAddr> },
    /// Delete every local key in a slot that now belongs elsewhere.
    DropSlotKeys { slot: u16 },
    /// A pub/sub message relayed by another node.
    Publish { channel: Bytes, message: Bytes },
    /// A module message relayed by another node.
    Module {
        sender: NodeName,
        module_id: u64,
        module_type: u8,
        payload: Bytes,
    },
}

impl ClusterState {
    // -- link lifecycle --

    /// Registers an inbound connection.
    pub fn link_accepted(&mut self, link: LinkId, peer: SocketAddr, now: Instant) {
        trace!("accepted {} from {}", link, peer);
        self.links.insert(
            link,
            BusLink {
                node: None,
                peer: Some(peer.ip()),
                created: now,
            },
        );
    }

    /// An outbound connect requested by [`Action::Connect`] succeeded.
    ///
    /// The first message on the link is a MEET if the node still needs one,
    /// a PING otherwise.
    pub fn link_connected(&mut self, node: &NodeName, link: LinkId, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        let Some(target) = self.nodes.get_mut(node) else {
            debug!("connected {} to forgotten node {}", link, node.short());
            out.push(Action::CloseLink { link });
            return out;
        };
        let kind = if target.flags.contains(NodeFlags::MEET) {
            MessageType::Meet
        } else {
            MessageType::Ping
        };
        let peer = target.addr.ip;
        target.link = Some(NodeLink::Up { link, since: now });
        self.links.insert(
            link,
            BusLink {
                node: Some(*node),
                peer,
                created: now,
            },
        );
        debug!("{} up to node {}", link, node.short());
        self.send_ping(node, kind, now, &mut out);
        out
    }

    /// An outbound connect failed. The attempt counts as an unanswered ping,
    /// so a node that stays unreachable ends up PFAIL.
    pub fn link_failed(&mut self, node: &NodeName) {
        if let Some(target) = self.nodes.get_mut(node) {
            if matches!(target.link, Some(NodeLink::Connecting { .. })) {
                debug!("connect to node {} failed", node.short());
                target.link = None;
            }
        }
    }

    /// A link went away, for whatever reason.
    pub fn link_closed(&mut self, link: LinkId) {
        self.links.remove(&link);
        for node in self.nodes.values_mut() {
            if node.link_id() == Some(link) {
                debug!("{} to node {} closed", link, node.name.short());
                node.link = None;
            }
        }
    }

    /// Drops a link from the core's books and asks the host to close it.
    pub(crate) fn close_link(&mut self, link: LinkId, out: &mut Vec<Action>) {
        self.link_closed(link);
        out.push(Action::CloseLink { link });
    }

    // -- sending --

    pub(crate) fn send(&mut self, link: LinkId, message: ClusterMessage, out: &mut Vec<Action>) {
        self.stats_sent[message.message_type().index()] += 1;
        out.push(Action::Send { link, message });
    }

    /// Sends to a node over its outbound link. Returns false if the link
    /// isn't up.
    pub(crate) fn send_to_node(
        &mut self,
        node: &NodeName,
        message: ClusterMessage,
        out: &mut Vec<Action>,
    ) -> bool {
        match self.nodes.get(node).and_then(|n| n.link_id()) {
            Some(link) => {
                self.send(link, message, out);
                true
            }
            None => false,
        }
    }

    /// Sends a copy of `message` to every handshaken node with a link.
    pub(crate) fn broadcast(&mut self, message: ClusterMessage, out: &mut Vec<Action>) {
        let links: Vec<LinkId> = self
            .nodes
            .values()
            .filter(|n| !n.is_myself() && !n.in_handshake())
            .filter_map(|n| n.link_id())
            .collect();
        for link in links {
            self.send(link, message.clone(), out);
        }
    }

    pub(crate) fn build_message(&self, body: MessageBody) -> ClusterMessage {
        ClusterMessage {
            header: self.build_header(),
            body,
        }
    }

    /// The local node's self-description. A replica advertises its
    /// master's slots and config epoch.
    pub(crate) fn build_header(&self) -> Header {
        let me = self.myself();
        let primary = me
            .replicates
            .filter(|_| me.is_replica())
            .and_then(|p| self.nodes.get(&p));
        let (slots, config_epoch) = match primary {
            Some(p) => (p.slots.clone(), p.config_epoch),
            None => (me.slots.clone(), me.config_epoch),
        };
        Header {
            port: me.addr.port,
            current_epoch: self.current_epoch,
            config_epoch,
            offset: self.repl_offset,
            sender: me.name,
            slots,
            replicates: me.replicates.filter(|_| me.is_replica()),
            ip: me.addr.ip,
            cport: me.addr.cport,
            flags: me.flags,
            state: self.state,
            mflags: self.outgoing_mflags(),
        }
    }

    // -- receiving --

    /// Processes one decoded message that arrived on `link`.
    pub fn handle_message(
        &mut self,
        link: LinkId,
        message: ClusterMessage,
        now: Instant,
    ) -> Vec<Action> {
        let mut out = Vec::new();
        let ty = message.message_type();
        self.stats_received[ty.index()] += 1;

        let ClusterMessage { header, body } = message;
        let sender = header.sender;
        if sender == self.myself {
            debug!("dropping {} that claims to come from myself", ty);
            return out;
        }
        let known = self
            .nodes
            .get(&sender)
            .is_some_and(|n| !n.in_handshake());

        if known {
            self.observe_epoch(header.current_epoch);
            self.observe_epoch(header.config_epoch);
            if let Some(node) = self.nodes.get_mut(&sender) {
                node.config_epoch = node.config_epoch.max(header.config_epoch);
                node.repl_offset = header.offset;
                node.repl_offset_time = Some(now);
            }
            self.note_primary_pause(&header);
        }

        match body {
            MessageBody::Ping(gossip) | MessageBody::Pong(gossip) | MessageBody::Meet(gossip) => {
                self.handle_heartbeat(link, ty, &header, &gossip, known, now, &mut out);
            }
            _ if !known => {
                debug!("ignoring {} from unknown node {}", ty, sender.short());
            }
            MessageBody::Fail { node } => self.handle_fail(&sender, &node, now),
            MessageBody::Publish { channel, message } => {
                out.push(Action::Publish { channel, message });
            }
            MessageBody::AuthRequest => self.handle_auth_request(&header, now, &mut out),
            MessageBody::AuthAck => self.handle_auth_ack(&header, now, &mut out),
            MessageBody::Update {
                config_epoch,
                node,
                slots,
            } => self.handle_update(config_epoch, &node, &slots, &mut out),
            MessageBody::MfStart => self.handle_mf_start(&sender, now, &mut out),
            MessageBody::Module {
                module_id,
                module_type,
                payload,
            } => out.push(Action::Module {
                sender,
                module_id,
                module_type,
                payload,
            }),
        }
        out
    }

    /// PING, PONG and MEET: handshakes, liveness, role and slot claims, and
    /// the gossip section.
    #[allow(clippy::too_many_arguments)]
    fn handle_heartbeat(
        &mut self,
        link: LinkId,
        ty: MessageType,
        header: &Header,
        gossip: &[GossipEntry],
        known: bool,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let sender = header.sender;
        let (link_node, peer) = match self.links.get(&link) {
            Some(l) => (l.node, l.peer),
            None => (None, None),
        };

        if matches!(ty, MessageType::Ping | MessageType::Meet) {
            if !known && ty == MessageType::Meet {
                self.accept_meet(header, peer, now);
                self.process_gossip_section(&sender, gossip, now, out);
            }
            self.reply_pong(link, &sender, now, out);
        }

        if let Some(expected) = link_node {
            let handshaking = self.nodes.get(&expected).is_some_and(|n| n.in_handshake());
            if handshaking {
                self.finish_handshake(&expected, link, header, known, peer, now, out);
                return;
            }
            if expected != sender {
                warn!(
                    "node {} answered as {}; marking its address unknown",
                    expected.short(),
                    sender.short()
                );
                if let Some(node) = self.nodes.get_mut(&expected) {
                    node.flags.insert(NodeFlags::NOADDR);
                    node.addr.ip = None;
                }
                self.close_link(link, out);
                return;
            }
            if ty == MessageType::Pong {
                if let Some(node) = self.nodes.get_mut(&sender) {
                    node.pong_received = Some(now);
                    node.ping_sent = None;
                }
                self.clear_failure_if_reachable(&sender, now);
            }
        }

        if !known {
            return;
        }

        if ty == MessageType::Ping && link_node.is_none() {
            let addr = NodeAddr::new(header.ip.or(peer), header.port, header.cport);
            self.update_node_address(&sender, addr, out);
        }

        self.apply_role(header);

        if header.replicates.is_none() {
            let dirty = self
                .nodes
                .get(&sender)
                .is_some_and(|n| n.slots != header.slots);
            if dirty {
                if let Some(owner) =
                    self.update_slots_from_claim(&sender, header.config_epoch, &header.slots, out)
                {
                    // tell the sender who really owns what it claims
                    self.send_update_about(&owner, link, out);
                }
            }
            self.handle_epoch_collision(&sender, header.config_epoch);
        }

        self.process_gossip_section(&sender, gossip, now, out);
    }

    /// Adds an unknown node that introduced itself with MEET. It stays in
    /// handshake until our own PING gets a PONG back.
    fn accept_meet(&mut self, header: &Header, peer: Option<IpAddr>, now: Instant) {
        let Some(ip) = header.ip.or(peer) else {
            return;
        };
        let addr = NodeAddr::new(Some(ip), header.port, header.cport);
        if self.nodes.values().any(|n| n.in_handshake() && n.addr == addr) {
            return;
        }
        let name = NodeName::random();
        info!("met by node at {}", addr);
        self.nodes
            .insert(name, ClusterNode::new(name, NodeFlags::HANDSHAKE, addr, now));
    }

    /// Completes the handshake on an outbound link: the provisional node
    /// takes the sender's real name, or is dropped if that name is already
    /// known.
    #[allow(clippy::too_many_arguments)]
    fn finish_handshake(
        &mut self,
        provisional: &NodeName,
        link: LinkId,
        header: &Header,
        known: bool,
        peer: Option<IpAddr>,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let sender = header.sender;
        if known {
            let addr = NodeAddr::new(header.ip.or(peer), header.port, header.cport);
            debug!(
                "handshake with {} reached known node {}",
                addr,
                sender.short()
            );
            self.update_node_address(&sender, addr, out);
            if let Err(e) = self.remove(provisional) {
                debug!("dropping provisional node {}: {}", provisional.short(), e);
            }
            self.close_link(link, out);
            return;
        }

        if *provisional != sender {
            let Some(mut node) = self.nodes.remove(provisional) else {
                return;
            };
            node.name = sender;
            self.nodes.insert(sender, node);
            if let Some(bus) = self.links.get_mut(&link) {
                bus.node = Some(sender);
            }
        }
        if let Some(node) = self.nodes.get_mut(&sender) {
            node.flags.remove(NodeFlags::HANDSHAKE | NodeFlags::MEET);
            node.flags
                .insert(header.flags & (NodeFlags::PRIMARY | NodeFlags::REPLICA));
            node.pong_received = Some(now);
            node.ping_sent = None;
        }
        info!("handshake with node {} completed", sender.short());
    }

    /// Updates a node's address after it reconnected from somewhere else.
    /// Its old outbound link is closed so the next tick reconnects.
    pub(crate) fn update_node_address(
        &mut self,
        name: &NodeName,
        addr: NodeAddr,
        out: &mut Vec<Action>,
    ) -> bool {
        if addr.ip.is_none() || *name == self.myself {
            return false;
        }
        let stale_link = match self.nodes.get_mut(name) {
            Some(node) if node.addr != addr => {
                info!("address of node {} changed to {}", name.short(), addr);
                node.addr = addr;
                node.flags.remove(NodeFlags::NOADDR);
                node.link_id()
            }
            _ => return false,
        };
        if let Some(link) = stale_link {
            self.close_link(link, out);
        }
        if self.myself().replicates == Some(*name) {
            out.push(Action::Replicate {
                primary: Some(addr.client_addr()),
            });
        }
        true
    }

    /// Applies the role a node announces for itself.
    fn apply_role(&mut self, header: &Header) {
        let sender = header.sender;
        let Some(node) = self.nodes.get(&sender) else {
            return;
        };
        match header.replicates {
            None if !node.is_primary() => {
                info!("node {} is now a master", sender.short());
                self.set_node_primary(&sender);
            }
            Some(primary) if node.is_primary() || node.replicates != Some(primary) => {
                info!(
                    "node {} is now a replica of {}",
                    sender.short(),
                    primary.short()
                );
                self.set_node_replicates(&sender, &primary);
            }
            _ => {}
        }
    }

    /// Adopts `claimed` slots for `sender` wherever its config epoch wins.
    ///
    /// Slots being imported are left alone. Keys in slots the local node
    /// loses are dropped, unless the local node (or its master) lost every
    /// slot to `sender`, in which case it becomes `sender`'s replica.
    ///
    /// Returns the owner of some claimed slot whose config epoch beats the
    /// claim, so the caller can correct the sender.
    pub(crate) fn update_slots_from_claim(
        &mut self,
        sender: &NodeName,
        epoch: u64,
        claimed: &SlotBitmap,
        out: &mut Vec<Action>,
    ) -> Option<NodeName> {
        if *sender == self.myself {
            debug!("discarding slot claim about myself");
            return None;
        }
        let me = self.myself;
        let my_primary = if self.myself().is_primary() {
            Some(me)
        } else {
            self.myself().replicates
        };

        let mut lost_mine = Vec::new();
        let mut took_from_primary = false;
        let mut stronger_owner = None;
        for slot in claimed.iter() {
            let owner = self.slots.get(slot);
            if owner == Some(*sender) || self.importing_from.get(slot).is_some() {
                continue;
            }
            let owner_epoch = owner
                .and_then(|o| self.nodes.get(&o))
                .map(|n| n.config_epoch);
            match owner_epoch {
                Some(current) if current >= epoch => {
                    if current > epoch && stronger_owner.is_none() {
                        stronger_owner = owner;
                    }
                    continue;
                }
                _ => {}
            }
            if owner == Some(me) && self.keys_in_slot(slot) > 0 {
                lost_mine.push(slot);
            }
            if owner.is_some() && owner == my_primary {
                took_from_primary = true;
            }
            self.set_slot_owner(slot, Some(*sender));
            self.migrating_to.set(slot, None);
        }

        let primary_emptied = my_primary
            .and_then(|p| self.nodes.get(&p))
            .is_some_and(|p| p.slots.is_empty());
        if took_from_primary && primary_emptied {
            info!(
                "configuration change: reconfiguring myself as a replica of {}",
                sender.short()
            );
            self.become_replica_of(sender, out);
        } else {
            for slot in lost_mine {
                warn!("lost slot {} to {}; dropping its keys", slot, sender.short());
                self.slot_keys[slot as usize] = 0;
                out.push(Action::DropSlotKeys { slot });
            }
        }
        self.update_state();
        stronger_owner
    }

    /// Applies an UPDATE about `name` if it carries a newer config epoch.
    fn handle_update(
        &mut self,
        config_epoch: u64,
        name: &NodeName,
        slots: &SlotBitmap,
        out: &mut Vec<Action>,
    ) {
        let Some(node) = self.nodes.get(name) else {
            debug!("UPDATE about unknown node {}", name.short());
            return;
        };
        if node.config_epoch >= config_epoch {
            return;
        }
        if node.is_replica() {
            self.set_node_primary(name);
        }
        if let Some(node) = self.nodes.get_mut(name) {
            node.config_epoch = config_epoch;
        }
        self.observe_epoch(config_epoch);
        self.update_slots_from_claim(name, config_epoch, slots, out);
    }

    /// Sends an UPDATE describing `owner` on `link`.
    fn send_update_about(&mut self, owner: &NodeName, link: LinkId, out: &mut Vec<Action>) {
        let Some(node) = self.nodes.get(owner) else {
            return;
        };
        let body = MessageBody::Update {
            config_epoch: node.config_epoch,
            node: *owner,
            slots: node.slots.clone(),
        };
        debug!("sending UPDATE about {} on {}", owner.short(), link);
        let message = self.build_message(body);
        self.send(link, message, out);
    }

    /// Broadcasts the local node's slot configuration.
    pub(crate) fn broadcast_update(&mut self, about: &NodeName, out: &mut Vec<Action>) {
        let Some(node) = self.nodes.get(about) else {
            return;
        };
        let body = MessageBody::Update {
            config_epoch: node.config_epoch,
            node: *about,
            slots: node.slots.clone(),
        };
        let message = self.build_message(body);
        self.broadcast(message, out);
    }

    /// Two masters with the same config epoch: the one with the smaller
    /// name takes a fresh epoch.
    fn handle_epoch_collision(&mut self, sender: &NodeName, sender_epoch: u64) {
        let me = self.myself();
        let sender_is_primary = self.nodes.get(sender).is_some_and(|n| n.is_primary());
        if !me.is_primary() || !sender_is_primary || me.config_epoch != sender_epoch {
            return;
        }
        if self.myself >= *sender {
            return;
        }
        let epoch = self.bump_config_epoch();
        warn!(
            "config epoch collision with {}; moved to epoch {}",
            sender.short(),
            epoch
        );
    }

    // -- cron --

    /// Periodic work: handshake expiry, reconnects, pings, failure
    /// detection, replica failover and the health check.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.ticks += 1;

        self.expire_handshakes(now, &mut out);
        self.connect_links(now, &mut out);
        if self.ticks % u64::from(self.config.ping_sample_every_ticks) == 0 {
            self.ping_sampled_node(now, &mut out);
        }
        self.ping_idle_nodes(now, &mut out);
        self.detect_timeouts(now, &mut out);
        self.update_orphaned(now);

        self.check_manual_failover(now, &mut out);
        if self.myself().is_replica() {
            self.handle_replica_failover(now, &mut out);
        }
        self.update_state();
        out
    }

    /// Drops provisional nodes whose handshake took too long, closing any
    /// link they still hold.
    fn expire_handshakes(&mut self, now: Instant, out: &mut Vec<Action>) {
        let timeout = self.config.handshake_timeout();
        let expired: Vec<(NodeName, Option<LinkId>)> = self
            .nodes
            .values()
            .filter(|n| n.in_handshake() && now.saturating_duration_since(n.created) > timeout)
            .map(|n| (n.name, n.link_id()))
            .collect();
        for (name, link) in expired {
            if let Some(link) = link {
                self.close_link(link, out);
            }
            match self.remove(&name) {
                Ok(node) => debug!("handshake with {} timed out", node.addr),
                Err(e) => debug!("expiring handshake {}: {}", name.short(), e),
            }
        }
    }

    /// Asks the host to connect to every node without a link. A connect
    /// that doesn't resolve within the node timeout is retried.
    fn connect_links(&mut self, now: Instant, out: &mut Vec<Action>) {
        let timeout = self.config.node_timeout();
        for node in self.nodes.values_mut() {
            if node.is_myself() || !node.has_addr() {
                continue;
            }
            match node.link {
                None => {
                    let Some(addr) = node.addr.bus_addr() else {
                        continue;
                    };
                    node.link = Some(NodeLink::Connecting { since: now });
                    if node.ping_sent.is_none() {
                        node.ping_sent = Some(now);
                    }
                    out.push(Action::Connect {
                        node: node.name,
                        addr,
                    });
                }
                Some(NodeLink::Connecting { since })
                    if now.saturating_duration_since(since) > timeout =>
                {
                    debug!("connect to node {} timed out", node.name.short());
                    node.link = None;
                }
                _ => {}
            }
        }
    }
}
