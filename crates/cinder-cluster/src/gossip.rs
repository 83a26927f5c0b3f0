//! Heartbeats and gossip dissemination.
//!
//! Every PING, PONG and MEET carries a handful of entries describing other
//! nodes. Entries spread addresses, liveness and failure suspicions: a
//! master that gossips a PFAIL or FAIL flag about a node files a fail
//! report, and an entry for an unknown node starts a handshake with it.

use std::time::{Duration, Instant};

use rand::seq::IndexedRandom;
use tracing::{debug, trace};

use crate::bus::Action;
use crate::message::{GossipEntry, MessageBody, MessageType};
use crate::topology::{NodeAddr, NodeFlags, NodeLink, NodeObservation};
use crate::{ClusterNode, ClusterState, LinkId, NodeName};

/// Lower bound on gossip entries per message.
const MIN_GOSSIP_ENTRIES: usize = 3;

impl ClusterState {
    /// Sends a PING, PONG or MEET to `target` over its outbound link.
    pub(crate) fn send_ping(
        &mut self,
        target: &NodeName,
        kind: MessageType,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let Some(link) = self.nodes.get(target).and_then(|n| n.link_id()) else {
            return;
        };
        let gossip = self.gossip_entries(Some(target), now);
        let body = match kind {
            MessageType::Meet => MessageBody::Meet(gossip),
            MessageType::Pong => MessageBody::Pong(gossip),
            _ => MessageBody::Ping(gossip),
        };
        let message = self.build_message(body);
        if let Some(node) = self.nodes.get_mut(target) {
            match kind {
                MessageType::Ping if node.ping_sent.is_none() => node.ping_sent = Some(now),
                MessageType::Meet => node.flags.remove(NodeFlags::MEET),
                _ => {}
            }
        }
        trace!("sending {} to {}", kind, target.short());
        self.send(link, message, out);
    }

    /// Answers a PING or MEET on the link it arrived on.
    pub(crate) fn reply_pong(
        &mut self,
        link: LinkId,
        sender: &NodeName,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let gossip = self.gossip_entries(Some(sender), now);
        let message = self.build_message(MessageBody::Pong(gossip));
        self.send(link, message, out);
    }

    /// Sends a PONG to every node, announcing a configuration change.
    pub(crate) fn broadcast_pong(&mut self, now: Instant, out: &mut Vec<Action>) {
        let gossip = self.gossip_entries(None, now);
        let message = self.build_message(MessageBody::Pong(gossip));
        self.broadcast(message, out);
    }

    /// Picks the entries for a message to `target`: a random tenth of the
    /// known nodes (at least three), plus every node currently PFAIL so
    /// suspicions reach a quorum quickly.
    pub(crate) fn gossip_entries(&self, target: Option<&NodeName>, now: Instant) -> Vec<GossipEntry> {
        let eligible = |n: &&ClusterNode| {
            !n.is_myself()
                && Some(&n.name) != target
                && !n.in_handshake()
                && n.has_addr()
        };
        let candidates: Vec<&ClusterNode> = self
            .nodes
            .values()
            .filter(eligible)
            .filter(|n| !n.timed_out())
            .filter(|n| n.link.is_some() || !n.slots.is_empty())
            .collect();

        let wanted = (self.nodes.len() / 10)
            .max(MIN_GOSSIP_ENTRIES)
            .min(candidates.len());
        let mut entries: Vec<GossipEntry> = candidates
            .choose_multiple(&mut rand::rng(), wanted)
            .map(|n| gossip_entry(n, now))
            .collect();

        entries.extend(
            self.nodes
                .values()
                .filter(eligible)
                .filter(|n| n.timed_out())
                .map(|n| gossip_entry(n, now)),
        );
        entries
    }

    /// Folds the gossip section of a message from `sender` into the
    /// registry.
    pub(crate) fn process_gossip_section(
        &mut self,
        sender: &NodeName,
        entries: &[GossipEntry],
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let sender_votes = self
            .nodes
            .get(sender)
            .is_some_and(|n| n.is_voting_primary());

        for entry in entries {
            if entry.name == self.myself {
                continue;
            }
            let suspected = entry.flags.intersects(NodeFlags::PFAIL | NodeFlags::FAIL);

            match self.nodes.get(&entry.name).map(|n| n.in_handshake()) {
                Some(true) => {}
                Some(false) => {
                    if sender_votes {
                        if suspected {
                            if self.add_fail_report(&entry.name, sender, now) {
                                debug!(
                                    "node {} reported node {} as not reachable",
                                    sender.short(),
                                    entry.name.short()
                                );
                            }
                            self.mark_failing_if_needed(&entry.name, now, out);
                        } else {
                            self.remove_fail_report(&entry.name, sender);
                        }
                    }
                    if !suspected {
                        self.refresh_pong_time(&entry.name, entry.pong_received, now);
                    }
                    self.refresh_address(entry, out);
                }
                None => {
                    if entry.flags.contains(NodeFlags::NOADDR) || entry.ip.is_none() {
                        continue;
                    }
                    let addr = NodeAddr::new(entry.ip, entry.port, entry.cport);
                    if self.nodes.values().any(|n| n.in_handshake() && n.addr == addr) {
                        continue;
                    }
                    let created = self.upsert(
                        NodeObservation {
                            name: entry.name,
                            addr: Some(addr),
                            flags: NodeFlags::HANDSHAKE | NodeFlags::MEET,
                            config_epoch: 0,
                        },
                        now,
                    );
                    if created {
                        debug!(
                            "learned about node {} at {} from {}",
                            entry.name.short(),
                            addr,
                            sender.short()
                        );
                    }
                }
            }
        }
    }

    /// Trusts a third party's pong time if we aren't waiting on a ping of
    /// our own and nobody reports the node as failing.
    fn refresh_pong_time(&mut self, name: &NodeName, age_ms: u32, now: Instant) {
        if age_ms == 0 {
            return;
        }
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        if node.ping_sent.is_some() || !node.fail_reports.is_empty() {
            return;
        }
        let Some(seen) = now.checked_sub(Duration::from_millis(u64::from(age_ms))) else {
            return;
        };
        if node.pong_received.map_or(true, |pong| pong < seen) {
            node.pong_received = Some(seen);
        }
    }

    /// Nodes that failed or lost their address pick up a new one from
    /// gossip.
    fn refresh_address(&mut self, entry: &GossipEntry, out: &mut Vec<Action>) {
        let Some(node) = self.nodes.get(&entry.name) else {
            return;
        };
        let stale = node.flags.intersects(NodeFlags::FAIL | NodeFlags::NOADDR);
        let usable = entry.ip.is_some()
            && !entry
                .flags
                .intersects(NodeFlags::NOADDR | NodeFlags::PFAIL | NodeFlags::FAIL);
        if stale && usable {
            let addr = NodeAddr::new(entry.ip, entry.port, entry.cport);
            self.update_node_address(&entry.name, addr, out);
        }
    }

    /// Pings the node, among a small random sample, we heard from least
    /// recently.
    pub(crate) fn ping_sampled_node(&mut self, now: Instant, out: &mut Vec<Action>) {
        let candidates: Vec<&ClusterNode> = self
            .nodes
            .values()
            .filter(|n| !n.is_myself() && !n.in_handshake())
            .filter(|n| n.link_id().is_some() && n.ping_sent.is_none())
            .collect();
        let target = candidates
            .choose_multiple(&mut rand::rng(), self.config.ping_sample_size)
            .min_by_key(|n| n.pong_received)
            .map(|n| n.name);
        if let Some(target) = target {
            trace!("sampled ping to {}", target.short());
            self.send_ping(&target, MessageType::Ping, now, out);
        }
    }

    /// Keeps every link exercised: pings nodes not heard from in half a
    /// node timeout and closes links whose pings go unanswered.
    pub(crate) fn ping_idle_nodes(&mut self, now: Instant, out: &mut Vec<Action>) {
        let timeout = self.config.node_timeout();
        let half = timeout / 2;
        let mf_replica = self
            .myself()
            .is_primary()
            .then_some(self.manual_failover.replica)
            .flatten();

        let mut stale_links = Vec::new();
        let mut idle = Vec::new();
        for node in self.nodes.values() {
            if node.is_myself() || node.in_handshake() || !node.has_addr() {
                continue;
            }
            let Some(NodeLink::Up { link, since }) = node.link else {
                continue;
            };
            let waited = node
                .ping_sent
                .is_some_and(|sent| now.saturating_duration_since(sent) > half);
            if waited && now.saturating_duration_since(since) > timeout {
                stale_links.push(link);
                continue;
            }
            let quiet = node.ping_sent.is_none()
                && node
                    .pong_received
                    .map_or(true, |pong| now.saturating_duration_since(pong) > half);
            if quiet || mf_replica == Some(node.name) {
                idle.push(node.name);
            }
        }

        for link in stale_links {
            debug!("{} unresponsive, reconnecting", link);
            self.close_link(link, out);
        }
        for name in idle {
            self.send_ping(&name, MessageType::Ping, now, out);
        }
    }
}

fn gossip_entry(node: &ClusterNode, now: Instant) -> GossipEntry {
    GossipEntry {
        name: node.name,
        ping_sent: age_ms(node.ping_sent, now),
        pong_received: age_ms(node.pong_received, now),
        ip: node.addr.ip,
        port: node.addr.port,
        cport: node.addr.cport,
        flags: node.flags - NodeFlags::MYSELF,
    }
}

/// Milliseconds since `t`, with zero reserved for "never".
fn age_ms(t: Option<Instant>, now: Instant) -> u32 {
    match t {
        None => 0,
        Some(t) => {
            let ms = now.saturating_duration_since(t).as_millis();
            ms.clamp(1, u128::from(u32::MAX)) as u32
        }
    }
}
