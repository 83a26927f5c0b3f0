//! In-memory cluster harness.
//!
//! Runs several [`ClusterState`]s against a simulated clock and routes the
//! bus actions between them. Every message goes through the wire codec on
//! its way. Stopped nodes don't tick, accept connections or receive
//! messages.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use cinder_cluster::{
    key_slot, Action, ClusterConfig, ClusterMessage, ClusterState, Keyspace, LinkId, NodeAddr,
    NodeName, Route, RouteRequest, BUS_PORT_OFFSET,
};

const BASE_PORT: u16 = 7000;
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Fast timings so scenarios finish in a few simulated seconds.
pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        node_timeout_ms: 1000,
        cron_interval_ms: 100,
        failover_delay_ms: 200,
        failover_jitter_ms: 100,
        failover_rank_delay_ms: 500,
        ..Default::default()
    }
}

pub struct SimNode {
    pub state: ClusterState,
    pub up: bool,
    /// Host-facing actions: everything that isn't bus plumbing.
    pub effects: Vec<Action>,
}

struct Pipe {
    peer: usize,
    peer_link: LinkId,
}

pub struct Sim {
    pub now: Instant,
    pub nodes: Vec<SimNode>,
    pipes: HashMap<LinkId, Pipe>,
    next_link: u64,
    queue: VecDeque<(usize, Action)>,
}

impl Sim {
    /// `count` masters without slots that don't know each other.
    pub fn new(count: usize) -> Self {
        let now = Instant::now();
        let nodes = (0..count)
            .map(|i| {
                let state =
                    ClusterState::new(test_config(), NodeName::random(), Self::addr(i), now)
                        .expect("valid config");
                SimNode {
                    state,
                    up: true,
                    effects: Vec::new(),
                }
            })
            .collect();
        Self {
            now,
            nodes,
            pipes: HashMap::new(),
            next_link: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn addr(i: usize) -> NodeAddr {
        NodeAddr::from_client(SocketAddr::new(LOCALHOST, BASE_PORT + i as u16))
    }

    pub fn name(&self, i: usize) -> NodeName {
        self.nodes[i].state.myself_name()
    }

    pub fn state(&self, i: usize) -> &ClusterState {
        &self.nodes[i].state
    }

    pub fn state_mut(&mut self, i: usize) -> &mut ClusterState {
        &mut self.nodes[i].state
    }

    /// Splits all slots evenly over the given nodes.
    pub fn spread_slots(&mut self, owners: &[usize]) {
        let share = cinder_cluster::SLOT_COUNT / owners.len() as u16;
        for (n, &i) in owners.iter().enumerate() {
            let start = share * n as u16;
            let end = if n + 1 == owners.len() {
                cinder_cluster::SLOT_COUNT
            } else {
                start + share
            };
            let slots: Vec<u16> = (start..end).collect();
            self.nodes[i].state.add_slots(&slots).expect("slots are free");
        }
    }

    /// Introduces node 0 to every other node and runs until everyone knows
    /// everyone, then a little longer for epochs to settle.
    pub fn join_all(&mut self) {
        for j in 1..self.nodes.len() {
            let now = self.now;
            self.nodes[0]
                .state
                .meet(Self::addr(j), now)
                .expect("valid address");
        }
        let converged = self.run_until(Duration::from_secs(20), |sim| sim.converged());
        assert!(converged, "cluster didn't converge");
        self.run_for(Duration::from_secs(3));
    }

    /// Every running node knows every other node by its real name.
    pub fn converged(&self) -> bool {
        let live: Vec<usize> = (0..self.nodes.len()).filter(|&i| self.nodes[i].up).collect();
        live.iter().all(|&i| {
            let state = &self.nodes[i].state;
            state.nodes().count() == self.nodes.len()
                && live.iter().all(|&j| {
                    state
                        .node(&self.name(j))
                        .is_some_and(|n| !n.in_handshake())
                })
        })
    }

    pub fn stop(&mut self, i: usize) {
        self.nodes[i].up = false;
    }

    /// Hands actions returned by a direct call on node `i` to the harness.
    pub fn apply(&mut self, i: usize, actions: Vec<Action>) {
        self.queue.extend(actions.into_iter().map(|a| (i, a)));
        self.drain();
    }

    pub fn run_for(&mut self, duration: Duration) {
        let end = self.now + duration;
        while self.now < end {
            self.step();
        }
    }

    /// Steps until `done` holds or `limit` passes. Returns whether `done`
    /// held.
    pub fn run_until(&mut self, limit: Duration, done: impl Fn(&Sim) -> bool) -> bool {
        let end = self.now + limit;
        while self.now < end {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// One cron interval: every running node ticks.
    pub fn step(&mut self) {
        self.now += test_config().cron_interval();
        let now = self.now;
        for i in 0..self.nodes.len() {
            if !self.nodes[i].up {
                continue;
            }
            let out = self.nodes[i].state.tick(now);
            self.queue.extend(out.into_iter().map(|a| (i, a)));
            self.drain();
        }
    }

    fn drain(&mut self) {
        let mut budget = 100_000;
        while let Some((i, action)) = self.queue.pop_front() {
            budget -= 1;
            assert!(budget > 0, "message storm");
            self.execute(i, action);
        }
    }

    fn new_link(&mut self) -> LinkId {
        self.next_link += 1;
        LinkId(self.next_link)
    }

    fn execute(&mut self, i: usize, action: Action) {
        let now = self.now;
        match action {
            Action::Connect { node, addr } => {
                let target = addr
                    .port()
                    .checked_sub(BUS_PORT_OFFSET + BASE_PORT)
                    .map(usize::from)
                    .filter(|&j| j < self.nodes.len() && j != i);
                let Some(j) = target.filter(|&j| self.nodes[i].up && self.nodes[j].up) else {
                    self.nodes[i].state.link_failed(&node);
                    return;
                };
                let ours = self.new_link();
                let theirs = self.new_link();
                self.pipes.insert(
                    ours,
                    Pipe {
                        peer: j,
                        peer_link: theirs,
                    },
                );
                self.pipes.insert(
                    theirs,
                    Pipe {
                        peer: i,
                        peer_link: ours,
                    },
                );
                let peer = SocketAddr::new(LOCALHOST, 40_000 + i as u16);
                self.nodes[j].state.link_accepted(theirs, peer, now);
                let out = self.nodes[i].state.link_connected(&node, ours, now);
                self.queue.extend(out.into_iter().map(|a| (i, a)));
            }
            Action::Send { link, message } => {
                let Some(pipe) = self.pipes.get(&link) else {
                    return;
                };
                let (j, their_link) = (pipe.peer, pipe.peer_link);
                if !self.nodes[i].up || !self.nodes[j].up {
                    return;
                }
                let bytes = message.encode();
                let (decoded, used) = ClusterMessage::decode(&bytes)
                    .expect("well-formed frame")
                    .expect("complete frame");
                assert_eq!(used, bytes.len());
                let out = self.nodes[j].state.handle_message(their_link, decoded, now);
                self.queue.extend(out.into_iter().map(|a| (j, a)));
            }
            Action::CloseLink { link } => {
                if let Some(pipe) = self.pipes.remove(&link) {
                    self.pipes.remove(&pipe.peer_link);
                    self.nodes[pipe.peer].state.link_closed(pipe.peer_link);
                }
                self.nodes[i].state.link_closed(link);
            }
            other => self.nodes[i].effects.push(other),
        }
    }
}

/// A key store that holds a fixed set of keys.
#[derive(Default)]
pub struct Keys(pub Vec<Vec<u8>>);

impl Keyspace for Keys {
    fn contains_key(&self, key: &[u8]) -> bool {
        self.0.iter().any(|k| k == key)
    }

    fn move_one_key(&mut self, slot: u16, _target: &NodeAddr) -> bool {
        match self.0.iter().position(|k| key_slot(k) == slot) {
            Some(pos) => {
                self.0.swap_remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Some key that hashes to `slot`.
pub fn key_in_slot(slot: u16) -> Vec<u8> {
    (0u32..)
        .map(|i| format!("key:{i}").into_bytes())
        .find(|k| key_slot(k) == slot)
        .expect("every slot is reachable")
}

/// Routes a single-key request.
pub fn route_key(state: &ClusterState, key: &[u8], keys: &Keys, asking: bool) -> Route {
    let request_keys = [key];
    let request = RouteRequest {
        keys: &request_keys,
        asking,
        ..Default::default()
    };
    state.route(&request, keys)
}
