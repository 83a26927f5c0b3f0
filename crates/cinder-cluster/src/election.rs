//! Replica failover elections.
//!
//! When its master is FAIL, a replica waits a short, rank-dependent delay
//! and then asks every master for a vote at a fresh epoch. Masters grant at
//! most one vote per epoch, so two replicas can't both collect a majority
//! for the same epoch. The winner takes over its master's slots with the
//! election epoch as its config epoch.
//!
//! # Fairness
//!
//! Rank is the number of sibling replicas with a higher replication offset.
//! Each rank step adds `failover_rank_delay_ms` to the wait, so the most
//! up-to-date replica usually asks first and wins before the others try.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::bus::Action;
use crate::message::{Header, MessageBody, MessageFlags};
use crate::topology::NodeFlags;
use crate::{ClusterState, NodeName};

/// Phase of the local node's election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// No election.
    Idle,
    /// Scheduled; the vote request goes out once the delay has passed.
    Requesting,
    /// Request sent, collecting acks.
    WaitingVotes,
    /// Promoted.
    Won,
    /// Another replica took over first.
    Lost,
    /// Not enough votes in time. A new attempt, at a higher epoch, starts
    /// after the retry interval.
    TimedOut,
}

/// State for one election attempt.
///
/// Created when a replica sees its master FAIL. Dropped when the master
/// recovers, or when the retry interval after a timeout has passed.
#[derive(Debug, Clone)]
pub struct Election {
    /// Epoch this election is contesting; zero until the request is sent.
    pub epoch: u64,
    /// Masters that voted for us.
    votes: HashSet<NodeName>,
    pub state: ElectionState,
    /// Position among sibling replicas by replication offset.
    pub rank: usize,
    /// When the vote request goes out.
    pub start_at: Instant,
    /// Votes must arrive before this.
    pub deadline: Option<Instant>,
    /// When a timed out election may be retried.
    pub retry_at: Option<Instant>,
    /// Started by a manual failover: no delay, and voters skip the FAIL
    /// check.
    pub manual: bool,
}

impl Election {
    /// Creates an election whose request goes out at `start_at`.
    pub fn new(start_at: Instant, rank: usize, manual: bool) -> Self {
        Self {
            epoch: 0,
            votes: HashSet::new(),
            state: ElectionState::Requesting,
            rank,
            start_at,
            deadline: None,
            retry_at: None,
            manual,
        }
    }

    /// Records a vote from `voter`. Returns `true` if quorum is newly
    /// reached.
    ///
    /// Once quorum is reached this returns `true` exactly once; later calls
    /// return `false` so the caller promotes exactly once.
    pub fn record_vote(&mut self, voter: NodeName, quorum: usize) -> bool {
        if self.state != ElectionState::WaitingVotes {
            return false;
        }
        self.votes.insert(voter);
        if self.votes.len() >= quorum {
            self.state = ElectionState::Won;
            true
        } else {
            false
        }
    }

    pub fn votes(&self) -> usize {
        self.votes.len()
    }

    /// True while the election can still produce a promotion.
    pub fn is_running(&self) -> bool {
        matches!(
            self.state,
            ElectionState::Requesting | ElectionState::WaitingVotes
        )
    }
}

impl ClusterState {
    pub fn election_state(&self) -> ElectionState {
        self.election
            .as_ref()
            .map_or(ElectionState::Idle, |e| e.state)
    }

    /// Number of sibling replicas ahead of us by replication offset.
    fn replica_rank(&self) -> usize {
        let Some(primary) = self.myself().replicates else {
            return 0;
        };
        self.nodes
            .values()
            .filter(|n| !n.is_myself() && n.is_replica() && n.replicates == Some(primary))
            .filter(|n| !n.flags.contains(NodeFlags::NOFAILOVER))
            .filter(|n| n.repl_offset > self.repl_offset)
            .count()
    }

    /// Drives the local election. Called from the tick on replicas.
    pub(crate) fn handle_replica_failover(&mut self, now: Instant, out: &mut Vec<Action>) {
        let Some(primary_name) = self.myself().replicates else {
            self.election = None;
            return;
        };
        let Some(primary) = self.nodes.get(&primary_name) else {
            return;
        };
        let manual = self.manual_failover.can_start;

        if !primary.failed() && !manual {
            if let Some(election) = self.election.take().filter(|e| e.is_running()) {
                info!(
                    "master {} is reachable again; abandoning election (epoch {})",
                    primary_name.short(),
                    election.epoch
                );
            }
            return;
        }
        if !manual && self.myself().flags.contains(NodeFlags::NOFAILOVER) {
            return;
        }
        if primary.slots.is_empty() && primary.slots_at_fail == 0 {
            return;
        }

        if !manual {
            if let Some(max_age) = self.config.max_data_age() {
                let last_contact = primary.pong_received.unwrap_or(primary.created);
                let age = now
                    .saturating_duration_since(last_contact)
                    .saturating_sub(self.config.node_timeout());
                if age > max_age {
                    debug!(
                        "replica data is too old ({}ms) to fail over",
                        age.as_millis()
                    );
                    return;
                }
            }
        }

        let active = self
            .election
            .as_ref()
            .is_some_and(|e| e.is_running() || e.state == ElectionState::TimedOut);
        if !active {
            self.schedule_election(now, manual);
        }
        let quorum = self.quorum();
        let rank = if manual { 0 } else { self.replica_rank() };
        let auth_timeout = self.config.auth_timeout();
        let retry = self.config.auth_retry_time();
        let rank_delay = Duration::from_millis(self.config.failover_rank_delay_ms);
        let Some(election) = self.election.as_mut() else {
            return;
        };

        match election.state {
            ElectionState::Requesting => {
                if !election.manual && rank > election.rank {
                    let added = rank_delay * (rank - election.rank) as u32;
                    election.start_at += added;
                    election.rank = rank;
                    info!(
                        "replica rank updated to #{}, added {}ms of delay",
                        rank,
                        added.as_millis()
                    );
                }
                if now < election.start_at {
                    return;
                }
                self.current_epoch += 1;
                let epoch = self.current_epoch;
                let manual = election.manual;
                election.epoch = epoch;
                election.state = ElectionState::WaitingVotes;
                election.deadline = Some(now + auth_timeout);
                election.retry_at = Some(now + retry);
                info!(
                    "starting failover election for epoch {} (quorum {})",
                    epoch, quorum
                );
                self.request_votes(manual, out);
            }
            ElectionState::WaitingVotes => {
                if election.deadline.is_some_and(|d| now >= d) {
                    election.state = ElectionState::TimedOut;
                    warn!(
                        "failover election for epoch {} timed out with {} of {} votes",
                        election.epoch,
                        election.votes(),
                        quorum
                    );
                }
            }
            ElectionState::TimedOut => {
                if election.retry_at.map_or(true, |r| now >= r) {
                    debug!("retrying failover election");
                    self.election = None;
                }
            }
            ElectionState::Idle | ElectionState::Won | ElectionState::Lost => {}
        }
    }

    fn schedule_election(&mut self, now: Instant, manual: bool) {
        if manual {
            info!("manual failover: starting election without delay");
            self.election = Some(Election::new(now, 0, true));
            return;
        }
        let rank = self.replica_rank();
        let jitter = match self.config.failover_jitter_ms {
            0 => 0,
            max => rand::rng().random_range(0..max),
        };
        let delay = Duration::from_millis(
            self.config.failover_delay_ms
                + jitter
                + rank as u64 * self.config.failover_rank_delay_ms,
        );
        info!(
            "start of election delayed for {}ms (rank #{}, offset {})",
            delay.as_millis(),
            rank,
            self.repl_offset
        );
        self.election = Some(Election::new(now + delay, rank, false));
    }

    fn request_votes(&mut self, force_ack: bool, out: &mut Vec<Action>) {
        let mut message = self.build_message(MessageBody::AuthRequest);
        if force_ack {
            message.header.mflags |= MessageFlags::FORCEACK;
        }
        self.broadcast(message, out);
    }

    /// Decides whether to vote for the replica that sent `header`.
    pub(crate) fn handle_auth_request(
        &mut self,
        header: &Header,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let requester = header.sender;
        if !self.myself().is_voting_primary() {
            return;
        }
        match self.check_vote(header, now) {
            Ok(primary) => {
                self.last_vote_epoch = self.current_epoch;
                if let Some(primary) = self.nodes.get_mut(&primary) {
                    primary.voted_time = Some(now);
                }
                info!(
                    "failover auth granted to {} for epoch {}",
                    requester.short(),
                    self.current_epoch
                );
                let ack = self.build_message(MessageBody::AuthAck);
                if !self.send_to_node(&requester, ack, out) {
                    debug!("no link to {} for the vote", requester.short());
                }
            }
            Err(reason) => {
                warn!(
                    "failover auth denied to {}: {}",
                    requester.short(),
                    reason
                );
            }
        }
    }

    /// Returns the requester's master if the vote can be granted.
    fn check_vote(&self, header: &Header, now: Instant) -> Result<NodeName, String> {
        let request_epoch = header.current_epoch;
        if request_epoch < self.current_epoch {
            return Err(format!(
                "request epoch {} is behind current epoch {}",
                request_epoch, self.current_epoch
            ));
        }
        if self.last_vote_epoch == self.current_epoch {
            return Err(format!("already voted for epoch {}", self.current_epoch));
        }
        let requester = self
            .nodes
            .get(&header.sender)
            .ok_or_else(|| "unknown requester".to_owned())?;
        if requester.is_primary() {
            return Err("it is a master".into());
        }
        let primary_name = requester
            .replicates
            .ok_or_else(|| "its master is unknown".to_owned())?;
        let primary = self
            .nodes
            .get(&primary_name)
            .ok_or_else(|| "its master is unknown".to_owned())?;
        if !primary.failed() && !header.mflags.contains(MessageFlags::FORCEACK) {
            return Err("its master is up".into());
        }
        let cooldown = self.config.node_timeout() * 2;
        if let Some(voted) = primary.voted_time {
            if now.saturating_duration_since(voted) < cooldown {
                return Err(format!(
                    "voted for a replica of {} {}ms ago",
                    primary_name.short(),
                    now.saturating_duration_since(voted).as_millis()
                ));
            }
        }
        for slot in header.slots.iter() {
            let owner_epoch = self
                .slots
                .get(slot)
                .and_then(|o| self.nodes.get(&o))
                .map(|o| o.config_epoch);
            if let Some(epoch) = owner_epoch.filter(|e| *e > header.config_epoch) {
                return Err(format!(
                    "slot {} has a newer owner (epoch {} > {})",
                    slot, epoch, header.config_epoch
                ));
            }
        }
        Ok(primary_name)
    }

    /// Counts a vote and promotes on quorum.
    pub(crate) fn handle_auth_ack(&mut self, header: &Header, now: Instant, out: &mut Vec<Action>) {
        let voter = header.sender;
        let votes = self
            .nodes
            .get(&voter)
            .is_some_and(|n| n.is_voting_primary());
        if !votes {
            return;
        }
        let quorum = self.quorum();
        let Some(election) = self.election.as_mut() else {
            return;
        };
        if election.state != ElectionState::WaitingVotes || header.current_epoch < election.epoch {
            return;
        }
        let won = election.record_vote(voter, quorum);
        debug!(
            "failover vote from {} ({} of {})",
            voter.short(),
            election.votes(),
            quorum
        );
        if won {
            let epoch = election.epoch;
            info!("failover election won for epoch {}", epoch);
            self.replace_primary(epoch, now, out);
        }
    }

    /// Takes over the master's slots at config epoch `epoch` and announces
    /// it.
    pub(crate) fn replace_primary(&mut self, epoch: u64, now: Instant, out: &mut Vec<Action>) {
        let me = self.myself;
        let Some(old) = self.myself().replicates else {
            return;
        };
        let slots: Vec<u16> = self
            .nodes
            .get(&old)
            .map(|n| n.slots.iter().collect())
            .unwrap_or_default();

        self.set_node_primary(&me);
        self.observe_epoch(epoch);
        self.myself_mut().config_epoch = epoch;
        for slot in slots {
            self.set_slot_owner(slot, Some(me));
            self.migrating_to.set(slot, None);
            self.importing_from.set(slot, None);
        }
        self.manual_failover.reset();
        info!(
            "promoted to master in place of {} at config epoch {}",
            old.short(),
            epoch
        );
        out.push(Action::Replicate { primary: None });
        self.update_state();
        self.broadcast_update(&me, out);
        self.broadcast_pong(now, out);
    }
}
