//! Manual failover.
//!
//! Issued on the replica that should take over. In the default mode the
//! replica sends MFSTART to its master, which pauses client writes and
//! advertises its replication offset with the PAUSED flag. Once the replica
//! has caught up to that offset it runs an election without delay, and
//! voters grant it even though the master is healthy. FORCE skips the
//! master's cooperation; TAKEOVER skips the election too.
//!
//! The whole operation is bounded by `manual_failover_timeout_ms`; on
//! timeout both sides give up and the master resumes writes.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use tracing::{info, warn};

use crate::bus::Action;
use crate::message::{Header, MessageBody, MessageFlags, MessageType};
use crate::{ClusterError, ClusterState, NodeName};

/// How a manual failover treats the current master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManualFailoverMode {
    /// Pause the master and wait for replication to catch up first.
    #[default]
    Default,
    /// Don't wait for the master; still needs a majority of votes.
    Force,
    /// Take a new config epoch and the slots without any agreement.
    Takeover,
}

impl fmt::Display for ManualFailoverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManualFailoverMode::Default => write!(f, "default"),
            ManualFailoverMode::Force => write!(f, "force"),
            ManualFailoverMode::Takeover => write!(f, "takeover"),
        }
    }
}

impl FromStr for ManualFailoverMode {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "default" => Ok(ManualFailoverMode::Default),
            "force" => Ok(ManualFailoverMode::Force),
            "takeover" => Ok(ManualFailoverMode::Takeover),
            other => Err(ClusterError::Configuration(format!(
                "unknown failover mode '{other}'"
            ))),
        }
    }
}

/// Manual failover bookkeeping, on either side.
#[derive(Debug, Default)]
pub(crate) struct ManualFailover {
    /// Deadline of the operation in progress.
    pub(crate) end: Option<Instant>,
    /// On the master: the replica taking over.
    pub(crate) replica: Option<NodeName>,
    /// On the replica: the paused master's replication offset.
    pub(crate) master_offset: Option<u64>,
    /// On the replica: caught up, the election may start.
    pub(crate) can_start: bool,
}

impl ManualFailover {
    pub(crate) fn in_progress(&self) -> bool {
        self.end.is_some()
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

impl ClusterState {
    /// Starts a manual failover of the local replica's master.
    pub fn manual_failover(
        &mut self,
        mode: ManualFailoverMode,
        now: Instant,
    ) -> Result<Vec<Action>, ClusterError> {
        let me = self.myself();
        if !me.is_replica() {
            return Err(ClusterError::wrong_role("master"));
        }
        let primary = me
            .replicates
            .ok_or_else(|| ClusterError::Configuration("my master is unknown".into()))?;
        let primary_node = self
            .nodes
            .get(&primary)
            .ok_or(ClusterError::NotFound(primary))?;
        if mode == ManualFailoverMode::Default
            && (primary_node.failed() || primary_node.link_id().is_none())
        {
            return Err(ClusterError::PrimaryUnreachable(primary));
        }

        let mut out = Vec::new();
        self.manual_failover.reset();
        self.election = None;
        self.manual_failover.end = Some(now + self.config.manual_failover_timeout());

        match mode {
            ManualFailoverMode::Takeover => {
                let epoch = self.bump_config_epoch();
                info!("taking over master {} without agreement", primary.short());
                self.replace_primary(epoch, now, &mut out);
            }
            ManualFailoverMode::Force => {
                info!("forced manual failover of {}", primary.short());
                self.manual_failover.can_start = true;
            }
            ManualFailoverMode::Default => {
                info!(
                    "manual failover of {} requested, waiting for it to pause",
                    primary.short()
                );
                let message = self.build_message(MessageBody::MfStart);
                self.send_to_node(&primary, message, &mut out);
            }
        }
        Ok(out)
    }

    /// Message flags for outgoing headers.
    pub(crate) fn outgoing_mflags(&self) -> MessageFlags {
        if self.myself().is_primary() && self.manual_failover.in_progress() {
            MessageFlags::PAUSED
        } else {
            MessageFlags::empty()
        }
    }

    /// MFSTART from one of our replicas: pause writes and tell it our
    /// offset.
    pub(crate) fn handle_mf_start(&mut self, sender: &NodeName, now: Instant, out: &mut Vec<Action>) {
        let ours = self
            .nodes
            .get(sender)
            .is_some_and(|n| n.is_replica() && n.replicates == Some(self.myself));
        if !ours || !self.myself().is_primary() {
            warn!("ignoring MFSTART from {}, not my replica", sender.short());
            return;
        }
        let timeout = self.config.manual_failover_timeout();
        self.manual_failover.reset();
        self.manual_failover.end = Some(now + timeout);
        self.manual_failover.replica = Some(*sender);
        info!(
            "manual failover requested by replica {}; pausing writes",
            sender.short()
        );
        out.push(Action::PauseWrites {
            until: now + timeout * 2,
        });
        self.send_ping(sender, MessageType::Ping, now, out);
    }

    /// Picks up the paused master's offset from its header.
    pub(crate) fn note_primary_pause(&mut self, header: &Header) {
        let from_primary = self.myself().is_replica()
            && self.myself().replicates == Some(header.sender);
        if from_primary
            && self.manual_failover.in_progress()
            && self.manual_failover.master_offset.is_none()
            && header.mflags.contains(MessageFlags::PAUSED)
        {
            info!(
                "received replication offset {} from paused master",
                header.offset
            );
            self.manual_failover.master_offset = Some(header.offset);
        }
    }

    /// Times out a manual failover, and lets the replica start once it has
    /// caught up.
    pub(crate) fn check_manual_failover(&mut self, now: Instant, out: &mut Vec<Action>) {
        let Some(end) = self.manual_failover.end else {
            return;
        };
        if now >= end {
            warn!("manual failover timed out");
            if self.manual_failover.replica.is_some() {
                out.push(Action::ResumeWrites);
            }
            self.manual_failover.reset();
            return;
        }
        if self.myself().is_replica() && !self.manual_failover.can_start {
            if let Some(offset) = self.manual_failover.master_offset {
                if self.repl_offset >= offset {
                    info!("master replication stream processed, manual failover can start");
                    self.manual_failover.can_start = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{NodeAddr, NodeFlags, NodeLink, NodeObservation};
    use crate::{ClusterConfig, LinkId};

    fn addr(port: u16) -> NodeAddr {
        NodeAddr::from_client(format!("127.0.0.1:{port}").parse().unwrap())
    }

    /// A replica of a linked master that serves every slot.
    fn replica(now: Instant) -> (ClusterState, NodeName) {
        let mut state =
            ClusterState::new(ClusterConfig::default(), NodeName::random(), addr(7001), now)
                .unwrap();
        let primary = NodeName::random();
        state.upsert(
            NodeObservation {
                name: primary,
                addr: Some(addr(7000)),
                flags: NodeFlags::PRIMARY,
                config_epoch: 1,
            },
            now,
        );
        state.nodes.get_mut(&primary).unwrap().link = Some(NodeLink::Up {
            link: LinkId(1),
            since: now,
        });
        for slot in 0..crate::slots::SLOT_COUNT {
            state.assign_slot(slot, &primary).unwrap();
        }
        state.replicate(&primary).unwrap();
        (state, primary)
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("FORCE".parse::<ManualFailoverMode>().unwrap(), ManualFailoverMode::Force);
        assert_eq!(
            "takeover".parse::<ManualFailoverMode>().unwrap(),
            ManualFailoverMode::Takeover
        );
        assert!("sideways".parse::<ManualFailoverMode>().is_err());
    }

    #[test]
    fn master_cannot_fail_over() {
        let now = Instant::now();
        let mut state =
            ClusterState::new(ClusterConfig::default(), NodeName::random(), addr(7000), now)
                .unwrap();
        assert!(matches!(
            state.manual_failover(ManualFailoverMode::Default, now),
            Err(ClusterError::WrongRole { .. })
        ));
    }

    #[test]
    fn default_mode_sends_mfstart() {
        let now = Instant::now();
        let (mut state, _) = replica(now);
        let out = state.manual_failover(ManualFailoverMode::Default, now).unwrap();
        assert!(matches!(
            out.as_slice(),
            [Action::Send { link: LinkId(1), message }] if message.body == MessageBody::MfStart
        ));
        assert!(state.manual_failover.in_progress());
        assert!(!state.manual_failover.can_start);
    }

    #[test]
    fn catches_up_then_can_start() {
        let now = Instant::now();
        let (mut state, primary) = replica(now);
        state.manual_failover(ManualFailoverMode::Default, now).unwrap();

        let mut header = state.build_header();
        header.sender = primary;
        header.offset = 500;
        header.mflags = MessageFlags::PAUSED;
        state.note_primary_pause(&header);
        assert_eq!(state.manual_failover.master_offset, Some(500));

        let mut out = Vec::new();
        state.set_replication_offset(499);
        state.check_manual_failover(now, &mut out);
        assert!(!state.manual_failover.can_start);
        state.set_replication_offset(500);
        state.check_manual_failover(now, &mut out);
        assert!(state.manual_failover.can_start);
    }

    #[test]
    fn takeover_claims_slots_at_new_epoch() {
        let now = Instant::now();
        let (mut state, primary) = replica(now);
        let out = state.manual_failover(ManualFailoverMode::Takeover, now).unwrap();
        assert!(state.myself().is_primary());
        assert_eq!(state.myself().config_epoch, 2);
        assert_eq!(state.slot_owner(0), Some(state.myself_name()));
        assert!(state.node(&primary).unwrap().slots.is_empty());
        assert!(out.contains(&Action::Replicate { primary: None }));
        assert!(!state.manual_failover.in_progress());
    }

    #[test]
    fn timeout_resets_both_sides() {
        let now = Instant::now();
        let (mut state, _) = replica(now);
        state.manual_failover(ManualFailoverMode::Force, now).unwrap();
        let mut out = Vec::new();
        state.check_manual_failover(now + state.config().manual_failover_timeout(), &mut out);
        assert!(!state.manual_failover.in_progress());
        // replica side has no writes to resume
        assert!(out.is_empty());
    }
}
