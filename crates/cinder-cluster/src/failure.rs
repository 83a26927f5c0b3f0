//! Failure detection.
//!
//! A node that leaves a ping unanswered for longer than the node timeout is
//! flagged PFAIL locally. Masters gossip their PFAIL flags; once a quorum
//! of voting masters (the local one included, when it votes) agree, the
//! node is flagged FAIL and a FAIL message forces the verdict on everyone.

use std::time::Instant;

use tracing::{debug, info};

use crate::bus::Action;
use crate::message::MessageBody;
use crate::topology::{FailReport, NodeFlags};
use crate::{ClusterState, NodeName};

impl ClusterState {
    /// Records that `reporter` sees `failing` as PFAIL or FAIL. Returns true
    /// if this is a new report rather than a refresh.
    pub(crate) fn add_fail_report(
        &mut self,
        failing: &NodeName,
        reporter: &NodeName,
        now: Instant,
    ) -> bool {
        let Some(node) = self.nodes.get_mut(failing) else {
            return false;
        };
        match node.fail_reports.iter_mut().find(|r| r.reporter == *reporter) {
            Some(report) => {
                report.time = now;
                false
            }
            None => {
                node.fail_reports.push(FailReport {
                    reporter: *reporter,
                    time: now,
                });
                true
            }
        }
    }

    pub(crate) fn remove_fail_report(&mut self, failing: &NodeName, reporter: &NodeName) {
        if let Some(node) = self.nodes.get_mut(failing) {
            node.fail_reports.retain(|r| r.reporter != *reporter);
        }
    }

    /// Drops stale reports and counts the rest.
    pub(crate) fn fail_report_count(&mut self, failing: &NodeName, now: Instant) -> usize {
        let validity = self.config.fail_report_validity();
        match self.nodes.get_mut(failing) {
            Some(node) => {
                node.fail_reports
                    .retain(|r| now.saturating_duration_since(r.time) <= validity);
                node.fail_reports.len()
            }
            None => 0,
        }
    }

    /// Flags PFAIL on nodes whose ping has been outstanding for longer than
    /// the node timeout.
    pub(crate) fn detect_timeouts(&mut self, now: Instant, out: &mut Vec<Action>) {
        let timeout = self.config.node_timeout();
        let mut suspects = Vec::new();
        for node in self.nodes.values_mut() {
            if node.is_myself() || node.in_handshake() || !node.has_addr() || node.is_failing() {
                continue;
            }
            let overdue = node
                .ping_sent
                .is_some_and(|sent| now.saturating_duration_since(sent) > timeout);
            if overdue {
                info!("*** node {} possibly failing", node.name.short());
                node.flags.insert(NodeFlags::PFAIL);
                suspects.push(node.name);
            }
        }
        for name in suspects {
            self.mark_failing_if_needed(&name, now, out);
        }
    }

    /// Promotes a local PFAIL to FAIL once enough voting masters report the
    /// node, and broadcasts the verdict.
    pub(crate) fn mark_failing_if_needed(
        &mut self,
        name: &NodeName,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let needed = self.quorum();
        match self.nodes.get(name) {
            Some(node) if node.is_primary() && node.timed_out() && !node.failed() => {}
            _ => return,
        }

        let mut reports = self.fail_report_count(name, now);
        if self.myself().is_voting_primary() {
            reports += 1;
        }
        if reports < needed {
            return;
        }

        info!(
            "marking node {} as failing (quorum reached: {} of {})",
            name.short(),
            reports,
            needed
        );
        self.set_fail(name, now);
        let message = self.build_message(MessageBody::Fail { node: *name });
        self.broadcast(message, out);
        self.update_state();
    }

    /// A FAIL message from a known node.
    pub(crate) fn handle_fail(&mut self, sender: &NodeName, failing: &NodeName, now: Instant) {
        match self.nodes.get(failing) {
            Some(node) if !node.is_myself() && !node.failed() => {}
            Some(_) => return,
            None => {
                debug!("FAIL about unknown node {}", failing.short());
                return;
            }
        }
        info!(
            "FAIL message received from {} about {}",
            sender.short(),
            failing.short()
        );
        self.set_fail(failing, now);
        self.update_state();
    }

    fn set_fail(&mut self, name: &NodeName, now: Instant) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.flags.remove(NodeFlags::PFAIL);
            node.flags.insert(NodeFlags::FAIL);
            node.fail_time = Some(now);
            node.slots_at_fail = node.slots.count();
        }
    }

    /// A node answered a ping. PFAIL always clears; FAIL clears for
    /// replicas, for masters with nothing to fail over, and for masters
    /// that still serve slots and came back within the undo window.
    pub(crate) fn clear_failure_if_reachable(&mut self, name: &NodeName, now: Instant) {
        let undo_window = self.config.fail_undo_window();
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        if node.timed_out() {
            debug!("node {} is reachable again", name.short());
            node.flags.remove(NodeFlags::PFAIL);
        }
        if !node.failed() {
            return;
        }

        let recent = node
            .fail_time
            .is_some_and(|t| now.saturating_duration_since(t) <= undo_window);
        let reason = if node.is_replica() {
            Some("it is a replica")
        } else if node.slots_at_fail == 0 {
            Some("it served no slots")
        } else if recent && !node.slots.is_empty() {
            Some("it is back and still serves its slots")
        } else {
            None
        };
        if let Some(reason) = reason {
            info!("clear FAIL state for node {}: {}", name.short(), reason);
            node.flags.remove(NodeFlags::FAIL);
            node.fail_time = None;
            node.slots_at_fail = 0;
            self.update_state();
        }
    }
}
