//! Joining, failure detection and the quorum rule.

use std::time::Duration;

use cinder_cluster::{ClusterHealth, SLOT_COUNT};

use crate::helpers::Sim;

#[test]
fn nodes_discover_each_other_through_gossip() {
    let mut sim = Sim::new(4);
    sim.spread_slots(&[0, 1, 2, 3]);
    // only node 0 is told about the others
    sim.join_all();

    for i in 0..4 {
        let state = sim.state(i);
        assert_eq!(state.health(), ClusterHealth::Ok, "node {i}");
        assert_eq!(state.voting_primaries(), 4);
        for slot in [0, SLOT_COUNT / 2, SLOT_COUNT - 1] {
            assert_eq!(state.slot_owner(slot), sim.state(0).slot_owner(slot));
        }
    }

    // collisions leave every master with its own config epoch
    let mut epochs: Vec<u64> = (0..4).map(|i| sim.state(i).myself().config_epoch).collect();
    epochs.sort_unstable();
    epochs.dedup();
    assert_eq!(epochs.len(), 4);
}

#[test]
fn majority_marks_silent_master_failed() {
    let mut sim = Sim::new(3);
    sim.spread_slots(&[0, 1, 2]);
    sim.join_all();
    let silent = sim.name(2);

    sim.stop(2);
    sim.run_for(Duration::from_secs(5));

    for i in 0..2 {
        let node = sim.state(i).node(&silent).unwrap();
        assert!(node.failed(), "node {i} should see FAIL");
        // its slots are uncovered now
        assert_eq!(sim.state(i).health(), ClusterHealth::Fail);
    }
}

#[test]
fn lone_survivor_never_confirms_failure() {
    let mut sim = Sim::new(3);
    sim.spread_slots(&[0, 1, 2]);
    sim.join_all();

    sim.stop(1);
    sim.stop(2);
    sim.run_for(Duration::from_secs(6));

    let state = sim.state(0);
    for i in 1..3 {
        let node = state.node(&sim.name(i)).unwrap();
        assert!(node.timed_out());
        assert!(!node.failed());
    }
    // a minority partition stops serving
    assert_eq!(state.health(), ClusterHealth::Fail);
}
