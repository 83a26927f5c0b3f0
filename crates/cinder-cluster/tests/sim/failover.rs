//! Automatic and manual failover.

use std::time::Duration;

use cinder_cluster::{Action, ClusterHealth, ManualFailoverMode, Route};

use crate::helpers::{key_in_slot, route_key, Keys, Sim};

const A: usize = 0;
const B: usize = 1;
const C: usize = 2;
const D: usize = 3;

/// Masters A, C and D; B replicates A.
fn cluster_with_replica() -> Sim {
    let mut sim = Sim::new(4);
    sim.spread_slots(&[A, C, D]);
    sim.join_all();
    let primary = sim.name(A);
    let out = sim.state_mut(B).replicate(&primary).unwrap();
    sim.apply(B, out);
    sim.run_for(Duration::from_secs(2));
    assert!(sim.state(B).myself().is_replica());
    sim
}

fn max_epoch(sim: &Sim) -> u64 {
    (0..sim.nodes.len())
        .map(|i| sim.state(i).current_epoch())
        .max()
        .unwrap_or(0)
}

#[test]
fn replica_takes_over_failed_master() {
    let mut sim = cluster_with_replica();
    let a = sim.name(A);
    let b = sim.name(B);
    let before = max_epoch(&sim);
    assert_eq!(sim.state(C).slot_owner(50), Some(a));

    sim.stop(A);
    let promoted = sim.run_until(Duration::from_secs(15), |sim| {
        sim.state(B).myself().is_primary()
    });
    assert!(promoted, "replica never won the election");
    sim.run_for(Duration::from_secs(2));

    let me = sim.state(B).myself();
    assert_eq!(me.config_epoch, before + 1);
    for i in [B, C, D] {
        let state = sim.state(i);
        assert!(state.node(&a).unwrap().failed(), "node {i}");
        assert_eq!(state.slot_owner(0), Some(b), "node {i}");
        assert_eq!(state.slot_owner(100), Some(b), "node {i}");
        assert_eq!(state.health(), ClusterHealth::Ok, "node {i}");
    }
    assert!(sim.nodes[B]
        .effects
        .contains(&Action::Replicate { primary: None }));

    let key = key_in_slot(50);
    assert_eq!(route_key(sim.state(B), &key, &Keys::default(), false), Route::Local);
    assert!(matches!(
        route_key(sim.state(C), &key, &Keys::default(), false),
        Route::Moved { slot: 50, .. }
    ));
}

#[test]
fn only_one_replica_wins() {
    const E: usize = 4;
    let mut sim = Sim::new(5);
    sim.spread_slots(&[A, C, D]);
    sim.join_all();
    let a = sim.name(A);
    for replica in [B, E] {
        let out = sim.state_mut(replica).replicate(&a).unwrap();
        sim.apply(replica, out);
    }
    sim.state_mut(B).set_replication_offset(100);
    sim.state_mut(E).set_replication_offset(50);
    sim.run_for(Duration::from_secs(2));

    sim.stop(A);
    sim.run_for(Duration::from_secs(15));

    let winners: Vec<usize> = [B, E]
        .into_iter()
        .filter(|&i| sim.state(i).myself().is_primary())
        .collect();
    assert_eq!(winners.len(), 1, "exactly one replica is promoted");
    let winner = winners[0];
    let loser = if winner == B { E } else { B };
    let winner_name = sim.name(winner);

    assert_eq!(
        sim.state(loser).myself().replicates,
        Some(winner_name),
        "the other replica follows the winner"
    );
    for i in [B, C, D, E] {
        assert_eq!(sim.state(i).slot_owner(0), Some(winner_name), "node {i}");
    }
    for voter in [C, D] {
        assert!(sim.state(voter).last_vote_epoch() > 0);
    }
}

#[test]
fn manual_failover_swaps_roles() {
    let mut sim = cluster_with_replica();
    let a = sim.name(A);
    let b = sim.name(B);

    let now = sim.now;
    let out = sim
        .state_mut(B)
        .manual_failover(ManualFailoverMode::Default, now)
        .unwrap();
    sim.apply(B, out);
    let swapped = sim.run_until(Duration::from_secs(5), |sim| {
        sim.state(A).myself().replicates == Some(b)
    });
    assert!(swapped, "old master never became a replica");

    assert!(sim.state(B).myself().is_primary());
    assert_eq!(sim.state(B).slot_owner(0), Some(b));
    assert!(!sim.state(C).node(&a).unwrap().failed());

    let effects = &sim.nodes[A].effects;
    let paused = effects
        .iter()
        .position(|e| matches!(e, Action::PauseWrites { .. }));
    let resumed = effects.iter().position(|e| *e == Action::ResumeWrites);
    assert!(paused.is_some() && resumed.is_some());
    assert!(paused < resumed);
}

#[test]
fn takeover_needs_no_votes() {
    let mut sim = cluster_with_replica();
    let b = sim.name(B);
    sim.stop(C);
    sim.stop(D);

    let now = sim.now;
    let out = sim
        .state_mut(B)
        .manual_failover(ManualFailoverMode::Takeover, now)
        .unwrap();
    sim.apply(B, out);
    sim.run_for(Duration::from_secs(1));

    assert!(sim.state(B).myself().is_primary());
    assert_eq!(sim.state(A).slot_owner(0), Some(b));
    assert_eq!(sim.state(A).myself().replicates, Some(b));
}
