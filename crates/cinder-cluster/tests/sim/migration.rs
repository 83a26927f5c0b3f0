//! Moving a slot between live masters.

use std::time::Duration;

use cinder_cluster::{ClusterError, Route};

use crate::helpers::{key_in_slot, route_key, Keys, Sim};

const A: usize = 0;
const C: usize = 1;
const D: usize = 2;

#[test]
fn slot_moves_with_ask_then_moved() {
    let mut sim = Sim::new(3);
    sim.spread_slots(&[A, C, D]);
    sim.join_all();
    let a = sim.name(A);
    let d = sim.name(D);
    let d_addr = Sim::addr(D).client_addr();

    let key = key_in_slot(7);
    let other = (0u32..)
        .map(|i| format!("other:{i}").into_bytes())
        .find(|k| cinder_cluster::key_slot(k) == 7)
        .unwrap();
    let mut a_keys = Keys(vec![key.clone()]);
    sim.state_mut(A).key_added(7);
    let d_keys = Keys::default();

    sim.state_mut(D).begin_import(7, &a).unwrap();
    sim.state_mut(A).begin_migration(7, &d).unwrap();

    // the source still serves what it has and redirects the rest
    assert_eq!(route_key(sim.state(A), &key, &a_keys, false), Route::Local);
    assert_eq!(
        route_key(sim.state(A), &other, &a_keys, false),
        Route::Ask { slot: 7, addr: d_addr }
    );

    // the source can't let go while it holds keys
    let now = sim.now;
    assert!(matches!(
        sim.state_mut(A).complete_migration(7, now),
        Err(ClusterError::KeysRemaining { slot: 7, keys: 1 })
    ));

    assert_eq!(sim.state_mut(A).migrate_keys(7, &mut a_keys, 100).unwrap(), 1);
    assert_eq!(sim.state(A).keys_in_slot(7), 0);
    assert_eq!(
        route_key(sim.state(A), &key, &a_keys, false),
        Route::Ask { slot: 7, addr: d_addr }
    );

    // the destination only serves the slot to clients that sent ASKING
    assert!(matches!(
        route_key(sim.state(D), &key, &d_keys, false),
        Route::Moved { slot: 7, .. }
    ));
    assert_eq!(route_key(sim.state(D), &key, &d_keys, true), Route::Local);

    let out = sim.state_mut(A).complete_migration(7, now).unwrap();
    sim.apply(A, out);
    let out = sim.state_mut(D).complete_migration(7, now).unwrap();
    sim.apply(D, out);
    sim.run_for(Duration::from_secs(2));

    for i in [A, C, D] {
        let state = sim.state(i);
        assert_eq!(state.slot_owner(7), Some(d), "node {i}");
        assert_eq!(state.migrating_to(7), None);
        assert_eq!(state.importing_from(7), None);
    }
    assert_eq!(
        route_key(sim.state(A), &key, &a_keys, false),
        Route::Moved { slot: 7, addr: d_addr }
    );
    assert_eq!(route_key(sim.state(D), &key, &d_keys, false), Route::Local);
    // the rest of the range stays put
    assert_eq!(sim.state(C).slot_owner(8), Some(a));

    // completing again changes nothing
    let now = sim.now;
    let epoch = sim.state(A).current_epoch();
    assert!(sim.state_mut(A).complete_migration(7, now).unwrap().is_empty());
    assert_eq!(sim.state(A).current_epoch(), epoch);
    assert_eq!(sim.state(A).slot_owner(7), Some(d));
}
