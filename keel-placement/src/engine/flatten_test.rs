//! Unit Tests for Flatten Placement
//!
//! Covers the four placement phases, the churn guarantees (stability, idempotence)
//! and the ledger invariants under greedy fill.

use super::*;
use crate::test_support::*;
use keel_core::TopicSpec;

fn flatten() -> PlacementEngine {
    PlacementEngine::new(PlacementStrategy::Flatten)
}

/// **Test:** Greedy Fill Picks The Most Free Broker
///
/// **Expectation:** With free resource [9900, 9930, 9950], an unassigned partition
/// costing 50 lands on the broker with 9950 free.
#[test]
fn test_greedy_fill_most_free() {
    let table = table(vec![TopicSpec::new("t1", 1, 50, 1)]);
    let mut ledger = ResourceLedger::new(vec![
        alive(report("b1", 9900)),
        alive(report("b2", 9930)),
        alive(report("b3", 9950)),
    ]);

    let plan = flatten().place(&offered(&table), &mut ledger);

    let key = TaskKey::new("t1", 0);
    assert_eq!(plan.target(&key), Some("b3"));
    assert_eq!(plan.phase(&key), Some(Phase::Greedy));
    assert_eq!(ledger.get("b3").unwrap().free_resource(), 9900);
}

/// **Test:** Stable Reuse Beats Free Resource
///
/// **Reason:** Churn minimization: a partition served by a live broker with room
/// must not move just because another broker has more free resource.
#[test]
fn test_stable_owner_is_kept() {
    let mut table = table(vec![TopicSpec::new("t1", 1, 10, 1)]);
    record_owner(&mut table, "t1", 0, "b1");
    let mut ledger = ResourceLedger::new(vec![
        alive(report("b1", 100).serving("t1", 0)),
        alive(report("b2", 1000)),
    ]);

    let plan = flatten().place(&offered(&table), &mut ledger);

    let key = TaskKey::new("t1", 0);
    assert_eq!(plan.target(&key), Some("b1"));
    assert_eq!(plan.phase(&key), Some(Phase::Stable));
}

/// **Test:** Unconfirmed Handoff Keeps Its Target
///
/// **Reason:** A partition handed to a broker that has not reported it yet must not
/// be pulled to another broker that became more attractive meanwhile.
///
/// **Expectation:** Nobody owns t1#0, its previous target b2 still has room, so it
/// stays on b2 even though b1 has more free resource.
#[test]
fn test_previous_target_is_kept_until_confirmed() {
    let mut table = table(vec![TopicSpec::new("t1", 1, 10, 1)]);
    record_target(&mut table, "t1", 0, "b2");
    let mut ledger = ResourceLedger::new(vec![alive(report("b1", 1000)), alive(report("b2", 100))]);

    let plan = flatten().place(&offered(&table), &mut ledger);

    let key = TaskKey::new("t1", 0);
    assert_eq!(plan.target(&key), Some("b2"));
    assert_eq!(plan.phase(&key), Some(Phase::Greedy));
}

/// **Test:** Previous Target Without Room Falls Back To Greedy Fill
#[test]
fn test_full_previous_target_falls_back_to_most_free() {
    let mut table = table(vec![TopicSpec::new("t1", 1, 10, 1)]);
    record_target(&mut table, "t1", 0, "b2");
    let mut ledger = ResourceLedger::new(vec![alive(report("b1", 100)), alive(report("b2", 5))]);

    let plan = flatten().place(&offered(&table), &mut ledger);
    assert_eq!(plan.target(&TaskKey::new("t1", 0)), Some("b1"));
}

/// **Test:** Resource Exhaustion Leaves The Partition Waiting
#[test]
fn test_exhausted_partition_waits() {
    let table = table(vec![TopicSpec::new("t1", 1, 100, 1)]);
    let mut ledger = ResourceLedger::new(vec![alive(report("b1", 50)), alive(report("b2", 50))]);

    let plan = flatten().place(&offered(&table), &mut ledger);

    let key = TaskKey::new("t1", 0);
    assert_eq!(plan.target(&key), None);
    assert!(plan.waiting().contains(&key));
    assert_eq!(ledger.get("b1").unwrap().free_resource(), 50);
    assert_eq!(ledger.get("b2").unwrap().free_resource(), 50);
}

/// **Test:** Recovery Reuse After A Broker Restart
///
/// **Reason:** A restarted broker forgets its tasks; the recorded mapping is
/// re-established so the broker is told to load the partition again.
#[test]
fn test_recorded_owner_recovers_after_restart() {
    let mut table = table(vec![TopicSpec::new("t1", 1, 10, 1)]);
    record_owner(&mut table, "t1", 0, "b1");
    let mut ledger = ResourceLedger::new(vec![alive(report("b1", 100)), alive(report("b2", 1000))]);

    let plan = flatten().place(&offered(&table), &mut ledger);

    let key = TaskKey::new("t1", 0);
    assert_eq!(plan.target(&key), Some("b1"));
    assert_eq!(plan.phase(&key), Some(Phase::Recovered));
}

/// **Test:** Orphan Reuse Of Resident Data
///
/// **Expectation:** A partition with no recorded owner that a broker already holds
/// is kept there instead of being loaded on the most free broker.
#[test]
fn test_orphan_stays_where_data_lives() {
    let table = table(vec![TopicSpec::new("t1", 2, 10, 2)]);
    let mut ledger = ResourceLedger::new(vec![
        alive(report("b1", 1000)),
        alive(report("b2", 100).serving("t1", 1)),
    ]);

    let plan = flatten().place(&offered(&table), &mut ledger);

    let key = TaskKey::new("t1", 1);
    assert_eq!(plan.target(&key), Some("b2"));
    assert_eq!(plan.phase(&key), Some(Phase::Orphaned));
    assert_eq!(plan.target(&TaskKey::new("t1", 0)), Some("b1"));
}

/// **Test:** Orphan Reuse Ignores Data Recorded Elsewhere
///
/// **Expectation:** When the recorded owner is a different (dead) broker, a stale
/// copy on another broker does not win; greedy fill decides.
#[test]
fn test_orphan_requires_matching_prior_owner() {
    let mut table = table(vec![TopicSpec::new("t1", 1, 10, 1)]);
    record_owner(&mut table, "t1", 0, "b1");
    let mut ledger = ResourceLedger::new(vec![
        dead(report("b1", 100).serving("t1", 0)),
        alive(report("b2", 100).serving("t1", 0)),
        alive(report("b3", 500)),
    ]);

    let plan = flatten().place(&offered(&table), &mut ledger);

    let key = TaskKey::new("t1", 0);
    assert_eq!(plan.target(&key), Some("b3"));
    assert_eq!(plan.phase(&key), Some(Phase::Greedy));
}

/// **Test:** Dead Owner Triggers Failover
#[test]
fn test_dead_owner_is_replaced() {
    let mut table = table(vec![TopicSpec::new("t1", 1, 10, 1)]);
    record_owner(&mut table, "t1", 0, "b1");
    let mut ledger = ResourceLedger::new(vec![
        dead(report("b1", 1000).serving("t1", 0)),
        alive(report("b2", 100)),
    ]);

    let plan = flatten().place(&offered(&table), &mut ledger);
    assert_eq!(plan.target(&TaskKey::new("t1", 0)), Some("b2"));
}

/// **Test:** Greedy Fill Re-Keys After Every Reservation
///
/// **Expectation:** Two equal brokers alternate: the order structure is updated after
/// each reservation, so the next partition sees the other broker as most free.
#[test]
fn test_greedy_fill_alternates_between_equal_brokers() {
    let table = table(vec![TopicSpec::new("t1", 4, 10, 4)]);
    let mut ledger = ResourceLedger::new(vec![alive(report("b1", 100)), alive(report("b2", 100))]);

    let plan = flatten().place(&offered(&table), &mut ledger);

    let targets: Vec<_> = (0..4)
        .map(|p| plan.target(&TaskKey::new("t1", p)).unwrap())
        .collect();
    assert_eq!(targets, vec!["b1", "b2", "b1", "b2"]);
}

/// **Test:** Larger Topics Are Placed First
///
/// **Expectation:** When only one topic fits, the one with the larger aggregate
/// demand gets the room regardless of its name.
#[test]
fn test_larger_demand_is_visited_first() {
    let table = table(vec![
        TopicSpec::new("a-small", 1, 30, 1),
        TopicSpec::new("z-large", 2, 30, 2),
    ]);
    let mut ledger = ResourceLedger::new(vec![alive(report("b1", 60))]);

    let plan = flatten().place(&offered(&table), &mut ledger);

    assert_eq!(plan.target(&TaskKey::new("z-large", 0)), Some("b1"));
    assert_eq!(plan.target(&TaskKey::new("z-large", 1)), Some("b1"));
    assert!(plan.waiting().contains(&TaskKey::new("a-small", 0)));
}

/// **Test:** Group-Tagged Topics Stay In Their Group
#[test]
fn test_group_affinity() {
    let table = table(vec![TopicSpec::new("t1", 3, 10, 3).with_group("analytics")]);
    let mut ledger = ResourceLedger::new(vec![
        alive(report("plain", 10_000)),
        alive(report("analytics##0", 100)),
        alive(report("billing##0", 10_000)),
    ]);

    let plan = flatten().place(&offered(&table), &mut ledger);

    for p in 0..3 {
        assert_eq!(plan.target(&TaskKey::new("t1", p)), Some("analytics##0"));
    }
    assert_ledger_invariants(&table, &ledger);
}

/// **Test:** Idempotence
///
/// **Expectation:** Identical topic and broker snapshots yield identical plans.
#[test]
fn test_unchanged_inputs_give_unchanged_plan() {
    let mut table = table(vec![
        TopicSpec::new("orders", 6, 20, 2),
        TopicSpec::new("payments", 3, 35, 1),
        TopicSpec::new("logs", 8, 5, 8),
    ]);
    record_owner(&mut table, "orders", 0, "b2");
    let brokers = vec![
        alive(report("b1", 120).serving("logs", 3)),
        alive(report("b2", 150).serving("orders", 0)),
        alive(report("b3", 90)),
    ];

    let mut first = ResourceLedger::new(brokers.clone());
    let mut second = ResourceLedger::new(brokers);
    let plan_a = flatten().place(&offered(&table), &mut first);
    let plan_b = flatten().place(&offered(&table), &mut second);

    assert_eq!(plan_a, plan_b);
    assert_ledger_invariants(&table, &first);
}

/// **Test:** Stability Across Ticks
///
/// **Reason:** Once brokers confirm what they were given, adding a much larger broker
/// must not move anything.
#[test]
fn test_confirmed_placement_survives_new_broker() {
    let mut table = table(vec![TopicSpec::new("orders", 4, 20, 2), TopicSpec::new("logs", 2, 10, 2)]);
    let mut ledger = ResourceLedger::new(vec![alive(report("b1", 100)), alive(report("b2", 100))]);
    let first = flatten().place(&offered(&table), &mut ledger);

    // brokers confirm their targets, the scheduler records the owners
    let mut reports = vec![report("b1", 100), report("b2", 100)];
    for (key, broker) in first.targets() {
        let idx = if broker == "b1" { 0 } else { 1 };
        reports[idx] = reports[idx].clone().serving(key.topic.clone(), key.partition);
        record_owner(&mut table, &key.topic, key.partition, broker);
    }
    let mut brokers: Vec<_> = reports.into_iter().map(alive).collect();
    brokers.push(alive(report("b9", 10_000)));
    let mut ledger = ResourceLedger::new(brokers);

    let second = flatten().place(&offered(&table), &mut ledger);

    assert_eq!(first.targets(), second.targets());
    assert!(second.phase_counts().keys().all(|p| *p == Phase::Stable));
}

/// **Test:** Invariants Under Pressure
///
/// **Expectation:** With more demand than capacity, every broker stays within its
/// capacity and per-topic limit, and every offered partition is either placed or waiting.
#[test]
fn test_invariants_hold_when_oversubscribed() {
    let table = table(vec![
        TopicSpec::new("a", 10, 25, 3),
        TopicSpec::new("b", 7, 40, 2),
        TopicSpec::new("c", 12, 10, 5).with_group("edge"),
    ]);
    let mut ledger = ResourceLedger::new(vec![
        alive(report("b1", 200)),
        alive(report("b2", 150)),
        alive(report("edge##0", 60)),
        alive(report("edge##1", 45)),
    ]);

    let plan = flatten().place(&offered(&table), &mut ledger);

    assert_ledger_invariants(&table, &ledger);
    assert_eq!(plan.targets().len() + plan.waiting().len(), 29);
    assert!(!plan.waiting().is_empty());
}
