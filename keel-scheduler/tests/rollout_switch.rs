mod common;

use common::*;
use keel_core::{PartitionStatus, TaskKey, TopicSpec};
use keel_scheduler::{RoleConfig, RolloutPhase, ServiceConfiguration};
use std::collections::BTreeMap;
use std::time::Duration;

fn rollout_config(target: Option<&str>, expected: &[(&str, u32)], threshold: f64) -> ServiceConfiguration {
    ServiceConfiguration {
        health_gate_threshold: threshold,
        roles: vec![RoleConfig {
            name: "default".to_string(),
            current_version: "v1".to_string(),
            target_version: target.map(str::to_string),
            expected_brokers: expected
                .iter()
                .map(|(version, count)| (version.to_string(), *count))
                .collect::<BTreeMap<_, _>>(),
        }],
        ..ServiceConfiguration::default()
    }
}

/// **Test:** Health Gate Blocks An Unhealthy Target Fleet
///
/// **Expectation:** The target version expects 10 brokers but only 6 are alive with a
/// 0.8 threshold: no switch happens and the old fleet keeps serving.
#[tokio::test]
async fn test_unhealthy_target_fleet_is_not_switched_to() {
    let config = rollout_config(Some("v2"), &[("v1", 2), ("v2", 10)], 0.8);
    let mut h = harness(config, vec![TopicSpec::new("t1", 4, 10, 4)]);

    let mut reports = vec![broker("old-0", "v1", 100), broker("old-1", "v1", 100)];
    reports.extend((0..6).map(|i| broker(&format!("new-{}", i), "v2", 100)));
    h.beat(reports).await;

    let report = h.tick().await;
    let report_next = h.tick().await;

    assert!(report.skipped.is_empty());
    assert!(report_next.finalized.is_empty());
    for p in 0..4 {
        let target = h.coordinator.state().target(&TaskKey::new("t1", p)).unwrap();
        assert!(target.starts_with("old-"), "t1#{} placed on {}", p, target);
    }
    assert_eq!(h.dispatch_count("new-0"), 0);
    let rollout = h.coordinator.state().rollout("default").unwrap();
    assert_eq!(rollout.phase(), RolloutPhase::Switching);
    assert_eq!(rollout.current_version(), Some("v1"));
    assert_eq!(h.sink.rollout("default"), None);
}

/// **Test:** No Qualified Subset
///
/// **Expectation:** When neither fleet passes the gate the role is skipped and
/// nothing is dispatched or published.
#[tokio::test]
async fn test_role_is_skipped_without_a_healthy_subset() {
    let config = rollout_config(None, &[("v1", 5)], 0.8);
    let mut h = harness(config, vec![TopicSpec::new("t1", 2, 10, 2)]);
    h.beat(vec![broker("old-0", "v1", 100), broker("old-1", "v1", 100)])
        .await;

    let report = h.tick().await;

    assert_eq!(report.skipped, vec!["default".to_string()]);
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.published, 0);
    assert!(h.sink.transitions().await.is_empty());
}

/// **Test:** Full Version Switch
///
/// **Expectation:** The old fleet is drained, the new fleet only receives partitions
/// once the old brokers released them, and the switch is finalized and persisted at
/// the start of the tick following the one where the old fleet became empty.
#[tokio::test]
async fn test_switch_drains_old_fleet_then_completes() {
    let config = rollout_config(None, &[("v1", 2)], 0.5);
    let mut h = harness(config, vec![TopicSpec::new("t1", 2, 10, 2)]);

    h.beat(vec![broker("old-0", "v1", 100), broker("old-1", "v1", 100)])
        .await;
    h.tick().await;
    h.beat(vec![
        confirming(broker("old-0", "v1", 100), h.last_payload("old-0")),
        confirming(broker("old-1", "v1", 100), h.last_payload("old-1")),
    ])
    .await;
    h.tick().await;
    assert_eq!(
        h.coordinator.state().status(&TaskKey::new("t1", 0)),
        Some(PartitionStatus::Serving)
    );

    // three v2 brokers expected, two are up: 2 >= 3 * 0.5
    h.coordinator.set_target("default", "v2", 3);
    h.beat(vec![broker("new-0", "v2", 100), broker("new-1", "v2", 100)])
        .await;
    let report = h.tick().await;

    assert!(report.finalized.is_empty());
    for p in 0..2 {
        let key = TaskKey::new("t1", p);
        assert!(h.coordinator.state().target(&key).unwrap().starts_with("new-"));
        assert_eq!(
            h.coordinator.state().status(&key),
            Some(PartitionStatus::Migrating)
        );
    }
    assert!(h.last_payload("old-0").unwrap().is_drain());
    assert!(h.last_payload("old-1").unwrap().is_drain());
    assert!(h.last_payload("new-0").unwrap().is_drain());
    assert_eq!(
        h.coordinator.state().rollout("default").unwrap().phase(),
        RolloutPhase::Switching
    );

    // old fleet released everything
    h.beat(vec![broker("old-0", "v1", 100), broker("old-1", "v1", 100)])
        .await;
    let report = h.tick().await;
    assert!(report.finalized.is_empty());
    assert_eq!(
        h.coordinator.state().status(&TaskKey::new("t1", 0)),
        Some(PartitionStatus::Loading)
    );
    assert_eq!(task_names(&h.last_payload("new-0").unwrap()), vec!["t1#0"]);
    assert_eq!(task_names(&h.last_payload("new-1").unwrap()), vec!["t1#1"]);

    let report = h.tick().await;
    assert_eq!(report.finalized, vec!["default".to_string()]);
    assert_eq!(h.sink.rollout("default").as_deref(), Some("v2"));
    let rollout = h.coordinator.state().rollout("default").unwrap();
    assert_eq!(rollout.phase(), RolloutPhase::Stable);
    assert_eq!(rollout.current_version(), Some("v2"));
    // the stable role keeps the partitions where the switch put them
    assert_eq!(task_names(&h.last_payload("new-0").unwrap()), vec!["t1#0"]);
}

/// **Test:** Cancelling A Switch
#[tokio::test]
async fn test_setting_current_version_cancels_switch() {
    let config = rollout_config(Some("v2"), &[("v1", 1), ("v2", 1)], 0.8);
    let mut h = harness(config, vec![TopicSpec::new("t1", 1, 10, 1)]);
    h.beat(vec![broker("old-0", "v1", 100)]).await;

    h.coordinator.set_target("default", "v1", 1);
    h.tick().await;

    let rollout = h.coordinator.state().rollout("default").unwrap();
    assert_eq!(rollout.phase(), RolloutPhase::Stable);
    assert_eq!(
        h.coordinator.state().target(&TaskKey::new("t1", 0)),
        Some("old-0")
    );
}

/// **Test:** No Reclamation While Switching
///
/// **Reason:** A switching role may still need every broker it knows of; dead
/// brokers are only forgotten once the role is stable again.
///
/// **Expectation:** old-1 stays dead past the reclaim timeout while the switch is
/// held open by old-0, and is reclaimed on the first tick after the switch is
/// cancelled.
#[tokio::test]
async fn test_dead_broker_is_kept_while_switching() {
    let config = ServiceConfiguration {
        unknown_timeout: Duration::from_secs(5),
        reclaim_timeout: Duration::from_secs(30),
        ..rollout_config(Some("v2"), &[("v1", 2), ("v2", 3)], 0.5)
    };
    let mut h = harness(config, vec![TopicSpec::new("t1", 1, 10, 1)]);
    h.beat(vec![
        broker("old-0", "v1", 100).serving("t1", 0),
        broker("old-1", "v1", 100),
        broker("new-0", "v2", 100),
        broker("new-1", "v2", 100),
    ])
    .await;
    h.tick().await;

    h.advance(Duration::from_secs(40));
    h.beat(vec![
        broker("old-0", "v1", 100).serving("t1", 0),
        broker("new-0", "v2", 100),
        broker("new-1", "v2", 100),
    ])
    .await;
    let report = h.tick().await;

    assert!(report.reclaimed.is_empty());
    assert!(h.coordinator.state().broker("old-1").unwrap().is_dead());
    assert_eq!(
        h.coordinator.state().rollout("default").unwrap().phase(),
        RolloutPhase::Switching
    );

    h.coordinator.set_target("default", "v1", 2);
    let report = h.tick().await;

    assert_eq!(report.reclaimed, vec!["old-1".to_string()]);
    assert!(h.coordinator.state().broker("old-1").is_none());
}

/// **Test:** Failed Rollout Persistence Is Retried
///
/// **Expectation:** While the rollout store rejects the flip the role stays
/// switching; the next tick after it recovers finalizes the switch.
#[tokio::test]
async fn test_failed_rollout_persistence_is_retried() {
    let config = rollout_config(None, &[("v1", 1)], 0.8);
    let mut h = harness(config, vec![TopicSpec::new("t1", 1, 10, 1)]);
    h.coordinator.set_target("default", "v2", 1);
    h.beat(vec![broker("old-0", "v1", 100), broker("new-0", "v2", 100)])
        .await;

    // the new fleet is complete on the first switching tick
    let report = h.tick().await;
    assert!(report.finalized.is_empty());
    assert_eq!(
        h.coordinator.state().target(&TaskKey::new("t1", 0)),
        Some("new-0")
    );

    h.sink.reject_rollouts(true);
    let report = h.tick().await;
    assert!(report.finalized.is_empty());
    assert_eq!(h.sink.rollout("default"), None);
    let rollout = h.coordinator.state().rollout("default").unwrap();
    assert_eq!(rollout.phase(), RolloutPhase::Switching);
    assert_eq!(rollout.current_version(), Some("v1"));

    h.sink.reject_rollouts(false);
    let report = h.tick().await;
    assert_eq!(report.finalized, vec!["default".to_string()]);
    assert_eq!(h.sink.rollout("default").as_deref(), Some("v2"));
    assert_eq!(
        h.coordinator.state().rollout("default").unwrap().phase(),
        RolloutPhase::Stable
    );
}

/// **Test:** Failed Transition Publication Is Retried
///
/// **Expectation:** Rejected transitions are not remembered as published, so the
/// same transitions go out on the next tick.
#[tokio::test]
async fn test_failed_transition_publication_is_retried() {
    let mut h = harness(
        ServiceConfiguration::default(),
        vec![TopicSpec::new("t1", 2, 10, 2)],
    );
    h.beat(vec![broker("b1", "v1", 100)]).await;

    h.sink.reject_transitions(true);
    let report = h.tick().await;
    assert_eq!(report.published, 0);
    assert!(h.sink.transitions().await.is_empty());
    assert_eq!(report.dispatched, 1);

    h.sink.reject_transitions(false);
    let report = h.tick().await;
    assert_eq!(report.published, 2);
    let transitions = h.sink.transitions().await;
    assert_eq!(transitions.len(), 2);
    assert!(transitions
        .iter()
        .all(|t| t.status == PartitionStatus::Loading
            && t.target_broker.as_deref() == Some("b1:6650")));

    let report = h.tick().await;
    assert_eq!(report.published, 0);
}
