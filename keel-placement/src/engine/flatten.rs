use keel_core::TaskKey;
use std::collections::HashMap;

use super::{reserve_on, Phase, PlacementPlan};
use crate::demand::TopicDemand;
use crate::ledger::ResourceLedger;

// Flatten placement runs four phases, each one only sees what the previous ones left:
//
//   A. stable reuse    - recorded owner alive and confirming
//   B. recovery reuse  - recorded owner alive, self-report disagrees (e.g. restart)
//   C. orphan reuse    - a broker holds data of a partition nobody else is recorded on
//   D. greedy fill     - previous target if it still fits, else most free resource
//                        first, in linearized order
//
// A partition that survives D unplaced is WAITING until the next tick.
pub(super) fn place(
    topics: &[&TopicDemand],
    order: &[(&TopicDemand, u32)],
    ledger: &mut ResourceLedger,
) -> PlacementPlan {
    let mut plan = PlacementPlan::default();
    let mut pending: Vec<(&TopicDemand, u32)> = order.to_vec();

    // Phase A
    pending.retain(|&(topic, p)| {
        let Some(owner) = recorded_owner(topic, p) else {
            return true;
        };
        let key = TaskKey::new(topic.name(), p);
        let confirmed = ledger
            .get(owner)
            .map(|b| b.is_alive() && b.confirms(&key))
            .unwrap_or(false);
        !(confirmed && reserve_on(&mut plan, ledger, topic, p, owner, topic.spec().group_tag(), Phase::Stable))
    });

    // Phase B
    pending.retain(|&(topic, p)| {
        let Some(owner) = recorded_owner(topic, p) else {
            return true;
        };
        !(ledger.is_alive(owner)
            && reserve_on(&mut plan, ledger, topic, p, owner, topic.spec().group_tag(), Phase::Recovered))
    });

    // Phase C
    let known: HashMap<&str, &TopicDemand> = topics.iter().map(|t| (t.name(), *t)).collect();
    let holders: Vec<(String, Vec<TaskKey>)> = ledger
        .alive_brokers()
        .map(|b| {
            let held = b
                .current_task_set()
                .iter()
                .filter(|(_, task)| task.state.confirms_ownership())
                .map(|(key, _)| key.clone())
                .collect();
            (b.name().to_string(), held)
        })
        .collect();
    for (broker, held) in &holders {
        for key in held {
            let Some(topic) = known.get(key.topic.as_str()) else {
                continue;
            };
            if key.partition >= topic.partition_count() || plan.is_placed(key) {
                continue;
            }
            let prior = recorded_owner(topic, key.partition);
            if prior.map_or(true, |prior| prior == broker) {
                reserve_on(
                    &mut plan,
                    ledger,
                    topic,
                    key.partition,
                    broker,
                    topic.spec().group_tag(),
                    Phase::Orphaned,
                );
            }
        }
    }

    // Phase D
    for (topic, p) in pending {
        let key = TaskKey::new(topic.name(), p);
        if plan.is_placed(&key) {
            continue;
        }
        // a partition handed to a broker that has not confirmed it yet stays there
        if let Some(previous) = previous_target(topic, p) {
            if reserve_on(&mut plan, ledger, topic, p, previous, topic.spec().group_tag(), Phase::Greedy) {
                continue;
            }
        }
        let chosen = ledger.reserve_most_free(
            topic.name(),
            p,
            topic.resource_cost(),
            topic.partition_limit(),
            topic.spec().group_tag(),
        );
        match chosen {
            Some(broker) => plan.assign(key, &broker, Phase::Greedy),
            None => plan.wait(key),
        }
    }

    plan
}

fn recorded_owner(topic: &TopicDemand, partition: u32) -> Option<&str> {
    topic.partition(partition)?.current_broker()
}

fn previous_target(topic: &TopicDemand, partition: u32) -> Option<&str> {
    topic.partition(partition)?.target_broker()
}
