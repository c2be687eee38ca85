use keel_core::{BrokerReport, TaskKey, TopicSpec};
use std::time::{Duration, Instant};

use crate::demand::{TopicDemand, TopicTable};
use crate::ledger::{BrokerLedger, ResourceLedger};

pub(crate) const UNKNOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// A broker whose last heartbeat is fresh.
pub(crate) fn alive(report: BrokerReport) -> BrokerLedger {
    let now = Instant::now();
    let mut broker = BrokerLedger::from_report(report, now);
    broker.prepare_decision(now, UNKNOWN_TIMEOUT);
    broker
}

/// A broker that has not been heard of for a minute.
pub(crate) fn dead(report: BrokerReport) -> BrokerLedger {
    let then = Instant::now();
    let mut broker = BrokerLedger::from_report(report, then);
    broker.prepare_decision(then + Duration::from_secs(60), UNKNOWN_TIMEOUT);
    broker
}

pub(crate) fn report(name: &str, capacity: u64) -> BrokerReport {
    BrokerReport::new(name, format!("{}:6650", name), "v1", capacity)
}

pub(crate) fn table(specs: Vec<TopicSpec>) -> TopicTable {
    let mut table = TopicTable::new();
    table.sync(specs);
    table
}

pub(crate) fn record_owner(table: &mut TopicTable, topic: &str, partition: u32, broker: &str) {
    if let Some(slot) = table.slot_mut(&TaskKey::new(topic, partition)) {
        slot.set_current_broker(Some(broker.to_string()));
    }
}

pub(crate) fn record_target(table: &mut TopicTable, topic: &str, partition: u32, broker: &str) {
    if let Some(slot) = table.slot_mut(&TaskKey::new(topic, partition)) {
        slot.set_target_broker(Some(broker.to_string()));
    }
}

pub(crate) fn offered(table: &TopicTable) -> Vec<&TopicDemand> {
    table.iter().collect()
}

/// Sum of resource cost targeted on each broker never exceeds its capacity,
/// and no topic exceeds its per-broker limit.
pub(crate) fn assert_ledger_invariants(table: &TopicTable, ledger: &ResourceLedger) {
    for broker in ledger.brokers() {
        let mut used = 0;
        let mut per_topic = std::collections::HashMap::new();
        for key in broker.target_task_set() {
            let topic = table.get(&key.topic).expect("targeted topic is known");
            used += topic.resource_cost();
            *per_topic.entry(key.topic.clone()).or_insert(0u32) += 1;
            if let Some(group) = topic.group() {
                assert_eq!(broker.group(), Some(group), "group invariant on {}", broker.name());
            }
        }
        assert!(used <= broker.capacity(), "capacity invariant on {}", broker.name());
        for (topic, count) in per_topic {
            let limit = table.get(&topic).unwrap().partition_limit();
            assert!(count <= limit, "limit invariant for {} on {}", topic, broker.name());
        }
    }
}
