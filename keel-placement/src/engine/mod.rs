mod flatten;
mod vertical;

#[cfg(test)]
mod flatten_test;

pub use vertical::VerticalLayout;

use keel_core::TaskKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::demand::TopicDemand;
use crate::ledger::ResourceLedger;

/// Which rule placed a partition during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Recorded owner is alive and still reports the partition
    Stable,
    /// Recorded owner is alive but its self-report disagrees
    Recovered,
    /// A broker already holds data nobody else claims
    Orphaned,
    /// Most-free-resource greedy fill
    Greedy,
    /// Vertical strategy, preferred ordinal
    Preferred,
    /// Vertical strategy, spillover to the highest live ordinal
    Spillover,
}

/// Result of one engine invocation: where every offered partition should go.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlacementPlan {
    targets: BTreeMap<TaskKey, String>,
    placed_by: BTreeMap<TaskKey, Phase>,
    waiting: BTreeSet<TaskKey>,
}

impl PlacementPlan {
    fn assign(&mut self, key: TaskKey, broker: &str, phase: Phase) {
        self.waiting.remove(&key);
        self.placed_by.insert(key.clone(), phase);
        self.targets.insert(key, broker.to_string());
    }

    fn wait(&mut self, key: TaskKey) {
        if !self.targets.contains_key(&key) {
            self.waiting.insert(key);
        }
    }

    pub fn target(&self, key: &TaskKey) -> Option<&str> {
        self.targets.get(key).map(String::as_str)
    }

    pub fn is_placed(&self, key: &TaskKey) -> bool {
        self.targets.contains_key(key)
    }

    pub fn phase(&self, key: &TaskKey) -> Option<Phase> {
        self.placed_by.get(key).copied()
    }

    pub fn targets(&self) -> &BTreeMap<TaskKey, String> {
        &self.targets
    }

    pub fn waiting(&self) -> &BTreeSet<TaskKey> {
        &self.waiting
    }

    /// Number of placements made by each phase.
    pub fn phase_counts(&self) -> BTreeMap<Phase, usize> {
        let mut counts = BTreeMap::new();
        for phase in self.placed_by.values() {
            *counts.entry(*phase).or_insert(0) += 1;
        }
        counts
    }
}

/// Selects one of the two placement functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Free-resource greedy bin packing
    Flatten,
    /// Deterministic modulo placement inside fixed-size broker groups
    Vertical(VerticalLayout),
}

impl Default for PlacementStrategy {
    fn default() -> Self {
        Self::Flatten
    }
}

/// Pure placement over a tick-scoped ledger.
///
/// The engine never touches the topic table: it reads the offered topics, reserves
/// capacity in `ledger`, and reports its decisions as a `PlacementPlan`.
#[derive(Debug, Clone, Default)]
pub struct PlacementEngine {
    strategy: PlacementStrategy,
}

impl PlacementEngine {
    pub fn new(strategy: PlacementStrategy) -> Self {
        PlacementEngine { strategy }
    }

    /// Places `topics` onto the alive brokers of `ledger`.
    ///
    /// `ledger` must have gone through `prepare_decision` for this tick.
    pub fn place(&self, topics: &[&TopicDemand], ledger: &mut ResourceLedger) -> PlacementPlan {
        let order = linearize(topics);
        let plan = match &self.strategy {
            PlacementStrategy::Flatten => flatten::place(topics, &order, ledger),
            PlacementStrategy::Vertical(layout) => vertical::place(layout, &order, ledger),
        };
        debug!(
            offered = order.len(),
            placed = plan.targets.len(),
            waiting = plan.waiting.len(),
            phases = ?plan.phase_counts(),
            "placement finished"
        );
        plan
    }
}

/// Deterministic visiting order of every offered partition.
///
/// Topics with the largest aggregate demand (`partition_count * resource_cost`) come
/// first, ties broken by topic name; partitions of a topic by index.
pub(crate) fn linearize<'a>(topics: &[&'a TopicDemand]) -> Vec<(&'a TopicDemand, u32)> {
    let mut sorted: Vec<&'a TopicDemand> = topics.to_vec();
    sorted.sort_by(|a, b| {
        b.spec()
            .total_demand()
            .cmp(&a.spec().total_demand())
            .then_with(|| a.name().cmp(b.name()))
    });
    sorted
        .into_iter()
        .flat_map(|topic| (0..topic.partition_count()).map(move |p| (topic, p)))
        .collect()
}

/// Reserves on `broker` and records the placement in `plan`.
fn reserve_on(
    plan: &mut PlacementPlan,
    ledger: &mut ResourceLedger,
    topic: &TopicDemand,
    partition: u32,
    broker: &str,
    group: &str,
    phase: Phase,
) -> bool {
    let reserved = ledger.try_reserve(
        broker,
        topic.name(),
        partition,
        topic.resource_cost(),
        topic.partition_limit(),
        group,
    );
    if reserved {
        plan.assign(TaskKey::new(topic.name(), partition), broker, phase);
    }
    reserved
}
