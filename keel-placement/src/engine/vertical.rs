use keel_core::TaskKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

use super::{reserve_on, Phase, PlacementPlan};
use crate::demand::TopicDemand;
use crate::ledger::ResourceLedger;

/// Expected size of every vertical broker group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerticalLayout {
    /// group name -> number of brokers (`n`) the group is meant to have
    #[serde(default)]
    pub group_sizes: BTreeMap<String, u32>,
    /// Group used for topics without a group tag
    #[serde(default = "default_group")]
    pub default_group: String,
}

fn default_group() -> String {
    "default".to_string()
}

impl Default for VerticalLayout {
    fn default() -> Self {
        VerticalLayout {
            group_sizes: BTreeMap::new(),
            default_group: default_group(),
        }
    }
}

impl VerticalLayout {
    pub fn with_group(mut self, group: impl Into<String>, size: u32) -> Self {
        self.group_sizes.insert(group.into(), size);
        self
    }

    fn group_of<'a>(&'a self, topic: &'a TopicDemand) -> &'a str {
        topic.group().unwrap_or(self.default_group.as_str())
    }
}

// Partition p of a topic in group G with n configured brokers prefers ordinal p mod n.
// Preferred reservations for the whole tick are made first, then the leftovers spill
// over to the highest live ordinal that accepts them. Since the preferred ordinal is
// re-evaluated every tick, placement returns to p mod n as soon as the broker is back.
pub(super) fn place(
    layout: &VerticalLayout,
    order: &[(&TopicDemand, u32)],
    ledger: &mut ResourceLedger,
) -> PlacementPlan {
    let mut plan = PlacementPlan::default();

    // group -> ordinal -> broker name, alive brokers only
    let mut live: BTreeMap<String, BTreeMap<u32, String>> = BTreeMap::new();
    for broker in ledger.alive_brokers() {
        if let (Some(group), Some(ordinal)) = (broker.group(), broker.ordinal()) {
            live.entry(group.to_string())
                .or_default()
                .insert(ordinal, broker.name().to_string());
        }
    }

    let mut spill: Vec<(&TopicDemand, u32)> = Vec::new();
    for &(topic, p) in order {
        let group = layout.group_of(topic);
        let key = TaskKey::new(topic.name(), p);
        let (Some(&n), Some(members)) = (layout.group_sizes.get(group), live.get(group)) else {
            trace!(topic = %topic.name(), group = %group, "no configured size or live broker for group");
            plan.wait(key);
            continue;
        };
        if n == 0 || members.is_empty() {
            plan.wait(key);
            continue;
        }
        let preferred = p % n;
        let placed = match members.get(&preferred) {
            Some(broker) => reserve_on(&mut plan, ledger, topic, p, broker, group, Phase::Preferred),
            None => false,
        };
        if !placed {
            spill.push((topic, p));
        }
    }

    for (topic, p) in spill {
        let group = layout.group_of(topic);
        let key = TaskKey::new(topic.name(), p);
        let placed = live
            .get(group)
            .map(|members| {
                members
                    .values()
                    .rev()
                    .any(|broker| reserve_on(&mut plan, ledger, topic, p, broker, group, Phase::Spillover))
            })
            .unwrap_or(false);
        if !placed {
            plan.wait(key);
        }
    }

    plan
}
