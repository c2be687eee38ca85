use keel_core::{FencingToken, PartitionRange, PartitionStatus, SessionId, TaskKey, TopicSpec};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::ledger::BrokerLedger;

/// Placement record of one partition.
///
/// Broker references are broker names; addresses are resolved when payloads are built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionSlot {
    current_broker: Option<String>,
    target_broker: Option<String>,
    status: PartitionStatus,
    session_id: Option<SessionId>,
    fencing_token: Option<FencingToken>,
}

impl PartitionSlot {
    pub fn current_broker(&self) -> Option<&str> {
        self.current_broker.as_deref()
    }

    pub fn set_current_broker(&mut self, broker: Option<String>) {
        self.current_broker = broker;
    }

    pub fn target_broker(&self) -> Option<&str> {
        self.target_broker.as_deref()
    }

    pub fn set_target_broker(&mut self, broker: Option<String>) {
        self.target_broker = broker;
    }

    pub fn status(&self) -> PartitionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: PartitionStatus) {
        self.status = status;
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn set_session_id(&mut self, session_id: Option<SessionId>) {
        self.session_id = session_id;
    }

    pub fn fencing_token(&self) -> Option<&FencingToken> {
        self.fencing_token.as_ref()
    }

    pub fn set_fencing_token(&mut self, token: Option<FencingToken>) {
        self.fencing_token = token;
    }
}

/// Placement demand of a topic: its catalog spec plus one slot per partition.
#[derive(Debug, Clone)]
pub struct TopicDemand {
    spec: TopicSpec,
    partitions: Vec<PartitionSlot>,
    inconsistent: bool,
}

impl TopicDemand {
    pub fn new(spec: TopicSpec) -> Self {
        let partitions = vec![PartitionSlot::default(); spec.partition_count as usize];
        TopicDemand {
            spec,
            partitions,
            inconsistent: false,
        }
    }

    pub fn spec(&self) -> &TopicSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn group(&self) -> Option<&str> {
        self.spec.group.as_deref()
    }

    pub fn role(&self) -> &str {
        &self.spec.role
    }

    pub fn partition_count(&self) -> u32 {
        self.spec.partition_count
    }

    pub fn resource_cost(&self) -> u64 {
        self.spec.resource_cost
    }

    pub fn partition_limit(&self) -> u32 {
        self.spec.partition_limit
    }

    pub fn partition(&self, index: u32) -> Option<&PartitionSlot> {
        self.partitions.get(index as usize)
    }

    pub fn partition_mut(&mut self, index: u32) -> Option<&mut PartitionSlot> {
        self.partitions.get_mut(index as usize)
    }

    pub fn partitions(&self) -> impl Iterator<Item = (u32, &PartitionSlot)> {
        self.partitions
            .iter()
            .enumerate()
            .map(|(index, slot)| (index as u32, slot))
    }

    pub fn range(&self, index: u32) -> PartitionRange {
        PartitionRange::for_partition(index, self.spec.partition_count)
    }

    /// Set when the catalog changed the partition count during the last sync.
    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    fn update(&mut self, spec: TopicSpec) {
        self.inconsistent = spec.partition_count as usize != self.partitions.len();
        if self.inconsistent {
            self.partitions
                .resize(spec.partition_count as usize, PartitionSlot::default());
        }
        self.spec = spec;
    }
}

/// Outcome of a catalog sync.
#[derive(Debug, Default, PartialEq)]
pub struct SyncSummary {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub resized: Vec<String>,
    pub rejected: Vec<String>,
}

impl SyncSummary {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.deleted.is_empty()
            && self.resized.is_empty()
            && self.rejected.is_empty()
    }
}

/// All topics the scheduler knows about, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TopicTable {
    topics: BTreeMap<String, TopicDemand>,
}

impl TopicTable {
    pub fn new() -> Self {
        TopicTable::default()
    }

    /// Aligns the table with a fresh catalog snapshot.
    pub fn sync(&mut self, specs: Vec<TopicSpec>) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let mut seen = BTreeMap::new();

        for spec in specs {
            if let Err(err) = spec.validate() {
                warn!(topic = %spec.name, error = %err, "ignoring invalid topic definition");
                summary.rejected.push(spec.name);
                continue;
            }
            seen.insert(spec.name.clone(), spec);
        }

        let deleted: Vec<String> = self
            .topics
            .keys()
            .filter(|name| !seen.contains_key(*name))
            .cloned()
            .collect();
        for name in deleted {
            self.topics.remove(&name);
            summary.deleted.push(name);
        }

        for (name, spec) in seen {
            match self.topics.get_mut(&name) {
                Some(demand) => {
                    demand.update(spec);
                    if demand.inconsistent {
                        summary.resized.push(name);
                    }
                }
                None => {
                    self.topics.insert(name.clone(), TopicDemand::new(spec));
                    summary.created.push(name);
                }
            }
        }
        summary
    }

    /// Refreshes the current side of every slot from the alive brokers' self-reports.
    ///
    /// When several brokers report the same partition the recorded owner wins if it
    /// is among them, otherwise the lowest broker name.
    ///
    /// A recorded owner that is alive in the same session but no longer reports the
    /// partition has released it and stops being its owner. An owner whose session
    /// changed stays recorded so that it can recover the partition.
    pub fn observe<'a>(&mut self, brokers: impl IntoIterator<Item = &'a BrokerLedger>) {
        let mut claims: HashMap<TaskKey, Vec<&BrokerLedger>> = HashMap::new();
        let mut alive: HashMap<&str, &BrokerLedger> = HashMap::new();
        for broker in brokers.into_iter().filter(|b| b.is_alive()) {
            alive.insert(broker.name(), broker);
            for (key, task) in broker.current_task_set() {
                if task.state.confirms_ownership() {
                    claims.entry(key.clone()).or_default().push(broker);
                }
            }
        }

        for demand in self.topics.values_mut() {
            let topic = demand.spec.name.clone();
            for (index, slot) in demand.partitions.iter_mut().enumerate() {
                let key = TaskKey::new(topic.clone(), index as u32);
                let Some(owners) = claims.get(&key) else {
                    let released = slot
                        .current_broker
                        .as_deref()
                        .and_then(|name| alive.get(name))
                        .is_some_and(|b| {
                            !b.holds(&key) && slot.session_id.as_ref() == Some(b.session_id())
                        });
                    if released {
                        slot.current_broker = None;
                        slot.session_id = None;
                    }
                    continue;
                };
                let owner = owners
                    .iter()
                    .find(|b| Some(b.name()) == slot.current_broker.as_deref())
                    .or_else(|| owners.iter().min_by(|a, b| a.name().cmp(b.name())));
                if let Some(owner) = owner {
                    if let Some(task) = owner.current_task_set().get(&key) {
                        slot.current_broker = Some(owner.name().to_string());
                        slot.session_id = Some(task.session_id.clone());
                        slot.fencing_token = Some(task.fencing_token.clone());
                    }
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&TopicDemand> {
        self.topics.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TopicDemand> {
        self.topics.get_mut(name)
    }

    pub fn slot(&self, key: &TaskKey) -> Option<&PartitionSlot> {
        self.topics.get(&key.topic)?.partition(key.partition)
    }

    pub fn slot_mut(&mut self, key: &TaskKey) -> Option<&mut PartitionSlot> {
        self.topics.get_mut(&key.topic)?.partition_mut(key.partition)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopicDemand> {
        self.topics.values()
    }

    /// Topics served by a fleet role.
    pub fn for_role<'a>(&'a self, role: &'a str) -> impl Iterator<Item = &'a TopicDemand> + 'a {
        self.topics.values().filter(move |t| t.role() == role)
    }

    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.topics.values().map(|t| t.role().to_string()).collect();
        roles.sort();
        roles.dedup();
        roles
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
