use keel_core::{BrokerReport, ReportedTask, SessionId, TaskKey};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Separator between the group and the ordinal in a broker name (`<group>##<ordinal>`).
pub const GROUP_SEPARATOR: &str = "##";

/// Splits a broker name of the form `<group>##<ordinal>`.
pub fn parse_role_name(name: &str) -> Option<(&str, u32)> {
    let (group, ordinal) = name.rsplit_once(GROUP_SEPARATOR)?;
    if group.is_empty() {
        return None;
    }
    ordinal.parse::<u32>().ok().map(|ordinal| (group, ordinal))
}

/// Capacity accounting of a single broker for the current scheduling tick.
///
/// The reported side (`reported`, liveness inputs) is refreshed from heartbeats,
/// the decision side (`current`, `target`, `free`) is rebuilt by `prepare_decision`.
#[derive(Debug, Clone)]
pub struct BrokerLedger {
    name: String,
    address: String,
    role: String,
    version: String,
    group: Option<String>,
    ordinal: Option<u32>,
    capacity: u64,
    session_id: SessionId,

    // heartbeat side
    reported: Vec<ReportedTask>,
    reported_alive: bool,
    last_heartbeat: Instant,

    // operator overrides, applied at prepare time
    load_shift: f64,
    drained: bool,

    // decision side
    alive: bool,
    unknown_for: Duration,
    free: u64,
    current: BTreeMap<TaskKey, ReportedTask>,
    target: BTreeSet<TaskKey>,
    target_per_topic: HashMap<String, u32>,
}

impl BrokerLedger {
    /// Creates the ledger entry of a broker on its first heartbeat.
    pub fn from_report(report: BrokerReport, seen_at: Instant) -> Self {
        let (group, ordinal) = match parse_role_name(&report.name) {
            Some((group, ordinal)) => (Some(group.to_string()), Some(ordinal)),
            None => (None, None),
        };
        BrokerLedger {
            name: report.name,
            address: report.address,
            role: report.role,
            version: report.version,
            group,
            ordinal,
            capacity: report.capacity,
            session_id: report.session_id,
            reported: report.tasks,
            reported_alive: report.alive,
            last_heartbeat: seen_at,
            load_shift: 0.0,
            drained: false,
            alive: false,
            unknown_for: Duration::ZERO,
            free: 0,
            current: BTreeMap::new(),
            target: BTreeSet::new(),
            target_per_topic: HashMap::new(),
        }
    }

    /// Applies a newer heartbeat. Older heartbeats are ignored.
    pub fn refresh(&mut self, report: BrokerReport, seen_at: Instant) {
        if seen_at < self.last_heartbeat {
            return;
        }
        self.address = report.address;
        self.role = report.role;
        self.version = report.version;
        self.capacity = report.capacity;
        self.session_id = report.session_id;
        self.reported = report.tasks;
        self.reported_alive = report.alive;
        self.last_heartbeat = seen_at;
    }

    /// Sets the operator overrides used by the next `prepare_decision`.
    pub fn set_capacity_override(&mut self, load_shift: f64, drained: bool) {
        self.load_shift = load_shift.clamp(0.0, 1.0);
        self.drained = drained;
    }

    /// Snapshots the reported state, recomputes liveness and resets the decision side.
    pub fn prepare_decision(&mut self, now: Instant, unknown_timeout: Duration) {
        self.unknown_for = now.saturating_duration_since(self.last_heartbeat);
        self.alive = self.reported_alive && self.unknown_for <= unknown_timeout;

        self.current = self
            .reported
            .iter()
            .map(|task| (task.key(), task.clone()))
            .collect();

        self.target.clear();
        self.target_per_topic.clear();
        self.free = self.effective_capacity();
    }

    fn effective_capacity(&self) -> u64 {
        if self.drained {
            return 0;
        }
        if self.load_shift <= 0.0 {
            return self.capacity;
        }
        (self.capacity as f64 * (1.0 - self.load_shift)).floor() as u64
    }

    /// Checks every reservation rule without mutating anything.
    pub fn can_reserve(&self, topic: &str, cost: u64, limit: u32, group: &str) -> bool {
        if !group.is_empty() && self.group.as_deref() != Some(group) {
            return false;
        }
        if self.free < cost {
            return false;
        }
        let placed = self.target_per_topic.get(topic).copied().unwrap_or(0);
        placed < limit
    }

    /// Reserves `cost` for partition `partition` of `topic`; returns false (and changes nothing)
    /// when the group, free resource or per-topic limit forbid it.
    pub fn try_reserve(&mut self, topic: &str, partition: u32, cost: u64, limit: u32, group: &str) -> bool {
        if !self.can_reserve(topic, cost, limit, group) {
            return false;
        }
        if !self.target.insert(TaskKey::new(topic, partition)) {
            // already targeted here this tick
            return false;
        }
        self.free -= cost;
        *self.target_per_topic.entry(topic.to_string()).or_insert(0) += 1;
        true
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn ordinal(&self) -> Option<u32> {
        self.ordinal
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn free_resource(&self) -> u64 {
        self.free
    }

    pub fn current_task_set(&self) -> &BTreeMap<TaskKey, ReportedTask> {
        &self.current
    }

    pub fn target_task_set(&self) -> &BTreeSet<TaskKey> {
        &self.target
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_dead(&self) -> bool {
        !self.alive
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    /// Time since the last heartbeat, as of the last `prepare_decision`.
    pub fn unknown_for(&self) -> Duration {
        self.unknown_for
    }

    /// The broker's self-report stands behind the task.
    pub fn confirms(&self, key: &TaskKey) -> bool {
        self.current
            .get(key)
            .map(|task| task.state.confirms_ownership())
            .unwrap_or(false)
    }

    /// The broker's self-report mentions the task in any state, unloading included.
    pub fn holds(&self, key: &TaskKey) -> bool {
        self.current.contains_key(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct FreeKey {
    free: Reverse<u64>,
    name: String,
}

/// Tick-scoped ledger of a broker subset.
///
/// Alive brokers are indexed by `(free resource desc, name asc)`; every successful
/// reservation re-keys the broker so the index always reflects the remaining capacity.
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    brokers: BTreeMap<String, BrokerLedger>,
    by_free: BTreeSet<FreeKey>,
}

impl ResourceLedger {
    pub fn new(brokers: impl IntoIterator<Item = BrokerLedger>) -> Self {
        let brokers = brokers
            .into_iter()
            .map(|broker| (broker.name.clone(), broker))
            .collect();
        let mut ledger = ResourceLedger {
            brokers,
            by_free: BTreeSet::new(),
        };
        ledger.reindex();
        ledger
    }

    fn reindex(&mut self) {
        self.by_free = self
            .brokers
            .values()
            .filter(|broker| broker.alive)
            .map(|broker| FreeKey {
                free: Reverse(broker.free),
                name: broker.name.clone(),
            })
            .collect();
    }

    /// Runs `prepare_decision` on every broker and rebuilds the order index.
    pub fn prepare_decision(&mut self, now: Instant, unknown_timeout: Duration) {
        for broker in self.brokers.values_mut() {
            broker.prepare_decision(now, unknown_timeout);
        }
        self.reindex();
    }

    /// Reserves on the named broker; dead or unknown brokers always decline.
    pub fn try_reserve(
        &mut self,
        broker: &str,
        topic: &str,
        partition: u32,
        cost: u64,
        limit: u32,
        group: &str,
    ) -> bool {
        let Some(entry) = self.brokers.get_mut(broker) else {
            return false;
        };
        if !entry.alive {
            return false;
        }
        let old_key = FreeKey {
            free: Reverse(entry.free),
            name: entry.name.clone(),
        };
        if !entry.try_reserve(topic, partition, cost, limit, group) {
            return false;
        }
        self.by_free.remove(&old_key);
        self.by_free.insert(FreeKey {
            free: Reverse(entry.free),
            name: old_key.name,
        });
        true
    }

    /// First alive broker, most free resource first, that accepts the reservation.
    pub fn reserve_most_free(
        &mut self,
        topic: &str,
        partition: u32,
        cost: u64,
        limit: u32,
        group: &str,
    ) -> Option<String> {
        let chosen = self
            .by_free
            .iter()
            .map(|key| key.name.as_str())
            .find(|name| {
                self.brokers
                    .get(*name)
                    .map(|b| b.can_reserve(topic, cost, limit, group))
                    .unwrap_or(false)
            })?
            .to_string();
        if self.try_reserve(&chosen, topic, partition, cost, limit, group) {
            Some(chosen)
        } else {
            None
        }
    }

    /// Alive broker names ordered by `(free resource desc, name asc)`.
    pub fn by_free_resource(&self) -> impl Iterator<Item = &str> {
        self.by_free.iter().map(|key| key.name.as_str())
    }

    pub fn get(&self, broker: &str) -> Option<&BrokerLedger> {
        self.brokers.get(broker)
    }

    pub fn is_alive(&self, broker: &str) -> bool {
        self.brokers.get(broker).map(|b| b.alive).unwrap_or(false)
    }

    /// All brokers, ordered by name.
    pub fn brokers(&self) -> impl Iterator<Item = &BrokerLedger> {
        self.brokers.values()
    }

    pub fn alive_brokers(&self) -> impl Iterator<Item = &BrokerLedger> {
        self.brokers.values().filter(|b| b.alive)
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}
